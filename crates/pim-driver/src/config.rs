//! Rank configuration
//!
//! Static description of a rank plus the control-plane policies applied to
//! it. Validated once when the rank is allocated.

use crate::error::{PimError, Result};
use pim_ufi::pc::PcMode;
use pim_ufi::topology::MAX_DPUS_PER_SLICE;
use pim_ufi::{DpuId, Topology};
use tracing::debug;

/// Read-back attempts allowed per packet before a transaction times out.
pub const DEFAULT_MAX_RETRIES: u32 = 100;

/// Hardware threads per DPU.
pub const DEFAULT_NR_THREADS: u8 = 24;

/// Largest supported thread count (thread run bitfields are 32 bits).
pub const MAX_NR_THREADS: u8 = 32;

/// Granularity of asynchronous launch workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaunchGranularity {
    /// One background worker per rank
    #[default]
    Rank,
    /// One background worker per launched DPU
    Dpu,
}

/// Profiling captured when a DPU stops running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProfilingMode {
    /// No capture
    #[default]
    Disabled,
    /// Poll count and wall time per run
    Statistics,
    /// Statistics plus `words` WRAM words read at `wram_offset`
    Samples {
        /// First sample word in WRAM
        wram_offset: u32,
        /// Number of sample words
        words: u32,
    },
}

impl ProfilingMode {
    /// Whether anything is captured.
    pub const fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

/// Rank configuration
#[derive(Debug, Clone)]
pub struct RankConfig {
    /// Slices × DPUs per slice
    pub topology: Topology,

    /// Hardware threads per DPU
    pub nr_threads: u8,

    /// IRAM size in instructions (drives the PC mode)
    pub iram_instructions: u32,

    /// WRAM size in 32-bit words
    pub wram_words: u32,

    /// Read-back attempts per packet
    pub max_retries: u32,

    /// Busy-wait iterations after a software reset
    pub reset_wait_cycles: u32,

    /// DPUs excluded from every operation
    pub disabled_dpus: Vec<DpuId>,

    /// Worker granularity for asynchronous launches
    pub launch_granularity: LaunchGranularity,

    /// Profiling capture
    pub profiling: ProfilingMode,
}

impl Default for RankConfig {
    fn default() -> Self {
        Self::new(Topology::RANK_8X8)
    }
}

impl RankConfig {
    /// Configuration with default policies for `topology`.
    pub fn new(topology: Topology) -> Self {
        Self {
            topology,
            nr_threads: DEFAULT_NR_THREADS,
            iram_instructions: 4096,
            wram_words: 16 * 1024,
            max_retries: DEFAULT_MAX_RETRIES,
            reset_wait_cycles: 1_000,
            disabled_dpus: Vec::new(),
            launch_granularity: LaunchGranularity::Rank,
            profiling: ProfilingMode::Disabled,
        }
    }

    /// Set the thread count.
    #[must_use]
    pub fn with_threads(mut self, nr_threads: u8) -> Self {
        self.nr_threads = nr_threads;
        self
    }

    /// Set the IRAM size.
    #[must_use]
    pub fn with_iram_instructions(mut self, instructions: u32) -> Self {
        self.iram_instructions = instructions;
        self
    }

    /// Set the WRAM size.
    #[must_use]
    pub fn with_wram_words(mut self, words: u32) -> Self {
        self.wram_words = words;
        self
    }

    /// Set the read-back retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the post-reset busy-wait.
    #[must_use]
    pub fn with_reset_wait_cycles(mut self, cycles: u32) -> Self {
        self.reset_wait_cycles = cycles;
        self
    }

    /// Mark a DPU as disabled.
    #[must_use]
    pub fn with_disabled_dpu(mut self, dpu: DpuId) -> Self {
        self.disabled_dpus.push(dpu);
        self
    }

    /// Set the worker granularity.
    #[must_use]
    pub fn with_launch_granularity(mut self, granularity: LaunchGranularity) -> Self {
        self.launch_granularity = granularity;
        self
    }

    /// Set profiling.
    #[must_use]
    pub fn with_profiling(mut self, profiling: ProfilingMode) -> Self {
        self.profiling = profiling;
        self
    }

    /// PC mode for the configured IRAM.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the IRAM size is unsupported.
    pub fn pc_mode(&self) -> Result<PcMode> {
        PcMode::for_iram(self.iram_instructions).ok_or_else(|| {
            PimError::invalid_config(format!(
                "IRAM size {} outside 256..=65536 instructions",
                self.iram_instructions
            ))
        })
    }

    /// Enabled-DPU bitfield of `slice`.
    pub fn enabled_mask(&self, slice: u8) -> u8 {
        self.disabled_dpus
            .iter()
            .filter(|d| d.slice == slice)
            .fold(self.topology.member_mask(), |mask, d| mask & !d.bit())
    }

    /// Check the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first rejected setting.
    pub fn validate(&self) -> Result<()> {
        let t = self.topology;
        if t.nr_slices == 0 {
            return Err(PimError::invalid_config("rank has no slices"));
        }
        if t.dpus_per_slice == 0 || t.dpus_per_slice > MAX_DPUS_PER_SLICE {
            return Err(PimError::invalid_config(format!(
                "{} DPUs per slice, expected 1..={MAX_DPUS_PER_SLICE}",
                t.dpus_per_slice
            )));
        }
        if self.nr_threads == 0 || self.nr_threads > MAX_NR_THREADS {
            return Err(PimError::invalid_config(format!(
                "{} threads per DPU, expected 1..={MAX_NR_THREADS}",
                self.nr_threads
            )));
        }
        self.pc_mode()?;
        if self.max_retries == 0 {
            return Err(PimError::invalid_config("retry budget is zero"));
        }
        if let ProfilingMode::Samples { wram_offset, words } = self.profiling {
            if u64::from(wram_offset) + u64::from(words) > u64::from(self.wram_words) {
                return Err(PimError::invalid_config("profiling samples exceed WRAM"));
            }
        }
        if let Some(dpu) = self.disabled_dpus.iter().find(|d| !t.contains(**d)) {
            return Err(PimError::invalid_config(format!(
                "disabled DPU {dpu} outside {}x{} rank",
                t.nr_slices, t.dpus_per_slice
            )));
        }

        debug!(
            "Rank config: {}x{} DPUs, {} threads, IRAM {} instr, {} disabled",
            t.nr_slices,
            t.dpus_per_slice,
            self.nr_threads,
            self.iram_instructions,
            self.disabled_dpus.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = RankConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_retries, 100);
        assert_eq!(config.pc_mode().unwrap().width(), 12);
    }

    #[test]
    fn rejects_oversized_slices() {
        let config = RankConfig::new(Topology::new(2, 9));
        assert!(matches!(
            config.validate(),
            Err(PimError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn rejects_disabled_dpu_outside_rank() {
        let config = RankConfig::new(Topology::new(2, 4)).with_disabled_dpu(DpuId::new(2, 0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_samples_past_wram() {
        let config = RankConfig::default()
            .with_wram_words(64)
            .with_profiling(ProfilingMode::Samples {
                wram_offset: 60,
                words: 8,
            });
        assert!(config.validate().is_err());
    }

    #[test]
    fn enabled_mask_clears_disabled_members() {
        let config = RankConfig::new(Topology::new(2, 4))
            .with_disabled_dpu(DpuId::new(1, 2))
            .with_disabled_dpu(DpuId::new(1, 0));
        assert_eq!(config.enabled_mask(0), 0b1111);
        assert_eq!(config.enabled_mask(1), 0b1010);
    }
}
