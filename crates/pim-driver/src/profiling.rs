//! Per-run profiling
//!
//! Counters are armed when a DPU is booted and closed on the poll that
//! observes it stop. Closed runs queue up until the embedder takes them.

use crate::config::ProfilingMode;
use pim_ufi::DpuId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Profile of one completed run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStatistics {
    /// DPU that ran
    pub dpu: DpuId,
    /// Polls that saw the DPU running
    pub polls: u32,
    /// Boot to observed stop
    pub elapsed: Duration,
    /// Run ended in fault
    pub faulted: bool,
    /// WRAM sample words (`Samples` mode only)
    pub samples: Vec<u32>,
}

#[derive(Debug, Clone, Copy)]
struct Armed {
    started: Instant,
    polls: u32,
}

#[derive(Debug)]
pub(crate) struct Profiler {
    mode: ProfilingMode,
    armed: HashMap<DpuId, Armed>,
    finished: Vec<RunStatistics>,
}

impl Profiler {
    pub(crate) fn new(mode: ProfilingMode) -> Self {
        Self {
            mode,
            armed: HashMap::new(),
            finished: Vec::new(),
        }
    }

    pub(crate) const fn mode(&self) -> ProfilingMode {
        self.mode
    }

    pub(crate) fn arm(&mut self, dpus: &[DpuId]) {
        if !self.mode.is_enabled() {
            return;
        }
        let started = Instant::now();
        for &dpu in dpus {
            self.armed.insert(dpu, Armed { started, polls: 0 });
        }
    }

    /// Count one poll for every armed DPU still running.
    pub(crate) fn record_poll(&mut self, running: &[DpuId]) {
        for dpu in running {
            if let Some(armed) = self.armed.get_mut(dpu) {
                armed.polls += 1;
            }
        }
    }

    /// DPUs that need a sample read before their run is closed.
    pub(crate) fn sample_window(&self) -> Option<(u32, u32)> {
        match self.mode {
            ProfilingMode::Samples { wram_offset, words } => Some((wram_offset, words)),
            _ => None,
        }
    }

    pub(crate) fn is_armed(&self, dpu: DpuId) -> bool {
        self.armed.contains_key(&dpu)
    }

    pub(crate) fn finish(&mut self, dpu: DpuId, faulted: bool, samples: Vec<u32>) {
        if let Some(armed) = self.armed.remove(&dpu) {
            self.finished.push(RunStatistics {
                dpu,
                polls: armed.polls,
                elapsed: armed.started.elapsed(),
                faulted,
                samples,
            });
        }
    }

    /// Drop the counters of `dpu` without recording a run.
    pub(crate) fn cancel(&mut self, dpu: DpuId) {
        self.armed.remove(&dpu);
    }

    pub(crate) fn reset(&mut self) {
        self.armed.clear();
    }

    pub(crate) fn take(&mut self) -> Vec<RunStatistics> {
        std::mem::take(&mut self.finished)
    }
}
