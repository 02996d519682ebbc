//! Shared per-rank runtime state
//!
//! Everything here is guarded by the rank lock. The Planner updates the
//! per-slice protocol fields (color, fault flags, shadows); the lifecycle
//! updates the run/fault bitfields and the running counter.

use crate::config::RankConfig;
use crate::error::{PimError, Result};
use pim_ufi::wire::{DISABLED_GROUP, ENABLED_GROUP};
use pim_ufi::{DpuId, Topology};

/// Selection currently latched by a slice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SliceTarget {
    /// One member
    Dpu(u8),
    /// A group
    Group(u8),
    /// Every member
    All,
}

impl SliceTarget {
    /// Bitfield of members this selection reaches.
    ///
    /// # Errors
    ///
    /// Returns `Internal` for a member outside the slice or a group id
    /// other than the enabled/disabled groups assigned at reset.
    pub fn selected_mask(self, enabled: u8, member_mask: u8) -> Result<u8> {
        match self {
            Self::Dpu(member) => 1u8
                .checked_shl(u32::from(member))
                .filter(|bit| bit & member_mask != 0)
                .ok_or_else(|| PimError::internal(format!("DPU {member} is not in the slice"))),
            Self::Group(ENABLED_GROUP) => Ok(enabled),
            Self::Group(DISABLED_GROUP) => Ok(!enabled & member_mask),
            Self::Group(other) => Err(PimError::internal(format!(
                "group {other} is not assigned by the control plane"
            ))),
            Self::All => Ok(member_mask),
        }
    }
}

/// Protocol state of one slice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceInfo {
    /// Color expected in the next response
    pub color: bool,
    /// A collision was reported since the last clear
    pub fault_collide: bool,
    /// A decode error was reported since the last clear
    pub fault_decode: bool,
    /// Enabled members
    pub enabled_dpus: u8,
    /// Every member is enabled
    pub all_dpus_enabled: bool,
    /// Last value written to the structure register
    pub structure_value: Option<u64>,
    /// Last selection sent
    pub slice_target: Option<SliceTarget>,
}

impl SliceInfo {
    fn new(enabled_dpus: u8, member_mask: u8) -> Self {
        Self {
            color: false,
            fault_collide: false,
            fault_decode: false,
            enabled_dpus,
            all_dpus_enabled: enabled_dpus == member_mask,
            structure_value: None,
            slice_target: None,
        }
    }

    /// Forget the write-only register shadows.
    pub fn invalidate_shadows(&mut self) {
        self.structure_value = None;
        self.slice_target = None;
    }
}

/// Per-rank runtime state
#[derive(Debug, Clone)]
pub struct RankRuntimeState {
    topology: Topology,
    /// Per-slice protocol state
    pub slices: Vec<SliceInfo>,
    dpu_running: Vec<u8>,
    dpu_in_fault: Vec<u8>,
    nb_dpu_running: u32,
}

impl RankRuntimeState {
    /// Fresh state for a rank described by `config`.
    pub fn new(config: &RankConfig) -> Self {
        let topology = config.topology;
        let member_mask = topology.member_mask();
        let nr = usize::from(topology.nr_slices);
        Self {
            topology,
            slices: (0..topology.nr_slices)
                .map(|s| SliceInfo::new(config.enabled_mask(s), member_mask))
                .collect(),
            dpu_running: vec![0; nr],
            dpu_in_fault: vec![0; nr],
            nb_dpu_running: 0,
        }
    }

    /// Back to the known post-reset values.
    pub fn reset(&mut self, config: &RankConfig) {
        *self = Self::new(config);
    }

    /// Rank geometry.
    pub const fn topology(&self) -> Topology {
        self.topology
    }

    /// Number of slices.
    pub fn nr_slices(&self) -> usize {
        self.slices.len()
    }

    /// DPUs currently running.
    pub const fn nb_dpu_running(&self) -> u32 {
        self.nb_dpu_running
    }

    /// Running bitfield of `slice`.
    pub fn dpu_running(&self, slice: u8) -> u8 {
        self.dpu_running.get(usize::from(slice)).copied().unwrap_or(0)
    }

    /// Fault bitfield of `slice`.
    pub fn dpu_in_fault(&self, slice: u8) -> u8 {
        self.dpu_in_fault.get(usize::from(slice)).copied().unwrap_or(0)
    }

    /// Whether `dpu` is running.
    pub fn is_running(&self, dpu: DpuId) -> bool {
        self.dpu_running(dpu.slice) & dpu.bit() != 0
    }

    /// Whether `dpu` is in fault.
    pub fn is_in_fault(&self, dpu: DpuId) -> bool {
        self.dpu_in_fault(dpu.slice) & dpu.bit() != 0
    }

    /// Whether `dpu` is enabled.
    pub fn is_enabled(&self, dpu: DpuId) -> bool {
        self.slices
            .get(usize::from(dpu.slice))
            .is_some_and(|s| s.enabled_dpus & dpu.bit() != 0)
    }

    /// Any DPU in fault.
    pub fn any_fault(&self) -> bool {
        self.dpu_in_fault.iter().any(|&bits| bits != 0)
    }

    /// Every DPU in fault, slice-major.
    pub fn faulted_dpus(&self) -> Vec<DpuId> {
        self.bits_to_dpus(&self.dpu_in_fault)
    }

    /// Every running DPU, slice-major.
    pub fn running_dpus(&self) -> Vec<DpuId> {
        self.bits_to_dpus(&self.dpu_running)
    }

    fn bits_to_dpus(&self, fields: &[u8]) -> Vec<DpuId> {
        let mut out = Vec::new();
        for (slice, &bits) in (0u8..).zip(fields) {
            out.extend(self.topology.members_of(slice, bits));
        }
        out
    }

    /// Replace the running bits of `slice` selected by `scope` with `bits`.
    /// Returns the members that stopped running.
    pub fn update_running(&mut self, slice: u8, scope: u8, bits: u8) -> u8 {
        let Some(field) = self.dpu_running.get_mut(usize::from(slice)) else {
            return 0;
        };
        let old = *field;
        *field = (old & !scope) | (bits & scope);
        let stopped = old & !*field;
        self.recount();
        stopped
    }

    /// Replace the fault bits of `slice` selected by `scope` with `bits`.
    pub fn update_fault(&mut self, slice: u8, scope: u8, bits: u8) {
        if let Some(field) = self.dpu_in_fault.get_mut(usize::from(slice)) {
            *field = (*field & !scope) | (bits & scope);
        }
    }

    /// Mark DPUs of `slice` as booted.
    pub fn mark_booted(&mut self, slice: u8, bits: u8) {
        if let Some(field) = self.dpu_running.get_mut(usize::from(slice)) {
            *field |= bits;
        }
        self.update_fault(slice, bits, 0);
        self.recount();
    }

    fn recount(&mut self) {
        self.nb_dpu_running = self.dpu_running.iter().map(|b| b.count_ones()).sum();
    }

    /// Clear the decode/collide flags of `slice`.
    pub fn clear_protocol_faults(&mut self, slice: u8) {
        if let Some(info) = self.slices.get_mut(usize::from(slice)) {
            info.fault_decode = false;
            info.fault_collide = false;
        }
    }

    /// Slices that reported a decode error or a collision.
    pub fn slices_with_protocol_faults(&self) -> Vec<u8> {
        (0u8..)
            .zip(&self.slices)
            .filter(|(_, s)| s.fault_decode || s.fault_collide)
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> RankRuntimeState {
        let config = RankConfig::new(Topology::new(4, 4)).with_disabled_dpu(DpuId::new(1, 3));
        RankRuntimeState::new(&config)
    }

    #[test]
    fn fresh_state() {
        let s = state();
        assert_eq!(s.nr_slices(), 4);
        assert_eq!(s.nb_dpu_running(), 0);
        assert!(s.slices[0].all_dpus_enabled);
        assert!(!s.slices[1].all_dpus_enabled);
        assert_eq!(s.slices[1].enabled_dpus, 0b0111);
        assert!(!s.is_enabled(DpuId::new(1, 3)));
    }

    #[test]
    fn counter_follows_bitfields() {
        let mut s = state();
        s.mark_booted(0, 0b1011);
        s.mark_booted(2, 0b0001);
        assert_eq!(s.nb_dpu_running(), 4);

        let stopped = s.update_running(0, 0b1111, 0b0010);
        assert_eq!(stopped, 0b1001);
        assert_eq!(s.nb_dpu_running(), 2);
        assert_eq!(s.running_dpus(), vec![DpuId::new(0, 1), DpuId::new(2, 0)]);
    }

    #[test]
    fn scoped_update_leaves_other_members() {
        let mut s = state();
        s.mark_booted(0, 0b0011);
        s.update_running(0, 0b0001, 0);
        assert!(s.is_running(DpuId::new(0, 1)));
        assert!(!s.is_running(DpuId::new(0, 0)));
    }

    #[test]
    fn group_masks() {
        assert_eq!(SliceTarget::Group(ENABLED_GROUP).selected_mask(0b0111, 0xF).unwrap(), 0b0111);
        assert_eq!(SliceTarget::Group(DISABLED_GROUP).selected_mask(0b0111, 0xF).unwrap(), 0b1000);
        assert_eq!(SliceTarget::Dpu(2).selected_mask(0, 0xF).unwrap(), 0b0100);
        assert_eq!(SliceTarget::All.selected_mask(0, 0xF).unwrap(), 0xF);
        assert!(SliceTarget::Group(5).selected_mask(0, 0xF).is_err());
        assert!(SliceTarget::Dpu(4).selected_mask(0, 0xF).is_err());
        assert!(SliceTarget::Dpu(200).selected_mask(0, 0xF).is_err());
    }

    #[test]
    fn protocol_faults_clear_per_slice() {
        let mut s = state();
        s.slices[0].fault_decode = true;
        s.slices[2].fault_collide = true;
        s.clear_protocol_faults(0);
        assert_eq!(s.slices_with_protocol_faults(), vec![2]);
        s.clear_protocol_faults(9);
        assert_eq!(s.slices_with_protocol_faults(), vec![2]);
    }

    #[test]
    fn boot_clears_stale_fault() {
        let mut s = state();
        s.update_fault(0, 0xF, 0b0001);
        assert!(s.any_fault());
        s.mark_booted(0, 0b0001);
        assert!(!s.any_fault());
    }
}
