//! Rank geometry: slices (control interfaces) × DPUs per slice.
//!
//! Per-slice DPU state travels on the wire as 8-bit bitfields (one bit per
//! member), which bounds a slice to [`MAX_DPUS_PER_SLICE`] members.

use std::fmt;

/// Maximum DPUs driven by one slice.
pub const MAX_DPUS_PER_SLICE: u8 = 8;

/// Identifies one DPU inside a rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DpuId {
    /// Slice (control interface) index.
    pub slice: u8,
    /// Member index inside the slice.
    pub member: u8,
}

impl DpuId {
    /// DPU `member` of slice `slice`.
    #[must_use]
    pub const fn new(slice: u8, member: u8) -> Self {
        Self { slice, member }
    }

    /// Bit of this DPU in its slice bitfield, zero past the eighth member.
    #[must_use]
    pub fn bit(self) -> u8 {
        1u8.checked_shl(u32::from(self.member)).unwrap_or(0)
    }
}

impl fmt::Display for DpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.slice, self.member)
    }
}

/// Rank geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Topology {
    /// Slices in the rank.
    pub nr_slices: u8,
    /// DPUs per slice.
    pub dpus_per_slice: u8,
}

impl Topology {
    /// Reference geometry: 8 slices of 8 DPUs.
    pub const RANK_8X8: Self = Self {
        nr_slices: 8,
        dpus_per_slice: 8,
    };

    /// Build a topology.
    #[must_use]
    pub const fn new(nr_slices: u8, dpus_per_slice: u8) -> Self {
        Self {
            nr_slices,
            dpus_per_slice,
        }
    }

    /// Total DPUs in the rank.
    #[must_use]
    pub const fn nr_dpus(&self) -> usize {
        self.nr_slices as usize * self.dpus_per_slice as usize
    }

    /// Bitfield with one bit per member of a slice.
    #[must_use]
    pub const fn member_mask(&self) -> u8 {
        if self.dpus_per_slice >= MAX_DPUS_PER_SLICE {
            0xFF
        } else {
            (1u8 << self.dpus_per_slice) - 1
        }
    }

    /// Whether `dpu` lies inside this geometry.
    #[must_use]
    pub const fn contains(&self, dpu: DpuId) -> bool {
        dpu.slice < self.nr_slices && dpu.member < self.dpus_per_slice
    }

    /// Flat index of `dpu`, row-major by slice. `None` when out of range.
    #[must_use]
    pub const fn index(&self, dpu: DpuId) -> Option<usize> {
        if self.contains(dpu) {
            Some(dpu.slice as usize * self.dpus_per_slice as usize + dpu.member as usize)
        } else {
            None
        }
    }

    /// Inverse of [`Topology::index`].
    #[must_use]
    pub fn dpu_at(&self, index: usize) -> Option<DpuId> {
        if index >= self.nr_dpus() {
            return None;
        }
        let per = usize::from(self.dpus_per_slice);
        let slice = u8::try_from(index / per).ok()?;
        let member = u8::try_from(index % per).ok()?;
        Some(DpuId::new(slice, member))
    }

    /// Every DPU, slice-major.
    pub fn dpus(&self) -> impl Iterator<Item = DpuId> + '_ {
        (0..self.nr_slices)
            .flat_map(move |s| (0..self.dpus_per_slice).map(move |m| DpuId::new(s, m)))
    }

    /// Members of `slice` whose bit is set in `bitfield`.
    pub fn members_of(&self, slice: u8, bitfield: u8) -> impl Iterator<Item = DpuId> + '_ {
        (0..self.dpus_per_slice)
            .filter(move |m| bitfield & (1 << m) != 0)
            .map(move |m| DpuId::new(slice, m))
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::RANK_8X8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_bit_saturates() {
        assert_eq!(DpuId::new(0, 3).bit(), 0b1000);
        assert_eq!(DpuId::new(0, 7).bit(), 0x80);
        assert_eq!(DpuId::new(0, 8).bit(), 0);
    }

    #[test]
    fn index_is_bounds_checked() {
        let t = Topology::new(4, 6);
        assert_eq!(t.index(DpuId::new(0, 0)), Some(0));
        assert_eq!(t.index(DpuId::new(3, 5)), Some(23));
        assert_eq!(t.index(DpuId::new(4, 0)), None);
        assert_eq!(t.index(DpuId::new(0, 6)), None);
    }

    #[test]
    fn dpu_at_inverts_index() {
        let t = Topology::RANK_8X8;
        for dpu in t.dpus() {
            assert_eq!(t.dpu_at(t.index(dpu).unwrap()), Some(dpu));
        }
        assert_eq!(t.dpu_at(64), None);
    }

    #[test]
    fn member_masks() {
        assert_eq!(Topology::new(1, 8).member_mask(), 0xFF);
        assert_eq!(Topology::new(1, 3).member_mask(), 0b111);
    }

    #[test]
    fn members_of_bitfield() {
        let t = Topology::RANK_8X8;
        let members: Vec<_> = t.members_of(2, 0b1001).collect();
        assert_eq!(members, vec![DpuId::new(2, 0), DpuId::new(2, 3)]);
    }
}
