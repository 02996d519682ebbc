//! Program counter encoding.
//!
//! A DPU program counter indexes IRAM instructions, so its width follows
//! the IRAM size of the rank. The debug interface exposes a stopped
//! thread's PC as two halves read with separate commands: a fixed 8-bit
//! LSB half and an MSB half holding the remaining `width - 8` bits.
//! THREAD_BOOT carries the PC width so the DPU sequencer wraps correctly.

/// Width of the LSB half of a PC.
pub const PC_LSB_BITS: u8 = 8;

/// Smallest supported PC width.
pub const MIN_PC_WIDTH: u8 = PC_LSB_BITS;

/// Largest supported PC width (64 Ki instructions).
pub const MAX_PC_WIDTH: u8 = 16;

/// PC mode of a rank: the number of significant PC bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PcMode {
    width: u8,
}

impl PcMode {
    /// Derive the PC mode for an IRAM of `instructions` entries.
    ///
    /// Returns `None` when the size is outside `256..=65536`.
    #[must_use]
    pub const fn for_iram(instructions: u32) -> Option<Self> {
        if instructions < (1 << MIN_PC_WIDTH) || instructions > (1 << MAX_PC_WIDTH) {
            return None;
        }
        let width = 32 - (instructions - 1).leading_zeros();
        #[allow(clippy::cast_possible_truncation)]
        Some(Self { width: width as u8 })
    }

    /// Significant PC bits.
    #[must_use]
    pub const fn width(self) -> u8 {
        self.width
    }

    /// Bits carried by the MSB half.
    #[must_use]
    pub const fn msb_bits(self) -> u8 {
        self.width - PC_LSB_BITS
    }

    /// Value sent in the THREAD_BOOT payload.
    #[must_use]
    pub const fn wire_value(self) -> u8 {
        self.width
    }

    /// Mask of valid PC values.
    #[must_use]
    pub const fn pc_mask(self) -> u32 {
        (1u32 << self.width) - 1
    }

    /// Reassemble a PC from its halves. Bits above each half's width are
    /// ignored.
    #[must_use]
    pub const fn assemble(self, msb: u32, lsb: u32) -> u32 {
        let msb_mask = (1u32 << self.msb_bits()) - 1;
        let lsb_mask = (1u32 << PC_LSB_BITS) - 1;
        ((msb & msb_mask) << PC_LSB_BITS) | (lsb & lsb_mask)
    }

    /// Split a PC into `(msb, lsb)` halves.
    #[must_use]
    pub const fn split(self, pc: u32) -> (u32, u32) {
        let pc = pc & self.pc_mask();
        (pc >> PC_LSB_BITS, pc & ((1u32 << PC_LSB_BITS) - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_follows_iram_size() {
        assert_eq!(PcMode::for_iram(4096).map(PcMode::width), Some(12));
        assert_eq!(PcMode::for_iram(4097).map(PcMode::width), Some(13));
        assert_eq!(PcMode::for_iram(256).map(PcMode::width), Some(8));
        assert_eq!(PcMode::for_iram(65536).map(PcMode::width), Some(16));
        assert_eq!(PcMode::for_iram(255), None);
        assert_eq!(PcMode::for_iram(65537), None);
    }

    #[test]
    fn msb_width_shrinks_with_iram() {
        let small = PcMode::for_iram(2048).unwrap();
        let large = PcMode::for_iram(4096).unwrap();
        assert_eq!(small.msb_bits(), 3);
        assert_eq!(large.msb_bits(), 4);
    }

    #[test]
    fn split_and_assemble() {
        let mode = PcMode::for_iram(4096).unwrap();
        for pc in [0u32, 1, 0xFF, 0x100, 0xABC, 0xFFF] {
            let (msb, lsb) = mode.split(pc);
            assert_eq!(mode.assemble(msb, lsb), pc);
        }
    }

    #[test]
    fn assemble_ignores_bits_beyond_halves() {
        let mode = PcMode::for_iram(2048).unwrap();
        // MSB half is 3 bits wide; bit 3 and above are noise.
        assert_eq!(mode.assemble(0xF9, 0x1_22), 0x122);
    }
}
