//! Command and response word layout.
//!
//! One 64-bit word per slice per round-trip. The host writes a command
//! word, the slice answers by overwriting it with a response word:
//!
//! ```text
//! command : [63:56] opcode      [55:0] payload
//! response: [63:56] 0xFF once accepted
//!           [55:48] color code (8 redundant copies of the slice color bit)
//!           [47:40] opcode echo
//!           [39:0]  data
//! ```
//!
//! Two words are reserved: [`EMPTY`] (slice has nothing to do this step) and
//! [`NOP`] (explicit no-operation). Neither addresses the slice, so neither
//! moves the color bit.

// ── Field layout ─────────────────────────────────────────────────────────────

/// Value of the top byte of a response once the command was accepted.
pub const ACCEPT_SENTINEL: u8 = 0xFF;

/// Shift of the opcode (command) / sentinel (response) byte.
pub const TOP_SHIFT: u32 = 56;
/// Shift of the 8-bit color code in a response.
pub const COLOR_SHIFT: u32 = 48;
/// Shift of the opcode echo in a response.
pub const ECHO_SHIFT: u32 = 40;

/// Top byte of a word.
pub const TOP_MASK: u64 = 0xFF00_0000_0000_0000;
/// Color code byte of a response.
pub const COLOR_MASK: u64 = 0x00FF_0000_0000_0000;
/// Opcode echo byte of a response.
pub const ECHO_MASK: u64 = 0x0000_FF00_0000_0000;
/// Low 48 bits: everything below the color code.
pub const LOW48_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;
/// Command payload (below the opcode).
pub const PAYLOAD_MASK: u64 = 0x00FF_FFFF_FFFF_FFFF;
/// Response data field.
pub const DATA_MASK: u64 = 0x0000_00FF_FFFF_FFFF;
/// Selected-DPU mask echoed by memory writes.
pub const SELECTED_ECHO_MASK: u64 = 0xFF;

/// Shift of the memory offset inside a memory-access payload.
pub const OFFSET_SHIFT: u32 = 32;
/// Width mask of a memory offset (relative to the structure base).
pub const OFFSET_MASK: u64 = 0xFF_FFFF;

// ── Reserved words ───────────────────────────────────────────────────────────

/// Idle-slice sentinel. Sent to every slice with no pending work so that
/// all slices stay on the same step.
pub const EMPTY: u64 = 0x0000_0000_0000_0000;

/// Explicit no-operation.
pub const NOP: u64 = 0xFF00_0000_0000_0000;

/// Response pattern written back by an attached debugger that already
/// validated (or overrode) the result of the pending command.
pub const DEBUGGER_VALIDATED: u64 = NOP;

/// Response of a slice to BYTE_ORDER once the lanes are settled.
/// Contains a zero byte, which is the only property the host checks.
pub const BYTE_ORDER_SIGNATURE: u64 = 0x0001_03FF_0F8F_CFEF;

/// Thread selector meaning "every thread" for CLEAR_RUN.
pub const ALL_THREADS: u8 = 0xFF;

/// Group holding every enabled DPU after rank reset.
pub const ENABLED_GROUP: u8 = 0;
/// Group holding every disabled DPU after rank reset.
pub const DISABLED_GROUP: u8 = 1;

/// Fault classes, combinable in CLEAR_FAULT.
pub mod fault {
    /// Breakpoint fault (also raised by SET_BKP_FAULT).
    pub const BREAKPOINT: u8 = 1 << 0;
    /// DMA fault.
    pub const DMA: u8 = 1 << 1;
    /// Memory fault.
    pub const MEMORY: u8 = 1 << 2;
    /// Every class.
    pub const ALL: u8 = BREAKPOINT | DMA | MEMORY;
}

// ── Opcodes ──────────────────────────────────────────────────────────────────

/// UFI opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Lane/byte-order discovery.
    ByteOrder = 0x01,
    /// Slice software reset.
    SoftwareReset = 0x02,
    /// Select one DPU of the slice.
    SelectDpu = 0x03,
    /// Select a group of DPUs.
    SelectGroup = 0x04,
    /// Select every DPU of the slice.
    SelectAll = 0x05,
    /// Write the structure register (base address for memory accesses).
    WriteStructure = 0x06,
    /// Read the chip identifier.
    Identity = 0x07,
    /// Assign the selected DPUs to a group.
    WriteGroup = 0x08,
    /// Boot a thread at PC 0.
    ThreadBoot = 0x10,
    /// Resume a stopped thread.
    ThreadResume = 0x11,
    /// Clear run bit(s).
    ClearRun = 0x12,
    /// Read the per-DPU run bitfield.
    ReadRun = 0x13,
    /// Read the per-DPU fault bitfield.
    ReadFault = 0x14,
    /// Raise a breakpoint fault.
    SetBkpFault = 0x15,
    /// Clear fault classes.
    ClearFault = 0x16,
    /// Replace the next fetched instruction with STOP.
    DebugReplaceStop = 0x17,
    /// Low half of the last stopped thread's PC.
    ReadPcLsb = 0x18,
    /// High half of the last stopped thread's PC.
    ReadPcMsb = 0x19,
    /// Id of the last stopped thread.
    ReadStoppedThread = 0x1A,
    /// Per-thread run bitfield of the selected DPU.
    ReadThreadRun = 0x1B,
    /// Reset every thread PC.
    ClearPc = 0x1C,
    /// IRAM write, low 32 bits of an instruction.
    IramWriteLo = 0x20,
    /// IRAM write, high 16 bits of an instruction.
    IramWriteHi = 0x21,
    /// IRAM read, low 32 bits.
    IramReadLo = 0x22,
    /// IRAM read, high 16 bits.
    IramReadHi = 0x23,
    /// WRAM word write.
    WramWrite = 0x24,
    /// WRAM word read.
    WramRead = 0x25,
}

impl Opcode {
    /// Decode an opcode byte. Reserved bytes (EMPTY/NOP) and unknown values
    /// yield `None`.
    #[must_use]
    pub const fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0x01 => Self::ByteOrder,
            0x02 => Self::SoftwareReset,
            0x03 => Self::SelectDpu,
            0x04 => Self::SelectGroup,
            0x05 => Self::SelectAll,
            0x06 => Self::WriteStructure,
            0x07 => Self::Identity,
            0x08 => Self::WriteGroup,
            0x10 => Self::ThreadBoot,
            0x11 => Self::ThreadResume,
            0x12 => Self::ClearRun,
            0x13 => Self::ReadRun,
            0x14 => Self::ReadFault,
            0x15 => Self::SetBkpFault,
            0x16 => Self::ClearFault,
            0x17 => Self::DebugReplaceStop,
            0x18 => Self::ReadPcLsb,
            0x19 => Self::ReadPcMsb,
            0x1A => Self::ReadStoppedThread,
            0x1B => Self::ReadThreadRun,
            0x1C => Self::ClearPc,
            0x20 => Self::IramWriteLo,
            0x21 => Self::IramWriteHi,
            0x22 => Self::IramReadLo,
            0x23 => Self::IramReadHi,
            0x24 => Self::WramWrite,
            0x25 => Self::WramRead,
            _ => return None,
        })
    }

    /// Memory writes echo the mask of DPUs that took the write.
    #[must_use]
    pub const fn echoes_selection(self) -> bool {
        matches!(self, Self::IramWriteLo | Self::IramWriteHi | Self::WramWrite)
    }

    /// Select-class commands: their effect cannot be read back.
    #[must_use]
    pub const fn is_select(self) -> bool {
        matches!(self, Self::SelectDpu | Self::SelectGroup | Self::SelectAll)
    }
}

// ── Command encoders ─────────────────────────────────────────────────────────

/// Build a command word from an opcode and payload (payload is truncated to
/// 56 bits).
#[must_use]
pub const fn command(op: Opcode, payload: u64) -> u64 {
    ((op as u64) << TOP_SHIFT) | (payload & PAYLOAD_MASK)
}

/// SELECT_DPU for `member`.
#[must_use]
pub const fn select_dpu(member: u8) -> u64 {
    command(Opcode::SelectDpu, member as u64)
}

/// SELECT_GROUP for `group`.
#[must_use]
pub const fn select_group(group: u8) -> u64 {
    command(Opcode::SelectGroup, group as u64)
}

/// SELECT_ALL.
#[must_use]
pub const fn select_all() -> u64 {
    command(Opcode::SelectAll, 0)
}

/// WRITE_STRUCTURE with a 48-bit value.
#[must_use]
pub const fn write_structure(value: u64) -> u64 {
    command(Opcode::WriteStructure, value & LOW48_MASK)
}

/// THREAD_BOOT / THREAD_RESUME payload: thread id plus PC mode.
#[must_use]
pub const fn thread_payload(thread: u8, pc_mode: u8) -> u64 {
    (thread as u64) | ((pc_mode as u64) << 8)
}

/// Payload of a memory access: `offset` words past the structure base,
/// plus up to 32 bits of data.
#[must_use]
pub const fn memory_payload(offset: u32, data: u32) -> u64 {
    (((offset as u64) & OFFSET_MASK) << OFFSET_SHIFT) | data as u64
}

// ── Field extractors ─────────────────────────────────────────────────────────

/// Top byte (opcode of a command, sentinel of a response).
#[must_use]
pub const fn top_byte(word: u64) -> u8 {
    (word >> TOP_SHIFT) as u8
}

/// Color code byte of a response.
#[must_use]
pub const fn color_byte(word: u64) -> u8 {
    (word >> COLOR_SHIFT) as u8
}

/// Opcode echo byte of a response.
#[must_use]
pub const fn echo_byte(word: u64) -> u8 {
    (word >> ECHO_SHIFT) as u8
}

/// Data field of a response.
#[must_use]
pub const fn data(word: u64) -> u64 {
    word & DATA_MASK
}

/// Payload of a command.
#[must_use]
pub const fn payload(word: u64) -> u64 {
    word & PAYLOAD_MASK
}

/// Memory offset carried by a memory-access payload.
#[must_use]
pub const fn payload_offset(payload: u64) -> u32 {
    ((payload >> OFFSET_SHIFT) & OFFSET_MASK) as u32
}

/// 32-bit datum carried by a memory-access payload.
#[must_use]
pub const fn payload_data(payload: u64) -> u32 {
    payload as u32
}

/// Whether a command word addresses the slice (and therefore flips its
/// color). EMPTY and NOP do not.
#[must_use]
pub const fn addresses_slice(command: u64) -> bool {
    command != EMPTY && (command & TOP_MASK) != NOP
}

/// Byte-order discovery test: some byte of the response is exactly zero.
#[must_use]
pub const fn has_zero_byte(word: u64) -> bool {
    let mut i = 0;
    while i < 8 {
        if (word >> (i * 8)) & 0xFF == 0 {
            return true;
        }
        i += 1;
    }
    false
}

/// Build a response word. Used by simulators; the host only decodes.
#[must_use]
pub const fn response(color_code: u8, echo: u8, data: u64) -> u64 {
    ((ACCEPT_SENTINEL as u64) << TOP_SHIFT)
        | ((color_code as u64) << COLOR_SHIFT)
        | ((echo as u64) << ECHO_SHIFT)
        | (data & DATA_MASK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_words_do_not_address_the_slice() {
        assert!(!addresses_slice(EMPTY));
        assert!(!addresses_slice(NOP));
        assert!(addresses_slice(select_all()));
        assert!(addresses_slice(command(Opcode::ReadRun, 0)));
    }

    #[test]
    fn opcode_byte_roundtrips_through_command() {
        let word = command(Opcode::WramWrite, memory_payload(0x12, 0xDEAD_BEEF));
        assert_eq!(Opcode::from_u8(top_byte(word)), Some(Opcode::WramWrite));
        assert_eq!(payload_offset(payload(word)), 0x12);
        assert_eq!(payload_data(payload(word)), 0xDEAD_BEEF);
    }

    #[test]
    fn reserved_bytes_are_not_opcodes() {
        assert_eq!(Opcode::from_u8(0x00), None);
        assert_eq!(Opcode::from_u8(0xFF), None);
    }

    #[test]
    fn response_fields() {
        let word = response(0xFF, Opcode::ReadRun as u8, 0b1010);
        assert_eq!(top_byte(word), ACCEPT_SENTINEL);
        assert_eq!(color_byte(word), 0xFF);
        assert_eq!(echo_byte(word), Opcode::ReadRun as u8);
        assert_eq!(data(word), 0b1010);
    }

    #[test]
    fn zero_byte_detection() {
        assert!(has_zero_byte(BYTE_ORDER_SIGNATURE));
        assert!(!has_zero_byte(u64::MAX));
        assert!(has_zero_byte(0xFFFF_FFFF_FF00_FFFF));
        assert!(!has_zero_byte(0x0101_0101_0101_0101));
    }

    #[test]
    fn only_memory_writes_echo_selection() {
        assert!(Opcode::WramWrite.echoes_selection());
        assert!(Opcode::IramWriteHi.echoes_selection());
        assert!(!Opcode::WramRead.echoes_selection());
        assert!(!Opcode::ThreadBoot.echoes_selection());
    }
}
