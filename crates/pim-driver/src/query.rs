//! Queries and the wire operations they expand into
//!
//! A [`Query`] is one typed request bound to a [`Target`]. When added to a
//! transaction it expands into the [`Operation`]s that realise it on the
//! wire: an optional leading selection, an optional structure write, then
//! one or more commands. Responses flow back into the query's result.

use crate::state::SliceTarget;
use pim_ufi::pc::PcMode;
use pim_ufi::wire::{self, Opcode};
use pim_ufi::DpuId;
use std::collections::VecDeque;

/// DPUs a query is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// One DPU
    Dpu(DpuId),
    /// A group of one slice
    Group {
        /// Slice
        slice: u8,
        /// Group id
        group: u8,
    },
    /// Every DPU of one slice
    All(u8),
    /// Whatever the slice selected last
    Previous(u8),
}

impl Target {
    /// Slice the query is queued on.
    pub const fn slice(&self) -> u8 {
        match self {
            Self::Dpu(dpu) => dpu.slice,
            Self::Group { slice, .. } | Self::All(slice) | Self::Previous(slice) => *slice,
        }
    }

    /// Selection latched on the wire for this target, `None` for `Previous`.
    pub const fn slice_target(&self) -> Option<SliceTarget> {
        match self {
            Self::Dpu(dpu) => Some(SliceTarget::Dpu(dpu.member)),
            Self::Group { group, .. } => Some(SliceTarget::Group(*group)),
            Self::All(_) => Some(SliceTarget::All),
            Self::Previous(_) => None,
        }
    }
}

/// Protocol operation requested by a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryKind {
    /// Lane discovery; result is the raw response word
    ByteOrder,
    /// Slice reset; the caller busy-waits afterwards
    SoftwareReset,
    /// Explicit no-operation
    Nop,
    /// Chip identifier (u32)
    Identity,
    /// Structure register write
    WriteStructure(u64),
    /// Assign the selected DPUs to a group
    WriteGroup(u8),
    /// Boot a thread; result is the already-running bitfield (u8)
    ThreadBoot {
        /// Thread id
        thread: u8,
        /// PC width of the rank
        pc_mode: PcMode,
    },
    /// Resume a thread; result is the already-running bitfield (u8)
    ThreadResume {
        /// Thread id
        thread: u8,
        /// PC width of the rank
        pc_mode: PcMode,
    },
    /// Clear run bits of a thread (`wire::ALL_THREADS` for all)
    ClearRun(u8),
    /// Run bitfield of the selected DPUs (u8)
    ReadRun,
    /// Fault bitfield of the selected DPUs (u8)
    ReadFault,
    /// Raise a breakpoint fault
    SetBreakpointFault,
    /// Clear fault classes (`wire::fault` bits)
    ClearFault(u8),
    /// Replace the next instruction with STOP
    DebugReplaceStop,
    /// Low PC half of the last stopped thread (u32)
    ReadPcLsb,
    /// High PC half of the last stopped thread (u32)
    ReadPcMsb,
    /// Id of the last stopped thread (u32)
    ReadStoppedThread,
    /// Per-thread run bitfield (u32)
    ReadThreadRun,
    /// Reset every thread PC
    ClearPc,
    /// Write 48-bit instructions from `address`
    IramWrite {
        /// First instruction index
        address: u32,
        /// Instructions (low 48 bits used)
        instructions: Vec<u64>,
    },
    /// Read `count` instructions from `address`
    IramRead {
        /// First instruction index
        address: u32,
        /// Instructions to read
        count: u32,
    },
    /// Write 32-bit words from `address`
    WramWrite {
        /// First word index
        address: u32,
        /// Words
        words: Vec<u32>,
    },
    /// Read `count` words from `address`
    WramRead {
        /// First word index
        address: u32,
        /// Words to read
        count: u32,
    },
}

impl QueryKind {
    /// Slice-level operations never carry a selection.
    const fn is_slice_level(&self) -> bool {
        matches!(self, Self::ByteOrder | Self::SoftwareReset | Self::Nop)
    }
}

/// How an operation is validated and whether it may be elided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    /// Selection write; elided when the slice-target shadow matches
    Select(SliceTarget),
    /// Structure write; elided when the structure shadow matches
    Structure(u64),
    /// Discovery; validated by the zero-byte test
    ByteOrder,
    /// Reset; not validated on the wire
    SoftwareReset,
    /// No-operation
    Nop,
    /// Regular command
    Command(Opcode),
}

/// Where a response lands in the query result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSlot {
    /// Response is discarded
    Ignore,
    /// Raw response word
    Raw,
    /// Low 8 data bits
    Byte,
    /// Low 32 data bits
    Word32,
    /// Low half of instruction `i`
    InstrLo(usize),
    /// High half of instruction `i`
    InstrHi(usize),
    /// Word `i`
    Word(usize),
}

/// One wire step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    /// Validation/elision class
    pub class: OpClass,
    /// Command word
    pub command: u64,
    /// Destination of the response
    pub slot: ResultSlot,
}

impl Operation {
    const fn new(class: OpClass, command: u64, slot: ResultSlot) -> Self {
        Self {
            class,
            command,
            slot,
        }
    }

    fn wire(op: Opcode, payload: u64, slot: ResultSlot) -> Self {
        Self::new(OpClass::Command(op), wire::command(op, payload), slot)
    }

    /// Whether the command needs a selection latched on the slice.
    pub const fn needs_selection(&self) -> bool {
        matches!(self.class, OpClass::Command(_) | OpClass::Structure(_))
    }
}

/// Decoded result of a query
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum QueryResult {
    /// Nothing to report
    #[default]
    None,
    /// 8-bit result (bitfields)
    U8(u8),
    /// 32-bit result
    U32(u32),
    /// Raw 64-bit response
    U64(u64),
    /// IRAM instructions
    Instructions(Vec<u64>),
    /// WRAM words
    Words(Vec<u32>),
}

impl QueryResult {
    /// 8-bit view.
    pub const fn as_u8(&self) -> Option<u8> {
        match self {
            Self::U8(v) => Some(*v),
            _ => None,
        }
    }

    /// 32-bit view.
    pub const fn as_u32(&self) -> Option<u32> {
        match self {
            Self::U32(v) => Some(*v),
            _ => None,
        }
    }

    /// 64-bit view.
    pub const fn as_u64(&self) -> Option<u64> {
        match self {
            Self::U64(v) => Some(*v),
            _ => None,
        }
    }

    /// Instruction view.
    pub fn as_instructions(&self) -> Option<&[u64]> {
        match self {
            Self::Instructions(v) => Some(v),
            _ => None,
        }
    }

    /// Word view.
    pub fn as_words(&self) -> Option<&[u32]> {
        match self {
            Self::Words(v) => Some(v),
            _ => None,
        }
    }
}

/// A targeted protocol request with its result slot
#[derive(Debug, Clone)]
pub struct Query {
    target: Target,
    kind: QueryKind,
    ops: VecDeque<Operation>,
    result: QueryResult,
}

impl Query {
    /// Build a query and expand its operations.
    pub fn new(target: Target, kind: QueryKind) -> Self {
        let ops = expand(target, &kind);
        let result = match &kind {
            QueryKind::IramRead { count, .. } => {
                QueryResult::Instructions(vec![0; *count as usize])
            }
            QueryKind::WramRead { count, .. } => QueryResult::Words(vec![0; *count as usize]),
            _ => QueryResult::None,
        };
        Self {
            target,
            kind,
            ops,
            result,
        }
    }

    /// Target of the query.
    pub const fn target(&self) -> Target {
        self.target
    }

    /// Kind of the query.
    pub const fn kind(&self) -> &QueryKind {
        &self.kind
    }

    /// Operations not yet issued.
    pub fn remaining_operations(&self) -> usize {
        self.ops.len()
    }

    /// Result decoded so far.
    pub const fn result(&self) -> &QueryResult {
        &self.result
    }

    pub(crate) fn current(&self) -> Option<&Operation> {
        self.ops.front()
    }

    pub(crate) fn skip_current(&mut self) {
        self.ops.pop_front();
    }

    pub(crate) fn into_result(self) -> QueryResult {
        self.result
    }

    /// Retire the current operation, decoding its response.
    pub(crate) fn complete_current(&mut self, response: u64) {
        let Some(op) = self.ops.pop_front() else {
            return;
        };
        let data = wire::data(response);
        #[allow(clippy::cast_possible_truncation)]
        match op.slot {
            ResultSlot::Ignore => {}
            ResultSlot::Raw => self.result = QueryResult::U64(response),
            ResultSlot::Byte => self.result = QueryResult::U8(data as u8),
            ResultSlot::Word32 => self.result = QueryResult::U32(data as u32),
            ResultSlot::InstrLo(i) => {
                if let QueryResult::Instructions(v) = &mut self.result {
                    if let Some(instr) = v.get_mut(i) {
                        *instr = (*instr & !0xFFFF_FFFF) | (data & 0xFFFF_FFFF);
                    }
                }
            }
            ResultSlot::InstrHi(i) => {
                if let QueryResult::Instructions(v) = &mut self.result {
                    if let Some(instr) = v.get_mut(i) {
                        *instr = (*instr & 0xFFFF_FFFF) | ((data & 0xFFFF) << 32);
                    }
                }
            }
            ResultSlot::Word(i) => {
                if let QueryResult::Words(v) = &mut self.result {
                    if let Some(word) = v.get_mut(i) {
                        *word = data as u32;
                    }
                }
            }
        }
    }
}

fn expand(target: Target, kind: &QueryKind) -> VecDeque<Operation> {
    let mut ops = VecDeque::new();

    if !kind.is_slice_level() {
        if let Some(selection) = target.slice_target() {
            let command = match selection {
                SliceTarget::Dpu(member) => wire::select_dpu(member),
                SliceTarget::Group(group) => wire::select_group(group),
                SliceTarget::All => wire::select_all(),
            };
            ops.push_back(Operation::new(
                OpClass::Select(selection),
                command,
                ResultSlot::Ignore,
            ));
        }
    }

    let structure = |ops: &mut VecDeque<Operation>, base: u32| {
        let value = u64::from(base);
        ops.push_back(Operation::new(
            OpClass::Structure(value),
            wire::write_structure(value),
            ResultSlot::Ignore,
        ));
    };

    match kind {
        QueryKind::ByteOrder => ops.push_back(Operation::new(
            OpClass::ByteOrder,
            wire::command(Opcode::ByteOrder, 0),
            ResultSlot::Raw,
        )),
        QueryKind::SoftwareReset => ops.push_back(Operation::new(
            OpClass::SoftwareReset,
            wire::command(Opcode::SoftwareReset, 0),
            ResultSlot::Ignore,
        )),
        QueryKind::Nop => {
            ops.push_back(Operation::new(OpClass::Nop, wire::NOP, ResultSlot::Ignore));
        }
        QueryKind::Identity => {
            ops.push_back(Operation::wire(Opcode::Identity, 0, ResultSlot::Word32));
        }
        QueryKind::WriteStructure(value) => ops.push_back(Operation::new(
            OpClass::Structure(*value & wire::LOW48_MASK),
            wire::write_structure(*value),
            ResultSlot::Ignore,
        )),
        QueryKind::WriteGroup(group) => {
            let word = u64::from(*group);
            ops.push_back(Operation::wire(Opcode::WriteGroup, word, ResultSlot::Ignore));
        }
        QueryKind::ThreadBoot { thread, pc_mode } => ops.push_back(Operation::wire(
            Opcode::ThreadBoot,
            wire::thread_payload(*thread, pc_mode.wire_value()),
            ResultSlot::Byte,
        )),
        QueryKind::ThreadResume { thread, pc_mode } => ops.push_back(Operation::wire(
            Opcode::ThreadResume,
            wire::thread_payload(*thread, pc_mode.wire_value()),
            ResultSlot::Byte,
        )),
        QueryKind::ClearRun(thread) => {
            let word = u64::from(*thread);
            ops.push_back(Operation::wire(Opcode::ClearRun, word, ResultSlot::Ignore));
        }
        QueryKind::ReadRun => ops.push_back(Operation::wire(Opcode::ReadRun, 0, ResultSlot::Byte)),
        QueryKind::ReadFault => {
            ops.push_back(Operation::wire(Opcode::ReadFault, 0, ResultSlot::Byte));
        }
        QueryKind::SetBreakpointFault => {
            ops.push_back(Operation::wire(Opcode::SetBkpFault, 0, ResultSlot::Ignore));
        }
        QueryKind::ClearFault(classes) => {
            let word = u64::from(*classes);
            ops.push_back(Operation::wire(Opcode::ClearFault, word, ResultSlot::Ignore));
        }
        QueryKind::DebugReplaceStop => {
            ops.push_back(Operation::wire(Opcode::DebugReplaceStop, 0, ResultSlot::Ignore));
        }
        QueryKind::ReadPcLsb => {
            ops.push_back(Operation::wire(Opcode::ReadPcLsb, 0, ResultSlot::Word32));
        }
        QueryKind::ReadPcMsb => {
            ops.push_back(Operation::wire(Opcode::ReadPcMsb, 0, ResultSlot::Word32));
        }
        QueryKind::ReadStoppedThread => {
            ops.push_back(Operation::wire(Opcode::ReadStoppedThread, 0, ResultSlot::Word32));
        }
        QueryKind::ReadThreadRun => {
            ops.push_back(Operation::wire(Opcode::ReadThreadRun, 0, ResultSlot::Word32));
        }
        QueryKind::ClearPc => {
            ops.push_back(Operation::wire(Opcode::ClearPc, 0, ResultSlot::Ignore));
        }
        QueryKind::IramWrite {
            address,
            instructions,
        } => {
            structure(&mut ops, *address);
            for (i, instr) in (0u32..).zip(instructions) {
                #[allow(clippy::cast_possible_truncation)]
                let (lo, hi) = (*instr as u32, ((*instr >> 32) & 0xFFFF) as u32);
                ops.push_back(Operation::wire(
                    Opcode::IramWriteLo,
                    wire::memory_payload(i, lo),
                    ResultSlot::Ignore,
                ));
                ops.push_back(Operation::wire(
                    Opcode::IramWriteHi,
                    wire::memory_payload(i, hi),
                    ResultSlot::Ignore,
                ));
            }
        }
        QueryKind::IramRead { address, count } => {
            structure(&mut ops, *address);
            for i in 0..*count {
                let idx = i as usize;
                ops.push_back(Operation::wire(
                    Opcode::IramReadLo,
                    wire::memory_payload(i, 0),
                    ResultSlot::InstrLo(idx),
                ));
                ops.push_back(Operation::wire(
                    Opcode::IramReadHi,
                    wire::memory_payload(i, 0),
                    ResultSlot::InstrHi(idx),
                ));
            }
        }
        QueryKind::WramWrite { address, words } => {
            structure(&mut ops, *address);
            for (i, word) in (0u32..).zip(words) {
                ops.push_back(Operation::wire(
                    Opcode::WramWrite,
                    wire::memory_payload(i, *word),
                    ResultSlot::Ignore,
                ));
            }
        }
        QueryKind::WramRead { address, count } => {
            structure(&mut ops, *address);
            for i in 0..*count {
                ops.push_back(Operation::wire(
                    Opcode::WramRead,
                    wire::memory_payload(i, 0),
                    ResultSlot::Word(i as usize),
                ));
            }
        }
    }

    ops
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classes(q: &Query) -> Vec<OpClass> {
        q.ops.iter().map(|op| op.class).collect()
    }

    #[test]
    fn addressed_query_leads_with_selection() {
        let q = Query::new(Target::Dpu(DpuId::new(2, 3)), QueryKind::ReadRun);
        assert_eq!(
            classes(&q),
            vec![
                OpClass::Select(SliceTarget::Dpu(3)),
                OpClass::Command(Opcode::ReadRun)
            ]
        );
        assert_eq!(q.target().slice(), 2);
    }

    #[test]
    fn previous_target_has_no_selection() {
        let q = Query::new(Target::Previous(1), QueryKind::ReadFault);
        assert_eq!(classes(&q), vec![OpClass::Command(Opcode::ReadFault)]);
    }

    #[test]
    fn slice_level_queries_ignore_the_target() {
        let q = Query::new(Target::All(0), QueryKind::SoftwareReset);
        assert_eq!(classes(&q), vec![OpClass::SoftwareReset]);
        let q = Query::new(Target::All(0), QueryKind::Nop);
        assert_eq!(q.current().map(|op| op.command), Some(wire::NOP));
    }

    #[test]
    fn iram_write_expands_two_ops_per_instruction() {
        let q = Query::new(
            Target::Previous(0),
            QueryKind::IramWrite {
                address: 0x40,
                instructions: vec![0x1234_5678_9ABC, 0xFFFF_0000_0001],
            },
        );
        // structure + 2 × (lo, hi)
        assert_eq!(q.remaining_operations(), 5);
        assert_eq!(q.ops[0].class, OpClass::Structure(0x40));
        assert_eq!(wire::payload_data(wire::payload(q.ops[1].command)), 0x5678_9ABC);
        assert_eq!(wire::payload_data(wire::payload(q.ops[2].command)), 0x1234);
        assert_eq!(wire::payload_offset(wire::payload(q.ops[3].command)), 1);
    }

    #[test]
    fn iram_read_reassembles_instruction() {
        let mut q = Query::new(
            Target::Previous(0),
            QueryKind::IramRead {
                address: 0,
                count: 1,
            },
        );
        q.skip_current(); // structure
        q.complete_current(wire::response(0, Opcode::IramReadLo as u8, 0x9ABC_DEF0));
        q.complete_current(wire::response(0, Opcode::IramReadHi as u8, 0x1234));
        assert_eq!(q.result().as_instructions(), Some(&[0x1234_9ABC_DEF0u64][..]));
    }

    #[test]
    fn bitfield_decoder_takes_low_byte() {
        let mut q = Query::new(Target::Previous(0), QueryKind::ReadRun);
        q.complete_current(wire::response(0xFF, Opcode::ReadRun as u8, 0b0110));
        assert_eq!(q.result().as_u8(), Some(0b0110));
        assert_eq!(q.remaining_operations(), 0);
    }
}
