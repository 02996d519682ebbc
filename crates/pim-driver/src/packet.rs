//! One lockstep step across every slice
//!
//! A packet carries exactly one command word per slice plus what the
//! Planner needs to accept that slice's response: a mask/expected pair,
//! the color the response must carry, and the ready flag flipped once the
//! response validated.

use crate::error::{PimError, Result};
use crate::query::{OpClass, Operation};
use crate::state::{SliceInfo, SliceTarget};
use pim_ufi::color::{self, ColorClass};
use pim_ufi::wire::{
    self, DEBUGGER_VALIDATED, ECHO_MASK, ECHO_SHIFT, EMPTY, LOW48_MASK, NOP, SELECTED_ECHO_MASK,
    TOP_MASK,
};

/// Response expected for a plain command: sentinel plus opcode echo.
const fn accepted(command: u64) -> u64 {
    TOP_MASK | ((wire::top_byte(command) as u64) << ECHO_SHIFT)
}

/// State of one slice within a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceSlot {
    /// Command word sent to the slice
    pub command: u64,
    /// Bits of the response compared against `expected`
    pub mask: u64,
    /// Value the masked response must equal
    pub expected: u64,
    /// Response validated
    pub ready: bool,
    /// Validated by the byte-order test instead of the mask
    pub byte_order: bool,
    /// Color the response must carry
    pub expected_color: bool,
    /// Selection latched when the command was built
    pub target: Option<SliceTarget>,
    /// Final response word
    pub response: u64,
    pub(crate) op: Option<Operation>,
}

impl SliceSlot {
    fn idle() -> Self {
        Self {
            command: EMPTY,
            mask: LOW48_MASK,
            expected: 0,
            ready: false,
            byte_order: false,
            expected_color: false,
            target: None,
            response: 0,
            op: None,
        }
    }

    /// Slot carries a query operation.
    pub const fn is_active(&self) -> bool {
        self.op.is_some()
    }

    /// Load `op`, flipping the slice color and updating the register
    /// shadows of `info`.
    pub(crate) fn load(
        &mut self,
        op: Operation,
        info: &mut SliceInfo,
        member_mask: u8,
    ) -> Result<()> {
        if op.needs_selection() && info.slice_target.is_none() {
            return Err(PimError::internal(
                "command targets the previous selection but none was sent",
            ));
        }

        let command = op.command;
        let (mask, expected) = match op.class {
            OpClass::Nop => (TOP_MASK, NOP),
            OpClass::ByteOrder => {
                self.byte_order = true;
                (0, 0)
            }
            OpClass::SoftwareReset => {
                self.ready = true;
                (0, 0)
            }
            OpClass::Select(target) => {
                if let SliceTarget::Dpu(_) = target {
                    target.selected_mask(info.enabled_dpus, member_mask)?;
                }
                info.slice_target = Some(target);
                info.structure_value = None;
                (TOP_MASK | ECHO_MASK, accepted(command))
            }
            OpClass::Structure(value) => {
                info.structure_value = Some(value);
                (TOP_MASK | ECHO_MASK, accepted(command))
            }
            OpClass::Command(opcode) if opcode.echoes_selection() => {
                let selected = info
                    .slice_target
                    .map_or(Ok(0), |t| t.selected_mask(info.enabled_dpus, member_mask))?;
                (
                    TOP_MASK | ECHO_MASK | SELECTED_ECHO_MASK,
                    accepted(command) | u64::from(selected),
                )
            }
            OpClass::Command(_) => (TOP_MASK | ECHO_MASK, accepted(command)),
        };

        if wire::addresses_slice(command) {
            info.color = !info.color;
        }
        self.command = command;
        self.mask = mask;
        self.expected = expected;
        self.expected_color = info.color;
        self.target = info.slice_target;
        self.op = Some(op);
        Ok(())
    }

    /// Command toggles the slice color once committed.
    pub fn flips_color(&self) -> bool {
        self.is_active() && wire::addresses_slice(self.command)
    }

    /// Classify a response; `None` means read again.
    pub fn check(&self, response: u64) -> Option<ColorClass> {
        if self.ready {
            return Some(ColorClass::Clean);
        }
        if response == DEBUGGER_VALIDATED {
            return Some(ColorClass::Clean);
        }
        if response & self.mask != self.expected {
            return None;
        }
        if !wire::addresses_slice(self.command) {
            return Some(ColorClass::Clean);
        }
        let class = color::classify(wire::color_byte(response), self.expected_color);
        class.is_settled().then_some(class)
    }
}

/// One command per slice
#[derive(Debug, Clone)]
pub struct Packet {
    slots: Vec<SliceSlot>,
    committed: bool,
}

impl Packet {
    /// Packet of idle slots.
    pub fn new(nr_slices: usize) -> Self {
        Self {
            slots: (0..nr_slices).map(|_| SliceSlot::idle()).collect(),
            committed: false,
        }
    }

    /// Reset every slot to the idle sentinel.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = SliceSlot::idle();
        }
        self.committed = false;
    }

    /// Commands reached the rank.
    pub const fn is_committed(&self) -> bool {
        self.committed
    }

    pub(crate) fn mark_committed(&mut self) {
        self.committed = true;
    }

    /// Slots in slice order.
    pub fn slots(&self) -> &[SliceSlot] {
        &self.slots
    }

    pub(crate) fn slots_mut(&mut self) -> &mut [SliceSlot] {
        &mut self.slots
    }

    /// Command words in slice order.
    pub fn commands(&self) -> Vec<u64> {
        self.slots.iter().map(|s| s.command).collect()
    }

    /// Some slice carries a query operation.
    pub fn any_active(&self) -> bool {
        self.slots.iter().any(SliceSlot::is_active)
    }

    /// Some slice runs byte-order discovery.
    pub fn has_byte_order(&self) -> bool {
        self.slots.iter().any(|s| s.byte_order && !s.ready)
    }

    /// Every slot validated.
    pub fn all_ready(&self) -> bool {
        self.slots.iter().all(|s| s.ready)
    }
}
