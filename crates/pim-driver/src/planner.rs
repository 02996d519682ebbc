//! Transaction execution
//!
//! The Planner turns per-slice query queues into a sequence of packets.
//! Each packet is committed once, then read back until every slice's
//! response validates or the retry budget runs out. A final read-back
//! supplies the result words. Selections and structure writes already
//! latched on a slice are elided using the shadows in [`SliceInfo`].
//!
//! [`SliceInfo`]: crate::state::SliceInfo

use crate::backend::RankBackend;
use crate::error::{PimError, Result};
use crate::packet::Packet;
use crate::query::OpClass;
use crate::state::RankRuntimeState;
use crate::transaction::Transaction;
use pim_ufi::wire;
use tracing::{trace, warn};

/// Counters for one executed transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    /// Packets committed
    pub packets: u32,
    /// Read-backs issued, final reads included
    pub read_backs: u32,
}

/// Drives one transaction over a backend
pub struct Planner<'a> {
    state: &'a mut RankRuntimeState,
    backend: &'a mut dyn RankBackend,
    max_retries: u32,
    results: Vec<u64>,
}

impl<'a> Planner<'a> {
    /// Planner over `state` and `backend`, reading back at most
    /// `max_retries` times per packet.
    pub fn new(
        state: &'a mut RankRuntimeState,
        backend: &'a mut dyn RankBackend,
        max_retries: u32,
    ) -> Self {
        let nr = state.nr_slices();
        Self {
            state,
            backend,
            max_retries,
            results: vec![0; nr],
        }
    }

    /// Run `txn` to completion.
    ///
    /// Queries complete in FIFO order per slice. On a fatal error the
    /// pending queries are discarded and the register shadows of the
    /// slices involved in the failing packet are invalidated. A packet that
    /// never reached the rank leaves the slice colors untouched.
    ///
    /// # Errors
    ///
    /// `Driver`/`System` on backend failure, `Timeout` when a packet never
    /// validates, `Internal` on a control-plane invariant violation.
    pub fn execute(&mut self, txn: &mut Transaction) -> Result<ExecutionReport> {
        if txn.nr_slices() != self.state.nr_slices() {
            return Err(PimError::internal(format!(
                "transaction has {} slices, rank has {}",
                txn.nr_slices(),
                self.state.nr_slices()
            )));
        }

        let mut report = ExecutionReport::default();
        let mut packet = Packet::new(self.state.nr_slices());
        loop {
            packet.clear();
            let step = self
                .build(txn, &mut packet)
                .and_then(|active| {
                    if active {
                        self.run(&mut packet, &mut report).map(|()| true)
                    } else {
                        Ok(false)
                    }
                });
            match step {
                Ok(true) => Self::retire(txn, &packet),
                Ok(false) => break,
                Err(err) => {
                    self.abort(txn, &packet, &err);
                    return Err(err);
                }
            }
        }
        Ok(report)
    }

    /// Fill `packet` from the queue heads. Returns whether any slice has
    /// work.
    fn build(&mut self, txn: &mut Transaction, packet: &mut Packet) -> Result<bool> {
        let member_mask = self.state.topology().member_mask();
        for (s, slot) in packet.slots_mut().iter_mut().enumerate() {
            let info = &mut self.state.slices[s];
            while let Some(query) = txn.head_mut(s) {
                let Some(op) = query.current().copied() else {
                    txn.complete_head(s);
                    continue;
                };
                let elided = match op.class {
                    OpClass::Select(target) => info.slice_target == Some(target),
                    OpClass::Structure(value) => info.structure_value == Some(value),
                    _ => false,
                };
                if elided {
                    query.skip_current();
                    continue;
                }
                slot.load(op, info, member_mask)?;
                break;
            }
        }
        Ok(packet.any_active())
    }

    fn read_back(&mut self, report: &mut ExecutionReport) -> Result<()> {
        self.backend
            .update_commands(&mut self.results)
            .into_result("update_commands")?;
        report.read_backs += 1;
        Ok(())
    }

    fn run(&mut self, packet: &mut Packet, report: &mut ExecutionReport) -> Result<()> {
        let commands = packet.commands();
        trace!("Packet {}: {:016x?}", report.packets, commands);
        self.backend
            .commit_commands(&commands)
            .into_result("commit_commands")?;
        packet.mark_committed();
        report.packets += 1;

        if packet.has_byte_order() {
            let mut attempts = 0;
            while packet.has_byte_order() {
                if attempts == self.max_retries {
                    return Err(PimError::Timeout { attempts });
                }
                self.read_back(report)?;
                attempts += 1;
                for (slot, &word) in packet.slots_mut().iter_mut().zip(&self.results) {
                    if slot.byte_order && wire::has_zero_byte(word) {
                        slot.ready = true;
                    }
                }
            }
        }

        let mut attempts = 0;
        while !packet.all_ready() {
            if attempts == self.max_retries {
                let pending: Vec<usize> = (0..)
                    .zip(packet.slots())
                    .filter(|(_, slot)| !slot.ready)
                    .map(|(s, _)| s)
                    .collect();
                warn!("Slices {:?} never validated after {} read-backs", pending, attempts);
                return Err(PimError::Timeout { attempts });
            }
            self.read_back(report)?;
            attempts += 1;
            for (s, slot) in packet.slots_mut().iter_mut().enumerate() {
                if slot.ready {
                    continue;
                }
                let Some(class) = slot.check(self.results[s]) else {
                    continue;
                };
                let info = &mut self.state.slices[s];
                if class.decode() {
                    info.fault_decode = true;
                    warn!("Slice {s}: decode error on {:016x}", slot.command);
                }
                if class.collide() {
                    info.fault_collide = true;
                    warn!("Slice {s}: collision on {:016x}", slot.command);
                }
                slot.ready = true;
            }
        }

        self.read_back(report)?;
        for (slot, &word) in packet.slots_mut().iter_mut().zip(&self.results) {
            slot.response = word;
        }
        Ok(())
    }

    fn retire(txn: &mut Transaction, packet: &Packet) {
        for (s, slot) in packet.slots().iter().enumerate() {
            if !slot.is_active() {
                continue;
            }
            let done = txn.head_mut(s).is_some_and(|query| {
                query.complete_current(slot.response);
                query.remaining_operations() == 0
            });
            if done {
                txn.complete_head(s);
            }
        }
    }

    fn abort(&mut self, txn: &mut Transaction, packet: &Packet, err: &PimError) {
        for (info, slot) in self.state.slices.iter_mut().zip(packet.slots()) {
            if !slot.is_active() {
                continue;
            }
            info.invalidate_shadows();
            if slot.flips_color() && !packet.is_committed() {
                info.color = !info.color;
            }
        }
        let dropped = txn.discard_pending();
        warn!("Transaction aborted ({err}), {dropped} queries dropped");
    }
}

impl std::fmt::Debug for Planner<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner")
            .field("backend", &self.backend.backend_type())
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

/// Execute `txn` against `backend` with the given retry budget.
///
/// # Errors
///
/// See [`Planner::execute`].
pub fn execute_transaction(
    state: &mut RankRuntimeState,
    backend: &mut dyn RankBackend,
    max_retries: u32,
    txn: &mut Transaction,
) -> Result<ExecutionReport> {
    Planner::new(state, backend, max_retries).execute(txn)
}
