// SPDX-License-Identifier: AGPL-3.0-only

//! Simulated rank backend
//!
//! Implements [`RankBackend`] with an in-process model of the slices and
//! their DPUs. Every command is decoded and applied the way a rank would:
//! the slice color flips, selections latch, the structure register offsets
//! memory accesses, and DPUs run scripted programs that stop (or fault)
//! after a number of run-bit polls.
//!
//! The simulator is a cloneable handle over shared state so a test can keep
//! one copy for inspection and fault injection while the rank owns another.
//!
//! ## Injection
//!
//! ```text
//! set_unsettled_reads(n)     first n read-backs after each commit are stale
//! inject_color_fault(s, c)   next response of slice s carries class c
//! set_stuck_slice(Some(s))   slice s never answers
//! fail_next_commit(status)   next commit_commands returns status
//! fail_next_update(status)   next update_commands returns status
//! set_byte_order_delay(n)    BYTE_ORDER answers u64::MAX for n reads
//! set_lane_swap(true)        BYTE_ORDER answers a byte-swapped signature
//! ```

use crate::backend::{BackendStatus, BackendType, MemoryRegion, RankBackend, TransferDescriptor};
use parking_lot::Mutex;
use pim_ufi::color::{self, ColorClass};
use pim_ufi::wire::{self, fault, Opcode, ALL_THREADS, BYTE_ORDER_SIGNATURE, EMPTY, LOW48_MASK};
use pim_ufi::pc::{MAX_PC_WIDTH, MIN_PC_WIDTH};
use pim_ufi::{DpuId, PcMode, Topology};
use std::sync::Arc;
use tracing::{debug, trace};

/// Chip identifier answered by `IDENTITY`.
pub const SIMULATED_CHIP_ID: u32 = 0x5049_4D01;

/// Word answered by a slice that never responds.
const STUCK_WORD: u64 = 0xDEAD_BEEF;

/// Color code at distance 4 from either color: never settles.
const UNSETTLED_CODE: u8 = 0x0F;

/// Scripted behaviour of a booted DPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DpuProgram {
    /// `READ_RUN` polls answered as running before the DPU stops
    pub run_polls: u32,
    /// Raise a breakpoint fault after this many polls instead
    pub fault_after: Option<u32>,
}

impl Default for DpuProgram {
    fn default() -> Self {
        Self {
            run_polls: 1,
            fault_after: None,
        }
    }
}

impl DpuProgram {
    /// Program that runs for `polls` polls.
    pub const fn runs_for(polls: u32) -> Self {
        Self {
            run_polls: polls,
            fault_after: None,
        }
    }

    /// Program that faults after `polls` polls.
    pub const fn faults_after(polls: u32) -> Self {
        Self {
            run_polls: u32::MAX,
            fault_after: Some(polls),
        }
    }
}

#[derive(Debug, Clone)]
struct SimDpu {
    threads: u32,
    pcs: Vec<u32>,
    fault: u8,
    group: u8,
    structure: u64,
    iram: Vec<u64>,
    wram: Vec<u32>,
    program: DpuProgram,
    polls: u32,
    pc_mode: u8,
    last_stopped: u8,
    boots: u32,
}

impl SimDpu {
    fn new(nr_threads: u8, iram: usize, wram: usize) -> Self {
        Self {
            threads: 0,
            pcs: vec![0; usize::from(nr_threads)],
            fault: 0,
            group: 0,
            structure: 0,
            iram: vec![0; iram],
            wram: vec![0; wram],
            program: DpuProgram::default(),
            polls: 0,
            pc_mode: 0,
            last_stopped: 0,
            boots: 0,
        }
    }

    /// Reset control state; memories survive.
    fn reset(&mut self) {
        self.threads = 0;
        self.pcs.iter_mut().for_each(|pc| *pc = 0);
        self.fault = 0;
        self.group = 0;
        self.structure = 0;
        self.polls = 0;
        self.last_stopped = 0;
    }

    fn is_running(&self) -> bool {
        self.threads != 0
    }

    /// One run-bit poll: advance the program and report whether the DPU
    /// still has a thread running.
    fn poll(&mut self) -> bool {
        if self.is_running() && self.fault == 0 {
            self.polls += 1;
            for t in 0..self.pcs.len() {
                if self.threads & (1 << t) != 0 {
                    self.pcs[t] = self.pcs[t].wrapping_add(1);
                }
            }
            if self.program.fault_after.is_some_and(|n| self.polls >= n) {
                self.fault |= fault::BREAKPOINT;
            } else if self.polls >= self.program.run_polls {
                self.last_stopped = self.threads.trailing_zeros() as u8;
                self.threads = 0;
            }
        }
        self.is_running()
    }

    fn start_thread(&mut self, thread: u8, pc_mode: u8, keep_pc: bool) -> bool {
        let bit = 1u32.checked_shl(u32::from(thread)).unwrap_or(0);
        if self.threads & bit != 0 {
            return true;
        }
        if !keep_pc {
            if let Some(pc) = self.pcs.get_mut(usize::from(thread)) {
                *pc = 0;
            }
            self.polls = 0;
            self.boots += 1;
        }
        self.threads |= bit;
        self.pc_mode = pc_mode;
        false
    }

    /// Stop the lowest running thread at its next instruction.
    fn replace_stop(&mut self) {
        if self.threads != 0 {
            let t = self.threads.trailing_zeros();
            self.threads &= !(1 << t);
            self.last_stopped = t as u8;
        }
    }

    fn stopped_pc(&self) -> u32 {
        self.pcs.get(usize::from(self.last_stopped)).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selection {
    None,
    Dpu(u8),
    Group(u8),
    All,
}

#[derive(Debug, Clone)]
struct SimSlice {
    color: bool,
    selection: Selection,
    response: u64,
    stale_reads: u32,
    byte_order_reads: u32,
    pending_color_fault: Option<ColorClass>,
    dpus: Vec<SimDpu>,
}

#[derive(Debug)]
struct SimState {
    topology: Topology,
    slices: Vec<SimSlice>,
    commits: Vec<Vec<u64>>,
    update_count: u64,
    unsettled_reads: u32,
    byte_order_delay: u32,
    lane_swap: bool,
    stuck_slice: Option<u8>,
    fail_commit: Option<BackendStatus>,
    fail_update: Option<BackendStatus>,
}

/// In-process rank simulator
#[derive(Debug, Clone)]
pub struct SimulatedRank {
    inner: Arc<Mutex<SimState>>,
}

impl SimulatedRank {
    /// Simulated rank with `nr_threads` threads, `iram` instructions and
    /// `wram` words per DPU.
    pub fn new(topology: Topology, nr_threads: u8, iram: u32, wram: u32) -> Self {
        let dpu = SimDpu::new(nr_threads, iram as usize, wram as usize);
        let slice = SimSlice {
            color: false,
            selection: Selection::None,
            response: EMPTY,
            stale_reads: 0,
            byte_order_reads: 0,
            pending_color_fault: None,
            dpus: vec![dpu; usize::from(topology.dpus_per_slice)],
        };
        debug!(
            "SimulatedRank: {}x{} DPUs, {nr_threads} threads, IRAM {iram}, WRAM {wram}",
            topology.nr_slices, topology.dpus_per_slice
        );
        Self {
            inner: Arc::new(Mutex::new(SimState {
                topology,
                slices: vec![slice; usize::from(topology.nr_slices)],
                commits: Vec::new(),
                update_count: 0,
                unsettled_reads: 0,
                byte_order_delay: 0,
                lane_swap: false,
                stuck_slice: None,
                fail_commit: None,
                fail_update: None,
            })),
        }
    }

    /// Simulator sized after a rank configuration.
    pub fn for_config(config: &crate::config::RankConfig) -> Self {
        Self::new(
            config.topology,
            config.nr_threads,
            config.iram_instructions,
            config.wram_words,
        )
    }

    fn with_dpu<R>(&self, dpu: DpuId, f: impl FnOnce(&mut SimDpu) -> R) -> Option<R> {
        let mut state = self.inner.lock();
        state
            .slices
            .get_mut(usize::from(dpu.slice))
            .and_then(|s| s.dpus.get_mut(usize::from(dpu.member)))
            .map(f)
    }

    // ── Scripting and injection ──────────────────────────────────────────

    /// Script what `dpu` does once booted.
    pub fn set_program(&self, dpu: DpuId, program: DpuProgram) {
        self.with_dpu(dpu, |d| d.program = program);
    }

    /// Script every DPU.
    pub fn set_program_all(&self, program: DpuProgram) {
        let mut state = self.inner.lock();
        for dpu in state.slices.iter_mut().flat_map(|s| s.dpus.iter_mut()) {
            dpu.program = program;
        }
    }

    /// Stale read-backs served after each commit.
    pub fn set_unsettled_reads(&self, reads: u32) {
        self.inner.lock().unsettled_reads = reads;
    }

    /// Next addressed response of `slice` carries `class`.
    pub fn inject_color_fault(&self, slice: u8, class: ColorClass) {
        if let Some(s) = self.inner.lock().slices.get_mut(usize::from(slice)) {
            s.pending_color_fault = Some(class);
        }
    }

    /// Make `slice` answer garbage forever (`None` to heal).
    pub fn set_stuck_slice(&self, slice: Option<u8>) {
        self.inner.lock().stuck_slice = slice;
    }

    /// Fail the next `commit_commands` call.
    pub fn fail_next_commit(&self, status: BackendStatus) {
        self.inner.lock().fail_commit = Some(status);
    }

    /// Fail the next `update_commands` call.
    pub fn fail_next_update(&self, status: BackendStatus) {
        self.inner.lock().fail_update = Some(status);
    }

    /// Reads before byte-order discovery settles.
    pub fn set_byte_order_delay(&self, reads: u32) {
        self.inner.lock().byte_order_delay = reads;
    }

    /// Answer byte-order discovery with swapped lanes.
    pub fn set_lane_swap(&self, swapped: bool) {
        self.inner.lock().lane_swap = swapped;
    }

    /// Force a thread PC.
    pub fn set_thread_pc(&self, dpu: DpuId, thread: u8, pc: u32) {
        self.with_dpu(dpu, |d| {
            if let Some(slot) = d.pcs.get_mut(usize::from(thread)) {
                *slot = pc;
            }
        });
    }

    // ── Inspection ───────────────────────────────────────────────────────

    /// `commit_commands` calls so far.
    pub fn commit_count(&self) -> usize {
        self.inner.lock().commits.len()
    }

    /// `update_commands` calls so far.
    pub fn update_count(&self) -> u64 {
        self.inner.lock().update_count
    }

    /// Every committed packet, oldest first.
    pub fn committed(&self) -> Vec<Vec<u64>> {
        self.inner.lock().commits.clone()
    }

    /// Forget the commit log and counters.
    pub fn clear_log(&self) {
        let mut state = self.inner.lock();
        state.commits.clear();
        state.update_count = 0;
    }

    /// Current color bit of `slice`.
    pub fn color(&self, slice: u8) -> Option<bool> {
        self.inner.lock().slices.get(usize::from(slice)).map(|s| s.color)
    }

    /// Thread run bitfield of `dpu`.
    pub fn threads(&self, dpu: DpuId) -> u32 {
        self.with_dpu(dpu, |d| d.threads).unwrap_or(0)
    }

    /// Fault classes raised on `dpu`.
    pub fn fault_bits(&self, dpu: DpuId) -> u8 {
        self.with_dpu(dpu, |d| d.fault).unwrap_or(0)
    }

    /// Group `dpu` belongs to.
    pub fn group(&self, dpu: DpuId) -> Option<u8> {
        self.with_dpu(dpu, |d| d.group)
    }

    /// Times `dpu` was booted.
    pub fn boot_count(&self, dpu: DpuId) -> u32 {
        self.with_dpu(dpu, |d| d.boots).unwrap_or(0)
    }

    /// PC of `thread` on `dpu`.
    pub fn thread_pc(&self, dpu: DpuId, thread: u8) -> Option<u32> {
        self.with_dpu(dpu, |d| d.pcs.get(usize::from(thread)).copied())
            .flatten()
    }

    /// Instruction at `address` of `dpu`.
    pub fn iram(&self, dpu: DpuId, address: u32) -> Option<u64> {
        self.with_dpu(dpu, |d| d.iram.get(address as usize).copied())
            .flatten()
    }

    /// `len` WRAM words of `dpu` from `offset`.
    pub fn wram(&self, dpu: DpuId, offset: u32, len: u32) -> Vec<u32> {
        self.with_dpu(dpu, |d| {
            let start = (offset as usize).min(d.wram.len());
            let end = (start + len as usize).min(d.wram.len());
            d.wram[start..end].to_vec()
        })
        .unwrap_or_default()
    }

    /// Store WRAM words directly.
    pub fn poke_wram(&self, dpu: DpuId, offset: u32, words: &[u32]) {
        self.with_dpu(dpu, |d| {
            for (slot, &w) in d.wram.iter_mut().skip(offset as usize).zip(words) {
                *slot = w;
            }
        });
    }
}

impl SimState {
    fn selected(&self, slice: usize) -> u8 {
        let s = &self.slices[slice];
        let member_mask = self.topology.member_mask();
        match s.selection {
            Selection::None => 0,
            Selection::Dpu(m) => 1u8.checked_shl(u32::from(m)).unwrap_or(0) & member_mask,
            Selection::Group(g) => (0u8..)
                .zip(&s.dpus)
                .filter(|(_, d)| d.group == g)
                .fold(0, |acc, (m, _)| acc | (1 << m)),
            Selection::All => member_mask,
        }
    }

    /// Apply `word` to `slice` and compute its response.
    fn execute(&mut self, slice: usize, word: u64) -> u64 {
        let top = wire::top_byte(word);
        if word == EMPTY || top == 0xFF {
            let color = self.slices[slice].color;
            return wire::response(color::encode(color), 0, 0);
        }

        let Some(op) = Opcode::from_u8(top) else {
            let s = &mut self.slices[slice];
            s.color = !s.color;
            return wire::response(color::encode(s.color) ^ 0x01, top, 0);
        };

        if op == Opcode::SoftwareReset {
            let s = &mut self.slices[slice];
            s.color = true;
            s.selection = Selection::None;
            s.dpus.iter_mut().for_each(SimDpu::reset);
            return wire::response(color::encode(true), top, 0);
        }

        self.slices[slice].color = !self.slices[slice].color;

        if op == Opcode::ByteOrder {
            self.slices[slice].byte_order_reads = self.byte_order_delay;
            return if self.lane_swap {
                BYTE_ORDER_SIGNATURE.swap_bytes()
            } else {
                BYTE_ORDER_SIGNATURE
            };
        }

        let payload = wire::payload(word);
        let selected = self.selected(slice);
        let data = self.apply(slice, op, payload, selected);

        let s = &mut self.slices[slice];
        let mut code = color::encode(s.color);
        if let Some(class) = s.pending_color_fault.take() {
            code ^= match class {
                ColorClass::Clean => 0x00,
                ColorClass::Decode => 0x01,
                ColorClass::Collide => 0x03,
                ColorClass::DecodeCollide => 0x07,
                ColorClass::Unsettled => UNSETTLED_CODE,
            };
        }
        wire::response(code, top, data)
    }

    fn apply(&mut self, slice: usize, op: Opcode, payload: u64, selected: u8) -> u64 {
        let s = &mut self.slices[slice];
        let first = selected.trailing_zeros() as usize;
        let mut each = |f: &mut dyn FnMut(&mut SimDpu) -> bool| -> u8 {
            let mut bits = 0u8;
            for (m, dpu) in s.dpus.iter_mut().enumerate() {
                if selected & (1 << m) != 0 && f(dpu) {
                    bits |= 1 << m;
                }
            }
            bits
        };
        #[allow(clippy::cast_possible_truncation)]
        let (thread, mode) = (payload as u8, (payload >> 8) as u8);
        let offset = wire::payload_offset(payload) as usize;
        let datum = wire::payload_data(payload);

        match op {
            Opcode::SelectDpu => {
                s.selection = Selection::Dpu(thread);
                0
            }
            Opcode::SelectGroup => {
                s.selection = Selection::Group(thread);
                0
            }
            Opcode::SelectAll => {
                s.selection = Selection::All;
                0
            }
            Opcode::WriteStructure => {
                each(&mut |d| {
                    d.structure = payload & LOW48_MASK;
                    false
                });
                0
            }
            Opcode::Identity => u64::from(SIMULATED_CHIP_ID),
            Opcode::WriteGroup => {
                each(&mut |d| {
                    d.group = thread;
                    false
                });
                0
            }
            Opcode::ThreadBoot => u64::from(each(&mut |d| d.start_thread(thread, mode, false))),
            Opcode::ThreadResume => u64::from(each(&mut |d| d.start_thread(thread, mode, true))),
            Opcode::ClearRun => {
                each(&mut |d| {
                    if thread == ALL_THREADS {
                        d.threads = 0;
                    } else {
                        d.threads &= !1u32.checked_shl(u32::from(thread)).unwrap_or(0);
                    }
                    false
                });
                0
            }
            Opcode::ReadRun => u64::from(each(&mut SimDpu::poll)),
            Opcode::ReadFault => u64::from(each(&mut |d| d.fault != 0)),
            Opcode::SetBkpFault => {
                each(&mut |d| {
                    d.fault |= fault::BREAKPOINT;
                    false
                });
                0
            }
            Opcode::ClearFault => {
                #[allow(clippy::cast_possible_truncation)]
                let classes = payload as u8;
                each(&mut |d| {
                    d.fault &= !classes;
                    false
                });
                0
            }
            Opcode::DebugReplaceStop => {
                each(&mut |d| {
                    d.replace_stop();
                    false
                });
                0
            }
            Opcode::ClearPc => {
                each(&mut |d| {
                    d.pcs.iter_mut().for_each(|pc| *pc = 0);
                    false
                });
                0
            }
            Opcode::ReadPcLsb
            | Opcode::ReadPcMsb
            | Opcode::ReadStoppedThread
            | Opcode::ReadThreadRun => {
                let Some(d) = s.dpus.get(first) else { return 0 };
                let width = d.pc_mode.clamp(MIN_PC_WIDTH, MAX_PC_WIDTH);
                let (msb, lsb) = PcMode::for_iram(1u32 << width)
                    .map_or((0, 0), |mode| mode.split(d.stopped_pc()));
                u64::from(match op {
                    Opcode::ReadPcLsb => lsb,
                    Opcode::ReadPcMsb => msb,
                    Opcode::ReadStoppedThread => u32::from(d.last_stopped),
                    _ => d.threads,
                })
            }
            Opcode::IramWriteLo | Opcode::IramWriteHi => u64::from(each(&mut |d| {
                let addr = d.structure as usize + offset;
                if let Some(instr) = d.iram.get_mut(addr) {
                    *instr = if op == Opcode::IramWriteLo {
                        (*instr & !0xFFFF_FFFF) | u64::from(datum)
                    } else {
                        (*instr & 0xFFFF_FFFF) | (u64::from(datum & 0xFFFF) << 32)
                    };
                }
                true
            })),
            Opcode::WramWrite => u64::from(each(&mut |d| {
                let addr = d.structure as usize + offset;
                if let Some(word) = d.wram.get_mut(addr) {
                    *word = datum;
                }
                true
            })),
            Opcode::IramReadLo | Opcode::IramReadHi => {
                let Some(d) = s.dpus.get(first) else { return 0 };
                let instr = d.iram.get(d.structure as usize + offset).copied().unwrap_or(0);
                if op == Opcode::IramReadLo {
                    instr & 0xFFFF_FFFF
                } else {
                    (instr >> 32) & 0xFFFF
                }
            }
            Opcode::WramRead => {
                let Some(d) = s.dpus.get(first) else { return 0 };
                u64::from(d.wram.get(d.structure as usize + offset).copied().unwrap_or(0))
            }
            Opcode::ByteOrder | Opcode::SoftwareReset => 0,
        }
    }

    fn wram_of(&mut self, dpu: DpuId) -> Option<&mut Vec<u32>> {
        self.slices
            .get_mut(usize::from(dpu.slice))
            .and_then(|s| s.dpus.get_mut(usize::from(dpu.member)))
            .map(|d| &mut d.wram)
    }
}

impl RankBackend for SimulatedRank {
    fn commit_commands(&mut self, commands: &[u64]) -> BackendStatus {
        let mut state = self.inner.lock();
        if let Some(status) = state.fail_commit.take() {
            return status;
        }
        if commands.len() != state.slices.len() {
            return BackendStatus::InvalidProperty;
        }
        trace!("SimulatedRank: commit {:016x?}", commands);
        state.commits.push(commands.to_vec());
        let stale = state.unsettled_reads;
        for (i, &word) in commands.iter().enumerate() {
            let response = state.execute(i, word);
            let slice = &mut state.slices[i];
            slice.response = response;
            let settles_late =
                wire::addresses_slice(word) && wire::top_byte(word) != Opcode::ByteOrder as u8;
            slice.stale_reads = if settles_late {
                stale
            } else {
                0
            };
        }
        BackendStatus::Success
    }

    fn update_commands(&mut self, results: &mut [u64]) -> BackendStatus {
        let mut state = self.inner.lock();
        if let Some(status) = state.fail_update.take() {
            return status;
        }
        if results.len() != state.slices.len() {
            return BackendStatus::InvalidProperty;
        }
        state.update_count += 1;
        let stuck = state.stuck_slice.map(usize::from);
        for (i, (slice, out)) in state.slices.iter_mut().zip(results.iter_mut()).enumerate() {
            *out = if stuck == Some(i) {
                STUCK_WORD
            } else if slice.byte_order_reads > 0 {
                slice.byte_order_reads -= 1;
                u64::MAX
            } else if slice.stale_reads > 0 {
                slice.stale_reads -= 1;
                (slice.response & !wire::COLOR_MASK)
                    | (u64::from(UNSETTLED_CODE) << wire::COLOR_SHIFT)
            } else {
                slice.response
            };
        }
        BackendStatus::Success
    }

    fn copy_to_rank(&mut self, xfer: &TransferDescriptor) -> BackendStatus {
        let MemoryRegion::Wram = xfer.region;
        let mut state = self.inner.lock();
        for buffer in &xfer.buffers {
            let Some(wram) = state.wram_of(buffer.dpu) else {
                return BackendStatus::InvalidProperty;
            };
            let words = buffer.data.len() / 4;
            let start = xfer.offset as usize;
            if buffer.data.len() % 4 != 0 || start + words > wram.len() {
                return BackendStatus::BackendError;
            }
            for (slot, chunk) in wram[start..start + words]
                .iter_mut()
                .zip(buffer.data.chunks_exact(4))
            {
                *slot = u32::from_le(bytemuck::pod_read_unaligned(chunk));
            }
        }
        BackendStatus::Success
    }

    fn copy_from_rank(&mut self, xfer: &mut TransferDescriptor) -> BackendStatus {
        let MemoryRegion::Wram = xfer.region;
        let mut state = self.inner.lock();
        let start = xfer.offset as usize;
        for buffer in &mut xfer.buffers {
            let Some(wram) = state.wram_of(buffer.dpu) else {
                return BackendStatus::InvalidProperty;
            };
            let words = buffer.data.len() / 4;
            if buffer.data.len() % 4 != 0 || start + words > wram.len() {
                return BackendStatus::BackendError;
            }
            let le: Vec<u32> = wram[start..start + words].iter().map(|w| w.to_le()).collect();
            buffer.data.copy_from_slice(bytemuck::cast_slice::<u32, u8>(&le));
        }
        BackendStatus::Success
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Simulated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim() -> SimulatedRank {
        SimulatedRank::new(Topology::new(2, 4), 4, 256, 64)
    }

    fn commit(sim: &mut SimulatedRank, words: &[u64]) -> Vec<u64> {
        assert_eq!(sim.commit_commands(words), BackendStatus::Success);
        let mut out = vec![0; words.len()];
        assert_eq!(sim.update_commands(&mut out), BackendStatus::Success);
        out
    }

    #[test]
    fn color_flips_on_addressed_commands_only() {
        let mut sim = sim();
        commit(&mut sim, &[wire::select_all(), EMPTY]);
        assert_eq!(sim.color(0), Some(true));
        assert_eq!(sim.color(1), Some(false));
        commit(&mut sim, &[wire::NOP, EMPTY]);
        assert_eq!(sim.color(0), Some(true));
    }

    #[test]
    fn boot_then_poll_stops_program() {
        let mut sim = sim();
        let dpu = DpuId::new(1, 2);
        sim.set_program(dpu, DpuProgram::runs_for(2));
        commit(&mut sim, &[EMPTY, wire::select_dpu(2)]);
        let boot = wire::command(Opcode::ThreadBoot, wire::thread_payload(0, 12));
        let r = commit(&mut sim, &[EMPTY, boot]);
        assert_eq!(wire::data(r[1]), 0);
        assert_eq!(sim.threads(dpu), 1);

        let poll = wire::command(Opcode::ReadRun, 0);
        assert_eq!(wire::data(commit(&mut sim, &[EMPTY, poll])[1]), 0b0100);
        assert_eq!(wire::data(commit(&mut sim, &[EMPTY, poll])[1]), 0);
        assert_eq!(sim.boot_count(dpu), 1);
    }

    #[test]
    fn memory_write_echoes_selection() {
        let mut sim = sim();
        commit(&mut sim, &[wire::select_all(), EMPTY]);
        commit(&mut sim, &[wire::write_structure(8), EMPTY]);
        let r = commit(
            &mut sim,
            &[wire::command(Opcode::WramWrite, wire::memory_payload(1, 0xCAFE)), EMPTY],
        );
        assert_eq!(r[0] & 0xFF, 0x0F);
        assert_eq!(sim.wram(DpuId::new(0, 3), 9, 1), vec![0xCAFE]);
    }

    #[test]
    fn unsettled_reads_then_settles() {
        let mut sim = sim();
        sim.set_unsettled_reads(2);
        sim.commit_commands(&[wire::select_all(), EMPTY]);
        let mut out = [0; 2];
        sim.update_commands(&mut out);
        assert_eq!(wire::color_byte(out[0]), UNSETTLED_CODE);
        sim.update_commands(&mut out);
        sim.update_commands(&mut out);
        assert_eq!(wire::color_byte(out[0]), 0xFF);
        assert_eq!(sim.update_count(), 3);
    }

    #[test]
    fn byte_order_delay_and_signature() {
        let mut sim = sim();
        sim.set_byte_order_delay(1);
        let bo = wire::command(Opcode::ByteOrder, 0);
        sim.commit_commands(&[bo, bo]);
        let mut out = [0; 2];
        sim.update_commands(&mut out);
        assert_eq!(out, [u64::MAX; 2]);
        sim.update_commands(&mut out);
        assert_eq!(out, [BYTE_ORDER_SIGNATURE; 2]);
    }

    #[test]
    fn bulk_copy_round_trip() {
        let mut sim = sim();
        let dpu = DpuId::new(0, 1);
        let data = bytes::BytesMut::from(&bytemuck::cast_slice::<u32, u8>(&[1, 2, 3])[..]);
        let xfer = TransferDescriptor::wram(4).with_buffer(dpu, data);
        assert_eq!(sim.copy_to_rank(&xfer), BackendStatus::Success);
        assert_eq!(sim.wram(dpu, 4, 3), vec![1, 2, 3]);

        let mut back = TransferDescriptor::wram(63).with_buffer(dpu, bytes::BytesMut::zeroed(8));
        assert_eq!(sim.copy_from_rank(&mut back), BackendStatus::BackendError);
    }
}
