//! Run lifecycle: boot, poll, status, sync, launch and recovery
//!
//! ```text
//! Idle ──boot──▶ Running ──poll: run=0──▶ Done ──▶ Idle
//!                   │
//!                   └──poll: fault=1──▶ Faulted ──soft reset──▶ Idle
//! ```
//!
//! Every step takes the rank lock for one batch of transactions and
//! releases it before returning. Local rejections (`Disabled`,
//! `AlreadyRunning`) happen before any wire access.

use crate::config::LaunchGranularity;
use crate::error::{PimError, Result};
use crate::query::{QueryKind, QueryResult, Target};
use crate::rank::{Rank, RankInner};
use crate::transaction::{QueryId, Transaction};
use crate::worker::{PollWorker, WorkerScope};
use pim_ufi::wire::{fault, ALL_THREADS, ENABLED_GROUP};
use pim_ufi::DpuId;
use std::thread;
use tracing::{debug, info, warn};

/// How a launch waits for completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaunchPolicy {
    /// Caller blocks until every booted DPU stopped
    #[default]
    Synchronous,
    /// Return after boot; a background worker polls
    Asynchronous,
}

/// Aggregated run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RankStatus {
    /// Nothing is running
    pub done: bool,
    /// Some DPU faulted, or a slice reported a protocol fault
    pub fault: bool,
}

impl RankStatus {
    /// Combine two statuses.
    #[must_use]
    pub const fn merge(self, other: Self) -> Self {
        Self {
            done: self.done && other.done,
            fault: self.fault || other.fault,
        }
    }
}

/// A thread forced out by a pipeline drain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainedThread {
    /// Thread id
    pub thread: u8,
    /// PC the thread stopped at
    pub pc: u32,
}

fn byte_of(txn: &Transaction, id: QueryId) -> u8 {
    txn.result(id).and_then(QueryResult::as_u8).unwrap_or(0)
}

fn word_of(txn: &Transaction, id: QueryId) -> u32 {
    txn.result(id).and_then(QueryResult::as_u32).unwrap_or(0)
}

impl Rank {
    fn check_dpu(&self, inner: &RankInner, dpu: DpuId) -> Result<()> {
        if !self.config().topology.contains(dpu) {
            return Err(PimError::internal(format!("DPU {dpu} outside the rank")));
        }
        if !inner.state.is_enabled(dpu) {
            return Err(PimError::Disabled { dpu });
        }
        Ok(())
    }

    /// Arm profiling, then run the user hook.
    fn pre_launch(inner: &mut RankInner, dpus: &[DpuId]) -> Result<()> {
        inner.profiler.arm(dpus);
        if let Some(hook) = inner.hook.as_mut() {
            hook(dpus)?;
        }
        Ok(())
    }

    fn boot_locked(&self, inner: &mut RankInner, scope: Option<DpuId>) -> Result<()> {
        let topology = self.config().topology;
        let pc_mode = self.pc_mode();

        let targets: Vec<DpuId> = match scope {
            Some(dpu) => {
                self.check_dpu(inner, dpu)?;
                if inner.state.is_running(dpu) {
                    return Err(PimError::AlreadyRunning { dpu });
                }
                vec![dpu]
            }
            None => {
                if let Some(&dpu) = inner.state.running_dpus().first() {
                    return Err(PimError::AlreadyRunning { dpu });
                }
                (0..topology.nr_slices)
                    .flat_map(|s| {
                        topology.members_of(s, inner.state.slices[usize::from(s)].enabled_dpus)
                    })
                    .collect()
            }
        };
        if targets.is_empty() {
            return Ok(());
        }

        Self::pre_launch(inner, &targets)?;
        for dpu in &targets {
            inner.state.clear_protocol_faults(dpu.slice);
        }

        let boot = QueryKind::ThreadBoot { thread: 0, pc_mode };
        let mut txn = self.transaction();
        let mut booted = Vec::new();
        match scope {
            Some(dpu) => booted.push((dpu.slice, dpu.bit(), txn.push(Target::Dpu(dpu), boot)?)),
            None => {
                for (s, slice) in (0u8..).zip(&inner.state.slices) {
                    if slice.enabled_dpus == 0 {
                        continue;
                    }
                    let target = if slice.all_dpus_enabled {
                        Target::All(s)
                    } else {
                        Target::Group {
                            slice: s,
                            group: ENABLED_GROUP,
                        }
                    };
                    booted.push((s, slice.enabled_dpus, txn.push(target, boot.clone())?));
                }
            }
        }
        inner.execute(self.config().max_retries, &mut txn)?;

        for (s, bits, id) in booted {
            let already = byte_of(&txn, id) & bits;
            if already != 0 {
                warn!("Rank {} slice {s}: thread 0 already running on {already:#04x}", self.id());
            }
            inner.state.mark_booted(s, bits);
        }
        debug!(
            "Rank {}: booted {} DPU(s), {} running",
            self.id(),
            targets.len(),
            inner.state.nb_dpu_running()
        );
        Ok(())
    }

    /// Boot thread 0 on every enabled DPU.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` if any DPU is running (nothing is sent), an error
    /// from the pre-launch hook, otherwise any transaction error.
    pub fn boot_rank(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.boot_locked(&mut inner, None)
    }

    /// Boot thread 0 on `dpu`.
    ///
    /// # Errors
    ///
    /// `Disabled` or `AlreadyRunning` before any wire access, an error from
    /// the pre-launch hook, otherwise any transaction error.
    pub fn boot_dpu(&self, dpu: DpuId) -> Result<()> {
        let mut inner = self.inner.lock();
        self.boot_locked(&mut inner, Some(dpu))
    }

    fn poll_locked(&self, inner: &mut RankInner, scope: Option<DpuId>) -> Result<()> {
        let mut txn = self.transaction();
        let mut reads = Vec::new();
        match scope {
            Some(dpu) => {
                let run = txn.push(Target::Dpu(dpu), QueryKind::ReadRun)?;
                let fault = txn.push(Target::Previous(dpu.slice), QueryKind::ReadFault)?;
                reads.push((dpu.slice, dpu.bit(), run, fault));
            }
            None => {
                for (s, slice) in (0u8..).zip(&inner.state.slices) {
                    if slice.enabled_dpus == 0 {
                        continue;
                    }
                    let run = txn.push(Target::All(s), QueryKind::ReadRun)?;
                    let fault = txn.push(Target::Previous(s), QueryKind::ReadFault)?;
                    reads.push((s, slice.enabled_dpus, run, fault));
                }
            }
        }
        inner.execute(self.config().max_retries, &mut txn)?;

        let topology = self.config().topology;
        let mut stopped = Vec::new();
        for (s, scope_bits, run, fault) in reads {
            let enabled = inner.state.slices[usize::from(s)].enabled_dpus;
            let scope_bits = scope_bits & enabled;
            let run = byte_of(&txn, run);
            let fault = byte_of(&txn, fault) & scope_bits;
            inner.state.update_fault(s, scope_bits, fault);
            let ended = inner.state.update_running(s, scope_bits, run & !fault);
            stopped.extend(topology.members_of(s, ended).map(|d| (d, fault & d.bit() != 0)));
        }
        let running = inner.state.running_dpus();
        inner.profiler.record_poll(&running);

        if !stopped.is_empty() {
            self.capture_profiles(inner, &stopped)?;
        }
        Ok(())
    }

    /// Close the profiles of DPUs that just stopped, reading their sample
    /// window before a later launch can overwrite it.
    fn capture_profiles(&self, inner: &mut RankInner, stopped: &[(DpuId, bool)]) -> Result<()> {
        let window = inner.profiler.sample_window();
        let armed: Vec<(DpuId, bool)> = stopped
            .iter()
            .copied()
            .filter(|(dpu, _)| inner.profiler.is_armed(*dpu))
            .collect();
        if armed.is_empty() {
            return Ok(());
        }
        debug!("Rank {}: profiling {:?} after {:?}", self.id(), armed, inner.profiler.mode());

        let Some((address, count)) = window else {
            for (dpu, faulted) in armed {
                inner.profiler.finish(dpu, faulted, Vec::new());
            }
            return Ok(());
        };
        let mut txn = self.transaction();
        let mut reads = Vec::with_capacity(armed.len());
        for (dpu, faulted) in armed {
            let read = txn.push(Target::Dpu(dpu), QueryKind::WramRead { address, count })?;
            reads.push((dpu, faulted, read));
        }
        inner.execute(self.config().max_retries, &mut txn)?;
        for (dpu, faulted, id) in reads {
            let samples = txn
                .result(id)
                .and_then(QueryResult::as_words)
                .map(<[u32]>::to_vec)
                .unwrap_or_default();
            inner.profiler.finish(dpu, faulted, samples);
        }
        Ok(())
    }

    /// Read run and fault bits of every enabled DPU and update the running
    /// set. Returns the number of DPUs still running. Nothing is sent when
    /// no DPU is running.
    ///
    /// # Errors
    ///
    /// Any transaction error.
    pub fn poll_rank(&self) -> Result<u32> {
        let mut inner = self.inner.lock();
        if inner.state.nb_dpu_running() == 0 {
            return Ok(0);
        }
        self.poll_locked(&mut inner, None)?;
        Ok(inner.state.nb_dpu_running())
    }

    /// Poll one DPU. Returns whether it is still running.
    ///
    /// # Errors
    ///
    /// `Disabled` for a disabled DPU, otherwise any transaction error.
    pub fn poll_dpu(&self, dpu: DpuId) -> Result<bool> {
        let mut inner = self.inner.lock();
        self.check_dpu(&inner, dpu)?;
        if !inner.state.is_running(dpu) {
            return Ok(false);
        }
        self.poll_locked(&mut inner, Some(dpu))?;
        Ok(inner.state.is_running(dpu))
    }

    /// Poll, then report whether the rank is done and whether anything
    /// faulted.
    ///
    /// # Errors
    ///
    /// Any transaction error.
    pub fn status(&self) -> Result<RankStatus> {
        let mut inner = self.inner.lock();
        if inner.state.nb_dpu_running() != 0 {
            self.poll_locked(&mut inner, None)?;
        }
        Ok(RankStatus {
            done: inner.state.nb_dpu_running() == 0,
            fault: inner.state.any_fault() || !inner.state.slices_with_protocol_faults().is_empty(),
        })
    }

    /// Status of one DPU.
    ///
    /// # Errors
    ///
    /// Same as [`Rank::poll_dpu`].
    pub fn dpu_status(&self, dpu: DpuId) -> Result<RankStatus> {
        let running = self.poll_dpu(dpu)?;
        let inner = self.inner.lock();
        let slice = &inner.state.slices[usize::from(dpu.slice)];
        Ok(RankStatus {
            done: !running,
            fault: inner.state.is_in_fault(dpu) || slice.fault_decode || slice.fault_collide,
        })
    }

    /// DPUs to blame for a fault: faulted DPUs plus the enabled DPUs of
    /// slices that reported a protocol fault.
    pub(crate) fn fault_report(&self) -> Vec<DpuId> {
        let inner = self.inner.lock();
        let topology = self.config().topology;
        let mut dpus = inner.state.faulted_dpus();
        for s in inner.state.slices_with_protocol_faults() {
            let enabled = inner.state.slices[usize::from(s)].enabled_dpus;
            dpus.extend(topology.members_of(s, enabled));
        }
        dpus.sort_by_key(|d| (d.slice, d.member));
        dpus.dedup();
        dpus
    }

    /// Busy-poll until nothing runs.
    ///
    /// # Errors
    ///
    /// `Fault` listing the faulted DPUs, otherwise any transaction error.
    pub fn sync(&self) -> Result<()> {
        loop {
            let status = self.status()?;
            if status.done {
                if status.fault {
                    return Err(PimError::Fault {
                        dpus: self.fault_report(),
                    });
                }
                return Ok(());
            }
            thread::yield_now();
        }
    }

    /// Busy-poll `dpu` until it stops.
    ///
    /// # Errors
    ///
    /// `Fault` if the DPU faulted, otherwise as [`Rank::poll_dpu`].
    pub fn sync_dpu(&self, dpu: DpuId) -> Result<()> {
        loop {
            let status = self.dpu_status(dpu)?;
            if status.done {
                if status.fault {
                    return Err(PimError::Fault { dpus: vec![dpu] });
                }
                return Ok(());
            }
            thread::yield_now();
        }
    }

    fn rank_worker(&self) -> Result<()> {
        let mut slot = self.worker.lock();
        if let Some(worker) = slot.as_ref().filter(|w| w.is_alive()) {
            return worker.notify();
        }
        let worker = PollWorker::spawn(self.self_ref.clone(), self.id(), WorkerScope::Rank)?;
        worker.notify()?;
        *slot = Some(worker);
        Ok(())
    }

    fn dpu_worker(&self, dpu: DpuId) -> Result<()> {
        let mut workers = self.dpu_workers.lock();
        if let Some(worker) = workers.get(&dpu).filter(|w| w.is_alive()) {
            return worker.notify();
        }
        let worker = PollWorker::spawn(self.self_ref.clone(), self.id(), WorkerScope::Dpu(dpu))?;
        worker.notify()?;
        workers.insert(dpu, worker);
        Ok(())
    }

    /// Boot every enabled DPU, then wait as `policy` says.
    ///
    /// # Errors
    ///
    /// Boot errors, `Fault` from a synchronous wait, `System` if a worker
    /// cannot be started.
    pub fn launch_rank(&self, policy: LaunchPolicy) -> Result<()> {
        self.boot_rank()?;
        match policy {
            LaunchPolicy::Synchronous => self.sync(),
            LaunchPolicy::Asynchronous => match self.config().launch_granularity {
                LaunchGranularity::Rank => self.rank_worker(),
                LaunchGranularity::Dpu => self
                    .running_dpus()
                    .into_iter()
                    .try_for_each(|dpu| self.dpu_worker(dpu)),
            },
        }
    }

    /// Boot `dpu`, then wait as `policy` says.
    ///
    /// # Errors
    ///
    /// Same as [`Rank::launch_rank`].
    pub fn launch_dpu(&self, dpu: DpuId, policy: LaunchPolicy) -> Result<()> {
        self.boot_dpu(dpu)?;
        match policy {
            LaunchPolicy::Synchronous => self.sync_dpu(dpu),
            LaunchPolicy::Asynchronous => match self.config().launch_granularity {
                LaunchGranularity::Rank => self.rank_worker(),
                LaunchGranularity::Dpu => self.dpu_worker(dpu),
            },
        }
    }

    /// Stop and join every background worker.
    pub fn stop_workers(&self) {
        let rank = self.worker.lock().take();
        let dpus: Vec<PollWorker> = self.dpu_workers.lock().drain().map(|(_, w)| w).collect();
        let stopped = usize::from(rank.is_some()) + dpus.len();
        drop(rank);
        drop(dpus);
        if stopped > 0 {
            debug!("Rank {}: stopped {stopped} worker(s)", self.id());
        }
    }

    fn drain_locked(&self, inner: &mut RankInner, dpu: DpuId) -> Result<Vec<DrainedThread>> {
        let bound = u32::from(self.config().nr_threads) + 1;
        let retries = self.config().max_retries;
        let mut order = Vec::new();
        for _ in 0..bound {
            let mut txn = self.transaction();
            let run = txn.push(Target::Dpu(dpu), QueryKind::ReadThreadRun)?;
            inner.execute(retries, &mut txn)?;
            if word_of(&txn, run) == 0 {
                return Ok(order);
            }

            let mut txn = self.transaction();
            let prev = Target::Previous(dpu.slice);
            txn.push(Target::Dpu(dpu), QueryKind::DebugReplaceStop)?;
            let lsb = txn.push(prev, QueryKind::ReadPcLsb)?;
            let msb = txn.push(prev, QueryKind::ReadPcMsb)?;
            let thread = txn.push(prev, QueryKind::ReadStoppedThread)?;
            inner.execute(retries, &mut txn)?;

            #[allow(clippy::cast_possible_truncation)]
            order.push(DrainedThread {
                thread: word_of(&txn, thread) as u8,
                pc: self.pc_mode().assemble(word_of(&txn, msb), word_of(&txn, lsb)),
            });
        }
        Err(PimError::Timeout { attempts: bound })
    }

    /// Force every running thread of `dpu` out, one at a time, and return
    /// them in the order they stopped with their PCs.
    ///
    /// # Errors
    ///
    /// `Timeout` if threads keep running past the thread count, otherwise
    /// any transaction error.
    pub fn drain_pipeline(&self, dpu: DpuId) -> Result<Vec<DrainedThread>> {
        let mut inner = self.inner.lock();
        self.check_dpu(&inner, dpu)?;
        self.drain_locked(&mut inner, dpu)
    }

    /// Recover one DPU without resetting the rank: fault it, drain its
    /// threads, clear every fault class, run bit and PC.
    ///
    /// Returns the drained threads.
    ///
    /// # Errors
    ///
    /// `Disabled` for a disabled DPU, otherwise as [`Rank::drain_pipeline`].
    pub fn soft_reset_dpu(&self, dpu: DpuId) -> Result<Vec<DrainedThread>> {
        let mut inner = self.inner.lock();
        self.check_dpu(&inner, dpu)?;
        let retries = self.config().max_retries;

        let mut txn = self.transaction();
        txn.push(Target::Dpu(dpu), QueryKind::SetBreakpointFault)?;
        inner.execute(retries, &mut txn)?;

        let drained = self.drain_locked(&mut inner, dpu)?;

        let mut txn = self.transaction();
        txn.push(Target::Dpu(dpu), QueryKind::ClearFault(fault::ALL))?;
        txn.push(Target::Previous(dpu.slice), QueryKind::ClearRun(ALL_THREADS))?;
        txn.push(Target::Previous(dpu.slice), QueryKind::ClearPc)?;
        inner.execute(retries, &mut txn)?;

        inner.state.update_running(dpu.slice, dpu.bit(), 0);
        inner.state.update_fault(dpu.slice, dpu.bit(), 0);
        inner.state.clear_protocol_faults(dpu.slice);
        inner.profiler.cancel(dpu);
        info!("Rank {}: soft reset {dpu}, drained {} thread(s)", self.id(), drained.len());
        Ok(drained)
    }
}
