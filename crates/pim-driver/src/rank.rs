//! Rank handle, lock discipline and reset
//!
//! A [`Rank`] owns the backend and the runtime state behind one mutex.
//! Every transaction executes with that mutex held, so exactly one packet
//! is in flight per rank. The mutex is not re-entrant: code running under
//! [`Rank::with_lock`] must use the [`RankContext`] it is given instead of
//! calling back into the rank.

use crate::backend::{BackendType, RankBackend, TransferDescriptor};
use crate::config::RankConfig;
use crate::error::{PimError, Result};
use crate::planner::{execute_transaction, ExecutionReport};
use crate::profiling::{Profiler, RunStatistics};
use crate::query::{QueryKind, QueryResult, Target};
use crate::state::RankRuntimeState;
use crate::transaction::Transaction;
use crate::worker::PollWorker;
use bytes::BytesMut;
use parking_lot::Mutex;
use pim_ufi::wire::{fault, ALL_THREADS, BYTE_ORDER_SIGNATURE, DISABLED_GROUP, ENABLED_GROUP};
use pim_ufi::{DpuId, PcMode};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Shared handle to a rank
pub type RankHandle = Arc<Rank>;

/// Hook run under the rank lock before DPUs are booted
pub type PreLaunchHook = Box<dyn FnMut(&[DpuId]) -> Result<()> + Send>;

pub(crate) struct RankInner {
    pub(crate) state: RankRuntimeState,
    pub(crate) backend: Box<dyn RankBackend>,
    pub(crate) profiler: Profiler,
    pub(crate) hook: Option<PreLaunchHook>,
}

impl RankInner {
    pub(crate) fn execute(
        &mut self,
        max_retries: u32,
        txn: &mut Transaction,
    ) -> Result<ExecutionReport> {
        execute_transaction(&mut self.state, &mut *self.backend, max_retries, txn)
    }
}

/// Access to a locked rank
pub struct RankContext<'a> {
    inner: &'a mut RankInner,
    config: &'a RankConfig,
}

impl RankContext<'_> {
    /// Runtime state.
    pub fn state(&self) -> &RankRuntimeState {
        &self.inner.state
    }

    /// Runtime state, mutable. Shadows changed here are trusted by the
    /// next transaction.
    pub fn state_mut(&mut self) -> &mut RankRuntimeState {
        &mut self.inner.state
    }

    /// Rank configuration.
    pub const fn config(&self) -> &RankConfig {
        self.config
    }

    /// Empty transaction sized for this rank.
    pub fn transaction(&self) -> Transaction {
        Transaction::new(self.inner.state.nr_slices())
    }

    /// Execute `txn` without releasing the lock.
    ///
    /// # Errors
    ///
    /// See [`crate::planner::Planner::execute`].
    pub fn execute(&mut self, txn: &mut Transaction) -> Result<ExecutionReport> {
        self.inner.execute(self.config.max_retries, txn)
    }
}

/// One rank: backend, runtime state and launch workers
pub struct Rank {
    id: u32,
    config: RankConfig,
    pc_mode: PcMode,
    backend_type: BackendType,
    pub(crate) inner: Mutex<RankInner>,
    pub(crate) worker: Mutex<Option<PollWorker>>,
    pub(crate) dpu_workers: Mutex<HashMap<DpuId, PollWorker>>,
    pub(crate) self_ref: Weak<Rank>,
}

impl std::fmt::Debug for Rank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rank")
            .field("id", &self.id)
            .field("backend", &self.backend_type)
            .field("topology", &self.config.topology)
            .finish_non_exhaustive()
    }
}

impl Rank {
    /// Wrap `backend` into a rank. The rank is not reset.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` is rejected.
    pub fn new(id: u32, backend: Box<dyn RankBackend>, config: RankConfig) -> Result<RankHandle> {
        config.validate()?;
        let pc_mode = config.pc_mode()?;
        let backend_type = backend.backend_type();
        let state = RankRuntimeState::new(&config);
        let profiler = Profiler::new(config.profiling);
        debug!("Rank {id}: {backend_type} backend, PC width {}", pc_mode.width());

        Ok(Arc::new_cyclic(|self_ref| Self {
            id,
            config,
            pc_mode,
            backend_type,
            inner: Mutex::new(RankInner {
                state,
                backend,
                profiler,
                hook: None,
            }),
            worker: Mutex::new(None),
            dpu_workers: Mutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
        }))
    }

    /// Rank identifier within its registry.
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Rank configuration.
    pub const fn config(&self) -> &RankConfig {
        &self.config
    }

    /// PC mode matched to the IRAM size.
    pub const fn pc_mode(&self) -> PcMode {
        self.pc_mode
    }

    /// Backend kind.
    pub const fn backend_type(&self) -> BackendType {
        self.backend_type
    }

    /// Run `f` with the rank locked.
    ///
    /// Fault snapshot and restore happen here: everything `f` does through
    /// the context is atomic with respect to other rank users.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut RankContext<'_>) -> R) -> R {
        let mut inner = self.inner.lock();
        let mut ctx = RankContext {
            inner: &mut *inner,
            config: &self.config,
        };
        f(&mut ctx)
    }

    /// Execute `txn` under the rank lock.
    ///
    /// # Errors
    ///
    /// See [`crate::planner::Planner::execute`].
    pub fn execute(&self, txn: &mut Transaction) -> Result<ExecutionReport> {
        self.inner.lock().execute(self.config.max_retries, txn)
    }

    /// Empty transaction sized for this rank.
    pub fn transaction(&self) -> Transaction {
        Transaction::new(usize::from(self.config.topology.nr_slices))
    }

    /// Reset every slice and bring the rank to a known idle state.
    ///
    /// Sends a software reset to every slice, waits, checks the lane
    /// mapping, assigns enabled DPUs to the enabled group and disabled ones
    /// to the disabled group, then clears every fault and run bit.
    ///
    /// # Errors
    ///
    /// `Driver` if lane discovery answers the wrong signature, otherwise
    /// any transaction error.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let retries = self.config.max_retries;
        let topology = self.config.topology;
        inner.state.reset(&self.config);
        inner.profiler.reset();

        let mut txn = self.transaction();
        for s in 0..topology.nr_slices {
            txn.push(Target::All(s), QueryKind::SoftwareReset)?;
        }
        inner.execute(retries, &mut txn)?;
        for _ in 0..self.config.reset_wait_cycles {
            std::hint::spin_loop();
        }

        let mut txn = self.transaction();
        let mut lane_checks = Vec::with_capacity(usize::from(topology.nr_slices));
        for s in 0..topology.nr_slices {
            let lanes = txn.push(Target::All(s), QueryKind::ByteOrder)?;
            let identity = txn.push(Target::All(s), QueryKind::Identity)?;
            lane_checks.push((s, lanes, identity));
        }
        inner.execute(retries, &mut txn)?;
        for (s, lanes, identity) in lane_checks {
            let word = txn.result(lanes).and_then(QueryResult::as_u64).unwrap_or(0);
            if word != BYTE_ORDER_SIGNATURE {
                return Err(PimError::driver(format!(
                    "slice {s}: lane discovery answered {word:#018x}, expected {BYTE_ORDER_SIGNATURE:#018x}"
                )));
            }
            let chip = txn.result(identity).and_then(QueryResult::as_u32).unwrap_or(0);
            debug!("Rank {} slice {s}: chip id {chip:#010x}", self.id);
        }

        let mut txn = self.transaction();
        for s in 0..topology.nr_slices {
            let slice = &inner.state.slices[usize::from(s)];
            if slice.all_dpus_enabled {
                txn.push(Target::All(s), QueryKind::WriteGroup(ENABLED_GROUP))?;
            } else {
                for dpu in topology.members_of(s, topology.member_mask()) {
                    let group = if slice.enabled_dpus & dpu.bit() != 0 {
                        ENABLED_GROUP
                    } else {
                        DISABLED_GROUP
                    };
                    txn.push(Target::Dpu(dpu), QueryKind::WriteGroup(group))?;
                }
            }
            txn.push(Target::All(s), QueryKind::ClearFault(fault::ALL))?;
            txn.push(Target::Previous(s), QueryKind::ClearRun(ALL_THREADS))?;
        }
        inner.execute(retries, &mut txn)?;

        info!(
            "Rank {}: reset {}x{} DPUs ({} disabled)",
            self.id,
            topology.nr_slices,
            topology.dpus_per_slice,
            self.config.disabled_dpus.len()
        );
        Ok(())
    }

    // ── Accessors ────────────────────────────────────────────────────────

    /// DPUs currently running.
    pub fn nb_dpu_running(&self) -> u32 {
        self.inner.lock().state.nb_dpu_running()
    }

    /// Running bitfield of `slice`.
    pub fn dpu_running(&self, slice: u8) -> u8 {
        self.inner.lock().state.dpu_running(slice)
    }

    /// Fault bitfield of `slice`.
    pub fn dpu_in_fault(&self, slice: u8) -> u8 {
        self.inner.lock().state.dpu_in_fault(slice)
    }

    /// Whether `dpu` is running.
    pub fn is_running(&self, dpu: DpuId) -> bool {
        self.inner.lock().state.is_running(dpu)
    }

    /// Every running DPU.
    pub fn running_dpus(&self) -> Vec<DpuId> {
        self.inner.lock().state.running_dpus()
    }

    /// Every DPU in fault.
    pub fn faulted_dpus(&self) -> Vec<DpuId> {
        self.inner.lock().state.faulted_dpus()
    }

    /// Install the hook run before each boot.
    pub fn set_pre_launch_hook(&self, hook: PreLaunchHook) {
        self.inner.lock().hook = Some(hook);
    }

    /// Remove the pre-launch hook.
    pub fn clear_pre_launch_hook(&self) {
        self.inner.lock().hook = None;
    }

    /// Completed-run profiles recorded since the last call.
    pub fn take_run_statistics(&self) -> Vec<RunStatistics> {
        self.inner.lock().profiler.take()
    }

    // ── Memory access ────────────────────────────────────────────────────

    fn check_idle(state: &RankRuntimeState, dpu: DpuId) -> Result<()> {
        if !state.topology().contains(dpu) {
            return Err(PimError::internal(format!("DPU {dpu} outside the rank")));
        }
        if !state.is_enabled(dpu) {
            return Err(PimError::Disabled { dpu });
        }
        if state.is_running(dpu) {
            return Err(PimError::AlreadyRunning { dpu });
        }
        Ok(())
    }

    fn check_range(what: &str, start: u32, len: usize, size: u32) -> Result<()> {
        let end = u64::from(start) + len as u64;
        if end > u64::from(size) {
            return Err(PimError::internal(format!(
                "{what} access {start}..{end} outside {size} entries"
            )));
        }
        Ok(())
    }

    fn memory_query(&self, dpu: DpuId, kind: QueryKind) -> Result<QueryResult> {
        let mut inner = self.inner.lock();
        Self::check_idle(&inner.state, dpu)?;
        let mut txn = self.transaction();
        let id = txn.push(Target::Dpu(dpu), kind)?;
        inner.execute(self.config.max_retries, &mut txn)?;
        Ok(txn.result(id).cloned().unwrap_or_default())
    }

    /// Write instructions to the IRAM of `dpu`.
    ///
    /// # Errors
    ///
    /// `Disabled`/`AlreadyRunning` for an unusable DPU, `Internal` for an
    /// out-of-range access, otherwise any transaction error.
    pub fn write_iram(&self, dpu: DpuId, address: u32, instructions: &[u64]) -> Result<()> {
        Self::check_range("IRAM", address, instructions.len(), self.config.iram_instructions)?;
        self.memory_query(
            dpu,
            QueryKind::IramWrite {
                address,
                instructions: instructions.to_vec(),
            },
        )
        .map(drop)
    }

    /// Read `count` instructions from the IRAM of `dpu`.
    ///
    /// # Errors
    ///
    /// Same as [`Rank::write_iram`].
    pub fn read_iram(&self, dpu: DpuId, address: u32, count: u32) -> Result<Vec<u64>> {
        Self::check_range("IRAM", address, count as usize, self.config.iram_instructions)?;
        let result = self.memory_query(dpu, QueryKind::IramRead { address, count })?;
        Ok(result.as_instructions().map(<[u64]>::to_vec).unwrap_or_default())
    }

    /// Write words to the WRAM of `dpu`.
    ///
    /// # Errors
    ///
    /// Same as [`Rank::write_iram`].
    pub fn write_wram(&self, dpu: DpuId, address: u32, words: &[u32]) -> Result<()> {
        Self::check_range("WRAM", address, words.len(), self.config.wram_words)?;
        self.memory_query(
            dpu,
            QueryKind::WramWrite {
                address,
                words: words.to_vec(),
            },
        )
        .map(drop)
    }

    /// Read `count` words from the WRAM of `dpu`.
    ///
    /// # Errors
    ///
    /// Same as [`Rank::write_iram`].
    pub fn read_wram(&self, dpu: DpuId, address: u32, count: u32) -> Result<Vec<u32>> {
        Self::check_range("WRAM", address, count as usize, self.config.wram_words)?;
        let result = self.memory_query(dpu, QueryKind::WramRead { address, count })?;
        Ok(result.as_words().map(<[u32]>::to_vec).unwrap_or_default())
    }

    /// Bulk copy `words` into the WRAM of `dpu` through the backend.
    ///
    /// # Errors
    ///
    /// `Disabled`/`AlreadyRunning` for an unusable DPU, otherwise the
    /// mapped backend status.
    pub fn copy_to_wram(&self, dpu: DpuId, offset: u32, words: &[u32]) -> Result<()> {
        Self::check_range("WRAM", offset, words.len(), self.config.wram_words)?;
        let data = BytesMut::from(bytemuck::cast_slice::<u32, u8>(words));
        let xfer = TransferDescriptor::wram(offset).with_buffer(dpu, data);

        let mut inner = self.inner.lock();
        Self::check_idle(&inner.state, dpu)?;
        inner.backend.copy_to_rank(&xfer).into_result("copy_to_rank")?;
        debug!("Rank {}: copied {} bytes to {dpu} WRAM", self.id, xfer.len_bytes());
        Ok(())
    }

    /// Bulk copy `len` words out of the WRAM of `dpu` through the backend.
    ///
    /// # Errors
    ///
    /// Same as [`Rank::copy_to_wram`].
    pub fn copy_from_wram(&self, dpu: DpuId, offset: u32, len: u32) -> Result<Vec<u32>> {
        Self::check_range("WRAM", offset, len as usize, self.config.wram_words)?;
        let mut xfer = TransferDescriptor::wram(offset)
            .with_buffer(dpu, BytesMut::zeroed(len as usize * 4));

        let mut inner = self.inner.lock();
        Self::check_idle(&inner.state, dpu)?;
        inner
            .backend
            .copy_from_rank(&mut xfer)
            .into_result("copy_from_rank")?;
        drop(inner);

        let data = xfer.buffers.first().map(|b| &b.data[..]).unwrap_or_default();
        Ok(data
            .chunks_exact(4)
            .map(|c| u32::from_le(bytemuck::pod_read_unaligned(c)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::SimulatedRank;
    use pim_ufi::Topology;

    fn rank(config: RankConfig) -> (RankHandle, SimulatedRank) {
        let sim = SimulatedRank::for_config(&config);
        let rank = Rank::new(0, Box::new(sim.clone()), config).unwrap();
        (rank, sim)
    }

    #[test]
    fn reset_assigns_groups() {
        let config = RankConfig::new(Topology::new(2, 4)).with_disabled_dpu(DpuId::new(1, 2));
        let (rank, sim) = rank(config);
        rank.reset().unwrap();
        assert_eq!(sim.group(DpuId::new(0, 3)), Some(ENABLED_GROUP));
        assert_eq!(sim.group(DpuId::new(1, 2)), Some(DISABLED_GROUP));
        assert_eq!(sim.group(DpuId::new(1, 1)), Some(ENABLED_GROUP));
        assert_eq!(rank.nb_dpu_running(), 0);
    }

    #[test]
    fn reset_rejects_swapped_lanes() {
        let (rank, sim) = rank(RankConfig::new(Topology::new(2, 2)));
        sim.set_lane_swap(true);
        assert!(matches!(rank.reset(), Err(PimError::Driver { .. })));
    }

    #[test]
    fn reset_waits_for_byte_order() {
        let (rank, sim) = rank(RankConfig::new(Topology::new(2, 2)));
        sim.set_byte_order_delay(5);
        rank.reset().unwrap();
    }

    #[test]
    fn wram_through_protocol_and_backend() {
        let (rank, sim) = rank(RankConfig::new(Topology::new(2, 4)).with_wram_words(128));
        rank.reset().unwrap();
        let dpu = DpuId::new(1, 1);

        rank.write_wram(dpu, 10, &[1, 2, 3]).unwrap();
        assert_eq!(sim.wram(dpu, 10, 3), vec![1, 2, 3]);
        assert_eq!(rank.read_wram(dpu, 11, 2).unwrap(), vec![2, 3]);

        rank.copy_to_wram(dpu, 64, &[0xAA, 0xBB]).unwrap();
        assert_eq!(rank.copy_from_wram(dpu, 64, 2).unwrap(), vec![0xAA, 0xBB]);
        assert!(rank.read_wram(dpu, 127, 2).is_err());
    }

    #[test]
    fn iram_round_trip() {
        let (rank, _sim) = rank(RankConfig::new(Topology::new(1, 2)).with_iram_instructions(256));
        rank.reset().unwrap();
        let dpu = DpuId::new(0, 1);
        let program = [0x0000_1234_5678_9ABC, 0x0000_FFFF_0000_0001];
        rank.write_iram(dpu, 4, &program).unwrap();
        assert_eq!(rank.read_iram(dpu, 4, 2).unwrap(), program.to_vec());
    }

    #[test]
    fn with_lock_runs_transactions() {
        let (rank, _sim) = rank(RankConfig::new(Topology::new(2, 2)));
        rank.reset().unwrap();
        let chip = rank.with_lock(|ctx| {
            let mut txn = ctx.transaction();
            let id = txn.push(Target::All(1), QueryKind::Identity)?;
            ctx.execute(&mut txn)?;
            Ok::<_, PimError>(txn.result(id).and_then(|r| r.as_u32()))
        });
        assert_eq!(
            chip.unwrap(),
            Some(crate::backends::simulator::SIMULATED_CHIP_ID)
        );
    }

    #[test]
    fn disabled_dpu_memory_rejected() {
        let config = RankConfig::new(Topology::new(1, 2)).with_disabled_dpu(DpuId::new(0, 0));
        let (rank, sim) = rank(config);
        rank.reset().unwrap();
        let commits = sim.commit_count();
        assert!(matches!(
            rank.write_wram(DpuId::new(0, 0), 0, &[1]),
            Err(PimError::Disabled { .. })
        ));
        assert_eq!(sim.commit_count(), commits);
    }
}
