//! Background poll workers for asynchronous launches
//!
//! A worker is a named thread fed by a one-slot channel. A launch posts a
//! run request; a full slot means a request is already pending, so the
//! post is dropped. The worker polls its rank (or one DPU) until nothing is
//! left running, taking the rank lock once per poll, then blocks on the
//! channel again. Dropping the worker closes the channel, which also ends
//! a run in progress, and joins the thread.

use crate::error::{PimError, Result};
use crate::rank::Rank;
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use pim_ufi::DpuId;
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// What a worker polls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerScope {
    /// Every DPU of the rank
    Rank,
    /// One DPU
    Dpu(DpuId),
}

#[derive(Debug, Clone, Copy)]
enum WorkerMsg {
    Run,
}

/// Handle to a background poll worker
#[derive(Debug)]
pub struct PollWorker {
    scope: WorkerScope,
    sender: Option<Sender<WorkerMsg>>,
    handle: Option<JoinHandle<()>>,
}

impl PollWorker {
    /// Start a worker for `scope` on `rank`.
    ///
    /// # Errors
    ///
    /// Returns `System` if the thread cannot be spawned.
    pub fn spawn(rank: Weak<Rank>, rank_id: u32, scope: WorkerScope) -> Result<Self> {
        let (tx, rx) = bounded(1);
        let name = match scope {
            WorkerScope::Rank => format!("pim-rank{rank_id}-poll"),
            WorkerScope::Dpu(dpu) => {
                format!("pim-rank{rank_id}-dpu{}.{}-poll", dpu.slice, dpu.member)
            }
        };
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(&rank, scope, &rx))
            .map_err(|e| PimError::system(format!("spawning {name}: {e}")))?;
        debug!("Started worker {name}");
        Ok(Self {
            scope,
            sender: Some(tx),
            handle: Some(handle),
        })
    }

    /// Scope of the worker.
    pub const fn scope(&self) -> WorkerScope {
        self.scope
    }

    /// Ask the worker to poll until its scope is idle.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the worker thread has exited.
    pub fn notify(&self) -> Result<()> {
        let Some(sender) = &self.sender else {
            return Err(PimError::internal("poll worker already stopped"));
        };
        match sender.try_send(WorkerMsg::Run) {
            Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Disconnected(_)) => Err(PimError::internal("poll worker exited")),
        }
    }

    /// Worker thread is still alive.
    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn stop(&mut self) {
        self.sender = None;
        if let Some(handle) = self.handle.take() {
            // the last rank reference may be released on the worker itself
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("Poll worker {:?} panicked", self.scope);
            }
        }
    }
}

impl Drop for PollWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(rank: &Weak<Rank>, scope: WorkerScope, rx: &Receiver<WorkerMsg>) {
    while let Ok(WorkerMsg::Run) = rx.recv() {
        loop {
            // stop requested mid-run
            if let Err(TryRecvError::Disconnected) = rx.try_recv() {
                break;
            }
            let Some(rank) = rank.upgrade() else {
                return;
            };
            let idle = match scope {
                WorkerScope::Rank => rank.poll_rank().map(|running| running == 0),
                WorkerScope::Dpu(dpu) => rank.poll_dpu(dpu).map(|running| !running),
            };
            drop(rank);
            match idle {
                Ok(true) => break,
                Ok(false) => thread::yield_now(),
                Err(e) => {
                    warn!("Poll worker {scope:?}: {e}");
                    break;
                }
            }
        }
    }
    debug!("Poll worker {scope:?} exiting");
}
