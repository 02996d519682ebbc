//! Host control plane for PIM ranks.
//!
//! A rank is a board of several slices; each slice is one command/response
//! channel driving up to eight DPUs. This crate runs the UFI transaction
//! engine over those channels and the run lifecycle on top of it.
//!
//! # Layers
//!
//! ```text
//! RankRegistry / Set          allocate, launch, status, sync
//!   Rank (lifecycle)          boot, poll, drain, soft reset, workers
//!     Planner                 packets, color handshake, bounded retries
//!       Transaction / Query   per-slice FIFO queues
//!         RankBackend         commit_commands / update_commands / copies
//! ```
//!
//! # Quick start
//!
//! ```
//! use pim_driver::prelude::*;
//!
//! # fn main() -> pim_driver::Result<()> {
//! let config = RankConfig::new(Topology::new(4, 8));
//! let sim = SimulatedRank::for_config(&config);
//!
//! let mut registry = RankRegistry::new();
//! let rank = registry.allocate(Box::new(sim), config)?;
//!
//! rank.launch_rank(LaunchPolicy::Synchronous)?;
//! assert_eq!(rank.nb_dpu_running(), 0);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod backend;
pub mod backends;
mod config;
mod error;
mod lifecycle;
pub mod packet;
pub mod planner;
mod profiling;
pub mod query;
mod rank;
mod registry;
pub mod state;
pub mod transaction;
mod worker;

pub use backend::{
    BackendStatus, BackendType, MemoryRegion, RankBackend, TransferBuffer, TransferDescriptor,
};
pub use backends::{DpuProgram, SimulatedRank};
pub use config::{
    LaunchGranularity, ProfilingMode, RankConfig, DEFAULT_MAX_RETRIES, DEFAULT_NR_THREADS,
    MAX_NR_THREADS,
};
pub use error::{PimError, Result};
pub use lifecycle::{DrainedThread, LaunchPolicy, RankStatus};
pub use planner::{execute_transaction, ExecutionReport, Planner};
pub use profiling::RunStatistics;
pub use query::{Query, QueryKind, QueryResult, Target};
pub use rank::{PreLaunchHook, Rank, RankContext, RankHandle};
pub use registry::{DpuHandle, RankRegistry, Set};
pub use state::{RankRuntimeState, SliceInfo, SliceTarget};
pub use transaction::{QueryId, Transaction};
pub use worker::{PollWorker, WorkerScope};

pub use pim_ufi::{ColorClass, DpuId, Opcode, PcMode, Topology};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        DpuId, LaunchPolicy, PimError, QueryKind, Rank, RankConfig, RankHandle, RankRegistry,
        RankStatus, Result, Set, SimulatedRank, Target, Topology, Transaction,
    };
}
