//! Rank registry and DPU sets
//!
//! The registry is owned by the embedding application; nothing here is
//! global. A [`Set`] names what a launch, status or sync applies to: some
//! ranks, or a single DPU of one rank.

use crate::backend::RankBackend;
use crate::config::RankConfig;
use crate::error::{PimError, Result};
use crate::lifecycle::{LaunchPolicy, RankStatus};
use crate::rank::{Rank, RankHandle};
use pim_ufi::DpuId;
use std::sync::Arc;
use tracing::info;

/// One DPU of one rank
#[derive(Debug, Clone)]
pub struct DpuHandle {
    /// Owning rank
    pub rank: RankHandle,
    /// DPU within the rank
    pub dpu: DpuId,
}

/// Target of a launch, status or sync
#[derive(Debug, Clone)]
pub enum Set {
    /// Every enabled DPU of each rank
    Ranks(Vec<RankHandle>),
    /// A single DPU
    Dpu(DpuHandle),
}

impl Set {
    /// Boot the set and wait as `policy` says.
    ///
    /// Synchronous launches over several ranks boot all of them before
    /// waiting on any.
    ///
    /// # Errors
    ///
    /// The first boot error, then the merged `Fault` of every rank, or any
    /// other error from a wait.
    pub fn launch(&self, policy: LaunchPolicy) -> Result<()> {
        match self {
            Self::Dpu(handle) => handle.rank.launch_dpu(handle.dpu, policy),
            Self::Ranks(ranks) => match policy {
                LaunchPolicy::Asynchronous => ranks
                    .iter()
                    .try_for_each(|rank| rank.launch_rank(LaunchPolicy::Asynchronous)),
                LaunchPolicy::Synchronous => {
                    ranks.iter().try_for_each(|rank| rank.boot_rank())?;
                    self.sync()
                }
            },
        }
    }

    /// Poll the set and merge the statuses.
    ///
    /// # Errors
    ///
    /// Any poll error.
    pub fn status(&self) -> Result<RankStatus> {
        match self {
            Self::Dpu(handle) => handle.rank.dpu_status(handle.dpu),
            Self::Ranks(ranks) => ranks.iter().try_fold(
                RankStatus {
                    done: true,
                    fault: false,
                },
                |acc, rank| Ok(acc.merge(rank.status()?)),
            ),
        }
    }

    /// Wait until the whole set stopped.
    ///
    /// # Errors
    ///
    /// `Fault` naming every faulted DPU across the set, otherwise any poll
    /// error.
    pub fn sync(&self) -> Result<()> {
        match self {
            Self::Dpu(handle) => handle.rank.sync_dpu(handle.dpu),
            Self::Ranks(ranks) => {
                let mut faulted = Vec::new();
                for rank in ranks {
                    match rank.sync() {
                        Ok(()) => {}
                        Err(PimError::Fault { dpus }) => faulted.extend(dpus),
                        Err(e) => return Err(e),
                    }
                }
                if faulted.is_empty() {
                    Ok(())
                } else {
                    Err(PimError::Fault { dpus: faulted })
                }
            }
        }
    }

    /// Number of DPUs addressed.
    pub fn nr_dpus(&self) -> usize {
        match self {
            Self::Dpu(_) => 1,
            Self::Ranks(ranks) => ranks.iter().map(|r| r.config().topology.nr_dpus()).sum(),
        }
    }
}

/// Ranks allocated by one embedding application
#[derive(Debug, Default)]
pub struct RankRegistry {
    ranks: Vec<RankHandle>,
    next_id: u32,
}

impl RankRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring up a rank over `backend`: validate `config`, reset the rank,
    /// register it.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for a rejected configuration, otherwise any reset
    /// error.
    pub fn allocate(
        &mut self,
        backend: Box<dyn RankBackend>,
        config: RankConfig,
    ) -> Result<RankHandle> {
        let rank = Rank::new(self.next_id, backend, config)?;
        rank.reset()?;
        self.next_id += 1;
        info!("Allocated rank {} ({} backend)", rank.id(), rank.backend_type());
        self.ranks.push(Arc::clone(&rank));
        Ok(rank)
    }

    /// Stop the workers of `rank` and drop it from the registry.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if `rank` does not belong to this registry.
    pub fn free(&mut self, rank: &RankHandle) -> Result<()> {
        let pos = self
            .ranks
            .iter()
            .position(|r| Arc::ptr_eq(r, rank))
            .ok_or_else(|| PimError::internal(format!("rank {} not in registry", rank.id())))?;
        let rank = self.ranks.remove(pos);
        rank.stop_workers();
        info!("Freed rank {}", rank.id());
        Ok(())
    }

    /// Registered ranks.
    pub fn ranks(&self) -> &[RankHandle] {
        &self.ranks
    }

    /// Number of registered ranks.
    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    /// No rank is registered.
    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    /// Set of every registered rank.
    pub fn all(&self) -> Set {
        Set::Ranks(self.ranks.clone())
    }

    /// Set of one DPU.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if `dpu` is outside the rank.
    pub fn dpu(rank: &RankHandle, dpu: DpuId) -> Result<Set> {
        if !rank.config().topology.contains(dpu) {
            return Err(PimError::internal(format!("DPU {dpu} outside rank {}", rank.id())));
        }
        Ok(Set::Dpu(DpuHandle {
            rank: Arc::clone(rank),
            dpu,
        }))
    }
}

impl Drop for RankRegistry {
    fn drop(&mut self) {
        for rank in &self.ranks {
            rank.stop_workers();
        }
    }
}
