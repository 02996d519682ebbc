//! Rank backend implementations
//!
//! Only the simulator lives in this crate. Platform backends (DMA
//! interleaving, sysfs discovery) implement [`crate::RankBackend`] in the
//! embedding application.

pub mod simulator;

pub use simulator::{DpuProgram, SimulatedRank, SIMULATED_CHIP_ID};
