//! Boot a simulated rank and watch it run
//!
//! Allocates an 8x8 rank over the in-process simulator, launches it
//! synchronously and asynchronously, then recovers a faulted DPU.

use anyhow::Context;
use pim_driver::{
    DpuId, DpuProgram, LaunchPolicy, PimError, ProfilingMode, RankConfig, RankRegistry,
    SimulatedRank, Topology,
};
use std::thread;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("pim_driver=debug")
        .init();

    println!("PIM rank lifecycle demo\n");

    let config = RankConfig::new(Topology::RANK_8X8)
        .with_disabled_dpu(DpuId::new(7, 7))
        .with_profiling(ProfilingMode::Statistics);
    let sim = SimulatedRank::for_config(&config);
    sim.set_program_all(DpuProgram::runs_for(4));

    let mut registry = RankRegistry::new();
    let rank = registry
        .allocate(Box::new(sim.clone()), config)
        .context("allocating the simulated rank")?;
    println!(
        "Rank {}: {} DPUs, {} backend, PC width {}",
        rank.id(),
        rank.config().topology.nr_dpus(),
        rank.backend_type(),
        rank.pc_mode().width()
    );

    // Synchronous launch
    rank.launch_rank(LaunchPolicy::Synchronous)?;
    let stats = rank.take_run_statistics();
    let polls: u32 = stats.iter().map(|s| s.polls).sum();
    println!("Synchronous launch: {} runs, {polls} polls in total", stats.len());

    // Asynchronous launch
    rank.launch_rank(LaunchPolicy::Asynchronous)?;
    println!("Asynchronous launch: {} DPUs running", rank.nb_dpu_running());
    while !rank.status()?.done {
        thread::yield_now();
    }
    println!("Asynchronous launch done after {} commits", sim.commit_count());

    // Fault and recovery
    let victim = DpuId::new(3, 5);
    sim.set_program(victim, DpuProgram::faults_after(2));
    match rank.launch_dpu(victim, LaunchPolicy::Synchronous) {
        Err(PimError::Fault { dpus }) => println!("Fault reported on {dpus:?}"),
        other => println!("Unexpected launch outcome: {other:?}"),
    }
    for thread in rank.soft_reset_dpu(victim)? {
        println!("  drained thread {} at PC {:#x}", thread.thread, thread.pc);
    }
    println!("DPU {victim} in fault after soft reset: {}", rank.faulted_dpus().contains(&victim));

    registry.free(&rank)?;
    println!("\nDone");
    Ok(())
}
