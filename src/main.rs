//! A single invocation runs one rank of the simulation; the rank is taken
//! from the MPI launcher's environment. Fatal ingest or invariant errors
//! abort with nonzero status.

use std::path::PathBuf;

use anyhow::Context;
use log::{error, info};

use snmc::diagnostics;
use snmc::simulation::Simulation;

/// Rank from the usual MPI launcher environment variables, defaulting to a
/// single-rank run.
fn rank_from_environment() -> usize {
    for key in &["OMPI_COMM_WORLD_RANK", "PMI_RANK", "SLURM_PROCID", "RANK"] {
        if let Ok(value) = std::env::var(key) {
            if let Ok(rank) = value.parse() {
                return rank;
            }
        }
    }
    0
}

fn run() -> anyhow::Result<()> {
    let rank = rank_from_environment();
    diagnostics::init(rank);

    let dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    info!("starting in {}", dir.display());

    let npkts = std::env::var("SNMC_NPKTS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(snmc::simulation::DEFAULT_NPKTS);

    let mut sim = Simulation::init(dir, rank, npkts).context("initialising the simulation")?;
    sim.run().context("running the simulation")?;
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        error!("{:#}", err);
        std::process::exit(1);
    }
}
