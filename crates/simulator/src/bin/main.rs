//! Lockstep Simulator CLI
//!
//! Runs a seeded workload against a simulated cluster and prints a report.
//! Exits non-zero if surviving replicas diverged or a site halted.

use anyhow::{bail, Context};
use clap::Parser;
use lockstep_simulator::{Simulator, SimulatorConfig};
use lockstep_types::SiteId;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lockstep-sim")]
#[command(about = "Deterministic workload simulator for lockstep execution sites")]
#[command(version)]
struct Cli {
    /// TOML config file; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Number of partitions
    #[arg(long)]
    partitions: Option<u32>,

    /// Replicas per partition
    #[arg(long)]
    replicas: Option<u32>,

    /// Number of initiators
    #[arg(long)]
    initiators: Option<u32>,

    /// Simulated time to submit requests for (e.g., "500ms", "10s")
    #[arg(short, long)]
    duration: Option<humantime::Duration>,

    /// Multi-partition request ratio (0.0 to 1.0)
    #[arg(long)]
    mp_ratio: Option<f64>,

    /// Ratio of requests built to roll back (0.0 to 1.0)
    #[arg(long)]
    abort_ratio: Option<f64>,

    /// Kill a site, as SITE@TIME (e.g., "1@2s"); repeatable
    #[arg(long = "kill", value_parser = parse_kill)]
    kills: Vec<(SiteId, Duration)>,

    /// Run this many consecutive seeds starting at --seed
    #[arg(long, default_value = "1")]
    runs: u64,
}

fn parse_kill(s: &str) -> Result<(SiteId, Duration), String> {
    let (site, at) = s
        .split_once('@')
        .ok_or_else(|| format!("expected SITE@TIME, got {s}"))?;
    let site: u64 = site
        .trim()
        .parse()
        .map_err(|_| format!("invalid site id: {site}"))?;
    let at = humantime::parse_duration(at.trim()).map_err(|e| format!("invalid time {at}: {e}"))?;
    Ok((SiteId(site), at))
}

fn build_config(cli: &Cli) -> anyhow::Result<SimulatorConfig> {
    let mut config = match &cli.config {
        Some(path) => SimulatorConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SimulatorConfig::default(),
    };

    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    if let Some(partitions) = cli.partitions {
        config.network.num_partitions = partitions;
    }
    if let Some(replicas) = cli.replicas {
        config.network.replicas_per_partition = replicas;
    }
    if let Some(initiators) = cli.initiators {
        config.network.num_initiators = initiators;
    }
    if let Some(duration) = cli.duration {
        config.duration = *duration;
    }
    if let Some(ratio) = cli.mp_ratio {
        config.workload = config.workload.with_multi_partition_ratio(ratio);
    }
    if let Some(ratio) = cli.abort_ratio {
        config.workload = config.workload.with_abort_ratio(ratio);
    }
    for (site, at) in &cli.kills {
        config = config.with_kill(*at, *site);
    }
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let base = build_config(&cli)?;

    let mut inconsistent = Vec::new();
    for offset in 0..cli.runs.max(1) {
        let config = base.clone().with_seed(base.seed.wrapping_add(offset));
        let seed = config.seed;
        let report = Simulator::new(config)?.run()?;
        report.print();
        if !report.is_consistent() {
            inconsistent.push(seed);
        }
    }

    if !inconsistent.is_empty() {
        bail!("replicas diverged or sites halted for seeds {inconsistent:?}");
    }
    Ok(())
}
