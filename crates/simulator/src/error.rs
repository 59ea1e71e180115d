//! Simulator errors.

use lockstep_simulation::SimulationError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error("failed to read config {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    ParseConfig(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Simulation(#[from] SimulationError),

    #[error("latency histogram: {0}")]
    Histogram(#[from] hdrhistogram::CreationError),
}
