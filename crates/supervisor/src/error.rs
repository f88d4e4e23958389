use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Gateway entry point not found under {install_dir} (searched: {candidates})")]
    EntryNotFound {
        install_dir: PathBuf,
        candidates: String,
    },

    #[error("Failed to spawn gateway: {0}")]
    Spawn(String),

    #[error("Health probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("Port occupant lookup failed: {0}")]
    Occupants(String),

    #[error("Supervisor task is no longer running")]
    Stopped,
}

/// Why a health probe did not see a live gateway.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("HTTP {0}")]
    Status(u16),

    #[error("timed out")]
    Timeout,

    #[error("{0}")]
    Connect(String),
}
