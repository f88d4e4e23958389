//! Supervisor configuration.
//!
//! Every timing value here is policy, not correctness: the defaults reproduce
//! the desktop shell's behaviour and tests shrink them freely.

use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_GATEWAY_PORT: u16 = 39527;

/// How the gateway process is launched.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Installation directory; also the child's working directory.
    pub install_dir: PathBuf,
    /// Interpreter to run the entry point with. `None` executes the entry directly.
    pub runtime: Option<PathBuf>,
    pub runtime_args: Vec<String>,
    /// Entry point candidates relative to `install_dir`, first match wins.
    pub entry_candidates: Vec<PathBuf>,
    /// JSON config file holding `gateway.auth.token`.
    pub token_file: Option<PathBuf>,
    /// Base directory handed to the gateway as its home.
    pub home_dir: PathBuf,
}

impl LaunchSpec {
    pub fn new<P: AsRef<Path>>(install_dir: P) -> Self {
        let home_dir = home_dir();
        Self {
            install_dir: install_dir.as_ref().to_path_buf(),
            runtime: Some(PathBuf::from("node")),
            runtime_args: vec!["--disable-warning=ExperimentalWarning".to_string()],
            entry_candidates: default_entry_candidates(),
            token_file: Some(home_dir.join(".openclaw").join("openclaw.json")),
            home_dir,
        }
    }
}

pub fn default_entry_candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from("dist").join("entry.js"),
        PathBuf::from("dist").join("index.js"),
        PathBuf::from("openclaw.mjs"),
    ]
}

/// Health check cadence and failure handling.
#[derive(Debug, Clone)]
pub struct HealthPolicy {
    pub interval: Duration,
    /// Consecutive failures that trigger a restart (owned) or `error` (adopted).
    pub failure_ceiling: u32,
    /// Delay before the first probe after a cold start.
    pub cold_start_delay: Duration,
    /// Delay before the first probe after a deliberate restart.
    pub restart_delay: Duration,
    /// Delay before the first probe of an adopted gateway.
    pub adopted_delay: Duration,
    /// Failures logged individually before switching to every `log_every`th.
    pub log_first: u32,
    pub log_every: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(5000),
            failure_ceiling: 5,
            cold_start_delay: Duration::from_millis(5000),
            restart_delay: Duration::from_millis(1500),
            adopted_delay: Duration::from_millis(500),
            log_first: 2,
            log_every: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub port: u16,
    pub launch: LaunchSpec,
    pub health: HealthPolicy,
    /// Grace period between the termination request and a forced kill.
    pub shutdown_timeout: Duration,
    /// Pause after killing a port occupant before probing again.
    pub port_settle: Duration,
    pub connect_timeout: Duration,
    pub probe_timeout: Duration,
}

impl SupervisorConfig {
    pub fn new<P: AsRef<Path>>(port: u16, install_dir: P) -> Self {
        Self {
            port,
            launch: LaunchSpec::new(install_dir),
            health: HealthPolicy::default(),
            shutdown_timeout: Duration::from_millis(5000),
            port_settle: Duration::from_millis(1500),
            connect_timeout: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(3),
        }
    }
}

/// Home directory from the environment, falling back to the working directory.
pub fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}
