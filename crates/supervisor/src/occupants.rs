//! Finding and killing whatever listens on the gateway port.

use crate::error::SupervisorError;
use async_trait::async_trait;
use std::sync::Arc;
use sysinfo::{Pid, System};
use tokio::process::Command;
use tokio::task;

#[async_trait]
pub trait PortOccupants: Send + Sync {
    /// Pids listening on the TCP port.
    async fn listeners_on_port(&self, port: u16) -> Result<Vec<u32>, SupervisorError>;

    /// Kill a process. `Ok(false)` when the pid no longer exists.
    async fn kill(&self, pid: u32) -> Result<bool, SupervisorError>;
}

/// `lsof` based lookup for Unix hosts.
#[derive(Debug, Default, Clone, Copy)]
pub struct LsofOccupants;

#[async_trait]
impl PortOccupants for LsofOccupants {
    async fn listeners_on_port(&self, port: u16) -> Result<Vec<u32>, SupervisorError> {
        let output = Command::new("lsof")
            .args(["-nP", "-t", &format!("-iTCP:{}", port), "-sTCP:LISTEN"])
            .output()
            .await
            .map_err(|e| SupervisorError::Occupants(format!("lsof: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        // lsof exits 1 when nothing matches.
        if !output.status.success() && (output.status.code() != Some(1) || !stdout.trim().is_empty()) {
            return Err(SupervisorError::Occupants(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(parse_lsof_pids(&stdout))
    }

    async fn kill(&self, pid: u32) -> Result<bool, SupervisorError> {
        kill_pid(pid).await
    }
}

/// `netstat` based lookup for Windows hosts.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetstatOccupants;

#[async_trait]
impl PortOccupants for NetstatOccupants {
    async fn listeners_on_port(&self, port: u16) -> Result<Vec<u32>, SupervisorError> {
        let output = Command::new("netstat")
            .args(["-ano", "-p", "tcp"])
            .output()
            .await
            .map_err(|e| SupervisorError::Occupants(format!("netstat: {}", e)))?;

        if !output.status.success() {
            return Err(SupervisorError::Occupants(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(parse_netstat_pids(&String::from_utf8_lossy(&output.stdout), port))
    }

    async fn kill(&self, pid: u32) -> Result<bool, SupervisorError> {
        kill_pid(pid).await
    }
}

pub fn platform_occupants() -> Arc<dyn PortOccupants> {
    if cfg!(windows) {
        Arc::new(NetstatOccupants)
    } else {
        Arc::new(LsofOccupants)
    }
}

async fn kill_pid(pid: u32) -> Result<bool, SupervisorError> {
    task::spawn_blocking(move || {
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        if !system.refresh_process(pid) {
            return false;
        }
        system.process(pid).map(|process| process.kill()).unwrap_or(false)
    })
    .await
    .map_err(|e| SupervisorError::Occupants(e.to_string()))
}

/// Kill every listener on the port, returning how many were signalled.
///
/// Lookup failures and processes that exit on their own are logged, never
/// returned.
pub async fn terminate_listeners(occupants: &dyn PortOccupants, port: u16) -> usize {
    let pids = match occupants.listeners_on_port(port).await {
        Ok(pids) => pids,
        Err(e) => {
            tracing::warn!(port, error = %e, "Could not list port listeners");
            return 0;
        }
    };

    let own_pid = std::process::id();
    let mut killed = 0;
    for pid in pids.into_iter().filter(|pid| *pid != own_pid) {
        match occupants.kill(pid).await {
            Ok(true) => {
                tracing::info!(port, pid, "Killed port listener");
                killed += 1;
            }
            Ok(false) => tracing::debug!(port, pid, "Listener already gone"),
            Err(e) => tracing::warn!(port, pid, error = %e, "Failed to kill port listener"),
        }
    }
    killed
}

pub(crate) fn parse_lsof_pids(output: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

pub(crate) fn parse_netstat_pids(output: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{}", port);
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            match cols.as_slice() {
                [proto, local, _, state, pid]
                    if proto.eq_ignore_ascii_case("tcp")
                        && *state == "LISTENING"
                        && local.ends_with(&suffix) =>
                {
                    pid.parse().ok()
                }
                _ => None,
            }
        })
        .filter(|pid| *pid != 0)
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}
