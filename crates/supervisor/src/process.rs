//! Launching the gateway process and watching it until it exits.

use crate::config::{LaunchSpec, SupervisorConfig};
use crate::error::SupervisorError;
use crate::observer::SupervisorObserver;
use crate::state::LogLevel;
use crate::token::read_gateway_token;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// The gateway the supervisor is responsible for.
#[derive(Debug)]
pub enum ServiceProcess {
    /// Spawned by us; we may signal it.
    Owned(OwnedChild),
    /// Found already running; only monitored, never signalled.
    Adopted,
}

impl ServiceProcess {
    pub fn is_adopted(&self) -> bool {
        matches!(self, ServiceProcess::Adopted)
    }
}

/// Sent by the watcher task once the child is gone.
#[derive(Debug)]
pub struct ChildExit {
    pub generation: u64,
    pub status: Option<ExitStatus>,
    /// True when the exit followed a termination request.
    pub requested: bool,
}

/// Handle to a spawned gateway. The child itself lives in its watcher task.
#[derive(Debug)]
pub struct OwnedChild {
    pid: Option<u32>,
    terminate: Option<oneshot::Sender<()>>,
    watcher: JoinHandle<Option<ExitStatus>>,
}

impl OwnedChild {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the child to exit, force-killing it after the shutdown timeout.
    /// Resolves once the process is gone.
    pub async fn terminate(mut self) -> Option<ExitStatus> {
        if let Some(tx) = self.terminate.take() {
            let _ = tx.send(());
        }
        (&mut self.watcher).await.ok().flatten()
    }
}

/// First configured entry point that exists under the install directory.
pub fn find_entry_script(launch: &LaunchSpec) -> Result<PathBuf, SupervisorError> {
    launch
        .entry_candidates
        .iter()
        .map(|candidate| launch.install_dir.join(candidate))
        .find(|path| path.is_file())
        .ok_or_else(|| SupervisorError::EntryNotFound {
            install_dir: launch.install_dir.clone(),
            candidates: launch
                .entry_candidates
                .iter()
                .map(|c| c.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        })
}

/// Program and arguments used to start the gateway.
pub fn launch_command(launch: &LaunchSpec, entry: &Path, port: u16) -> (PathBuf, Vec<String>) {
    let tail = ["gateway".to_string(), "--port".to_string(), port.to_string()];
    match &launch.runtime {
        Some(runtime) => {
            let mut args = launch.runtime_args.clone();
            args.push(entry.display().to_string());
            args.extend(tail);
            (runtime.clone(), args)
        }
        None => (entry.to_path_buf(), tail.to_vec()),
    }
}

/// Environment handed to the gateway on top of ours.
pub fn launch_env(config: &SupervisorConfig, token: Option<String>) -> Vec<(String, String)> {
    let mut env = vec![
        ("NODE_ENV".to_string(), "production".to_string()),
        ("OPENCLAW_NO_RESPAWN".to_string(), "1".to_string()),
        ("OPENCLAW_NODE_OPTIONS_READY".to_string(), "1".to_string()),
        ("OPENCLAW_GATEWAY_PORT".to_string(), config.port.to_string()),
        (
            "OPENCLAW_HOME".to_string(),
            config.launch.home_dir.display().to_string(),
        ),
    ];
    if let Some(token) = token {
        env.push(("OPENCLAW_GATEWAY_TOKEN".to_string(), token));
    }
    env
}

/// Spawn the gateway and start its output readers and exit watcher.
pub(crate) fn spawn_service(
    config: &SupervisorConfig,
    observer: Arc<dyn SupervisorObserver>,
    generation: u64,
    exits: mpsc::UnboundedSender<ChildExit>,
) -> Result<OwnedChild, SupervisorError> {
    let entry = find_entry_script(&config.launch)?;
    let token = config
        .launch
        .token_file
        .as_deref()
        .and_then(read_gateway_token);
    let (program, args) = launch_command(&config.launch, &entry, config.port);

    tracing::info!(
        program = %program.display(),
        entry = %entry.display(),
        port = config.port,
        has_token = token.is_some(),
        "Spawning gateway"
    );

    let mut command = Command::new(&program);
    command
        .args(&args)
        .current_dir(&config.launch.install_dir)
        .envs(launch_env(config, token))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(windows)]
    command.creation_flags(CREATE_NO_WINDOW);

    let mut child = command
        .spawn()
        .map_err(|e| SupervisorError::Spawn(format!("{}: {}", program.display(), e)))?;

    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, LogLevel::Info, observer.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, LogLevel::Warn, observer);
    }

    let pid = child.id();
    let (terminate_tx, terminate_rx) = oneshot::channel();
    let watcher = tokio::spawn(watch_child(
        child,
        terminate_rx,
        config.shutdown_timeout,
        generation,
        exits,
    ));

    Ok(OwnedChild {
        pid,
        terminate: Some(terminate_tx),
        watcher,
    })
}

fn forward_lines<R>(reader: R, level: LogLevel, observer: Arc<dyn SupervisorObserver>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim_end();
            if !line.trim().is_empty() {
                observer.on_log(level, line);
            }
        }
    });
}

async fn watch_child(
    mut child: Child,
    mut terminate_rx: oneshot::Receiver<()>,
    shutdown_timeout: Duration,
    generation: u64,
    exits: mpsc::UnboundedSender<ChildExit>,
) -> Option<ExitStatus> {
    // A dropped handle counts as a termination request.
    let (status, requested) = tokio::select! {
        status = child.wait() => (status.ok(), false),
        _ = &mut terminate_rx => (shutdown(&mut child, shutdown_timeout).await, true),
    };

    let _ = exits.send(ChildExit {
        generation,
        status,
        requested,
    });
    status
}

async fn shutdown(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    request_exit(child);
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => {
            tracing::warn!(pid = ?child.id(), "Gateway ignored termination, killing");
            let _ = child.start_kill();
            child.wait().await.ok()
        }
    }
}

#[cfg(unix)]
fn request_exit(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: plain signal delivery to a pid we spawned and have not reaped.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn request_exit(child: &mut Child) {
    let _ = child.start_kill();
}

pub fn describe_exit(status: Option<ExitStatus>) -> String {
    match status {
        Some(status) => status.to_string(),
        None => "unknown status".to_string(),
    }
}
