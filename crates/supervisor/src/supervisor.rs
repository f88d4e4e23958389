//! The supervisor task and its handle.
//!
//! All supervision state lives in one task. The handle sends it commands and
//! reads the published status; helper tasks (health ticker, child watcher)
//! report back over channels tagged with the generation they were started in,
//! so anything from before the latest start/stop is dropped on arrival.

use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use crate::health::{spawn_ticker, HealthReport, HealthTracker};
use crate::observer::SupervisorObserver;
use crate::occupants::{platform_occupants, terminate_listeners, PortOccupants};
use crate::probe::{GatewayProbe, HttpProbe};
use crate::process::{describe_exit, spawn_service, ChildExit, ServiceProcess};
use crate::state::{GatewayState, GatewayStatus, LogLevel};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

enum Command {
    Start(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
    Restart(oneshot::Sender<()>),
}

/// Cloneable handle to a running supervisor task.
///
/// Dropping the last handle stops the supervisor, terminating an owned
/// gateway.
#[derive(Clone)]
pub struct GatewaySupervisor {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<GatewayState>,
    status: watch::Receiver<GatewayStatus>,
    port: u16,
}

impl GatewaySupervisor {
    /// Start the supervisor task. Must be called inside a tokio runtime.
    pub fn spawn(
        config: SupervisorConfig,
        probe: Arc<dyn GatewayProbe>,
        occupants: Arc<dyn PortOccupants>,
        observer: Arc<dyn SupervisorObserver>,
    ) -> Self {
        let port = config.port;
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(GatewayState::Stopped);
        let (status_tx, status_rx) = watch::channel(GatewayStatus {
            state: GatewayState::Stopped,
            port,
            adopted: false,
        });
        let (health_tx, health_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();

        let health = HealthTracker::new(&config.health);
        let actor = Supervisor {
            config,
            probe,
            occupants,
            observer,
            state: GatewayState::Stopped,
            process: None,
            stopping: false,
            generation: 0,
            health,
            ticker: None,
            state_tx,
            status_tx,
            health_tx,
            exit_tx,
        };
        tokio::spawn(actor.run(commands_rx, health_rx, exit_rx));

        Self {
            commands: commands_tx,
            state: state_rx,
            status: status_rx,
            port,
        }
    }

    /// Supervisor using the HTTP probe and the platform's port lookup.
    pub fn with_defaults(config: SupervisorConfig, observer: Arc<dyn SupervisorObserver>) -> Self {
        let probe = Arc::new(HttpProbe::new(config.connect_timeout, config.probe_timeout));
        Self::spawn(config, probe, platform_occupants(), observer)
    }

    /// Start or adopt the gateway. Failures show up as the `error` state.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        self.call(Command::Start).await
    }

    pub async fn stop(&self) -> Result<(), SupervisorError> {
        self.call(Command::Stop).await
    }

    pub async fn restart(&self) -> Result<(), SupervisorError> {
        self.call(Command::Restart).await
    }

    pub fn state(&self) -> GatewayState {
        *self.state.borrow()
    }

    pub fn status(&self) -> GatewayStatus {
        self.status.borrow().clone()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn subscribe(&self) -> watch::Receiver<GatewayState> {
        self.state.clone()
    }

    async fn call(
        &self,
        command: impl FnOnce(oneshot::Sender<()>) -> Command,
    ) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| SupervisorError::Stopped)?;
        rx.await.map_err(|_| SupervisorError::Stopped)
    }
}

struct Supervisor {
    config: SupervisorConfig,
    probe: Arc<dyn GatewayProbe>,
    occupants: Arc<dyn PortOccupants>,
    observer: Arc<dyn SupervisorObserver>,
    state: GatewayState,
    process: Option<ServiceProcess>,
    stopping: bool,
    generation: u64,
    health: HealthTracker,
    ticker: Option<JoinHandle<()>>,
    state_tx: watch::Sender<GatewayState>,
    status_tx: watch::Sender<GatewayStatus>,
    health_tx: mpsc::UnboundedSender<HealthReport>,
    exit_tx: mpsc::UnboundedSender<ChildExit>,
}

impl Supervisor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut health: mpsc::UnboundedReceiver<HealthReport>,
        mut exits: mpsc::UnboundedReceiver<ChildExit>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Start(reply)) => {
                        let delay = self.config.health.cold_start_delay;
                        self.start(delay).await;
                        let _ = reply.send(());
                    }
                    Some(Command::Stop(reply)) => {
                        self.stop().await;
                        let _ = reply.send(());
                    }
                    Some(Command::Restart(reply)) => {
                        self.restart().await;
                        let _ = reply.send(());
                    }
                    None => {
                        tracing::debug!("All supervisor handles dropped, shutting down");
                        self.stop().await;
                        return;
                    }
                },
                Some(report) = health.recv() => self.on_health(report).await,
                Some(exit) = exits.recv() => self.on_exit(exit),
            }
        }
    }

    async fn start(&mut self, initial_delay: Duration) {
        if matches!(self.state, GatewayState::Ready | GatewayState::Starting) {
            return;
        }

        let port = self.config.port;
        self.stopping = false;
        self.generation += 1;
        self.health.record_success();
        self.set_state(GatewayState::Starting);

        if self.port_serves_gateway().await {
            self.log(
                LogLevel::Info,
                &format!("Port {} is held by a running gateway, terminating it", port),
            );
            let killed = terminate_listeners(self.occupants.as_ref(), port).await;
            tracing::debug!(port, killed, "Terminated port listeners");
            tokio::time::sleep(self.config.port_settle).await;

            if self.port_serves_gateway().await {
                self.adopt();
                return;
            }
        }

        match spawn_service(
            &self.config,
            self.observer.clone(),
            self.generation,
            self.exit_tx.clone(),
        ) {
            Ok(child) => {
                let pid = child
                    .pid()
                    .map(|pid| pid.to_string())
                    .unwrap_or_else(|| "?".to_string());
                self.log(
                    LogLevel::Info,
                    &format!("Gateway started (pid {}) on port {}", pid, port),
                );
                self.process = Some(ServiceProcess::Owned(child));
                self.start_ticker(initial_delay);
            }
            Err(e) => {
                self.log(LogLevel::Error, &format!("Failed to start gateway: {}", e));
                self.set_state(GatewayState::Error);
            }
        }
    }

    fn adopt(&mut self) {
        let port = self.config.port;
        self.log(
            LogLevel::Info,
            &format!("Adopting the gateway already running on port {}", port),
        );
        crate::metrics::increment_adoptions();
        self.process = Some(ServiceProcess::Adopted);
        self.set_state(GatewayState::Ready);
        self.start_ticker(self.config.health.adopted_delay);
    }

    /// Tear down whatever we supervise without publishing a final state.
    async fn halt(&mut self) {
        self.stopping = true;
        self.generation += 1;
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }

        match self.process.take() {
            Some(ServiceProcess::Adopted) => {
                self.log(LogLevel::Info, "Detaching from adopted gateway");
            }
            Some(ServiceProcess::Owned(child)) => {
                self.log(LogLevel::Info, "Stopping gateway");
                let status = child.terminate().await;
                self.log(
                    LogLevel::Info,
                    &format!("Gateway stopped ({})", describe_exit(status)),
                );
            }
            None => {}
        }
        self.health.record_success();
    }

    async fn stop(&mut self) {
        self.halt().await;
        self.set_state(GatewayState::Stopped);
    }

    async fn restart(&mut self) {
        self.set_state(GatewayState::Restarting);
        self.log(LogLevel::Info, "Restarting gateway");
        crate::metrics::increment_restarts();
        self.halt().await;
        let delay = self.config.health.restart_delay;
        self.start(delay).await;
    }

    async fn on_health(&mut self, report: HealthReport) {
        if report.generation != self.generation || self.stopping {
            tracing::debug!(generation = report.generation, "Dropping stale health report");
            return;
        }
        let adopted = match &self.process {
            Some(process) => process.is_adopted(),
            None => return,
        };

        match report.result {
            Ok(()) => {
                self.health.record_success();
                if self.state != GatewayState::Ready {
                    self.set_state(GatewayState::Ready);
                    self.log(
                        LogLevel::Info,
                        &format!("Gateway ready on port {}", self.config.port),
                    );
                }
            }
            Err(e) => {
                crate::metrics::increment_health_failures();
                let outcome = self.health.record_failure();
                if outcome.should_log {
                    self.log(
                        LogLevel::Warn,
                        &format!(
                            "Health check failed ({}/{}): {}",
                            outcome.failures, self.config.health.failure_ceiling, e
                        ),
                    );
                }
                if !outcome.ceiling_reached {
                    return;
                }

                if adopted {
                    if self.state != GatewayState::Error {
                        self.log(
                            LogLevel::Error,
                            "Adopted gateway stopped answering health checks",
                        );
                        self.set_state(GatewayState::Error);
                    }
                } else {
                    self.log(
                        LogLevel::Error,
                        "Gateway stopped answering health checks, restarting",
                    );
                    self.restart().await;
                }
            }
        }
    }

    fn on_exit(&mut self, exit: ChildExit) {
        if exit.generation != self.generation || exit.requested {
            return;
        }
        self.process = None;
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        if !self.stopping {
            self.log(
                LogLevel::Warn,
                &format!("Gateway exited unexpectedly ({})", describe_exit(exit.status)),
            );
            self.set_state(GatewayState::Error);
        }
    }

    async fn port_serves_gateway(&self) -> bool {
        let port = self.config.port;
        self.probe.is_listening(port).await && self.probe.check_health(port).await.is_ok()
    }

    fn start_ticker(&mut self, initial_delay: Duration) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        self.ticker = Some(spawn_ticker(
            self.probe.clone(),
            self.config.port,
            initial_delay,
            self.config.health.interval,
            self.generation,
            self.health_tx.clone(),
        ));
    }

    fn set_state(&mut self, state: GatewayState) {
        if self.state == state {
            return;
        }
        self.state = state;
        // Status first, so a reader woken by the state watch sees a matching status.
        self.status_tx.send_replace(GatewayStatus {
            state,
            port: self.config.port,
            adopted: self
                .process
                .as_ref()
                .map(ServiceProcess::is_adopted)
                .unwrap_or(false),
        });
        self.state_tx.send_replace(state);
        self.observer.on_state_change(state);
    }

    fn log(&self, level: LogLevel, message: &str) {
        self.observer.on_log(level, message);
    }
}
