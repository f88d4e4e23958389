use crate::config::AppConfig;
use anyhow::{Context, Result};
use clawdesk_supervisor::{
    GatewayProbe, GatewayState, GatewaySupervisor, HttpProbe, LogHistory, SupervisorObserver,
    TracingObserver,
};
use std::sync::Arc;

/// Number of recent gateway log lines shown when the gateway fails.
const ERROR_CONTEXT_LINES: usize = 20;

pub async fn run(config: &AppConfig) -> Result<()> {
    let supervisor_config = config.supervisor_config();
    println!(
        "🚀 Supervising gateway on port {} ({})",
        supervisor_config.port,
        supervisor_config.launch.install_dir.display()
    );

    let history = Arc::new(LogHistory::new(Arc::new(TracingObserver)));
    let observer: Arc<dyn SupervisorObserver> = history.clone();
    let supervisor = GatewaySupervisor::with_defaults(supervisor_config, observer);
    let mut states = supervisor.subscribe();

    if let Err(e) = supervisor.start().await {
        eprintln!("❌ Gateway failed to start: {}", e);
    }

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                let status = supervisor.status();
                match state {
                    GatewayState::Ready if status.adopted => {
                        println!("✓ Gateway ready (adopted, port {})", status.port)
                    }
                    GatewayState::Ready => println!("✓ Gateway ready (port {})", status.port),
                    GatewayState::Error => {
                        println!("✗ Gateway error");
                        print_recent(&history);
                    }
                    other => println!("… Gateway {}", other),
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                break;
            }
        }
    }

    println!("\nStopping gateway...");
    supervisor.stop().await?;
    println!("Gateway stopped");
    Ok(())
}

pub async fn status(config: &AppConfig) -> Result<()> {
    let port = config.gateway.port;
    let probe = HttpProbe::default();

    print!("🔌 Port {}... ", port);
    if !probe.is_listening(port).await {
        println!("✗ (nothing listening)");
        return Ok(());
    }
    println!("✓");

    print!("🏥 Health endpoint... ");
    match probe.check_health(port).await {
        Ok(()) => println!("✓"),
        Err(e) => println!("✗ ({})", e),
    }
    Ok(())
}

fn print_recent(history: &LogHistory) {
    let lines = history.snapshot();
    let start = lines.len().saturating_sub(ERROR_CONTEXT_LINES);
    for line in &lines[start..] {
        eprintln!("  [{:?}] {}", line.level, line.message);
    }
}
