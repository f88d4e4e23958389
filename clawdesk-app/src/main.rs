use anyhow::Result;
use clawdesk_app::cli::{parse_args, CliCommand, USAGE};
use clawdesk_app::commands::{call, connect, gateway, identity};
use clawdesk_app::config::AppConfig;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "CLAWDESK_LOG";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("❌ {}\n\n{}", e, USAGE);
            std::process::exit(2);
        }
    };

    if cli.command == CliCommand::Help {
        println!("{}", USAGE);
        return Ok(());
    }

    let config_path = AppConfig::resolve_path(cli.config.as_deref());
    let config = AppConfig::load(&config_path)?;

    match cli.command {
        CliCommand::GatewayRun => gateway::run(&config).await,
        CliCommand::GatewayStatus => gateway::status(&config).await,
        CliCommand::Connect => connect::run(&config).await,
        CliCommand::Call { method, params } => call::run(&config, &method, params.as_deref()).await,
        CliCommand::IdentityShow => identity::show(&config),
        CliCommand::IdentityVerify => identity::verify(&config),
        CliCommand::Help => Ok(()),
    }
}
