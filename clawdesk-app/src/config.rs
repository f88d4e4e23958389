use anyhow::{bail, Context, Result};
use clawdesk_identity::DeviceIdentityStore;
use clawdesk_protocol::{ClientOptions, ReconnectPolicy};
use clawdesk_supervisor::{
    config::{default_entry_candidates, home_dir},
    read_gateway_token, HealthPolicy, LaunchSpec, SupervisorConfig, DEFAULT_GATEWAY_PORT,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "clawdesk.yaml";
pub const CONFIG_ENV: &str = "CLAWDESK_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub gateway: GatewaySection,
    pub client: ClientSection,
    pub identity: IdentitySection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub port: u16,
    pub install_dir: PathBuf,
    /// Interpreter for the entry point; `null` runs the entry directly.
    pub runtime: Option<PathBuf>,
    pub runtime_args: Vec<String>,
    pub entry_candidates: Vec<PathBuf>,
    /// Defaults to `<home>/.openclaw/openclaw.json`.
    pub token_file: Option<PathBuf>,
    pub health_interval_ms: u64,
    pub health_failure_ceiling: u32,
    pub cold_start_delay_ms: u64,
    pub restart_delay_ms: u64,
    pub adopted_delay_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub port_settle_ms: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        let health = HealthPolicy::default();
        Self {
            port: DEFAULT_GATEWAY_PORT,
            install_dir: PathBuf::from("./bundled/openclaw"),
            runtime: Some(PathBuf::from("node")),
            runtime_args: vec!["--disable-warning=ExperimentalWarning".to_string()],
            entry_candidates: default_entry_candidates(),
            token_file: None,
            health_interval_ms: health.interval.as_millis() as u64,
            health_failure_ceiling: health.failure_ceiling,
            cold_start_delay_ms: health.cold_start_delay.as_millis() as u64,
            restart_delay_ms: health.restart_delay.as_millis() as u64,
            adopted_delay_ms: health.adopted_delay.as_millis() as u64,
            shutdown_timeout_ms: 5000,
            port_settle_ms: 1500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// Defaults to `ws://127.0.0.1:<gateway.port>`.
    pub url: Option<String>,
    /// Overrides the token read from the gateway config file.
    pub token: Option<String>,
    pub client_id: String,
    pub client_version: String,
    pub locale: String,
    pub challenge_wait_ms: u64,
    pub backoff_floor_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_factor: f64,
}

impl Default for ClientSection {
    fn default() -> Self {
        let reconnect = ReconnectPolicy::default();
        Self {
            url: None,
            token: None,
            client_id: "cli".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            locale: "en-US".to_string(),
            challenge_wait_ms: 750,
            backoff_floor_ms: reconnect.floor.as_millis() as u64,
            backoff_max_ms: reconnect.max.as_millis() as u64,
            backoff_factor: reconnect.factor,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySection {
    /// Defaults to `<home>/.openclaw/identity/device-identity.json`.
    pub path: Option<PathBuf>,
}

impl AppConfig {
    /// Config file location: `--config`, then `CLAWDESK_CONFIG`, then `./clawdesk.yaml`.
    pub fn resolve_path(cli_path: Option<&Path>) -> PathBuf {
        cli_path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    /// Load and validate. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.gateway.port == 0 {
            bail!("gateway.port must be non-zero");
        }
        if self.gateway.health_failure_ceiling < 1 {
            bail!("gateway.health_failure_ceiling must be at least 1");
        }
        if self.gateway.health_interval_ms == 0 {
            bail!("gateway.health_interval_ms must be positive");
        }
        if !self.client.backoff_factor.is_finite() || self.client.backoff_factor < 1.0 {
            bail!("client.backoff_factor must be at least 1.0");
        }
        if self.client.backoff_floor_ms == 0 {
            bail!("client.backoff_floor_ms must be positive");
        }
        if self.client.challenge_wait_ms == 0 {
            bail!("client.challenge_wait_ms must be positive");
        }
        if self.client.backoff_floor_ms > self.client.backoff_max_ms {
            bail!("client.backoff_floor_ms must not exceed client.backoff_max_ms");
        }
        Ok(())
    }

    pub fn token_file(&self) -> PathBuf {
        self.gateway
            .token_file
            .clone()
            .unwrap_or_else(|| home_dir().join(".openclaw").join("openclaw.json"))
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        let g = &self.gateway;
        let mut config = SupervisorConfig::new(g.port, &g.install_dir);
        config.launch = LaunchSpec {
            runtime: g.runtime.clone(),
            runtime_args: g.runtime_args.clone(),
            entry_candidates: g.entry_candidates.clone(),
            token_file: Some(self.token_file()),
            ..config.launch
        };
        config.health = HealthPolicy {
            interval: Duration::from_millis(g.health_interval_ms),
            failure_ceiling: g.health_failure_ceiling,
            cold_start_delay: Duration::from_millis(g.cold_start_delay_ms),
            restart_delay: Duration::from_millis(g.restart_delay_ms),
            adopted_delay: Duration::from_millis(g.adopted_delay_ms),
            ..HealthPolicy::default()
        };
        config.shutdown_timeout = Duration::from_millis(g.shutdown_timeout_ms);
        config.port_settle = Duration::from_millis(g.port_settle_ms);
        config
    }

    /// Token for the connect handshake: explicit setting, else the gateway's own.
    pub fn client_token(&self) -> Option<String> {
        self.client
            .token
            .clone()
            .or_else(|| read_gateway_token(&self.token_file()))
    }

    pub fn client_options(&self) -> ClientOptions {
        let c = &self.client;
        let mut options = match &c.url {
            Some(url) => ClientOptions::new(url.clone()),
            None => ClientOptions::for_port(self.gateway.port),
        };
        options.token = self.client_token();
        options.client_id = c.client_id.clone();
        options.client_version = c.client_version.clone();
        options.locale = c.locale.clone();
        options.challenge_wait = Duration::from_millis(c.challenge_wait_ms);
        options.reconnect = ReconnectPolicy {
            floor: Duration::from_millis(c.backoff_floor_ms),
            max: Duration::from_millis(c.backoff_max_ms),
            factor: c.backoff_factor,
        };
        options
    }

    pub fn identity_store(&self) -> DeviceIdentityStore {
        match &self.identity.path {
            Some(path) => DeviceIdentityStore::new(path),
            None => DeviceIdentityStore::default_location(),
        }
    }
}
