//! Supervision of the local gateway process.
//!
//! [`GatewaySupervisor`] launches the gateway, or adopts one that is already
//! answering on the configured port, probes its health endpoint and restarts
//! an owned process that stops answering.

pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod observer;
pub mod occupants;
pub mod probe;
pub mod process;
pub mod state;
pub mod supervisor;
pub mod token;

pub use config::{HealthPolicy, LaunchSpec, SupervisorConfig, DEFAULT_GATEWAY_PORT};
pub use error::{ProbeError, SupervisorError};
pub use observer::{ChannelObserver, LogHistory, SupervisorEvent, SupervisorObserver, TracingObserver};
pub use occupants::{platform_occupants, terminate_listeners, LsofOccupants, NetstatOccupants, PortOccupants};
pub use probe::{health_url, GatewayProbe, HttpProbe};
pub use process::{find_entry_script, ServiceProcess};
pub use state::{GatewayState, GatewayStatus, LogLevel, LogLine};
pub use supervisor::GatewaySupervisor;
pub use token::read_gateway_token;
