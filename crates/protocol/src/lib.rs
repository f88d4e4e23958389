//! Client for the gateway's JSON-over-WebSocket protocol.
//!
//! Each connection starts with a `connect.challenge` / `connect` exchange.
//! After `hello-ok` the client multiplexes correlated requests and delivers
//! server events in order. Lost connections are retried forever with
//! exponential backoff until [`GatewayClient::stop`] is called.

pub mod backoff;
pub mod client;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod metrics;
pub mod signer;

pub use backoff::{Backoff, ReconnectPolicy};
pub use client::{ClientOptions, ConnectionStatus, GatewayClient, GatewayClientBuilder, ListenerId};
pub use error::ClientError;
pub use frame::{ErrorShape, EventFrame, Frame, HelloOk, RequestFrame, ResponseFrame};
pub use handshake::{ConnectParams, CONNECT_FAILED_CODE, MALFORMED_FRAME_CODE, PROTOCOL_VERSION};
pub use signer::DeviceAuthSigner;
