use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed ({code}): {reason}")]
    ConnectionClosed { code: u16, reason: String },

    #[error("Request rejected [{code}]: {message}")]
    Rejected {
        code: String,
        message: String,
        details: Option<Value>,
    },

    #[error("Client stopped")]
    Stopped,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Serialization(e.to_string())
    }
}
