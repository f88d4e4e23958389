use crate::error::ProbeError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

/// Reachability checks against the local gateway.
#[async_trait]
pub trait GatewayProbe: Send + Sync {
    /// True if something accepts TCP connections on the port.
    async fn is_listening(&self, port: u16) -> bool;

    /// `Ok` only for a `200` answer to `GET /health`.
    async fn check_health(&self, port: u16) -> Result<(), ProbeError>;
}

pub struct HttpProbe {
    client: reqwest::Client,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl HttpProbe {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            connect_timeout,
            request_timeout,
        }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(3))
    }
}

pub fn health_url(port: u16) -> String {
    format!("http://127.0.0.1:{}/health", port)
}

#[async_trait]
impl GatewayProbe for HttpProbe {
    async fn is_listening(&self, port: u16) -> bool {
        matches!(
            tokio::time::timeout(self.connect_timeout, TcpStream::connect(("127.0.0.1", port))).await,
            Ok(Ok(_))
        )
    }

    async fn check_health(&self, port: u16) -> Result<(), ProbeError> {
        let response = self
            .client
            .get(health_url(port))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProbeError::Timeout
                } else {
                    ProbeError::Connect(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        if status == 200 {
            Ok(())
        } else {
            Err(ProbeError::Status(status))
        }
    }
}
