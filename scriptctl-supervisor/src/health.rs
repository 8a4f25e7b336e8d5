use async_trait::async_trait;
use scriptctl_core::{HealthCheck, HealthProbe};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(1500);

/// TCP connect to a localhost port and/or HTTP GET expecting 2xx.
/// With both configured, both must pass.
#[derive(Debug, Clone)]
pub struct NetHealthProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl Default for NetHealthProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

impl NetHealthProbe {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                debug!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self { client, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn probe_port(&self, port: u16) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(("127.0.0.1", port))).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("TCP probe of port {} failed: {}", port, e);
                false
            }
            Err(_) => {
                debug!("TCP probe of port {} timed out", port);
                false
            }
        }
    }

    pub async fn probe_url(&self, url: &str) -> bool {
        match tokio::time::timeout(self.timeout, self.client.get(url).send()).await {
            Ok(Ok(resp)) => resp.status().is_success(),
            Ok(Err(e)) => {
                debug!("HTTP probe of {} failed: {}", url, e);
                false
            }
            Err(_) => {
                debug!("HTTP probe of {} timed out", url);
                false
            }
        }
    }
}

#[async_trait]
impl HealthProbe for NetHealthProbe {
    async fn probe(&self, check: &HealthCheck) -> bool {
        if let Some(port) = check.port
            && !self.probe_port(port).await
        {
            return false;
        }
        if let Some(url) = &check.url
            && !self.probe_url(url).await
        {
            return false;
        }
        true
    }
}
