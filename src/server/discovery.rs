//! Finding tool servers on the local network.
//!
//! Discovery is a plain HTTP probe of the health endpoint: the simplest
//! method that works across LAN setups. Known-host probing and bounded
//! subnet scanning are layered on top of the same primitive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;

/// Timeout for one health probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Overall deadline for a subnet scan.
const SCAN_TIMEOUT: Duration = Duration::from_secs(30);
/// Concurrent probes during a subnet scan.
const SCAN_CONCURRENCY: usize = 50;

/// Errors from discovery probes.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("probing {url}: {reason}")]
    Unreachable { url: String, reason: String },

    #[error("probe returned {status}: {body}")]
    BadStatus { status: u16, body: String },

    #[error("decoding health response: {0}")]
    Decode(String),
}

/// A discovered tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub host: String,
    pub port: u16,
    pub url: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// Probes hosts for tool servers and caches the latest scan results.
pub struct Discovery {
    http: reqwest::Client,
    services: Arc<Mutex<Vec<ServiceInfo>>>,
}

impl Discovery {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(PROBE_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            services: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Check one host and port for a tool server by fetching its health
    /// endpoint.
    pub async fn probe(&self, host: &str, port: u16) -> Result<ServiceInfo, DiscoveryError> {
        let url = format!("http://{host}:{port}");
        let health_url = format!("{url}/mcp/health");

        let response = self
            .http
            .get(&health_url)
            .send()
            .await
            .map_err(|e| DiscoveryError::Unreachable {
                url: url.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DiscoveryError::BadStatus {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let health: serde_json::Value = response
            .json()
            .await
            .map_err(|e| DiscoveryError::Decode(e.to_string()))?;

        let mut metadata = HashMap::new();
        if let Some(s) = health.get("status").and_then(|v| v.as_str()) {
            metadata.insert("status".to_string(), s.to_string());
        }
        if let Some(w) = health.get("work_dir").and_then(|v| v.as_str()) {
            metadata.insert("work_dir".to_string(), w.to_string());
        }

        Ok(ServiceInfo {
            host: host.to_string(),
            port,
            url,
            metadata,
        })
    }

    /// Probe an explicit host list concurrently; unreachable hosts are
    /// silently skipped.
    pub async fn probe_known_hosts(&self, hosts: &[String], port: u16) -> Vec<ServiceInfo> {
        let mut tasks = Vec::new();
        for host in hosts {
            let host = host.clone();
            let this = self.clone_probe_view();
            tasks.push(tokio::spawn(async move { this.probe(&host, port).await.ok() }));
        }

        let mut results = Vec::new();
        for task in tasks {
            if let Ok(Some(info)) = task.await {
                results.push(info);
            }
        }

        *self.services.lock().unwrap() = results.clone();
        results
    }

    /// Probe every host on a /24 subnet, e.g. `scan_subnet("192.168.1", 9500)`.
    /// Parallelism is bounded and the whole scan is capped by a deadline.
    pub async fn scan_subnet(&self, subnet_prefix: &str, port: u16) -> Vec<ServiceInfo> {
        let sem = Arc::new(Semaphore::new(SCAN_CONCURRENCY));
        let mut tasks = Vec::new();

        for i in 1..255u16 {
            let host = format!("{subnet_prefix}.{i}");
            let this = self.clone_probe_view();
            let sem = sem.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = sem.acquire().await.ok()?;
                this.probe(&host, port).await.ok()
            }));
        }

        let gather = async {
            let mut results = Vec::new();
            for task in tasks {
                if let Ok(Some(info)) = task.await {
                    results.push(info);
                }
            }
            results
        };

        let results = tokio::time::timeout(SCAN_TIMEOUT, gather)
            .await
            .unwrap_or_default();

        *self.services.lock().unwrap() = results.clone();
        results
    }

    /// Results of the most recent scan.
    pub fn last_discovered(&self) -> Vec<ServiceInfo> {
        self.services.lock().unwrap().clone()
    }

    /// A cheap clone sharing the HTTP client but not the results cache,
    /// for use inside spawned probe tasks.
    fn clone_probe_view(&self) -> Discovery {
        Discovery {
            http: self.http.clone(),
            services: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Default for Discovery {
    fn default() -> Self {
        Self::new()
    }
}

/// The machine's outbound local IP, for advertising this host's server.
pub fn local_ip() -> std::io::Result<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    Ok(socket.local_addr()?.ip().to_string())
}
