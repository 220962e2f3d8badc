//! Cluster transport layer for master-to-auxiliary communication
//!
//! Handles HTTP-based communication with cache nodes:
//! - Forwarding single key-value writes and reads
//! - Fetching a node's full mapping
//! - Liveness probes
//! - Graceful-leave handoff and registration calls to the master,
//!   with exponential backoff

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, ClientBuilder, StatusCode, Url};
use serde::Serialize;
use tracing::{debug, warn};

use shardcache_core::types::{KeyValue, Mappings, NodeId};

use crate::error::{ClusterError, ClusterResult};

/// Header naming the departing node on a handoff request
pub const AUX_SERVER_HEADER: &str = "aux-server";

/// Request/response calls the cluster layer makes against cache nodes
#[async_trait]
pub trait CacheTransport: Send + Sync {
    /// Store one pair on `node`
    async fn put(&self, node: &str, pair: &KeyValue) -> ClusterResult<()>;

    /// Read one key from `node`; `None` on a cache miss
    async fn get(&self, node: &str, key: &str) -> ClusterResult<Option<String>>;

    /// Full current mapping held by `node`
    async fn fetch_mappings(&self, node: &str) -> ClusterResult<Mappings>;

    /// Liveness check; any error means the node is considered dead
    async fn probe(&self, node: &str) -> ClusterResult<()>;
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// URL scheme prepended to `host:port` node ids
    pub scheme: String,
    /// Request timeout
    pub timeout: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Timeout for a single liveness probe
    pub probe_timeout: Duration,
    /// Maximum retry attempts for master-bound calls
    pub max_retries: u32,
    /// Base delay for exponential backoff
    pub retry_base_delay: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

/// HTTP transport shared by the master (towards auxiliaries) and the
/// auxiliary (towards the master)
pub struct ClusterTransport {
    client: Client,
    config: TransportConfig,
}

impl ClusterTransport {
    /// Create a new transport with the given configuration
    pub fn new(config: TransportConfig) -> ClusterResult<Self> {
        let client = ClientBuilder::new()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ClusterError::Transport(e.to_string()))?;

        Ok(Self { client, config })
    }

    fn url(&self, node: &str, path: &str) -> String {
        format!("{}://{}{}", self.config.scheme, node, path)
    }

    /// `/data/<key>` on `node`, with the key encoded as a single path segment
    fn key_url(&self, node: &str, key: &str) -> ClusterResult<Url> {
        let mut url = Url::parse(&self.url(node, "/data"))
            .map_err(|e| ClusterError::Transport(format!("{}: {}", node, e)))?;
        url.path_segments_mut()
            .map_err(|_| ClusterError::Transport(format!("{}: not a base URL", node)))?
            .push(key);
        Ok(url)
    }

    /// Hand `node`'s full mapping to the master before `node` shuts down
    pub async fn send_handoff(
        &self,
        master: &str,
        node: &str,
        mappings: &Mappings,
    ) -> ClusterResult<()> {
        let url = self.url(master, "/rebalance-dead-aux");
        self.post_with_retry(&url, mappings, Some(node)).await
    }

    /// Ask the master to register `node` with the coordination service
    pub async fn register(&self, master: &str, node: &str) -> ClusterResult<()> {
        let url = self.url(master, "/cluster/register");
        let body = serde_json::json!({ "node": node });
        self.post_with_retry(&url, &body, None).await
    }

    async fn post_with_retry<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
        aux_server: Option<&str>,
    ) -> ClusterResult<()> {
        let mut last_error = None;
        let mut delay = self.config.retry_base_delay;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                debug!("Retry attempt {} for {}", attempt, url);
                tokio::time::sleep(delay).await;
                delay *= 2;
            }

            match self.post_once(url, body, aux_server).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("Request to {} failed (attempt {}): {}", url, attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ClusterError::Transport("Unknown error".to_string())))
    }

    async fn post_once<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
        aux_server: Option<&str>,
    ) -> ClusterResult<()> {
        let mut request = self.client.post(url).json(body);
        if let Some(node) = aux_server {
            request = request.header(AUX_SERVER_HEADER, node);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ClusterError::Transport(format!(
                "Request failed with status {}: {}",
                status, body
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl CacheTransport for ClusterTransport {
    async fn put(&self, node: &str, pair: &KeyValue) -> ClusterResult<()> {
        let url = self.url(node, "/data");
        let response = self
            .client
            .post(&url)
            .json(pair)
            .send()
            .await
            .map_err(|e| ClusterError::Transport(format!("{}: {}", node, e)))?;

        if !response.status().is_success() {
            return Err(ClusterError::Transport(format!(
                "Failed to store key {} on {}: {}",
                pair.key,
                node,
                response.status()
            )));
        }
        Ok(())
    }

    async fn get(&self, node: &str, key: &str) -> ClusterResult<Option<String>> {
        let url = self.key_url(node, key)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ClusterError::Transport(format!("{}: {}", node, e)))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let pair: KeyValue = response
                    .json()
                    .await
                    .map_err(|e| ClusterError::Transport(e.to_string()))?;
                Ok(Some(pair.value))
            }
            status => Err(ClusterError::Transport(format!(
                "Failed to read key {} from {}: {}",
                key, node, status
            ))),
        }
    }

    async fn fetch_mappings(&self, node: &str) -> ClusterResult<Mappings> {
        let url = self.url(node, "/mappings");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ClusterError::Transport(format!("{}: {}", node, e)))?;

        if !response.status().is_success() {
            return Err(ClusterError::Transport(format!(
                "Failed to fetch mappings from {}: {}",
                node,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))
    }

    async fn probe(&self, node: &str) -> ClusterResult<()> {
        let url = self.url(node, "/health");
        let response = self
            .client
            .get(&url)
            .timeout(self.config.probe_timeout)
            .send()
            .await;

        match response {
            Ok(r) if r.status().is_success() => Ok(()),
            Ok(r) => Err(ClusterError::NodeUnreachable(format!(
                "{} answered health check with {}",
                node,
                r.status()
            ))),
            Err(e) => Err(ClusterError::NodeUnreachable(format!("{}: {}", node, e))),
        }
    }
}

impl std::fmt::Debug for ClusterTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterTransport")
            .field("config", &self.config)
            .finish()
    }
}

/// Addresses accepted as node ids: `host:port`, no scheme or path
pub fn validate_node_id(node: &NodeId) -> ClusterResult<()> {
    let valid = match node.rsplit_once(':') {
        Some((host, port)) => {
            !host.is_empty() && !host.contains('/') && port.parse::<u16>().is_ok()
        }
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(ClusterError::InvalidConfig(format!(
            "node id must be host:port, got {:?}",
            node
        )))
    }
}
