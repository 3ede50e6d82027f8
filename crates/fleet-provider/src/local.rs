//! LocalProvider: runs every node as a child process on this host.
//!
//! Useful for development and single-machine deployments. The child gets
//! its identity through environment variables and is expected to call
//! `register_node` with a loopback url once it listens.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use bytes::Bytes;
use http::Method;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use fleet_state::{Node, NodeConfig, NodeId};

use crate::error::{ProviderError, ProviderResult};
use crate::probe;
use crate::provider::{BoxFuture, NodeProvider};

/// Configuration for [`LocalProvider`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LocalProviderConfig {
    /// Program started for every node.
    pub command: String,
    pub args: Vec<String>,
    /// Extra environment for every node.
    pub env: BTreeMap<String, String>,
    /// Hosts a node may register a url on.
    pub allowed_hosts: Vec<String>,
    /// Health endpoint path, relative to the node url.
    pub health_path: String,
    /// Drain notification path, relative to the node url.
    pub notify_path: String,
    /// First pause between health probes; doubles up to `probe_max_interval`.
    #[serde(with = "crate::duration")]
    pub probe_interval: Duration,
    #[serde(with = "crate::duration")]
    pub probe_max_interval: Duration,
    #[serde(with = "crate::duration")]
    pub request_timeout: Duration,
    /// Sizing for nodes without an override.
    pub defaults: NodeConfig,
}

impl Default for LocalProviderConfig {
    fn default() -> Self {
        Self {
            command: "fleet-runner".to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
            allowed_hosts: vec![
                "localhost".to_string(),
                "127.0.0.1".to_string(),
                "::1".to_string(),
            ],
            health_path: "/health".to_string(),
            notify_path: "/notifyWhenIdle".to_string(),
            probe_interval: Duration::from_millis(100),
            probe_max_interval: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            defaults: NodeConfig {
                image: String::new(),
                cpu_milli: 500,
                memory_mb: 512,
                storage_mb: 20_000,
                is_tracing_enabled: false,
                is_profiling_enabled: false,
                idle_max_duration_ms: 30 * 60 * 1000,
                execution_timeout_secs: 15 * 60,
                provisioned_concurrency: 10,
            },
        }
    }
}

/// Node provider backed by local child processes.
pub struct LocalProvider {
    config: LocalProviderConfig,
    children: Mutex<HashMap<NodeId, Child>>,
}

impl LocalProvider {
    pub fn new(config: LocalProviderConfig) -> Self {
        Self {
            config,
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &LocalProviderConfig {
        &self.config
    }

    /// Number of children this provider currently tracks.
    pub async fn running(&self) -> usize {
        self.children.lock().await.len()
    }

    fn node_env(node: &Node) -> [(&'static str, String); 6] {
        [
            ("FLEET_NODE_ID", node.id.to_string()),
            ("FLEET_ROUTING_ID", node.routing_id.clone()),
            ("FLEET_DEPLOYMENT_ID", node.deployment_id.to_string()),
            ("FLEET_IMAGE", node.image.clone()),
            ("FLEET_CPU_MILLI", node.cpu_milli.to_string()),
            ("FLEET_MEMORY_MB", node.memory_mb.to_string()),
        ]
    }

    async fn spawn(&self, node: &Node) -> ProviderResult<()> {
        let mut children = self.children.lock().await;
        if let Some(child) = children.get_mut(&node.id) {
            // A retried start for a node whose process is still alive.
            if matches!(child.try_wait(), Ok(None)) {
                debug!(node_id = node.id, "node process already running");
                return Ok(());
            }
        }

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .envs(Self::node_env(node))
            .kill_on_drop(true);
        let child = cmd.spawn().map_err(|e| ProviderError::Start {
            node_id: node.id,
            source: Box::new(e),
        })?;
        info!(node_id = node.id, routing_id = %node.routing_id, pid = ?child.id(), "node process started");
        children.insert(node.id, child);
        Ok(())
    }

    async fn kill(&self, node: &Node) -> ProviderResult<()> {
        let child = self.children.lock().await.remove(&node.id);
        let Some(mut child) = child else {
            debug!(node_id = node.id, "no process for node, nothing to terminate");
            return Ok(());
        };
        if let Err(e) = child.kill().await {
            // Put it back so the next attempt can retry.
            self.children.lock().await.insert(node.id, child);
            return Err(ProviderError::Terminate {
                node_id: node.id,
                source: Box::new(e),
            });
        }
        info!(node_id = node.id, "node process terminated");
        Ok(())
    }

    fn check_url(&self, url: &str) -> ProviderResult<()> {
        let target = probe::target(url, "/").map_err(|e| ProviderError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let host = target.host.as_str();
        let allowed = self.config.allowed_hosts.iter().any(|h| {
            h.trim_start_matches('[')
                .trim_end_matches(']')
                .eq_ignore_ascii_case(host)
        });
        if !allowed {
            return Err(ProviderError::InvalidUrl {
                url: url.to_string(),
                reason: format!("host {host} is not allowed"),
            });
        }
        Ok(())
    }
}

impl NodeProvider for LocalProvider {
    fn default_node_config(&self) -> NodeConfig {
        self.config.defaults.clone()
    }

    fn start<'a>(&'a self, node: &'a Node) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(self.spawn(node))
    }

    fn terminate<'a>(&'a self, node: &'a Node) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(self.kill(node))
    }

    fn verify_url<'a>(&'a self, url: &'a str) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move { self.check_url(url) })
    }

    fn wait_until_healthy<'a>(
        &'a self,
        node_id: NodeId,
        url: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move {
            let healthy = probe::wait_until_healthy(
                url,
                &self.config.health_path,
                timeout,
                self.config.probe_interval,
                self.config.probe_max_interval,
            )
            .await;
            if healthy {
                Ok(())
            } else {
                Err(ProviderError::Unhealthy {
                    node_id,
                    url: url.to_string(),
                    waited_ms: timeout.as_millis() as u64,
                })
            }
        })
    }

    fn notify_when_idle<'a>(&'a self, node: &'a Node) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move {
            let Some(url) = node.url.as_deref() else {
                warn!(node_id = node.id, "node has no url, cannot notify");
                return Ok(());
            };
            let body = serde_json::to_vec(&serde_json::json!({ "nodeId": node.id }))
                .map_err(|e| ProviderError::Notify {
                    node_id: node.id,
                    source: Box::new(e),
                })?;
            let status = probe::send(
                Method::POST,
                url,
                &self.config.notify_path,
                Some(Bytes::from(body)),
                self.config.request_timeout,
            )
            .await
            .map_err(|e| ProviderError::Notify {
                node_id: node.id,
                source: Box::new(e),
            })?;
            if !status.is_success() {
                return Err(ProviderError::Notify {
                    node_id: node.id,
                    source: format!("unexpected status {status}").into(),
                });
            }
            debug!(node_id = node.id, "node notified to drain");
            Ok(())
        })
    }
}
