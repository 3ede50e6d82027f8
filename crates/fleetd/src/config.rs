//! fleetd.toml configuration.
//!
//! ```toml
//! data_dir = "/var/lib/fleet"
//! fleet_id = "default"
//!
//! [fleet]
//! get_running_node_timeout = "60s"
//!
//! [supervisor]
//! tick_interval = "1s"
//! starting_timeout = "5m"
//!
//! [provider]
//! command = "fleet-runner"
//! probe_interval = "100ms"
//! request_timeout = "5s"
//!
//! [defaults]
//! cpu_milli = 500
//! memory_mb = 512
//! ```
//!
//! Every key is optional. `[defaults]` is laid over `provider.defaults`
//! key by key.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use fleet::FleetConfig;
use fleet_provider::LocalProviderConfig;
use fleet_state::NodeConfigPatch;
use fleet_supervisor::SupervisorConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub fleet_id: String,
    pub fleet: FleetSection,
    pub supervisor: SupervisorSection,
    pub provider: LocalProviderConfig,
    /// Sizing for nodes without an override, over `provider.defaults`.
    pub defaults: Option<NodeConfigPatch>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/fleet"),
            fleet_id: "default".to_string(),
            fleet: FleetSection::default(),
            supervisor: SupervisorSection::default(),
            provider: LocalProviderConfig::default(),
            defaults: None,
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// The redb file holding this fleet's state.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.redb", self.fleet_id))
    }

    /// Provider settings with `[defaults]` applied.
    pub fn provider_config(&self) -> LocalProviderConfig {
        let mut provider = self.provider.clone();
        if let Some(patch) = &self.defaults {
            provider.defaults = provider.defaults.patched(patch);
        }
        provider
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FleetSection {
    #[serde(deserialize_with = "fleet_provider::duration::deserialize")]
    pub get_running_node_timeout: Duration,
    #[serde(deserialize_with = "fleet_provider::duration::deserialize")]
    pub get_running_node_retry_delay: Duration,
    #[serde(deserialize_with = "fleet_provider::duration::deserialize")]
    pub create_node_lock_timeout: Duration,
    #[serde(deserialize_with = "fleet_provider::duration::deserialize")]
    pub healthy_timeout: Duration,
}

impl Default for FleetSection {
    fn default() -> Self {
        let d = FleetConfig::default();
        Self {
            get_running_node_timeout: d.get_running_node_timeout,
            get_running_node_retry_delay: d.get_running_node_retry_delay,
            create_node_lock_timeout: d.create_node_lock_timeout,
            healthy_timeout: d.healthy_timeout,
        }
    }
}

impl From<FleetSection> for FleetConfig {
    fn from(s: FleetSection) -> Self {
        Self {
            get_running_node_timeout: s.get_running_node_timeout,
            get_running_node_retry_delay: s.get_running_node_retry_delay,
            create_node_lock_timeout: s.create_node_lock_timeout,
            healthy_timeout: s.healthy_timeout,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorSection {
    #[serde(deserialize_with = "fleet_provider::duration::deserialize")]
    pub tick_interval: Duration,
    #[serde(deserialize_with = "fleet_provider::duration::deserialize")]
    pub retry_delay: Duration,
    #[serde(deserialize_with = "fleet_provider::duration::deserialize")]
    pub tick_timeout: Duration,
    #[serde(deserialize_with = "fleet_provider::duration::deserialize")]
    pub lock_ttl: Duration,
    #[serde(deserialize_with = "fleet_provider::duration::deserialize")]
    pub pending_timeout: Duration,
    #[serde(deserialize_with = "fleet_provider::duration::deserialize")]
    pub starting_timeout: Duration,
    #[serde(deserialize_with = "fleet_provider::duration::deserialize")]
    pub finishing_timeout: Duration,
    #[serde(deserialize_with = "fleet_provider::duration::deserialize")]
    pub terminated_retention: Duration,
    #[serde(deserialize_with = "fleet_provider::duration::deserialize")]
    pub error_retention: Duration,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        let d = SupervisorConfig::default();
        Self {
            tick_interval: d.tick_interval,
            retry_delay: d.retry_delay,
            tick_timeout: d.tick_timeout,
            lock_ttl: d.lock_ttl,
            pending_timeout: d.pending_timeout,
            starting_timeout: d.starting_timeout,
            finishing_timeout: d.finishing_timeout,
            terminated_retention: d.terminated_retention,
            error_retention: d.error_retention,
        }
    }
}

impl From<SupervisorSection> for SupervisorConfig {
    fn from(s: SupervisorSection) -> Self {
        Self {
            tick_interval: s.tick_interval,
            retry_delay: s.retry_delay,
            tick_timeout: s.tick_timeout,
            lock_ttl: s.lock_ttl,
            pending_timeout: s.pending_timeout,
            starting_timeout: s.starting_timeout,
            finishing_timeout: s.finishing_timeout,
            terminated_retention: s.terminated_retention,
            error_retention: s.error_retention,
        }
    }
}
