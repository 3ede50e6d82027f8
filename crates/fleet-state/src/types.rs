//! Domain types for the fleet state store.
//!
//! These types represent the persisted state of deployments, nodes, node
//! config overrides, and advisory locks. All types are serializable to/from
//! JSON for storage in redb tables.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Opaque key identifying a routing target (e.g. an environment).
pub type RoutingId = String;

/// Store-assigned node identifier. Monotonically increasing.
pub type NodeId = u64;

/// Store-assigned deployment identifier. Monotonically increasing.
pub type DeploymentId = u64;

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Deployment ─────────────────────────────────────────────────────

/// A versioned release of the runner image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: DeploymentId,
    /// Image reference, verified before the deployment was created.
    pub image: String,
    pub created_at: u64,
    /// Set exactly once, when a newer deployment becomes active.
    pub superseded_at: Option<u64>,
}

impl Deployment {
    pub fn is_active(&self) -> bool {
        self.superseded_at.is_none()
    }
}

// ── Node ───────────────────────────────────────────────────────────

/// Lifecycle state of a node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Pending,
    Starting,
    Running,
    Outdated,
    Finishing,
    Idle,
    Terminated,
    Error,
}

impl NodeState {
    pub const ALL: [NodeState; 8] = [
        NodeState::Pending,
        NodeState::Starting,
        NodeState::Running,
        NodeState::Outdated,
        NodeState::Finishing,
        NodeState::Idle,
        NodeState::Terminated,
        NodeState::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Outdated => "OUTDATED",
            Self::Finishing => "FINISHING",
            Self::Idle => "IDLE",
            Self::Terminated => "TERMINATED",
            Self::Error => "ERROR",
        }
    }

    /// Whether the lifecycle graph has an edge `self -> to`.
    pub fn can_transition_to(&self, to: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, to),
            (Pending, Starting)
                | (Pending, Error)
                | (Starting, Running)
                | (Starting, Error)
                | (Running, Outdated)
                | (Running, Idle)
                | (Running, Error)
                | (Outdated, Finishing)
                | (Outdated, Error)
                | (Finishing, Idle)
                | (Finishing, Error)
                | (Idle, Terminated)
        )
    }

    /// States with no outgoing edges. Only these may be deleted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Error)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeState::ALL
            .iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| format!("unknown node state: {s}"))
    }
}

/// A worker node. Each node belongs to one routing id and one deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub routing_id: RoutingId,
    pub deployment_id: DeploymentId,
    /// Reachable address; set once the node is running.
    pub url: Option<String>,
    pub state: NodeState,
    pub image: String,
    pub cpu_milli: u32,
    pub memory_mb: u32,
    pub storage_mb: u32,
    /// Failure reason. Present iff `state == Error`.
    pub error: Option<String>,
    pub created_at: u64,
    pub last_state_transition_at: u64,
}

impl Node {
    /// Milliseconds spent in the current state as of `now`.
    pub fn time_in_state(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_state_transition_at)
    }
}

/// Insert payload for a new node. The store assigns id, state and timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct NewNode {
    pub routing_id: RoutingId,
    pub deployment_id: DeploymentId,
    pub image: String,
    pub cpu_milli: u32,
    pub memory_mb: u32,
    pub storage_mb: u32,
}

impl NewNode {
    pub fn from_config(routing_id: &str, deployment_id: DeploymentId, config: &NodeConfig) -> Self {
        Self {
            routing_id: routing_id.to_string(),
            deployment_id,
            image: config.image.clone(),
            cpu_milli: config.cpu_milli,
            memory_mb: config.memory_mb,
            storage_mb: config.storage_mb,
        }
    }
}

/// A requested edge in the node lifecycle graph.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Start,
    Run { url: String },
    Outdate,
    Finish,
    Idle,
    Terminate,
    Fail { reason: String },
}

impl Transition {
    pub fn target(&self) -> NodeState {
        match self {
            Self::Start => NodeState::Starting,
            Self::Run { .. } => NodeState::Running,
            Self::Outdate => NodeState::Outdated,
            Self::Finish => NodeState::Finishing,
            Self::Idle => NodeState::Idle,
            Self::Terminate => NodeState::Terminated,
            Self::Fail { .. } => NodeState::Error,
        }
    }
}

/// Filter for [`crate::StateStore::search_nodes`].
#[derive(Debug, Clone, Default)]
pub struct NodeSearch {
    pub routing_id: Option<RoutingId>,
    /// Empty means every state.
    pub states: Vec<NodeState>,
    /// Only nodes with an id strictly greater than this.
    pub cursor: Option<NodeId>,
    /// Defaults to [`NodeSearch::DEFAULT_LIMIT`].
    pub limit: Option<usize>,
}

impl NodeSearch {
    pub const DEFAULT_LIMIT: usize = 1000;

    pub fn routing(routing_id: &str) -> Self {
        Self {
            routing_id: Some(routing_id.to_string()),
            ..Default::default()
        }
    }

    pub fn with_states(mut self, states: &[NodeState]) -> Self {
        self.states = states.to_vec();
        self
    }

    pub fn after(mut self, cursor: NodeId) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Nodes of one routing id grouped by state, each group in id order.
pub type NodesByState = BTreeMap<NodeState, Vec<Node>>;

/// One page of search results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeSearchResult {
    pub nodes: BTreeMap<RoutingId, NodesByState>,
    /// Present when more matching nodes exist past this page.
    pub next_cursor: Option<NodeId>,
}

impl NodeSearchResult {
    pub fn len(&self) -> usize {
        self.nodes
            .values()
            .flat_map(|by_state| by_state.values())
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flatten into a single id-ordered list.
    pub fn into_nodes(self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .nodes
            .into_values()
            .flat_map(|by_state| by_state.into_values())
            .flatten()
            .collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }
}

// ── Node config ────────────────────────────────────────────────────

/// Fully resolved configuration a node is created with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfig {
    pub image: String,
    pub cpu_milli: u32,
    pub memory_mb: u32,
    pub storage_mb: u32,
    pub is_tracing_enabled: bool,
    pub is_profiling_enabled: bool,
    pub idle_max_duration_ms: u64,
    pub execution_timeout_secs: u64,
    pub provisioned_concurrency: u32,
}

impl NodeConfig {
    /// Overlay an override's values. The override image wins when pinned.
    pub fn with_override(mut self, over: Option<&NodeConfigOverride>) -> Self {
        if let Some(o) = over {
            if let Some(image) = &o.image {
                self.image = image.clone();
            }
            self.cpu_milli = o.cpu_milli;
            self.memory_mb = o.memory_mb;
            self.storage_mb = o.storage_mb;
            self.is_tracing_enabled = o.is_tracing_enabled;
            self.is_profiling_enabled = o.is_profiling_enabled;
            self.idle_max_duration_ms = o.idle_max_duration_ms;
            self.execution_timeout_secs = o.execution_timeout_secs;
            self.provisioned_concurrency = o.provisioned_concurrency;
        }
        self
    }

    /// Apply the set fields of `patch`.
    pub fn patched(mut self, patch: &NodeConfigPatch) -> Self {
        if let Some(image) = &patch.image {
            self.image = image.clone();
        }
        if let Some(v) = patch.cpu_milli {
            self.cpu_milli = v;
        }
        if let Some(v) = patch.memory_mb {
            self.memory_mb = v;
        }
        if let Some(v) = patch.storage_mb {
            self.storage_mb = v;
        }
        if let Some(v) = patch.is_tracing_enabled {
            self.is_tracing_enabled = v;
        }
        if let Some(v) = patch.is_profiling_enabled {
            self.is_profiling_enabled = v;
        }
        if let Some(v) = patch.idle_max_duration_ms {
            self.idle_max_duration_ms = v;
        }
        if let Some(v) = patch.execution_timeout_secs {
            self.execution_timeout_secs = v;
        }
        if let Some(v) = patch.provisioned_concurrency {
            self.provisioned_concurrency = v;
        }
        self
    }
}

/// Per-routing-id node configuration. At most one per routing id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfigOverride {
    pub id: u64,
    pub routing_id: RoutingId,
    /// Pinned image; cleared by every rollout.
    pub image: Option<String>,
    pub cpu_milli: u32,
    pub memory_mb: u32,
    pub storage_mb: u32,
    pub is_tracing_enabled: bool,
    pub is_profiling_enabled: bool,
    pub idle_max_duration_ms: u64,
    pub execution_timeout_secs: u64,
    pub provisioned_concurrency: u32,
    pub created_at: u64,
    pub updated_at: u64,
}

impl NodeConfigOverride {
    /// No pinned image and every value equal to `defaults`.
    pub fn matches_defaults(&self, defaults: &NodeConfig) -> bool {
        self.image.is_none()
            && self.cpu_milli == defaults.cpu_milli
            && self.memory_mb == defaults.memory_mb
            && self.storage_mb == defaults.storage_mb
            && self.is_tracing_enabled == defaults.is_tracing_enabled
            && self.is_profiling_enabled == defaults.is_profiling_enabled
            && self.idle_max_duration_ms == defaults.idle_max_duration_ms
            && self.execution_timeout_secs == defaults.execution_timeout_secs
            && self.provisioned_concurrency == defaults.provisioned_concurrency
    }

    /// Apply `patch` on top of `self`.
    pub fn patched(mut self, patch: &NodeConfigPatch) -> Self {
        if let Some(image) = &patch.image {
            self.image = Some(image.clone());
        }
        if let Some(v) = patch.cpu_milli {
            self.cpu_milli = v;
        }
        if let Some(v) = patch.memory_mb {
            self.memory_mb = v;
        }
        if let Some(v) = patch.storage_mb {
            self.storage_mb = v;
        }
        if let Some(v) = patch.is_tracing_enabled {
            self.is_tracing_enabled = v;
        }
        if let Some(v) = patch.is_profiling_enabled {
            self.is_profiling_enabled = v;
        }
        if let Some(v) = patch.idle_max_duration_ms {
            self.idle_max_duration_ms = v;
        }
        if let Some(v) = patch.execution_timeout_secs {
            self.execution_timeout_secs = v;
        }
        if let Some(v) = patch.provisioned_concurrency {
            self.provisioned_concurrency = v;
        }
        self
    }
}

/// Partial update to a routing id's override. `None` fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfigPatch {
    pub image: Option<String>,
    pub cpu_milli: Option<u32>,
    pub memory_mb: Option<u32>,
    pub storage_mb: Option<u32>,
    pub is_tracing_enabled: Option<bool>,
    pub is_profiling_enabled: Option<bool>,
    pub idle_max_duration_ms: Option<u64>,
    pub execution_timeout_secs: Option<u64>,
    pub provisioned_concurrency: Option<u32>,
}

// ── Locks ──────────────────────────────────────────────────────────

/// Holder of an advisory lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockRecord {
    pub owner: String,
    pub acquired_at: u64,
    /// Past this instant any contender may take the lock over.
    pub expires_at: u64,
}

impl LockRecord {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_graph_edges() {
        use NodeState::*;
        let allowed = [
            (Pending, Starting),
            (Pending, Error),
            (Starting, Running),
            (Starting, Error),
            (Running, Outdated),
            (Running, Idle),
            (Running, Error),
            (Outdated, Finishing),
            (Outdated, Error),
            (Finishing, Idle),
            (Finishing, Error),
            (Idle, Terminated),
        ];
        for from in NodeState::ALL {
            for to in NodeState::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in [NodeState::Terminated, NodeState::Error] {
            assert!(from.is_terminal());
            assert!(NodeState::ALL.iter().all(|to| !from.can_transition_to(*to)));
        }
        assert!(!NodeState::Idle.is_terminal());
    }

    #[test]
    fn node_state_parses_case_insensitively() {
        assert_eq!("running".parse::<NodeState>().unwrap(), NodeState::Running);
        assert_eq!("ERROR".parse::<NodeState>().unwrap(), NodeState::Error);
        assert!("bogus".parse::<NodeState>().is_err());
    }

    #[test]
    fn node_state_serializes_uppercase() {
        let json = serde_json::to_string(&NodeState::Finishing).unwrap();
        assert_eq!(json, "\"FINISHING\"");
    }

    fn defaults() -> NodeConfig {
        NodeConfig {
            image: "runner:1".into(),
            cpu_milli: 500,
            memory_mb: 512,
            storage_mb: 20_000,
            is_tracing_enabled: false,
            is_profiling_enabled: false,
            idle_max_duration_ms: 1_800_000,
            execution_timeout_secs: 900,
            provisioned_concurrency: 10,
        }
    }

    fn override_from(defaults: &NodeConfig) -> NodeConfigOverride {
        NodeConfigOverride {
            id: 1,
            routing_id: "env-1".into(),
            image: None,
            cpu_milli: defaults.cpu_milli,
            memory_mb: defaults.memory_mb,
            storage_mb: defaults.storage_mb,
            is_tracing_enabled: defaults.is_tracing_enabled,
            is_profiling_enabled: defaults.is_profiling_enabled,
            idle_max_duration_ms: defaults.idle_max_duration_ms,
            execution_timeout_secs: defaults.execution_timeout_secs,
            provisioned_concurrency: defaults.provisioned_concurrency,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn override_matches_defaults_until_patched() {
        let d = defaults();
        let o = override_from(&d);
        assert!(o.matches_defaults(&d));

        let bigger = o.clone().patched(&NodeConfigPatch {
            memory_mb: Some(1024),
            ..Default::default()
        });
        assert!(!bigger.matches_defaults(&d));

        let pinned = o.patched(&NodeConfigPatch {
            image: Some("runner:0".into()),
            ..Default::default()
        });
        assert!(!pinned.matches_defaults(&d));
    }

    #[test]
    fn config_with_override_prefers_pinned_image() {
        let d = defaults();
        let mut o = override_from(&d);
        o.cpu_milli = 2000;
        let cfg = d.clone().with_override(Some(&o));
        assert_eq!(cfg.image, "runner:1");
        assert_eq!(cfg.cpu_milli, 2000);

        o.image = Some("runner:pinned".into());
        let cfg = d.with_override(Some(&o));
        assert_eq!(cfg.image, "runner:pinned");
    }

    #[test]
    fn config_patch_sets_only_given_fields() {
        let cfg = defaults().patched(&NodeConfigPatch {
            cpu_milli: Some(250),
            is_tracing_enabled: Some(true),
            ..Default::default()
        });
        assert_eq!(cfg.cpu_milli, 250);
        assert!(cfg.is_tracing_enabled);
        assert_eq!(cfg.memory_mb, 512);
        assert_eq!(cfg.image, "runner:1");
        assert_eq!(defaults().patched(&NodeConfigPatch::default()), defaults());
    }

    #[test]
    fn search_result_flattens_in_id_order() {
        let node = |id, state| Node {
            id,
            routing_id: "r".into(),
            deployment_id: 1,
            url: None,
            state,
            image: "i".into(),
            cpu_milli: 1,
            memory_mb: 1,
            storage_mb: 1,
            error: None,
            created_at: 0,
            last_state_transition_at: 0,
        };
        let mut by_state = NodesByState::new();
        by_state.insert(NodeState::Running, vec![node(3, NodeState::Running)]);
        by_state.insert(NodeState::Pending, vec![node(1, NodeState::Pending)]);
        let mut result = NodeSearchResult::default();
        result.nodes.insert("r".into(), by_state);
        assert_eq!(result.len(), 2);
        let ids: Vec<_> = result.into_nodes().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }
}
