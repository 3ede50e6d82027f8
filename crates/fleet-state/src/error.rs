//! Error types for the fleet state store.

use thiserror::Error;

use crate::types::{DeploymentId, NodeId, NodeState, RoutingId};

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("deployment not found: {0}")]
    DeploymentNotFound(DeploymentId),

    #[error("node config override not found for routing id {0}")]
    NodeConfigOverrideNotFound(RoutingId),

    #[error("invalid transition for node {node_id}: {from} -> {to}")]
    InvalidTransition {
        node_id: NodeId,
        from: NodeState,
        to: NodeState,
    },

    #[error("a live node already exists for routing id {routing_id} on deployment {deployment_id}")]
    NodeAlreadyExists {
        routing_id: RoutingId,
        deployment_id: DeploymentId,
    },

    #[error("node {node_id} is {state} and cannot be deleted")]
    NodeDeleteNonTerminated { node_id: NodeId, state: NodeState },

    #[error("timed out after {waited_ms}ms acquiring lock {key}")]
    LockTimeout { key: String, waited_ms: u64 },
}

impl StateError {
    /// Stable, machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Open(_)
            | Self::Transaction(_)
            | Self::Table(_)
            | Self::Read(_)
            | Self::Write(_)
            | Self::Serialize(_)
            | Self::Deserialize(_) => "storage_error",
            Self::NodeNotFound(_) => "node_not_found",
            Self::DeploymentNotFound(_) => "deployment_not_found",
            Self::NodeConfigOverrideNotFound(_) => "node_config_override_not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::NodeAlreadyExists { .. } => "node_already_exists",
            Self::NodeDeleteNonTerminated { .. } => "node_delete_non_terminated",
            Self::LockTimeout { .. } => "lock_timeout",
        }
    }

    /// Whether this error only means the target row is already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NodeNotFound(_)
                | Self::DeploymentNotFound(_)
                | Self::NodeConfigOverrideNotFound(_)
        )
    }
}
