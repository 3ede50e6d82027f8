//! Errors returned by the fleet façade.

use thiserror::Error;

use fleet_provider::ProviderError;
use fleet_state::{RoutingId, StateError};

pub type FleetResult<T> = Result<T, FleetError>;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("no active deployment")]
    NoActiveDeployment,

    #[error("no running node for routing id {routing_id} after {waited_ms}ms")]
    NodeNotReadyTimeout { routing_id: RoutingId, waited_ms: u64 },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl FleetError {
    /// Stable, machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoActiveDeployment => "no_active_deployment",
            Self::NodeNotReadyTimeout { .. } => "node_not_ready_timeout",
            Self::State(e) => e.kind(),
            Self::Provider(e) => e.kind(),
        }
    }

    /// The entity is already gone; most callers treat this as a no-op.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::State(e) if e.is_not_found())
    }
}
