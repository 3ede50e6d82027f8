//! Provider and verifier errors.

use thiserror::Error;

use fleet_state::NodeId;

/// Boxed causal error from a substrate client.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("invalid image type: {0}")]
    InvalidImageType(String),

    #[error("image verification failed for {image}")]
    ImageVerification {
        image: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to start node {node_id}")]
    Start {
        node_id: NodeId,
        #[source]
        source: BoxError,
    },

    #[error("failed to terminate node {node_id}")]
    Terminate {
        node_id: NodeId,
        #[source]
        source: BoxError,
    },

    #[error("invalid node url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("node {node_id} not healthy at {url} after {waited_ms}ms")]
    Unhealthy {
        node_id: NodeId,
        url: String,
        waited_ms: u64,
    },

    #[error("failed to notify node {node_id}")]
    Notify {
        node_id: NodeId,
        #[source]
        source: BoxError,
    },
}

impl ProviderError {
    /// Stable, machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidImageType(_) => "invalid_image_type",
            Self::ImageVerification { .. } => "image_verification_failed",
            Self::Start { .. } => "node_start_failed",
            Self::Terminate { .. } => "node_terminate_failed",
            Self::InvalidUrl { .. } => "invalid_url",
            Self::Unhealthy { .. } => "node_unhealthy",
            Self::Notify { .. } => "node_notify_failed",
        }
    }
}
