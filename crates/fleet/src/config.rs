use std::time::Duration;

use serde::{Deserialize, Serialize};

use fleet_provider::verifier::DEFAULT_IMAGE_TYPE;

/// Timings for the façade's blocking operations.
#[derive(Debug, Clone, PartialEq)]
pub struct FleetConfig {
    /// Overall deadline for [`crate::Fleet::get_running_node`].
    pub get_running_node_timeout: Duration,
    /// Pause between readiness checks in `get_running_node`.
    pub get_running_node_retry_delay: Duration,
    /// How long an on-demand creator waits for the per-routing-id lock.
    pub create_node_lock_timeout: Duration,
    /// How long `register_node` waits for the node to answer health checks.
    pub healthy_timeout: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            get_running_node_timeout: Duration::from_secs(60),
            get_running_node_retry_delay: Duration::from_secs(1),
            create_node_lock_timeout: Duration::from_secs(10),
            healthy_timeout: Duration::from_secs(120),
        }
    }
}

/// Options for [`crate::Fleet::rollout`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutOptions {
    /// Which verifier checks the image.
    pub image_type: String,
    /// Skip verification entirely when false.
    pub verify_image: bool,
}

impl Default for RolloutOptions {
    fn default() -> Self {
        Self {
            image_type: DEFAULT_IMAGE_TYPE.to_string(),
            verify_image: true,
        }
    }
}
