//! fleet: lifecycle manager for a pool of worker nodes.
//!
//! [`Fleet`] is the entry point for callers: publish a new image with
//! [`Fleet::rollout`], obtain a usable node for a routing key with
//! [`Fleet::get_running_node`], let booted nodes announce themselves with
//! [`Fleet::register_node`], retire them with [`Fleet::idle_node`], and size
//! individual routing keys with [`Fleet::override_node_config`].
//!
//! Reconciliation (replacing outdated nodes, tearing down idle ones) is the
//! job of the [`Supervisor`](fleet_supervisor::Supervisor), obtained with
//! [`Fleet::supervisor`].

pub mod config;
pub mod error;
pub mod fleet;

pub use config::{FleetConfig, RolloutOptions};
pub use error::{FleetError, FleetResult};
pub use fleet::Fleet;

pub use fleet_provider as provider;
pub use fleet_state as state;
pub use fleet_supervisor as supervisor;
