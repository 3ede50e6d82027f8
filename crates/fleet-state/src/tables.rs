//! redb table definitions for the fleet state store.
//!
//! Row tables use integer or `&str` keys and `&[u8]` values holding
//! JSON-serialized domain types. Index tables use tuple keys with `()` values
//! and are maintained in the same write transaction as the rows they cover.

use redb::TableDefinition;

/// Deployments keyed by deployment id.
pub const DEPLOYMENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("deployments");

/// Nodes keyed by node id.
pub const NODES: TableDefinition<u64, &[u8]> = TableDefinition::new("nodes");

/// Secondary index `(routing_id, state, node_id)` over [`NODES`].
pub const NODES_BY_ROUTING_STATE: TableDefinition<(&str, &str, u64), ()> =
    TableDefinition::new("nodes_by_routing_state");

/// Live node per `(routing_id, deployment_id)`.
pub const NODE_GENERATIONS: TableDefinition<(&str, u64), u64> =
    TableDefinition::new("node_generations");

/// Node config overrides keyed by routing id.
pub const NODE_CONFIG_OVERRIDES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("node_config_overrides");

/// Advisory locks keyed by lock name.
pub const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");

/// Sequences and singletons.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub(crate) const SEQ_DEPLOYMENTS: &str = "seq:deployments";
pub(crate) const SEQ_NODES: &str = "seq:nodes";
pub(crate) const SEQ_NODE_CONFIG_OVERRIDES: &str = "seq:node_config_overrides";
pub(crate) const ACTIVE_DEPLOYMENT: &str = "active_deployment";
