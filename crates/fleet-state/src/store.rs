//! StateStore: redb-backed persistence for one fleet.
//!
//! Provides typed operations over deployments, nodes, node config overrides
//! and lock rows. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn read_row<T, Tbl>(table: &Tbl, id: u64) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    Tbl: ReadableTable<u64, &'static [u8]>,
{
    match table.get(id).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

/// Bump and return the named sequence.
fn next_id(txn: &WriteTransaction, sequence: &str) -> StateResult<u64> {
    let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
    let next = meta
        .get(sequence)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0)
        + 1;
    meta.insert(sequence, next).map_err(map_err!(Write))?;
    Ok(next)
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(NODES_BY_ROUTING_STATE)
            .map_err(map_err!(Table))?;
        txn.open_table(NODE_GENERATIONS).map_err(map_err!(Table))?;
        txn.open_table(NODE_CONFIG_OVERRIDES)
            .map_err(map_err!(Table))?;
        txn.open_table(LOCKS).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Create a deployment and make it the active one, superseding the
    /// previous active deployment in the same transaction.
    pub fn create_deployment(&self, image: &str) -> StateResult<Deployment> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let deployment = Self::insert_deployment(&txn, image)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id = deployment.id, %image, "deployment created");
        Ok(deployment)
    }

    /// Create the new active deployment and clear every pinned override
    /// image, atomically. Overrides left equal to `defaults` are removed.
    /// Returns the deployment and the number of overrides whose image was
    /// cleared.
    pub fn rollout_deployment(
        &self,
        image: &str,
        defaults: &NodeConfig,
    ) -> StateResult<(Deployment, usize)> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let deployment = Self::insert_deployment(&txn, image)?;
        let cleared = Self::clear_override_images(&txn, defaults, deployment.created_at)?;
        txn.commit().map_err(map_err!(Transaction))?;
        info!(id = deployment.id, %image, cleared, "deployment rolled out");
        Ok((deployment, cleared))
    }

    fn insert_deployment(txn: &WriteTransaction, image: &str) -> StateResult<Deployment> {
        let id = next_id(txn, SEQ_DEPLOYMENTS)?;
        let now = epoch_millis();

        let previous = {
            let meta = txn.open_table(META).map_err(map_err!(Table))?;
            meta.get(ACTIVE_DEPLOYMENT)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
        };

        let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        if let Some(prev_id) = previous {
            let prev: Option<Deployment> = read_row(&table, prev_id)?;
            if let Some(mut prev) = prev {
                prev.superseded_at = Some(now);
                let value = encode(&prev)?;
                table
                    .insert(prev_id, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }

        let deployment = Deployment {
            id,
            image: image.to_string(),
            created_at: now,
            superseded_at: None,
        };
        let value = encode(&deployment)?;
        table.insert(id, value.as_slice()).map_err(map_err!(Write))?;
        drop(table);

        let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
        meta.insert(ACTIVE_DEPLOYMENT, id)
            .map_err(map_err!(Write))?;
        Ok(deployment)
    }

    /// The deployment new nodes should run, if any rollout has happened.
    pub fn get_active_deployment(&self) -> StateResult<Option<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let meta = txn.open_table(META).map_err(map_err!(Table))?;
        let Some(id) = meta
            .get(ACTIVE_DEPLOYMENT)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
        else {
            return Ok(None);
        };
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        read_row(&table, id)
    }

    /// Get a deployment by id.
    pub fn get_deployment(&self, id: DeploymentId) -> StateResult<Option<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        read_row(&table, id)
    }

    /// List all deployments, oldest first.
    pub fn list_deployments(&self) -> StateResult<Vec<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert a `PENDING` node.
    ///
    /// Fails with [`StateError::NodeAlreadyExists`] when a live node already
    /// holds the `(routing_id, deployment_id)` slot.
    pub fn create_node(&self, new: &NewNode) -> StateResult<Node> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let node = Self::insert_node(&txn, new)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(node_id = node.id, routing_id = %node.routing_id, deployment_id = node.deployment_id, "node created");
        Ok(node)
    }

    /// Insert a `PENDING` node for `routing_id` on `deployment`, sized from
    /// `defaults` overlaid with the routing id's override (read in the same
    /// transaction).
    pub fn create_node_for_routing(
        &self,
        routing_id: &str,
        deployment: &Deployment,
        defaults: &NodeConfig,
    ) -> StateResult<Node> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let over = {
            let table = txn
                .open_table(NODE_CONFIG_OVERRIDES)
                .map_err(map_err!(Table))?;
            let row = table.get(routing_id).map_err(map_err!(Read))?;
            match row {
                Some(guard) => Some(decode::<NodeConfigOverride>(guard.value())?),
                None => None,
            }
        };
        let config = NodeConfig {
            image: deployment.image.clone(),
            ..defaults.clone()
        }
        .with_override(over.as_ref());
        let node = Self::insert_node(&txn, &NewNode::from_config(routing_id, deployment.id, &config))?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(node_id = node.id, %routing_id, deployment_id = deployment.id, image = %node.image, "node created");
        Ok(node)
    }

    fn insert_node(txn: &WriteTransaction, new: &NewNode) -> StateResult<Node> {
        let slot = (new.routing_id.as_str(), new.deployment_id);
        {
            let generations = txn.open_table(NODE_GENERATIONS).map_err(map_err!(Table))?;
            if generations.get(slot).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::NodeAlreadyExists {
                    routing_id: new.routing_id.clone(),
                    deployment_id: new.deployment_id,
                });
            }
        }

        let id = next_id(txn, SEQ_NODES)?;
        let now = epoch_millis();
        let node = Node {
            id,
            routing_id: new.routing_id.clone(),
            deployment_id: new.deployment_id,
            url: None,
            state: NodeState::Pending,
            image: new.image.clone(),
            cpu_milli: new.cpu_milli,
            memory_mb: new.memory_mb,
            storage_mb: new.storage_mb,
            error: None,
            created_at: now,
            last_state_transition_at: now,
        };
        Self::write_node(txn, &node, None)?;
        Ok(node)
    }

    /// Write a node row and keep both indexes in step with it.
    fn write_node(txn: &WriteTransaction, node: &Node, previous: Option<&Node>) -> StateResult<()> {
        let value = encode(node)?;
        let mut nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
        nodes.insert(node.id, value.as_slice()).map_err(map_err!(Write))?;

        let mut index = txn
            .open_table(NODES_BY_ROUTING_STATE)
            .map_err(map_err!(Table))?;
        if let Some(prev) = previous {
            index
                .remove((prev.routing_id.as_str(), prev.state.as_str(), prev.id))
                .map_err(map_err!(Write))?;
        }
        index
            .insert((node.routing_id.as_str(), node.state.as_str(), node.id), ())
            .map_err(map_err!(Write))?;

        let mut generations = txn.open_table(NODE_GENERATIONS).map_err(map_err!(Table))?;
        if let Some(prev) = previous {
            Self::release_generation(&mut generations, prev)?;
        }
        if !node.state.is_terminal() {
            generations
                .insert((node.routing_id.as_str(), node.deployment_id), node.id)
                .map_err(map_err!(Write))?;
        }
        Ok(())
    }

    /// Free the node's `(routing_id, deployment_id)` slot if it holds it.
    fn release_generation(
        generations: &mut redb::Table<'_, (&'static str, u64), u64>,
        node: &Node,
    ) -> StateResult<()> {
        let slot = (node.routing_id.as_str(), node.deployment_id);
        let holder = generations
            .get(slot)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value());
        if holder == Some(node.id) {
            generations.remove(slot).map_err(map_err!(Write))?;
        }
        Ok(())
    }

    /// Get a node by id.
    pub fn get_node(&self, id: NodeId) -> StateResult<Option<Node>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        read_row(&table, id)
    }

    /// Apply a validated lifecycle transition.
    ///
    /// `last_state_transition_at` always moves forward, even when two
    /// transitions land within the same millisecond.
    pub fn transition_node(&self, id: NodeId, transition: Transition) -> StateResult<Node> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let current: Node = {
            let nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            read_row(&nodes, id)?.ok_or(StateError::NodeNotFound(id))?
        };

        let to = transition.target();
        if !current.state.can_transition_to(to) {
            return Err(StateError::InvalidTransition {
                node_id: id,
                from: current.state,
                to,
            });
        }

        let mut next = current.clone();
        next.state = to;
        next.last_state_transition_at = epoch_millis().max(current.last_state_transition_at + 1);
        match transition {
            Transition::Run { url } => next.url = Some(url),
            Transition::Fail { reason } => next.error = Some(reason),
            Transition::Start
            | Transition::Outdate
            | Transition::Finish
            | Transition::Idle
            | Transition::Terminate => {}
        }

        Self::write_node(&txn, &next, Some(&current))?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(node_id = id, from = %current.state, to = %next.state, "node transitioned");
        Ok(next)
    }

    /// Hard-delete a terminal node.
    pub fn remove_node(&self, id: NodeId) -> StateResult<Node> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let node: Node = {
            let nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            read_row(&nodes, id)?.ok_or(StateError::NodeNotFound(id))?
        };
        if !node.state.is_terminal() {
            return Err(StateError::NodeDeleteNonTerminated {
                node_id: id,
                state: node.state,
            });
        }
        {
            let mut nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            nodes.remove(id).map_err(map_err!(Write))?;
            let mut index = txn
                .open_table(NODES_BY_ROUTING_STATE)
                .map_err(map_err!(Table))?;
            index
                .remove((node.routing_id.as_str(), node.state.as_str(), id))
                .map_err(map_err!(Write))?;
            let mut generations = txn.open_table(NODE_GENERATIONS).map_err(map_err!(Table))?;
            Self::release_generation(&mut generations, &node)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(node_id = id, state = %node.state, "node removed");
        Ok(node)
    }

    /// Insert or replace a node row verbatim, indexes included.
    ///
    /// Bypasses transition validation; used to seed or repair state.
    pub fn put_node(&self, node: &Node) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let previous: Option<Node> = {
            let nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            read_row(&nodes, node.id)?
        };
        Self::write_node(&txn, node, previous.as_ref())?;
        {
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            let seq = meta
                .get(SEQ_NODES)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0);
            if node.id > seq {
                meta.insert(SEQ_NODES, node.id).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// One page of nodes matching `search`, grouped by routing id then
    /// state, in id order.
    pub fn search_nodes(&self, search: &NodeSearch) -> StateResult<NodeSearchResult> {
        let limit = search.limit.unwrap_or(NodeSearch::DEFAULT_LIMIT).max(1);
        let start = search.cursor.map_or(0, |c| c.saturating_add(1));

        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
        let mut matched: Vec<Node> = Vec::new();

        match search.routing_id.as_deref() {
            Some(routing_id) if !search.states.is_empty() => {
                let index = txn
                    .open_table(NODES_BY_ROUTING_STATE)
                    .map_err(map_err!(Table))?;
                let mut ids = Vec::new();
                let mut states = search.states.clone();
                states.sort();
                states.dedup();
                for state in states {
                    let range = (routing_id, state.as_str(), start)..=(routing_id, state.as_str(), u64::MAX);
                    for entry in index.range(range).map_err(map_err!(Read))? {
                        let (key, _) = entry.map_err(map_err!(Read))?;
                        ids.push(key.value().2);
                    }
                }
                ids.sort_unstable();
                ids.truncate(limit + 1);
                for id in ids {
                    if let Some(node) = read_row(&nodes, id)? {
                        matched.push(node);
                    }
                }
            }
            routing_id => {
                for entry in nodes.range(start..).map_err(map_err!(Read))? {
                    let (_, value) = entry.map_err(map_err!(Read))?;
                    let node: Node = decode(value.value())?;
                    if routing_id.is_some_and(|r| r != node.routing_id) {
                        continue;
                    }
                    if !search.states.is_empty() && !search.states.contains(&node.state) {
                        continue;
                    }
                    matched.push(node);
                    if matched.len() > limit {
                        break;
                    }
                }
            }
        }

        let next_cursor = if matched.len() > limit {
            matched.truncate(limit);
            matched.last().map(|n| n.id)
        } else {
            None
        };

        let mut result = NodeSearchResult {
            nodes: BTreeMap::new(),
            next_cursor,
        };
        for node in matched {
            result
                .nodes
                .entry(node.routing_id.clone())
                .or_default()
                .entry(node.state)
                .or_default()
                .push(node);
        }
        Ok(result)
    }

    /// Every node matching `search`, following cursors to the end.
    pub fn search_all_nodes(&self, search: &NodeSearch) -> StateResult<Vec<Node>> {
        let mut page = search.clone();
        let mut nodes = Vec::new();
        loop {
            let result = self.search_nodes(&page)?;
            let next = result.next_cursor;
            nodes.extend(result.into_nodes());
            match next {
                Some(cursor) => page.cursor = Some(cursor),
                None => return Ok(nodes),
            }
        }
    }

    // ── Node config overrides ──────────────────────────────────────

    /// Get the override for a routing id.
    pub fn get_override(&self, routing_id: &str) -> StateResult<Option<NodeConfigOverride>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn
            .open_table(NODE_CONFIG_OVERRIDES)
            .map_err(map_err!(Table))?;
        match table.get(routing_id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Overrides keyed by routing id, optionally restricted to `routing_ids`.
    pub fn search_overrides(
        &self,
        routing_ids: Option<&[RoutingId]>,
    ) -> StateResult<BTreeMap<RoutingId, NodeConfigOverride>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn
            .open_table(NODE_CONFIG_OVERRIDES)
            .map_err(map_err!(Table))?;
        let mut results = BTreeMap::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if routing_ids.is_some_and(|ids| !ids.iter().any(|id| id == key.value())) {
                continue;
            }
            let row: NodeConfigOverride = decode(value.value())?;
            results.insert(row.routing_id.clone(), row);
        }
        Ok(results)
    }

    /// Merge `patch` into the routing id's override (or into `defaults` when
    /// none exists) and persist the result.
    ///
    /// When the merged override has no pinned image and equals `defaults`,
    /// the row is deleted instead and `None` is returned.
    pub fn put_override(
        &self,
        routing_id: &str,
        patch: &NodeConfigPatch,
        defaults: &NodeConfig,
    ) -> StateResult<Option<NodeConfigOverride>> {
        let now = epoch_millis();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existing: Option<NodeConfigOverride> = {
            let table = txn
                .open_table(NODE_CONFIG_OVERRIDES)
                .map_err(map_err!(Table))?;
            let row = table.get(routing_id).map_err(map_err!(Read))?;
            match row {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            }
        };

        let base = existing
            .clone()
            .unwrap_or_else(|| default_override(routing_id, defaults, now));
        let mut merged = base.patched(patch);

        if merged.matches_defaults(defaults) {
            if existing.is_some() {
                let mut table = txn
                    .open_table(NODE_CONFIG_OVERRIDES)
                    .map_err(map_err!(Table))?;
                table.remove(routing_id).map_err(map_err!(Write))?;
            }
            txn.commit().map_err(map_err!(Transaction))?;
            debug!(%routing_id, existed = existing.is_some(), "node config override collapsed to defaults");
            return Ok(None);
        }

        if existing.is_none() {
            merged.id = next_id(&txn, SEQ_NODE_CONFIG_OVERRIDES)?;
        }
        merged.updated_at = now;
        let value = encode(&merged)?;
        {
            let mut table = txn
                .open_table(NODE_CONFIG_OVERRIDES)
                .map_err(map_err!(Table))?;
            table
                .insert(routing_id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%routing_id, id = merged.id, "node config override stored");
        Ok(Some(merged))
    }

    /// Delete the override for a routing id.
    pub fn remove_override(&self, routing_id: &str) -> StateResult<NodeConfigOverride> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed: NodeConfigOverride = {
            let mut table = txn
                .open_table(NODE_CONFIG_OVERRIDES)
                .map_err(map_err!(Table))?;
            let row = table.remove(routing_id).map_err(map_err!(Write))?;
            match row {
                Some(guard) => decode(guard.value())?,
                None => return Err(StateError::NodeConfigOverrideNotFound(routing_id.to_string())),
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%routing_id, "node config override removed");
        Ok(removed)
    }

    /// Clear the pinned image on every override, removing those left equal
    /// to `defaults`. Returns how many changed.
    pub fn reset_override_images(&self, defaults: &NodeConfig) -> StateResult<usize> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let cleared = Self::clear_override_images(&txn, defaults, epoch_millis())?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(cleared)
    }

    fn clear_override_images(
        txn: &WriteTransaction,
        defaults: &NodeConfig,
        now: u64,
    ) -> StateResult<usize> {
        let mut table = txn
            .open_table(NODE_CONFIG_OVERRIDES)
            .map_err(map_err!(Table))?;
        let mut pinned = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let row: NodeConfigOverride = decode(value.value())?;
            if row.image.is_some() {
                pinned.push(row);
            }
        }
        let mut collapsed = 0;
        for mut row in pinned.iter().cloned() {
            row.image = None;
            if row.matches_defaults(defaults) {
                table
                    .remove(row.routing_id.as_str())
                    .map_err(map_err!(Write))?;
                collapsed += 1;
                continue;
            }
            row.updated_at = now;
            let value = encode(&row)?;
            table
                .insert(row.routing_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        if collapsed > 0 {
            debug!(collapsed, "overrides equal to defaults removed");
        }
        Ok(pinned.len())
    }

    // ── Locks ──────────────────────────────────────────────────────

    /// Take `key` for `owner` unless another owner holds an unexpired lease.
    /// Re-acquiring by the current owner extends the lease.
    pub fn try_acquire_lock(&self, key: &str, owner: &str, ttl: Duration) -> StateResult<bool> {
        let now = epoch_millis();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let held: Option<LockRecord> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            if let Some(held) = held {
                if held.owner != owner && !held.is_expired(now) {
                    return Ok(false);
                }
                if held.owner != owner {
                    debug!(%key, previous_owner = %held.owner, "taking over expired lock");
                }
            }
            let record = LockRecord {
                owner: owner.to_string(),
                acquired_at: now,
                expires_at: now + ttl.as_millis() as u64,
            };
            let value = encode(&record)?;
            table.insert(key, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(true)
    }

    /// Release `key` if `owner` still holds it. Returns whether it did.
    pub fn release_lock(&self, key: &str, owner: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let released = {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let held: Option<LockRecord> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            match held {
                Some(held) if held.owner == owner => {
                    table.remove(key).map_err(map_err!(Write))?;
                    true
                }
                _ => false,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(released)
    }

    /// Current holder of `key`, expired or not.
    pub fn get_lock(&self, key: &str) -> StateResult<Option<LockRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }
}

fn default_override(routing_id: &str, defaults: &NodeConfig, now: u64) -> NodeConfigOverride {
    NodeConfigOverride {
        id: 0,
        routing_id: routing_id.to_string(),
        image: None,
        cpu_milli: defaults.cpu_milli,
        memory_mb: defaults.memory_mb,
        storage_mb: defaults.storage_mb,
        is_tracing_enabled: defaults.is_tracing_enabled,
        is_profiling_enabled: defaults.is_profiling_enabled,
        idle_max_duration_ms: defaults.idle_max_duration_ms,
        execution_timeout_secs: defaults.execution_timeout_secs,
        provisioned_concurrency: defaults.provisioned_concurrency,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> NodeConfig {
        NodeConfig {
            image: "runner:default".into(),
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

    fn new_node(routing_id: &str, deployment_id: DeploymentId) -> NewNode {
        NewNode::from_config(routing_id, deployment_id, &defaults())
    }

    #[test]
    fn open_in_memory() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_active_deployment().unwrap().is_none());
        assert!(store.list_deployments().unwrap().is_empty());
    }

    #[test]
    fn open_persistent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.redb");

        {
            let store = StateStore::open(&path).unwrap();
            store.create_deployment("runner:1").unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        let active = store.get_active_deployment().unwrap().unwrap();
        assert_eq!(active.image, "runner:1");
    }

    // ── Deployment tests ───────────────────────────────────────────

    #[test]
    fn create_deployment_supersedes_previous() {
        let store = StateStore::open_in_memory().unwrap();
        let d1 = store.create_deployment("runner:1").unwrap();
        let d2 = store.create_deployment("runner:2").unwrap();
        assert!(d2.id > d1.id);

        let d1 = store.get_deployment(d1.id).unwrap().unwrap();
        assert!(d1.superseded_at.is_some());
        assert_eq!(store.get_active_deployment().unwrap().unwrap().id, d2.id);
    }

    #[test]
    fn superseded_deployment_is_never_touched_again() {
        let store = StateStore::open_in_memory().unwrap();
        let d1 = store.create_deployment("runner:1").unwrap();
        store.create_deployment("runner:2").unwrap();
        let first = store.get_deployment(d1.id).unwrap().unwrap();
        store.create_deployment("runner:3").unwrap();
        assert_eq!(store.get_deployment(d1.id).unwrap().unwrap(), first);
    }

    #[test]
    fn exactly_one_active_deployment() {
        let store = StateStore::open_in_memory().unwrap();
        for i in 0..5 {
            store.create_deployment(&format!("runner:{i}")).unwrap();
        }
        let active: Vec<_> = store
            .list_deployments()
            .unwrap()
            .into_iter()
            .filter(Deployment::is_active)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].image, "runner:4");
    }

    // ── Node tests ─────────────────────────────────────────────────

    #[test]
    fn create_node_starts_pending() {
        let store = StateStore::open_in_memory().unwrap();
        let node = store.create_node(&new_node("env-1", 1)).unwrap();
        assert_eq!(node.state, NodeState::Pending);
        assert!(node.error.is_none());
        assert!(node.url.is_none());
        assert_eq!(node.created_at, node.last_state_transition_at);
        assert_eq!(store.get_node(node.id).unwrap().unwrap(), node);
    }

    #[test]
    fn second_live_node_for_same_generation_is_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_node(&new_node("env-1", 1)).unwrap();
        let err = store.create_node(&new_node("env-1", 1)).unwrap_err();
        assert_eq!(err.kind(), "node_already_exists");

        // Other generations and routing ids are independent.
        store.create_node(&new_node("env-1", 2)).unwrap();
        store.create_node(&new_node("env-2", 1)).unwrap();
    }

    #[test]
    fn failed_node_frees_its_generation_slot() {
        let store = StateStore::open_in_memory().unwrap();
        let node = store.create_node(&new_node("env-1", 1)).unwrap();
        store
            .transition_node(node.id, Transition::Fail { reason: "boom".into() })
            .unwrap();
        let replacement = store.create_node(&new_node("env-1", 1)).unwrap();
        assert!(replacement.id > node.id);
    }

    #[test]
    fn create_node_for_routing_applies_override() {
        let store = StateStore::open_in_memory().unwrap();
        let deployment = store.create_deployment("runner:2").unwrap();
        store
            .put_override(
                "env-big",
                &NodeConfigPatch {
                    cpu_milli: Some(4000),
                    ..Default::default()
                },
                &defaults(),
            )
            .unwrap();

        let plain = store
            .create_node_for_routing("env-plain", &deployment, &defaults())
            .unwrap();
        assert_eq!(plain.image, "runner:2");
        assert_eq!(plain.cpu_milli, 500);

        let big = store
            .create_node_for_routing("env-big", &deployment, &defaults())
            .unwrap();
        assert_eq!(big.image, "runner:2");
        assert_eq!(big.cpu_milli, 4000);
    }

    #[test]
    fn transition_updates_url_error_and_timestamp() {
        let store = StateStore::open_in_memory().unwrap();
        let node = store.create_node(&new_node("env-1", 1)).unwrap();

        let started = store.transition_node(node.id, Transition::Start).unwrap();
        assert!(started.last_state_transition_at > node.last_state_transition_at);

        let running = store
            .transition_node(node.id, Transition::Run { url: "http://127.0.0.1:9000".into() })
            .unwrap();
        assert_eq!(running.state, NodeState::Running);
        assert_eq!(running.url.as_deref(), Some("http://127.0.0.1:9000"));
        assert!(running.last_state_transition_at > started.last_state_transition_at);

        let failed = store
            .transition_node(node.id, Transition::Fail { reason: "oom".into() })
            .unwrap();
        assert_eq!(failed.state, NodeState::Error);
        assert_eq!(failed.error.as_deref(), Some("oom"));
    }

    #[test]
    fn invalid_transition_leaves_node_unchanged() {
        let store = StateStore::open_in_memory().unwrap();
        let node = store.create_node(&new_node("env-1", 1)).unwrap();
        let err = store.transition_node(node.id, Transition::Finish).unwrap_err();
        assert!(matches!(
            err,
            StateError::InvalidTransition {
                from: NodeState::Pending,
                to: NodeState::Finishing,
                ..
            }
        ));
        assert_eq!(store.get_node(node.id).unwrap().unwrap(), node);
    }

    #[test]
    fn transition_unknown_node() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.transition_node(42, Transition::Start).unwrap_err();
        assert_eq!(err.kind(), "node_not_found");
    }

    #[test]
    fn remove_only_terminal_nodes() {
        let store = StateStore::open_in_memory().unwrap();
        let node = store.create_node(&new_node("env-1", 1)).unwrap();
        let err = store.remove_node(node.id).unwrap_err();
        assert_eq!(err.kind(), "node_delete_non_terminated");

        store
            .transition_node(node.id, Transition::Fail { reason: "x".into() })
            .unwrap();
        store.remove_node(node.id).unwrap();
        assert!(store.get_node(node.id).unwrap().is_none());
        assert!(store.search_nodes(&NodeSearch::default()).unwrap().is_empty());
    }

    #[test]
    fn search_groups_by_routing_and_state() {
        let store = StateStore::open_in_memory().unwrap();
        let a = store.create_node(&new_node("env-a", 1)).unwrap();
        let b = store.create_node(&new_node("env-b", 1)).unwrap();
        store.transition_node(b.id, Transition::Start).unwrap();

        let result = store.search_nodes(&NodeSearch::default()).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result.nodes["env-a"][&NodeState::Pending][0].id, a.id);
        assert_eq!(result.nodes["env-b"][&NodeState::Starting][0].id, b.id);
        assert!(result.next_cursor.is_none());
    }

    #[test]
    fn search_by_routing_and_state_uses_index() {
        let store = StateStore::open_in_memory().unwrap();
        let pending = store.create_node(&new_node("env-a", 1)).unwrap();
        let running = store.create_node(&new_node("env-a", 2)).unwrap();
        store.transition_node(running.id, Transition::Start).unwrap();
        store
            .transition_node(running.id, Transition::Run { url: "http://localhost:1".into() })
            .unwrap();
        store.create_node(&new_node("env-b", 1)).unwrap();

        let search = NodeSearch::routing("env-a").with_states(&[NodeState::Running]);
        let nodes = store.search_nodes(&search).unwrap().into_nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, running.id);

        let search = NodeSearch::routing("env-a").with_states(&[NodeState::Pending, NodeState::Running]);
        let ids: Vec<_> = store
            .search_nodes(&search)
            .unwrap()
            .into_nodes()
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, vec![pending.id, running.id]);
    }

    #[test]
    fn search_paginates_with_cursor() {
        let store = StateStore::open_in_memory().unwrap();
        for i in 0..5 {
            store.create_node(&new_node(&format!("env-{i}"), 1)).unwrap();
        }

        let first = store.search_nodes(&NodeSearch::default().limit(2)).unwrap();
        assert_eq!(first.len(), 2);
        let cursor = first.next_cursor.unwrap();

        let second = store
            .search_nodes(&NodeSearch::default().limit(2).after(cursor))
            .unwrap();
        assert_eq!(second.len(), 2);
        let third = store
            .search_nodes(&NodeSearch::default().limit(2).after(second.next_cursor.unwrap()))
            .unwrap();
        assert_eq!(third.len(), 1);
        assert!(third.next_cursor.is_none());

        let all = store.search_all_nodes(&NodeSearch::default().limit(2)).unwrap();
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn put_node_keeps_index_consistent() {
        let store = StateStore::open_in_memory().unwrap();
        let mut node = store.create_node(&new_node("env-1", 1)).unwrap();
        node.state = NodeState::Starting;
        node.last_state_transition_at = 1;
        store.put_node(&node).unwrap();

        let search = NodeSearch::routing("env-1").with_states(&[NodeState::Pending]);
        assert!(store.search_nodes(&search).unwrap().is_empty());
        let search = NodeSearch::routing("env-1").with_states(&[NodeState::Starting]);
        assert_eq!(store.search_nodes(&search).unwrap().len(), 1);
    }

    // ── Override tests ─────────────────────────────────────────────

    #[test]
    fn put_override_persists_non_default_values() {
        let store = StateStore::open_in_memory().unwrap();
        let row = store
            .put_override(
                "env-1",
                &NodeConfigPatch {
                    memory_mb: Some(2048),
                    ..Default::default()
                },
                &defaults(),
            )
            .unwrap()
            .unwrap();
        assert!(row.image.is_none());
        assert_eq!(row.memory_mb, 2048);
        assert_eq!(row.cpu_milli, 500);
        assert_eq!(store.get_override("env-1").unwrap().unwrap(), row);
    }

    #[test]
    fn put_override_collapses_to_defaults() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_override(
                "env-1",
                &NodeConfigPatch {
                    memory_mb: Some(2048),
                    ..Default::default()
                },
                &defaults(),
            )
            .unwrap();
        let collapsed = store
            .put_override(
                "env-1",
                &NodeConfigPatch {
                    memory_mb: Some(512),
                    ..Default::default()
                },
                &defaults(),
            )
            .unwrap();
        assert!(collapsed.is_none());
        assert!(store.get_override("env-1").unwrap().is_none());
    }

    #[test]
    fn put_override_update_preserves_identity() {
        let store = StateStore::open_in_memory().unwrap();
        let first = store
            .put_override(
                "env-1",
                &NodeConfigPatch {
                    cpu_milli: Some(1000),
                    ..Default::default()
                },
                &defaults(),
            )
            .unwrap()
            .unwrap();
        let second = store
            .put_override(
                "env-1",
                &NodeConfigPatch {
                    storage_mb: Some(1),
                    ..Default::default()
                },
                &defaults(),
            )
            .unwrap()
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.cpu_milli, 1000);
        assert_eq!(second.storage_mb, 1);
    }

    #[test]
    fn remove_missing_override() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.remove_override("nope").unwrap_err();
        assert_eq!(err.kind(), "node_config_override_not_found");
    }

    #[test]
    fn rollout_clears_pinned_images() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_override(
                "env-pinned",
                &NodeConfigPatch {
                    image: Some("runner:old".into()),
                    cpu_milli: Some(1000),
                    ..Default::default()
                },
                &defaults(),
            )
            .unwrap();
        store
            .put_override(
                "env-sized",
                &NodeConfigPatch {
                    cpu_milli: Some(1000),
                    ..Default::default()
                },
                &defaults(),
            )
            .unwrap();

        store
            .put_override(
                "env-image-only",
                &NodeConfigPatch {
                    image: Some("runner:debug".into()),
                    ..Default::default()
                },
                &defaults(),
            )
            .unwrap();

        let (deployment, cleared) = store.rollout_deployment("runner:new", &defaults()).unwrap();
        assert_eq!(cleared, 2);
        assert!(deployment.is_active());
        let overrides = store.search_overrides(None).unwrap();
        // Only an image was pinned, so nothing is left to override.
        assert_eq!(
            overrides.keys().cloned().collect::<Vec<_>>(),
            vec!["env-pinned".to_string(), "env-sized".to_string()]
        );
        assert!(overrides.values().all(|o| o.image.is_none()));
        assert_eq!(overrides["env-pinned"].updated_at, deployment.created_at);
    }

    #[test]
    fn reset_override_images_collapses_default_rows() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_override(
                "env-1",
                &NodeConfigPatch {
                    image: Some("runner:debug".into()),
                    ..Default::default()
                },
                &defaults(),
            )
            .unwrap();
        assert_eq!(store.reset_override_images(&defaults()).unwrap(), 1);
        assert!(store.get_override("env-1").unwrap().is_none());
        assert_eq!(store.reset_override_images(&defaults()).unwrap(), 0);
    }

    #[test]
    fn search_overrides_filters_routing_ids() {
        let store = StateStore::open_in_memory().unwrap();
        for id in ["a", "b", "c"] {
            store
                .put_override(
                    id,
                    &NodeConfigPatch {
                        cpu_milli: Some(1),
                        ..Default::default()
                    },
                    &defaults(),
                )
                .unwrap();
        }
        let wanted = vec!["a".to_string(), "c".to_string()];
        let found = store.search_overrides(Some(&wanted)).unwrap();
        assert_eq!(found.keys().cloned().collect::<Vec<_>>(), wanted);
    }

    // ── Lock tests ─────────────────────────────────────────────────

    #[test]
    fn lock_is_exclusive_until_released() {
        let store = StateStore::open_in_memory().unwrap();
        let ttl = Duration::from_secs(60);
        assert!(store.try_acquire_lock("k", "a", ttl).unwrap());
        assert!(!store.try_acquire_lock("k", "b", ttl).unwrap());
        assert!(!store.release_lock("k", "b").unwrap());
        assert!(store.release_lock("k", "a").unwrap());
        assert!(store.try_acquire_lock("k", "b", ttl).unwrap());
    }

    #[test]
    fn expired_lock_can_be_taken_over() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.try_acquire_lock("k", "crashed", Duration::ZERO).unwrap());
        assert!(store.try_acquire_lock("k", "b", Duration::from_secs(60)).unwrap());
        assert_eq!(store.get_lock("k").unwrap().unwrap().owner, "b");
        // The stale owner can no longer release it.
        assert!(!store.release_lock("k", "crashed").unwrap());
    }
}
