//! The fleet façade.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info};

use fleet_provider::{NodeProvider, Verifiers};
use fleet_state::{
    Deployment, LockManager, Node, NodeConfig, NodeConfigOverride, NodeConfigPatch, NodeId,
    NodeSearch, NodeSearchResult, NodeState, StateError, StateStore, Transition,
};
use fleet_supervisor::{Supervisor, SupervisorConfig};

use crate::config::{FleetConfig, RolloutOptions};
use crate::error::{FleetError, FleetResult};

/// States a node can be handed out from, best first.
const ACQUIRABLE_STATES: [NodeState; 4] = [
    NodeState::Running,
    NodeState::Outdated,
    NodeState::Starting,
    NodeState::Pending,
];

fn preference(state: NodeState) -> usize {
    ACQUIRABLE_STATES
        .iter()
        .position(|s| *s == state)
        .unwrap_or(ACQUIRABLE_STATES.len())
}

fn is_serving(state: NodeState) -> bool {
    matches!(state, NodeState::Running | NodeState::Outdated)
}

/// Entry point for one fleet. Cheap to clone.
#[derive(Clone)]
pub struct Fleet {
    fleet_id: String,
    store: StateStore,
    locks: LockManager,
    provider: Arc<dyn NodeProvider>,
    verifiers: Verifiers,
    config: FleetConfig,
}

impl Fleet {
    pub fn new(
        fleet_id: &str,
        store: StateStore,
        provider: Arc<dyn NodeProvider>,
        verifiers: Verifiers,
        config: FleetConfig,
    ) -> Self {
        Self {
            fleet_id: fleet_id.to_string(),
            locks: LockManager::new(store.clone()),
            store,
            provider,
            verifiers,
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.fleet_id
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// A supervisor for this fleet, sharing its store and provider.
    pub fn supervisor(&self, config: SupervisorConfig) -> Supervisor {
        Supervisor::new(&self.fleet_id, self.store.clone(), self.provider.clone(), config)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Publish `image` as the new active deployment.
    ///
    /// Existing nodes are not touched; the supervisor cycles them out.
    /// Every pinned override image is cleared in the same transaction.
    pub async fn rollout(&self, image: &str, options: RolloutOptions) -> FleetResult<Deployment> {
        if options.verify_image {
            self.verifiers.verify(&options.image_type, image).await?;
        }
        let defaults = self.provider.default_node_config();
        let (deployment, cleared) = self.store.rollout_deployment(image, &defaults)?;
        info!(
            fleet_id = %self.fleet_id,
            deployment_id = deployment.id,
            %image,
            cleared_overrides = cleared,
            "rollout published"
        );
        Ok(deployment)
    }

    pub fn get_active_deployment(&self) -> FleetResult<Option<Deployment>> {
        Ok(self.store.get_active_deployment()?)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    pub fn get_node(&self, node_id: NodeId) -> FleetResult<Node> {
        self.store
            .get_node(node_id)?
            .ok_or(FleetError::State(StateError::NodeNotFound(node_id)))
    }

    pub fn search_nodes(&self, search: &NodeSearch) -> FleetResult<NodeSearchResult> {
        Ok(self.store.search_nodes(search)?)
    }

    /// A node able to serve `routing_id`, created on demand.
    ///
    /// Returns as soon as a `RUNNING` or `OUTDATED` node exists. Otherwise
    /// makes sure exactly one node is coming up and polls until it is ready
    /// or `get_running_node_timeout` has passed.
    pub async fn get_running_node(&self, routing_id: &str) -> FleetResult<Node> {
        let started = Instant::now();
        let deadline = started + self.config.get_running_node_timeout;

        loop {
            let node = match self.find_acquirable(routing_id)? {
                Some(node) => Some(node),
                None => self.create_on_demand(routing_id).await?,
            };
            if let Some(node) = node {
                if is_serving(node.state) {
                    return Ok(node);
                }
                debug!(node_id = node.id, %routing_id, state = %node.state, "waiting for node");
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(FleetError::NodeNotReadyTimeout {
                    routing_id: routing_id.to_string(),
                    waited_ms: now.duration_since(started).as_millis() as u64,
                });
            }
            let pause = self.config.get_running_node_retry_delay.min(deadline - now);
            tokio::time::sleep(pause).await;
        }
    }

    /// The best node for `routing_id`: serving before booting, then oldest.
    fn find_acquirable(&self, routing_id: &str) -> FleetResult<Option<Node>> {
        let nodes = self
            .store
            .search_all_nodes(&NodeSearch::routing(routing_id).with_states(&ACQUIRABLE_STATES))?;
        Ok(nodes
            .into_iter()
            .min_by_key(|node| (preference(node.state), node.id)))
    }

    fn create_lock_key(&self, routing_id: &str) -> String {
        format!("fleet_{}_create_node_{}", self.fleet_id, routing_id)
    }

    /// Create a node for `routing_id` unless someone beat us to it.
    ///
    /// `Ok(None)` means the slot is still held by a node on its way out;
    /// the caller retries.
    async fn create_on_demand(&self, routing_id: &str) -> FleetResult<Option<Node>> {
        let key = self.create_lock_key(routing_id);
        self.locks
            .with_lock(&key, self.config.create_node_lock_timeout, || {
                self.create_locked(routing_id)
            })
            .await?
    }

    async fn create_locked(&self, routing_id: &str) -> FleetResult<Option<Node>> {
        if let Some(node) = self.find_acquirable(routing_id)? {
            return Ok(Some(node));
        }
        let deployment = self
            .store
            .get_active_deployment()?
            .ok_or(FleetError::NoActiveDeployment)?;
        let defaults = self.provider.default_node_config();
        match self
            .store
            .create_node_for_routing(routing_id, &deployment, &defaults)
        {
            Ok(node) => {
                info!(
                    node_id = node.id,
                    %routing_id,
                    deployment_id = deployment.id,
                    "node created on demand"
                );
                Ok(Some(node))
            }
            Err(StateError::NodeAlreadyExists { .. }) => {
                debug!(%routing_id, deployment_id = deployment.id, "previous node still holds the slot");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record a booted node's callback url once it answers health checks.
    pub async fn register_node(&self, node_id: NodeId, url: &str) -> FleetResult<Node> {
        let node = self.get_node(node_id)?;
        if !node.state.can_transition_to(NodeState::Running) {
            return Err(StateError::InvalidTransition {
                node_id,
                from: node.state,
                to: NodeState::Running,
            }
            .into());
        }

        self.provider.verify_url(url).await?;
        self.provider
            .wait_until_healthy(node_id, url, self.config.healthy_timeout)
            .await?;

        let node = self.store.transition_node(
            node_id,
            Transition::Run {
                url: url.to_string(),
            },
        )?;
        info!(node_id, routing_id = %node.routing_id, %url, "node registered");
        Ok(node)
    }

    /// Mark a node as no longer needed. The supervisor terminates it.
    pub fn idle_node(&self, node_id: NodeId) -> FleetResult<Node> {
        let node = self.store.transition_node(node_id, Transition::Idle)?;
        info!(node_id, routing_id = %node.routing_id, "node idle");
        Ok(node)
    }

    // ── Node config ────────────────────────────────────────────────

    /// Merge `patch` into the routing id's override.
    ///
    /// Compared against the provider's current defaults: if the result has
    /// no pinned image and matches them exactly, the override is removed and
    /// `None` is returned.
    pub fn override_node_config(
        &self,
        routing_id: &str,
        patch: &NodeConfigPatch,
    ) -> FleetResult<Option<NodeConfigOverride>> {
        let defaults = self.provider.default_node_config();
        let stored = self.store.put_override(routing_id, patch, &defaults)?;
        match &stored {
            Some(o) => info!(%routing_id, override_id = o.id, "node config override stored"),
            None => info!(%routing_id, "node config override matches defaults, removed"),
        }
        Ok(stored)
    }

    /// Configuration a node created now for `routing_id` would get.
    pub fn get_node_config(&self, routing_id: &str) -> FleetResult<NodeConfig> {
        let mut config = self.provider.default_node_config();
        if let Some(deployment) = self.store.get_active_deployment()? {
            config.image = deployment.image;
        }
        let over = self.store.get_override(routing_id)?;
        Ok(config.with_override(over.as_ref()))
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }
}
