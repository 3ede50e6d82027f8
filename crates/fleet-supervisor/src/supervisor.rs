//! Supervisor: plans and applies one reconciliation pass per tick.
//!
//! Each step re-reads the store, plans a list of [`Operation`]s and applies
//! them one at a time. A failing operation is logged and counted; the rest
//! of the step and the remaining steps still run. Provider failures leave
//! the node where it is so the next tick retries it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use fleet_provider::NodeProvider;
use fleet_state::{
    epoch_millis, Deployment, LockManager, Node, NodeSearch, NodeState, RoutingId, StateResult,
    StateStore, Transition,
};

use crate::config::SupervisorConfig;
use crate::error::SupervisorResult;
use crate::operation::{Operation, TickReport};

/// Error reason recorded on a node that never got started.
pub const PENDING_TIMEOUT_REASON: &str = "pending_timeout_reached";
/// Error reason recorded on a node that started but never registered.
pub const STARTING_TIMEOUT_REASON: &str = "starting_timeout_reached";

const LIVE_STATES: [NodeState; 6] = [
    NodeState::Pending,
    NodeState::Starting,
    NodeState::Running,
    NodeState::Outdated,
    NodeState::Finishing,
    NodeState::Idle,
];

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// Reconciles one fleet. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    fleet_id: String,
    store: StateStore,
    locks: LockManager,
    provider: Arc<dyn NodeProvider>,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(
        fleet_id: &str,
        store: StateStore,
        provider: Arc<dyn NodeProvider>,
        mut config: SupervisorConfig,
    ) -> Self {
        // The lease is not renewed mid-tick, so a tick may not outlive it.
        if config.tick_timeout > config.lock_ttl {
            warn!(
                %fleet_id,
                tick_timeout_ms = millis(config.tick_timeout),
                lock_ttl_ms = millis(config.lock_ttl),
                "tick timeout exceeds lock ttl; clamping"
            );
            config.tick_timeout = config.lock_ttl;
        }
        let locks = LockManager::new(store.clone()).with_ttl(config.lock_ttl);
        Self {
            fleet_id: fleet_id.to_string(),
            store,
            locks,
            provider,
            config,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Name of the advisory lock that makes ticks single-flight.
    pub fn lock_key(&self) -> String {
        format!("fleet_{}_supervisor", self.fleet_id)
    }

    /// Run one tick if no other supervisor of this fleet is mid-tick.
    /// `Ok(None)` means the tick was skipped.
    pub async fn try_tick(&self) -> StateResult<Option<TickReport>> {
        self.locks.try_with_lock(&self.lock_key(), || self.tick()).await
    }

    /// One reconciliation pass, without taking the supervisor lock.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let now = epoch_millis();

        let active = match self.store.get_active_deployment() {
            Ok(active) => active,
            Err(e) => {
                error!(fleet_id = %self.fleet_id, error = %e, "failed to read active deployment");
                report.plan_errors += 1;
                return report;
            }
        };

        match active {
            Some(active) => {
                self.step("start_pending", self.plan_start_pending(now), &mut report).await;
                self.step("starting_timeout", self.plan_starting_timeout(now), &mut report).await;
                self.step("outdate", self.plan_outdate(&active), &mut report).await;
                self.step("backfill", self.plan_backfill(&active), &mut report).await;
                self.step("drain", self.plan_drain(&active), &mut report).await;
                self.step("finishing_timeout", self.plan_finishing_timeout(now), &mut report).await;
                self.step("terminate_idle", self.plan_terminate_idle(), &mut report).await;
            }
            None => {
                warn!(fleet_id = %self.fleet_id, "no active deployment, only collecting garbage");
            }
        }
        self.step("remove", self.plan_remove(now), &mut report).await;

        if !report.is_empty() {
            debug!(fleet_id = %self.fleet_id, %report, "supervisor tick finished");
        }
        report
    }

    /// Tick every `tick_interval` until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            fleet_id = %self.fleet_id,
            tick_interval_ms = millis(self.config.tick_interval),
            "supervisor started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            let delay = match tokio::time::timeout(self.config.tick_timeout, self.try_tick()).await {
                Ok(Ok(Some(report))) => {
                    if !report.failed.is_empty() || report.plan_errors > 0 {
                        warn!(fleet_id = %self.fleet_id, %report, "supervisor tick had failures");
                    }
                    self.config.tick_interval
                }
                Ok(Ok(None)) => {
                    debug!(fleet_id = %self.fleet_id, "supervisor lock held elsewhere, tick skipped");
                    self.config.tick_interval
                }
                Ok(Err(e)) => {
                    error!(fleet_id = %self.fleet_id, error = %e, "supervisor lock unavailable");
                    self.config.retry_delay
                }
                Err(_) => {
                    warn!(
                        fleet_id = %self.fleet_id,
                        timeout_ms = millis(self.config.tick_timeout),
                        "supervisor tick timed out"
                    );
                    self.config.retry_delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!(fleet_id = %self.fleet_id, "supervisor shutting down");
    }

    // ── Execution ──────────────────────────────────────────────────

    async fn step(
        &self,
        name: &'static str,
        planned: StateResult<Vec<Operation>>,
        report: &mut TickReport,
    ) {
        let operations = match planned {
            Ok(operations) => operations,
            Err(e) => {
                error!(fleet_id = %self.fleet_id, step = name, error = %e, "failed to plan supervisor step");
                report.plan_errors += 1;
                return;
            }
        };
        for operation in operations {
            let kind = operation.kind();
            match self.apply(operation).await {
                Ok(()) => report.record(kind, true),
                Err(e) => {
                    warn!(fleet_id = %self.fleet_id, step = name, operation = %kind, error = %e, "supervisor operation failed");
                    report.record(kind, false);
                }
            }
        }
    }

    async fn apply(&self, operation: Operation) -> SupervisorResult<()> {
        match operation {
            Operation::Create {
                routing_id,
                deployment,
            } => {
                let defaults = self.provider.default_node_config();
                let node = self
                    .store
                    .create_node_for_routing(&routing_id, &deployment, &defaults)?;
                info!(node_id = node.id, %routing_id, deployment_id = deployment.id, "replacement node created");
            }
            Operation::Start { node } => {
                self.provider.start(&node).await?;
                self.store.transition_node(node.id, Transition::Start)?;
                info!(node_id = node.id, routing_id = %node.routing_id, "node starting");
            }
            Operation::Fail { node, reason } => {
                if let Err(e) = self.provider.terminate(&node).await {
                    warn!(node_id = node.id, error = %e, "failed to release failing node");
                }
                self.store
                    .transition_node(node.id, Transition::Fail { reason: reason.clone() })?;
                warn!(node_id = node.id, routing_id = %node.routing_id, from = %node.state, %reason, "node failed");
            }
            Operation::Outdate { node } => {
                self.store.transition_node(node.id, Transition::Outdate)?;
                info!(node_id = node.id, routing_id = %node.routing_id, deployment_id = node.deployment_id, "node outdated");
            }
            Operation::Finishing { node } => {
                if let Err(e) = self.provider.notify_when_idle(&node).await {
                    warn!(node_id = node.id, error = %e, "failed to notify draining node");
                }
                self.store.transition_node(node.id, Transition::Finish)?;
                info!(node_id = node.id, routing_id = %node.routing_id, "node finishing");
            }
            Operation::FinishingTimeout { node } => {
                warn!(
                    node_id = node.id,
                    routing_id = %node.routing_id,
                    finishing_ms = node.time_in_state(epoch_millis()),
                    "node has been finishing for too long"
                );
            }
            Operation::Terminate { node } => {
                self.provider.terminate(&node).await?;
                self.store.transition_node(node.id, Transition::Terminate)?;
                info!(node_id = node.id, routing_id = %node.routing_id, "node terminated");
            }
            Operation::Remove { node } => {
                self.store.remove_node(node.id)?;
                debug!(node_id = node.id, state = %node.state, "node removed");
            }
        }
        Ok(())
    }

    // ── Planning ───────────────────────────────────────────────────

    fn nodes_in(&self, states: &[NodeState]) -> StateResult<Vec<Node>> {
        self.store
            .search_all_nodes(&NodeSearch::default().with_states(states))
    }

    fn older_than(node: &Node, now: u64, limit: Duration) -> bool {
        node.time_in_state(now) > millis(limit)
    }

    fn plan_start_pending(&self, now: u64) -> StateResult<Vec<Operation>> {
        Ok(self
            .nodes_in(&[NodeState::Pending])?
            .into_iter()
            .map(|node| {
                if Self::older_than(&node, now, self.config.pending_timeout) {
                    Operation::Fail {
                        node,
                        reason: PENDING_TIMEOUT_REASON.to_string(),
                    }
                } else {
                    Operation::Start { node }
                }
            })
            .collect())
    }

    fn plan_starting_timeout(&self, now: u64) -> StateResult<Vec<Operation>> {
        Ok(self
            .nodes_in(&[NodeState::Starting])?
            .into_iter()
            .filter(|node| Self::older_than(node, now, self.config.starting_timeout))
            .map(|node| Operation::Fail {
                node,
                reason: STARTING_TIMEOUT_REASON.to_string(),
            })
            .collect())
    }

    fn plan_outdate(&self, active: &Deployment) -> StateResult<Vec<Operation>> {
        Ok(self
            .nodes_in(&[NodeState::Running])?
            .into_iter()
            .filter(|node| node.deployment_id != active.id)
            .map(|node| Operation::Outdate { node })
            .collect())
    }

    fn plan_backfill(&self, active: &Deployment) -> StateResult<Vec<Operation>> {
        let outdated: BTreeSet<RoutingId> = self
            .nodes_in(&[NodeState::Outdated])?
            .into_iter()
            .map(|node| node.routing_id)
            .collect();

        let mut operations = Vec::new();
        for routing_id in outdated {
            let live = self
                .store
                .search_all_nodes(&NodeSearch::routing(&routing_id).with_states(&LIVE_STATES))?;
            if !live.iter().any(|n| n.deployment_id == active.id) {
                operations.push(Operation::Create {
                    routing_id,
                    deployment: active.clone(),
                });
            }
        }
        Ok(operations)
    }

    fn plan_drain(&self, active: &Deployment) -> StateResult<Vec<Operation>> {
        let mut replaced: BTreeMap<RoutingId, bool> = BTreeMap::new();
        let mut operations = Vec::new();
        for node in self.nodes_in(&[NodeState::Outdated])? {
            let ready = match replaced.get(&node.routing_id) {
                Some(ready) => *ready,
                None => {
                    let running = self.store.search_all_nodes(
                        &NodeSearch::routing(&node.routing_id).with_states(&[NodeState::Running]),
                    )?;
                    let ready = running.iter().any(|n| n.deployment_id == active.id);
                    replaced.insert(node.routing_id.clone(), ready);
                    ready
                }
            };
            if ready {
                operations.push(Operation::Finishing { node });
            }
        }
        Ok(operations)
    }

    fn plan_finishing_timeout(&self, now: u64) -> StateResult<Vec<Operation>> {
        Ok(self
            .nodes_in(&[NodeState::Finishing])?
            .into_iter()
            .filter(|node| Self::older_than(node, now, self.config.finishing_timeout))
            .map(|node| Operation::FinishingTimeout { node })
            .collect())
    }

    fn plan_terminate_idle(&self) -> StateResult<Vec<Operation>> {
        Ok(self
            .nodes_in(&[NodeState::Idle])?
            .into_iter()
            .map(|node| Operation::Terminate { node })
            .collect())
    }

    fn plan_remove(&self, now: u64) -> StateResult<Vec<Operation>> {
        Ok(self
            .nodes_in(&[NodeState::Terminated, NodeState::Error])?
            .into_iter()
            .filter(|node| {
                let retention = match node.state {
                    NodeState::Terminated => self.config.terminated_retention,
                    _ => self.config.error_retention,
                };
                Self::older_than(node, now, retention)
            })
            .map(|node| Operation::Remove { node })
            .collect())
    }
}
