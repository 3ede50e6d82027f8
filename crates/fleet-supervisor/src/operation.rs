//! The closed set of actions a tick can take, and what a tick did.

use std::collections::BTreeMap;
use std::fmt;

use fleet_state::{Deployment, Node, RoutingId};

/// One planned action. Planned from a fresh read of the store and executed
/// immediately, so the node snapshot is at most one step old.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Create a `PENDING` replacement for `routing_id` on `deployment`.
    Create {
        routing_id: RoutingId,
        deployment: Deployment,
    },
    /// Ask the provider to start a `PENDING` node.
    Start { node: Node },
    /// Release whatever the node holds and move it to `ERROR`.
    Fail { node: Node, reason: String },
    /// Mark a `RUNNING` node of a superseded deployment as `OUTDATED`.
    Outdate { node: Node },
    /// Drain an `OUTDATED` node whose replacement is running.
    Finishing { node: Node },
    /// Report a node that has been draining for too long.
    FinishingTimeout { node: Node },
    /// Release an `IDLE` node.
    Terminate { node: Node },
    /// Purge a terminal node past its retention window.
    Remove { node: Node },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Create { .. } => OperationKind::Create,
            Self::Start { .. } => OperationKind::Start,
            Self::Fail { .. } => OperationKind::Fail,
            Self::Outdate { .. } => OperationKind::Outdate,
            Self::Finishing { .. } => OperationKind::Finishing,
            Self::FinishingTimeout { .. } => OperationKind::FinishingTimeout,
            Self::Terminate { .. } => OperationKind::Terminate,
            Self::Remove { .. } => OperationKind::Remove,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OperationKind {
    Create,
    Start,
    Fail,
    Outdate,
    Finishing,
    FinishingTimeout,
    Terminate,
    Remove,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Fail => "fail",
            Self::Outdate => "outdate",
            Self::Finishing => "finishing",
            Self::FinishingTimeout => "finishing_timeout",
            Self::Terminate => "terminate",
            Self::Remove => "remove",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome counts for one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub succeeded: BTreeMap<OperationKind, usize>,
    pub failed: BTreeMap<OperationKind, usize>,
    /// Steps whose planning read failed; their operations never ran.
    pub plan_errors: usize,
}

impl TickReport {
    pub fn record(&mut self, kind: OperationKind, ok: bool) {
        let counts = if ok { &mut self.succeeded } else { &mut self.failed };
        *counts.entry(kind).or_default() += 1;
    }

    pub fn succeeded(&self, kind: OperationKind) -> usize {
        self.succeeded.get(&kind).copied().unwrap_or(0)
    }

    pub fn failed(&self, kind: OperationKind) -> usize {
        self.failed.get(&kind).copied().unwrap_or(0)
    }

    /// Whether the tick found nothing to do.
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty() && self.plan_errors == 0
    }
}

impl fmt::Display for TickReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (label, counts) in [("ok", &self.succeeded), ("failed", &self.failed)] {
            for (kind, n) in counts {
                if !first {
                    f.write_str(" ")?;
                }
                first = false;
                write!(f, "{kind}_{label}={n}")?;
            }
        }
        if self.plan_errors > 0 {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "plan_errors={}", self.plan_errors)?;
        }
        Ok(())
    }
}
