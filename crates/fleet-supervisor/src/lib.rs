//! fleet-supervisor: the per-fleet reconciliation loop.
//!
//! A [`Supervisor`] periodically diffs the nodes in the store against the
//! active deployment and drives them through their lifecycle: starting
//! pending nodes, timing out stuck ones, outdating nodes of superseded
//! deployments, creating their replacements, draining them once the
//! replacement runs, terminating idle nodes and purging old terminal ones.
//!
//! Ticks are single-flight across every process sharing the store: each tick
//! runs under an advisory lock and is skipped when the lock is held.

pub mod config;
pub mod error;
pub mod operation;
pub mod supervisor;

pub use config::SupervisorConfig;
pub use error::{SupervisorError, SupervisorResult};
pub use operation::{Operation, OperationKind, TickReport};
pub use supervisor::Supervisor;
