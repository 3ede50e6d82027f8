//! fleet-state: persisted state for a fleet of worker nodes.
//!
//! Backed by [redb](https://docs.rs/redb). Holds the append-only deployment
//! history, the node table with its validated lifecycle transitions, the
//! per-routing-key node config overrides, and the advisory lock table used
//! for cross-replica mutual exclusion.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Every mutating call is a single redb write transaction; redb serialises
//! writers, so read-validate-write sequences (node transitions, rollout,
//! lock acquisition) are atomic.
//!
//! One database file holds exactly one fleet. The `StateStore` is `Clone` +
//! `Send` + `Sync` (backed by `Arc<Database>`) and can be shared across async
//! tasks and simulated replicas.

pub mod error;
pub mod lock;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use lock::LockManager;
pub use store::StateStore;
pub use types::*;
