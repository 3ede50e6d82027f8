//! fleet-provider: the seam between the fleet and its compute substrate.
//!
//! - [`NodeProvider`]: starts, terminates and health-checks nodes.
//! - [`ImageVerifier`]: validates an image reference before a rollout.
//! - [`duration`]: human-readable durations for config files.
//! - [`probe`]: minimal hyper HTTP/1 client used for health probes and
//!   drain notifications.
//! - [`LocalProvider`]: runs each node as a local child process.
//! - [`MockProvider`]: in-memory recording provider for tests.

pub mod duration;
pub mod error;
pub mod local;
pub mod mock;
pub mod probe;
pub mod provider;
pub mod verifier;

pub use error::{ProviderError, ProviderResult};
pub use local::{LocalProvider, LocalProviderConfig};
pub use mock::{MockProvider, ProviderCall};
pub use probe::ProbeResult;
pub use provider::{BoxFuture, NodeProvider};
pub use verifier::{DockerVerifier, ImageVerifier, Verifiers};
