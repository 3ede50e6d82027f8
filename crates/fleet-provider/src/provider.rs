//! The node provider interface.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use fleet_state::{Node, NodeConfig, NodeId};

use crate::error::ProviderResult;

/// Boxed, `Send` future returned by provider and verifier methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The only component that talks to the compute substrate.
///
/// Implementations must be idempotent enough to tolerate a retry on the next
/// supervisor tick: `start` may be called again for a node whose previous
/// start was issued but not recorded, and `terminate` may be called for a
/// node that is already gone.
pub trait NodeProvider: Send + Sync {
    /// Sizing and image used for nodes without an override. The image is
    /// replaced by the active deployment's image at creation time.
    fn default_node_config(&self) -> NodeConfig;

    fn start<'a>(&'a self, node: &'a Node) -> BoxFuture<'a, ProviderResult<()>>;

    fn terminate<'a>(&'a self, node: &'a Node) -> BoxFuture<'a, ProviderResult<()>>;

    /// Reject callback URLs that could not belong to a node of this substrate.
    fn verify_url<'a>(&'a self, url: &'a str) -> BoxFuture<'a, ProviderResult<()>>;

    /// Resolve once `url` answers health checks, or fail after `timeout`.
    fn wait_until_healthy<'a>(
        &'a self,
        node_id: NodeId,
        url: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, ProviderResult<()>>;

    /// Ask a node that is about to be drained to finish in-flight work and
    /// report idle. Best effort.
    fn notify_when_idle<'a>(&'a self, _node: &'a Node) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async { Ok(()) })
    }
}
