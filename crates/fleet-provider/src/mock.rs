//! Recording in-memory provider for tests and dry runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use fleet_state::{Node, NodeConfig, NodeId};

use crate::error::{ProviderError, ProviderResult};
use crate::provider::{BoxFuture, NodeProvider};

/// A call observed by [`MockProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    Start(NodeId),
    Terminate(NodeId),
    VerifyUrl(String),
    WaitUntilHealthy(NodeId),
    NotifyWhenIdle(NodeId),
}

/// Provider that records every call and succeeds unless told otherwise.
pub struct MockProvider {
    defaults: Mutex<NodeConfig>,
    calls: Mutex<Vec<ProviderCall>>,
    fail_start: AtomicBool,
    fail_terminate: AtomicBool,
    reject_urls: AtomicBool,
    unhealthy: AtomicBool,
    delay: Mutex<Duration>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockProvider {
    pub fn new(defaults: NodeConfig) -> Self {
        Self {
            defaults: Mutex::new(defaults),
            calls: Mutex::new(Vec::new()),
            fail_start: AtomicBool::new(false),
            fail_terminate: AtomicBool::new(false),
            reject_urls: AtomicBool::new(false),
            unhealthy: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Change the defaults, as a new provider release would.
    pub fn set_defaults(&self, defaults: NodeConfig) {
        *lock(&self.defaults) = defaults;
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn fail_terminate(&self, fail: bool) {
        self.fail_terminate.store(fail, Ordering::SeqCst);
    }

    pub fn reject_urls(&self, reject: bool) {
        self.reject_urls.store(reject, Ordering::SeqCst);
    }

    pub fn unhealthy(&self, unhealthy: bool) {
        self.unhealthy.store(unhealthy, Ordering::SeqCst);
    }

    /// Make `start` and `terminate` take this long, like a real substrate.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    async fn pause(&self) {
        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<ProviderCall> {
        lock(&self.calls).clone()
    }

    /// Drain the recorded calls.
    pub fn take_calls(&self) -> Vec<ProviderCall> {
        std::mem::take(&mut *lock(&self.calls))
    }

    fn record(&self, call: ProviderCall) {
        lock(&self.calls).push(call);
    }
}

impl NodeProvider for MockProvider {
    fn default_node_config(&self) -> NodeConfig {
        lock(&self.defaults).clone()
    }

    fn start<'a>(&'a self, node: &'a Node) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move {
            self.record(ProviderCall::Start(node.id));
            self.pause().await;
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(ProviderError::Start {
                    node_id: node.id,
                    source: "mock start failure".into(),
                });
            }
            Ok(())
        })
    }

    fn terminate<'a>(&'a self, node: &'a Node) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move {
            self.record(ProviderCall::Terminate(node.id));
            self.pause().await;
            if self.fail_terminate.load(Ordering::SeqCst) {
                return Err(ProviderError::Terminate {
                    node_id: node.id,
                    source: "mock terminate failure".into(),
                });
            }
            Ok(())
        })
    }

    fn verify_url<'a>(&'a self, url: &'a str) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move {
            self.record(ProviderCall::VerifyUrl(url.to_string()));
            if self.reject_urls.load(Ordering::SeqCst) {
                return Err(ProviderError::InvalidUrl {
                    url: url.to_string(),
                    reason: "rejected by mock".to_string(),
                });
            }
            Ok(())
        })
    }

    fn wait_until_healthy<'a>(
        &'a self,
        node_id: NodeId,
        url: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move {
            self.record(ProviderCall::WaitUntilHealthy(node_id));
            if self.unhealthy.load(Ordering::SeqCst) {
                return Err(ProviderError::Unhealthy {
                    node_id,
                    url: url.to_string(),
                    waited_ms: timeout.as_millis() as u64,
                });
            }
            Ok(())
        })
    }

    fn notify_when_idle<'a>(&'a self, node: &'a Node) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move {
            self.record(ProviderCall::NotifyWhenIdle(node.id));
            Ok(())
        })
    }
}
