//! Contract of the shared record store that replaces a signaling server.

use async_trait::async_trait;
use serde_json::{Map, Value};
use signalbox_core::store::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// A child appended under a watched path.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildAdded {
    pub key: String,
    pub value: Value,
}

/// Pub/sub key-value store with read-after-write visibility per key.
///
/// Paths are `/`-separated. Subscriptions deliver the current state first and
/// then every change; delivery may repeat, never reorder per subscription.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Value>>;

    async fn set(&self, path: &str, value: Value) -> Result<()>;

    /// Merge `fields` into the object at `path`.
    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<()>;

    /// Remove the value at `path` and everything below it. Removing an absent
    /// path succeeds.
    async fn remove(&self, path: &str) -> Result<()>;

    /// Append `value` under a fresh, insertion-ordered child key of `path`.
    async fn push(&self, path: &str, value: Value) -> Result<String>;

    /// Watch the value at `path`; `None` means absent.
    async fn subscribe(&self, path: &str) -> Result<Subscription<Option<Value>>>;

    /// Watch children appended under `path`, existing ones included. Each
    /// child is delivered at most once per subscription.
    async fn subscribe_child_added(&self, path: &str) -> Result<Subscription<ChildAdded>>;
}

/// Cancellation handle of a [`Subscription`]. Cloneable; cancelling more than
/// once is a no-op.
#[derive(Clone)]
pub struct Unsubscribe(Arc<UnsubscribeInner>);

struct UnsubscribeInner {
    cancelled: AtomicBool,
    action: Box<dyn Fn() + Send + Sync>,
}

impl Unsubscribe {
    pub fn new(action: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(UnsubscribeInner {
            cancelled: AtomicBool::new(false),
            action: Box::new(action),
        }))
    }

    pub fn cancel(&self) {
        if !self.0.cancelled.swap(true, Ordering::AcqRel) {
            (self.0.action)();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A live stream of store notifications. Dropping it unsubscribes.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    handle: Unsubscribe,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>, handle: Unsubscribe) -> Self {
        Self { rx, handle }
    }

    /// Next notification, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<T> {
        if self.handle.is_cancelled() {
            return None;
        }
        self.rx.recv().await
    }

    /// Next already-delivered notification, without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        if self.handle.is_cancelled() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    pub fn handle(&self) -> Unsubscribe {
        self.handle.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}
