//! Correlation registry
//!
//! Maps correlation ids of outstanding calls to their completion signal.
//! The calling task owns its [`PendingCall`]; dropping it removes the entry,
//! so the registry never outlives a call. The consumer loop only looks
//! entries up and signals them.

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Status and body of a matched reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct CorrelationRegistry {
    // None once fulfilled; the entry itself is removed by the PendingCall
    calls: Mutex<HashMap<String, Option<oneshot::Sender<Reply>>>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an outstanding call. Must happen before the request is published.
    ///
    /// Ids are assumed unique; registering an id twice replaces the earlier slot.
    pub fn register(&self, correlation_id: impl Into<String>) -> PendingCall<'_> {
        let correlation_id = correlation_id.into();
        let (tx, rx) = oneshot::channel();
        self.calls.lock().insert(correlation_id.clone(), Some(tx));

        PendingCall {
            registry: self,
            correlation_id,
            rx,
        }
    }

    /// Hand `reply` to the call waiting on `correlation_id`.
    ///
    /// Returns false when no call is waiting: unknown id, already fulfilled,
    /// or the caller gave up.
    pub fn fulfill(&self, correlation_id: &str, reply: Reply) -> bool {
        let tx = self
            .calls
            .lock()
            .get_mut(correlation_id)
            .and_then(Option::take);

        match tx {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }
}

/// An outstanding call. Removed from the registry on drop.
#[derive(Debug)]
pub struct PendingCall<'a> {
    registry: &'a CorrelationRegistry,
    correlation_id: String,
    rx: oneshot::Receiver<Reply>,
}

impl PendingCall<'_> {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Wait for the reply. `None` if the slot was replaced or dropped.
    pub async fn reply(&mut self) -> Option<Reply> {
        (&mut self.rx).await.ok()
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.registry.calls.lock().remove(&self.correlation_id);
    }
}
