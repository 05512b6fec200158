//! Pending-request correlation table.
//!
//! Every request/response exchange across the host/unit boundary goes
//! through here: the sender registers an id, gets a future, and the
//! protocol loop settles it when the matching `response` arrives. Each
//! entry owns exactly one timer; the deadline is enforced on this side of
//! the boundary, so a unit that never responds cannot leak a pending
//! future forever.

use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{HostError, HostResult};

struct PendingEntry {
    tx: oneshot::Sender<HostResult<Value>>,
    timer: JoinHandle<()>,
}

/// Correlation table mapping request ids to in-flight futures.
#[derive(Default)]
pub struct PendingRequests {
    entries: Arc<DashMap<String, PendingEntry>>,
}

impl PendingRequests {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a request id and return the future that settles when a
    /// response arrives or the timeout fires. `label` names the exchange
    /// in the timeout error.
    pub fn create(
        &self,
        id: &str,
        timeout: Duration,
        label: &str,
    ) -> impl Future<Output = HostResult<Value>> {
        let (tx, rx) = oneshot::channel();

        // The timer holds a weak reference so an abandoned table is not
        // kept alive for the length of its longest outstanding timeout.
        let timer = {
            let entries = Arc::downgrade(&self.entries);
            let id = id.to_string();
            let label = label.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(entries) = entries.upgrade() {
                    if let Some((_, entry)) = entries.remove(&id) {
                        let _ = entry.tx.send(Err(HostError::Timeout(label.clone())));
                        tracing::debug!("request {} timed out ({})", id, label);
                    }
                }
            })
        };

        self.entries
            .insert(id.to_string(), PendingEntry { tx, timer });

        async move {
            match rx.await {
                Ok(result) => result,
                // Entry was cancelled during teardown; no callback fired.
                Err(_) => Err(HostError::Transport("request cancelled".into())),
            }
        }
    }

    /// Settle a request successfully. Returns false if the id is unknown
    /// (already settled, timed out, or never created) - late arrivals are
    /// silently ignored.
    pub fn resolve(&self, id: &str, value: Value) -> bool {
        self.settle(id, Ok(value))
    }

    /// Settle a request with an error. Same late-arrival semantics as
    /// [`resolve`](Self::resolve).
    pub fn reject(&self, id: &str, error: HostError) -> bool {
        self.settle(id, Err(error))
    }

    fn settle(&self, id: &str, result: HostResult<Value>) -> bool {
        // Remove before delivering so a re-entrant settle sees no entry.
        match self.entries.remove(id) {
            Some((_, entry)) => {
                entry.timer.abort();
                let _ = entry.tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Drop a single entry without delivering a result.
    pub fn cancel(&self, id: &str) {
        if let Some((_, entry)) = self.entries.remove(id) {
            entry.timer.abort();
        }
    }

    /// Drop every outstanding entry. Invoked on host/unit teardown; pure
    /// cleanup, no result is delivered.
    pub fn cancel_all(&self) {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.cancel(&id);
        }
    }

    /// Reject every outstanding entry with a unit failure. Invoked when
    /// the unit dies with requests still in flight, so callers see the
    /// crash instead of waiting out their timeouts.
    pub fn fail_all(&self, message: &str) {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.reject(&id, HostError::UnitFailure(message.to_string()));
        }
    }

    /// Number of requests currently in flight.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;

    #[tokio::test]
    async fn test_resolve_settles_future() {
        let table = PendingRequests::new();
        let fut = table.create("r1", Duration::from_secs(5), "test");

        assert!(table.resolve("r1", json!({"ok": true})));
        assert_eq!(fut.await.unwrap(), json!({"ok": true}));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_reject_settles_future() {
        let table = PendingRequests::new();
        let fut = table.create("r1", Duration::from_secs(5), "test");

        assert!(table.reject("r1", HostError::UnitFailure("boom".into())));
        assert!(matches!(fut.await, Err(HostError::UnitFailure(_))));
    }

    #[tokio::test]
    async fn test_timeout_rejects_within_bound() {
        let table = PendingRequests::new();
        let start = Instant::now();
        let fut = table.create("r1", Duration::from_millis(50), "slow-call");

        let err = fut.await.unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, HostError::Timeout(_)));
        assert!(err.to_string().contains("slow-call"));
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(200), "{elapsed:?}");

        // Entry is gone; settling after timeout is a silent no-op.
        assert!(!table.resolve("r1", json!(1)));
        assert!(!table.reject("r1", HostError::Timeout("x".into())));
    }

    #[tokio::test]
    async fn test_double_settlement_is_noop() {
        let table = PendingRequests::new();
        let fut = table.create("r1", Duration::from_secs(5), "test");

        assert!(table.resolve("r1", json!(1)));
        assert!(!table.resolve("r1", json!(2)));
        assert_eq!(fut.await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_cancel_all_fires_no_results() {
        let table = PendingRequests::new();
        let fut_a = table.create("a", Duration::from_secs(5), "test");
        let fut_b = table.create("b", Duration::from_secs(5), "test");
        assert_eq!(table.len(), 2);

        table.cancel_all();
        assert!(table.is_empty());

        // Futures resolve with a transport error rather than hanging.
        assert!(matches!(fut_a.await, Err(HostError::Transport(_))));
        assert!(matches!(fut_b.await, Err(HostError::Transport(_))));
    }

    #[tokio::test]
    async fn test_fail_all_rejects_with_unit_failure() {
        let table = PendingRequests::new();
        let fut = table.create("a", Duration::from_secs(5), "test");

        table.fail_all("worker exited");
        match fut.await {
            Err(HostError::UnitFailure(msg)) => assert_eq!(msg, "worker exited"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_independent_requests() {
        let table = PendingRequests::new();
        let fut_a = table.create("a", Duration::from_secs(5), "test");
        let fut_b = table.create("b", Duration::from_secs(5), "test");

        assert!(table.resolve("b", json!("b-result")));
        assert!(table.resolve("a", json!("a-result")));
        assert_eq!(fut_a.await.unwrap(), json!("a-result"));
        assert_eq!(fut_b.await.unwrap(), json!("b-result"));
    }
}
