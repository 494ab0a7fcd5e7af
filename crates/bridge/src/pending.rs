//! Correlation table for requests awaiting a reply across the boundary.
//!
//! Flow:
//! 1. the caller registers an id and gets a oneshot receiver
//! 2. the frame carrying that id is posted
//! 3. the receive path calls [`PendingTable::complete`] with the reply
//! 4. the caller awaits the receiver or times out
//!
//! Every path that finishes a request removes its entry first, so exactly
//! one outcome is delivered per id and late replies find nothing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::protocol::Message;
use crate::transport::Transport;

pub type Outcome = Result<Value, BridgeError>;

struct PendingEntry {
    sender: oneshot::Sender<Outcome>,
    created_at: Instant,
    label: String,
}

#[derive(Debug, Default)]
pub struct PendingStats {
    pub registered: AtomicU64,
    pub completed: AtomicU64,
    pub timed_out: AtomicU64,
    pub rejected: AtomicU64,
    pub unmatched: AtomicU64,
}

impl PendingStats {
    pub fn snapshot(&self) -> PendingSnapshot {
        PendingSnapshot {
            registered: self.registered.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingSnapshot {
    pub registered: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub rejected: u64,
    pub unmatched: u64,
}

pub struct PendingTable {
    namespace: &'static str,
    entries: DashMap<String, PendingEntry>,
    stats: PendingStats,
}

impl PendingTable {
    pub fn new(namespace: &'static str) -> Self {
        Self {
            namespace,
            entries: DashMap::new(),
            stats: PendingStats::default(),
        }
    }

    /// Registers `id`; an id that is still outstanding is refused.
    pub fn register(&self, id: &str, label: &str) -> Result<oneshot::Receiver<Outcome>, BridgeError> {
        let (sender, receiver) = oneshot::channel();
        match self.entries.entry(id.to_owned()) {
            Entry::Occupied(_) => {
                return Err(BridgeError::protocol(format!(
                    "{} id {id} is already outstanding",
                    self.namespace
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingEntry {
                    sender,
                    created_at: Instant::now(),
                    label: label.to_owned(),
                });
            }
        }
        self.stats.registered.fetch_add(1, Ordering::Relaxed);
        debug!(namespace = self.namespace, id, label, "registered pending request");
        Ok(receiver)
    }

    /// Delivers `outcome` to the waiter for `id`. Returns false when the id
    /// is not pending (already settled, timed out, or never sent).
    pub fn complete(&self, id: &str, outcome: Outcome) -> bool {
        let Some((_, entry)) = self.entries.remove(id) else {
            self.stats.unmatched.fetch_add(1, Ordering::Relaxed);
            debug!(namespace = self.namespace, id, "reply for unknown or expired id");
            return false;
        };
        let failed = outcome.is_err();
        let elapsed_ms = entry.created_at.elapsed().as_millis() as u64;
        if entry.sender.send(outcome).is_err() {
            debug!(namespace = self.namespace, id, label = entry.label, "waiter dropped before reply");
            return false;
        }
        if failed {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.completed.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            namespace = self.namespace,
            id,
            label = entry.label,
            elapsed_ms,
            ok = !failed,
            "settled pending request"
        );
        true
    }

    pub fn resolve(&self, id: &str, value: Value) -> bool {
        self.complete(id, Ok(value))
    }

    pub fn reject(&self, id: &str, error: BridgeError) -> bool {
        self.complete(id, Err(error))
    }

    /// Rejects every outstanding entry. Returns how many waiters were told.
    pub fn reject_all(&self, error: &BridgeError) -> usize {
        let ids: Vec<String> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        ids.iter()
            .filter(|id| self.reject(id, error.clone()))
            .count()
    }

    /// Drops the entry for `id` without notifying anyone.
    pub fn forget(&self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Waits for the outcome of a registered id, bounded by `timeout`.
    pub async fn wait(
        &self,
        id: &str,
        label: &str,
        mut receiver: oneshot::Receiver<Outcome>,
        timeout: Duration,
    ) -> Outcome {
        let started = Instant::now();
        match tokio::time::timeout(timeout, &mut receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BridgeError::unavailable(format!(
                "{} {id} was dropped without a reply",
                self.namespace
            ))),
            Err(_) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                if self.entries.remove(id).is_none() {
                    // Whoever removed the entry sends or drops the sender
                    // without awaiting, so this resolves at once.
                    return match receiver.await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(BridgeError::unavailable(format!(
                            "{} {id} was dropped without a reply",
                            self.namespace
                        ))),
                    };
                }
                self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(namespace = self.namespace, id, label, elapsed_ms, "pending request timed out");
                Err(BridgeError::Timeout {
                    method: label.to_owned(),
                    elapsed_ms,
                })
            }
        }
    }

    /// Registers the message id, posts the frame and waits for the reply.
    pub async fn send(&self, transport: &dyn Transport, message: Message, timeout: Duration) -> Outcome {
        let id = message
            .id()
            .ok_or_else(|| BridgeError::protocol("message carries no correlation id"))?
            .to_owned();
        let label = message.label().to_owned();
        let frame = message.encode()?;
        let receiver = self.register(&id, &label)?;
        let _guard = EntryGuard { table: self, id: &id };
        transport.post(frame).await?;
        self.wait(&id, &label, receiver, timeout).await
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn stats(&self) -> PendingSnapshot {
        self.stats.snapshot()
    }
}

/// Removes the entry when the waiting future finishes or is dropped.
pub(crate) struct EntryGuard<'a> {
    pub(crate) table: &'a PendingTable,
    pub(crate) id: &'a str,
}

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        self.table.forget(self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::protocol::{Method, RpcRequest};
    use crate::transport;

    #[tokio::test]
    async fn register_and_complete() {
        let table = PendingTable::new("rpc");
        let rx = table.register("a", "checkResource").unwrap();
        assert!(table.is_pending("a"));

        assert!(table.resolve("a", json!({"allowed": true})));
        let outcome = table.wait("a", "checkResource", rx, Duration::from_secs(1)).await;
        assert_eq!(outcome.unwrap(), json!({"allowed": true}));
        assert!(table.is_empty());
        assert_eq!(table.stats().completed, 1);
    }

    #[tokio::test]
    async fn duplicate_reply_is_a_no_op() {
        let table = PendingTable::new("rpc");
        let rx = table.register("a", "planResources").unwrap();
        assert!(table.resolve("a", json!(1)));
        assert!(!table.resolve("a", json!(2)));
        assert!(!table.reject("a", BridgeError::Reloaded));
        assert_eq!(rx.await.unwrap().unwrap(), json!(1));
        assert_eq!(table.stats().unmatched, 2);
    }

    #[tokio::test]
    async fn outstanding_id_cannot_be_reused() {
        let table = PendingTable::new("rpc");
        let _rx = table.register("a", "init").unwrap();
        assert!(matches!(table.register("a", "init"), Err(BridgeError::Protocol(_))));
    }

    #[tokio::test]
    async fn timeout_rejects_and_late_reply_is_inert() {
        let table = PendingTable::new("rpc");
        let rx = table.register("slow", "checkResource").unwrap();
        let started = Instant::now();
        let outcome = table.wait("slow", "checkResource", rx, Duration::from_millis(20)).await;
        assert!(started.elapsed() >= Duration::from_millis(20));
        match outcome {
            Err(BridgeError::Timeout { method, elapsed_ms }) => {
                assert_eq!(method, "checkResource");
                assert!(elapsed_ms >= 20);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(!table.is_pending("slow"));
        assert!(!table.resolve("slow", json!(null)));
        assert_eq!(table.stats().timed_out, 1);
    }

    #[tokio::test]
    async fn reply_in_flight_when_timer_fires_wins() {
        let table = Arc::new(PendingTable::new("rpc"));
        let rx = table.register("racy", "checkResource").unwrap();
        // Taken off the table as `complete` does, but delivered after the deadline.
        let (_, entry) = table.entries.remove("racy").unwrap();
        let late = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            entry.sender.send(Ok(json!("late"))).is_ok()
        });
        let outcome = table.wait("racy", "checkResource", rx, Duration::from_millis(10)).await;
        assert_eq!(outcome.unwrap(), json!("late"));
        assert!(late.await.unwrap());
        assert_eq!(table.stats().timed_out, 0);
    }

    #[tokio::test]
    async fn reject_all_settles_every_waiter_once() {
        let table = PendingTable::new("rpc");
        let receivers: Vec<_> = (0..5)
            .map(|i| table.register(&format!("r{i}"), "checkResource").unwrap())
            .collect();
        assert_eq!(table.reject_all(&BridgeError::Reloaded), 5);
        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Err(BridgeError::Reloaded));
        }
        assert_eq!(table.reject_all(&BridgeError::Reloaded), 0);
    }

    #[tokio::test]
    async fn concurrent_out_of_order_replies_settle_exactly_once() {
        let table = Arc::new(PendingTable::new("rpc"));
        let (transport, mut outbox) = transport::channel();
        let transport = Arc::new(transport);

        let mut callers = tokio::task::JoinSet::new();
        for i in 0..50 {
            let table = table.clone();
            let transport = transport.clone();
            callers.spawn(async move {
                let message = Message::RpcRequest(RpcRequest::new(
                    format!("id-{i}"),
                    Method::CheckResource,
                    json!({"n": i}),
                ));
                let outcome = table
                    .send(transport.as_ref(), message, Duration::from_secs(5))
                    .await;
                (i, outcome)
            });
        }

        let mut ids = Vec::new();
        while ids.len() < 50 {
            let frame = outbox.recv().await.unwrap();
            let Some(Message::RpcRequest(request)) = Message::decode(&frame) else {
                panic!("unexpected frame {frame}");
            };
            ids.push((request.id, request.params));
        }
        ids.reverse();
        for (id, params) in &ids {
            assert!(table.resolve(id, params.clone()));
            assert!(!table.resolve(id, json!("again")));
        }

        let mut settled = 0;
        while let Some(joined) = callers.join_next().await {
            let (i, outcome) = joined.unwrap();
            assert_eq!(outcome.unwrap(), json!({"n": i}));
            settled += 1;
        }
        assert_eq!(settled, 50);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn failed_post_removes_the_entry() {
        let table = PendingTable::new("rpc");
        let (transport, outbox) = transport::channel();
        drop(outbox);
        let message = Message::RpcRequest(RpcRequest::new("x", Method::Init, Value::Null));
        let outcome = table.send(&transport, message, Duration::from_secs(1)).await;
        assert!(matches!(outcome, Err(BridgeError::SandboxUnavailable(_))));
        assert!(table.is_empty());
    }
}
