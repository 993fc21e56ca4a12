//! The write transaction cache.
//!
//! Writes are asynchronous: accepting one creates a transaction the
//! caller polls until it reaches `DONE`. The cache owns every live
//! transaction, hands out shared references (mutations are visible
//! through any outstanding reference), and evicts entries once their
//! TTL elapses. An expired transaction is indistinguishable from one
//! that never existed.

use chrono::{DateTime, Utc};
use manifold_api::types::transaction::{State, Status, Transaction as Snapshot};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

struct Inner {
    status: Status,
    state: State,
    updated: DateTime<Utc>,
    message: String,
}

/// A live write transaction. The status only ever advances
/// (`UNKNOWN → PENDING → WRITING → DONE`) and the state flips at
/// most once, from `OK` to `ERROR`.
pub struct Transaction {
    id: String,
    created: DateTime<Utc>,
    inner: Mutex<Inner>,
}

impl Transaction {
    fn new() -> Transaction {
        let now = Utc::now();

        Transaction {
            id: Uuid::new_v4().as_simple().to_string(),
            created: now,
            inner: Mutex::new(Inner {
                status: Status::Unknown,
                state: State::Ok,
                updated: now,
                message: String::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The current point-in-time view, as the RPC surface returns
    /// it.
    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock().unwrap();

        Snapshot {
            id: self.id.clone(),
            status: inner.status,
            state: inner.state,
            created: self.created,
            updated: inner.updated,
            message: inner.message.clone(),
        }
    }

    // Advances the status. A stale caller can't move a transaction
    // backwards.

    fn advance(&self, status: Status) {
        let mut inner = self.inner.lock().unwrap();

        if status > inner.status {
            inner.status = status;
            inner.updated = Utc::now()
        }
    }

    pub fn set_status_pending(&self) {
        self.advance(Status::Pending)
    }

    pub fn set_status_writing(&self) {
        self.advance(Status::Writing)
    }

    pub fn set_status_done(&self) {
        self.advance(Status::Done)
    }

    /// Marks the transaction failed and records why. The state never
    /// returns to `OK` afterwards.
    pub fn set_state_error(&self, message: &str) {
        let mut inner = self.inner.lock().unwrap();

        inner.state = State::Error;
        inner.message = message.into();
        inner.updated = Utc::now()
    }
}

/// TTL cache of live transactions, owned by the plugin. Operations
/// take one short lock; nothing handler-paced happens under it.
pub struct Cache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Arc<Transaction>, Instant)>>,
}

impl Cache {
    pub fn new(ttl: Duration) -> Cache {
        Cache {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates a transaction with a fresh opaque id, status
    /// `UNKNOWN`, and state `OK`.
    pub fn create(&self) -> Arc<Transaction> {
        let txn = Arc::new(Transaction::new());
        let expires = Instant::now() + self.ttl;

        self.entries
            .lock()
            .unwrap()
            .insert(txn.id.clone(), (txn.clone(), expires));
        txn
    }

    /// Returns the live transaction, or `None` for an unknown or
    /// expired id. Expired entries encountered here are dropped
    /// immediately rather than waiting for the sweeper.
    pub fn get(&self, id: &str) -> Option<Arc<Transaction>> {
        let mut entries = self.entries.lock().unwrap();

        match entries.get(id) {
            Some((_, expires)) if *expires <= Instant::now() => {
                entries.remove(id);
                None
            }
            Some((txn, _)) => Some(txn.clone()),
            None => None,
        }
    }

    /// Ids of every unexpired transaction.
    pub fn ids(&self) -> Vec<String> {
        let now = Instant::now();
        let mut ids: Vec<String> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, (_, expires))| *expires > now)
            .map(|(id, _)| id.clone())
            .collect();

        ids.sort();
        ids
    }

    /// Drops every expired entry.
    pub fn prune(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();

        entries.retain(|_, (_, expires)| *expires > now);

        let dropped = before - entries.len();

        if dropped > 0 {
            debug!(dropped, "pruned expired transactions")
        }
    }

    /// Periodic sweep, run as a background task for the life of the
    /// plugin. The interval is twice the TTL; `get` already drops
    /// expired entries it touches, so the sweep only has to bound
    /// the memory of never-polled transactions.
    pub async fn run_cleanup(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.ttl * 2);

        interval.set_missed_tick_behavior(
            tokio::time::MissedTickBehavior::Delay,
        );
        loop {
            interval.tick().await;
            self.prune()
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_defaults() {
        let cache = Cache::new(Duration::from_secs(300));
        let txn = cache.create();
        let snap = txn.snapshot();

        assert!(!snap.id.is_empty());
        assert_eq!(snap.status, Status::Unknown);
        assert_eq!(snap.state, State::Ok);
        assert_eq!(snap.created, snap.updated);
        assert!(snap.message.is_empty());

        // Ids are unique.

        assert_ne!(cache.create().id(), txn.id());
    }

    #[test]
    fn test_get_returns_live_reference() {
        let cache = Cache::new(Duration::from_secs(300));
        let txn = cache.create();

        txn.set_status_pending();

        // The mutation is visible through a separately fetched
        // reference; entries are shared, not copied.

        let fetched = cache.get(txn.id()).unwrap();

        assert_eq!(fetched.snapshot().status, Status::Pending);
        assert!(cache.get("no-such-transaction").is_none());
    }

    #[test]
    fn test_status_monotonic() {
        let txn = Transaction::new();

        txn.set_status_pending();
        txn.set_status_writing();
        assert_eq!(txn.snapshot().status, Status::Writing);

        // A stale transition can't move the status backwards.

        txn.set_status_pending();
        assert_eq!(txn.snapshot().status, Status::Writing);

        txn.set_status_done();
        assert_eq!(txn.snapshot().status, Status::Done);
        txn.set_status_writing();
        assert_eq!(txn.snapshot().status, Status::Done);
    }

    #[test]
    fn test_error_state() {
        let txn = Transaction::new();

        txn.set_status_done();
        txn.set_state_error("write timeout");

        let snap = txn.snapshot();

        assert_eq!(snap.state, State::Error);
        assert_eq!(snap.message, "write timeout");
        assert!(snap.updated >= snap.created);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache = Cache::new(Duration::from_secs(300));
        let txn = cache.create();

        assert!(cache.get(txn.id()).is_some());

        tokio::time::advance(Duration::from_secs(301)).await;

        // Expired entries read as missing and are dropped on touch.

        assert!(cache.get(txn.id()).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_and_ids() {
        let cache = Cache::new(Duration::from_secs(300));
        let old = cache.create();

        tokio::time::advance(Duration::from_secs(200)).await;

        let young = cache.create();

        assert_eq!(cache.ids().len(), 2);

        tokio::time::advance(Duration::from_secs(150)).await;

        // Only the older entry has crossed its TTL.

        assert_eq!(cache.ids(), vec![young.id().to_string()]);

        cache.prune();
        assert_eq!(cache.len(), 1);
        assert!(cache.get(old.id()).is_none());
        assert!(cache.get(young.id()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_sweeps() {
        let cache = Arc::new(Cache::new(Duration::from_secs(10)));
        let sweeper = tokio::spawn(cache.clone().run_cleanup());

        cache.create();
        tokio::time::advance(Duration::from_secs(25)).await;
        tokio::task::yield_now().await;

        assert_eq!(cache.len(), 0);
        sweeper.abort();
    }
}
