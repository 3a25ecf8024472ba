//! Background resolution of deferred transaction metadata.
//!
//! Two kinds of work keep the read path cheap:
//!
//! - caching the global commit timestamp of a committed nested transaction,
//!   so readers stop walking its parent chain;
//! - rolling back transactions that stopped sending keep-alives.
//!
//! Both are best-effort. A request that cannot be completed is counted and
//! logged, never retried, and never leaves a record half-updated: every
//! change goes through the store's ordinary guarded transitions.

use crate::error::{CoreError, CoreResult};
use crate::txn::{TransactionStore, TxnView, MAX_CHAIN_DEPTH};
use crate::types::{TxnId, TxnState};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Kind of resolution request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolveKind {
    /// Cache the root commit timestamp.
    GlobalCommit,
    /// Roll back a transaction past its keep-alive deadline.
    TimedOut,
}

/// Result of one resolution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The record was updated.
    Resolved,
    /// Nothing to do, or another actor got there first.
    Skipped,
}

struct Request {
    kind: ResolveKind,
    txn_id: TxnId,
    store: Arc<dyn TransactionStore>,
}

#[derive(Debug, Default)]
struct ResolverStats {
    resolved_global_commits: AtomicU64,
    resolved_timeouts: AtomicU64,
    skipped: AtomicU64,
    coalesced: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of resolver counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolverStatsSnapshot {
    /// Global commit timestamps cached.
    pub resolved_global_commits: u64,
    /// Timed-out transactions rolled back.
    pub resolved_timeouts: u64,
    /// Requests that found nothing to do.
    pub skipped: u64,
    /// Asynchronous requests folded into one already queued.
    pub coalesced: u64,
    /// Requests that hit an error.
    pub failed: u64,
}

struct Shared {
    in_flight: Mutex<HashSet<(ResolveKind, TxnId)>>,
    stats: ResolverStats,
}

impl Shared {
    fn run(&self, kind: ResolveKind, store: &dyn TransactionStore, txn_id: TxnId) {
        let outcome = match kind {
            ResolveKind::GlobalCommit => resolve_global_commit(store, txn_id),
            ResolveKind::TimedOut => resolve_timed_out(store, txn_id),
        };
        match outcome {
            Ok(Resolution::Resolved) => {
                let counter = match kind {
                    ResolveKind::GlobalCommit => &self.stats.resolved_global_commits,
                    ResolveKind::TimedOut => &self.stats.resolved_timeouts,
                };
                counter.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Resolution::Skipped) => {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(txn = %txn_id, ?kind, error = %err, "transaction resolution failed");
            }
        }
    }
}

/// Resolves global commit timestamps and timeouts, inline or on a worker.
///
/// Asynchronous requests go to one background thread over a channel. A
/// request for a `(kind, txn)` pair that is already queued is dropped.
/// [`shutdown`](Self::shutdown) stops intake, drains the queue and joins the
/// worker; dropping the resolver does the same.
pub struct TxnResolver {
    sender: Mutex<Option<Sender<Request>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl TxnResolver {
    /// Starts the resolver and its worker thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker thread cannot be spawned.
    pub fn start() -> CoreResult<Self> {
        let shared = Arc::new(Shared {
            in_flight: Mutex::new(HashSet::new()),
            stats: ResolverStats::default(),
        });
        let (sender, receiver) = mpsc::channel::<Request>();
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("sitx-txn-resolver".into())
            .spawn(move || {
                while let Ok(request) = receiver.recv() {
                    worker_shared.run(request.kind, request.store.as_ref(), request.txn_id);
                    worker_shared
                        .in_flight
                        .lock()
                        .remove(&(request.kind, request.txn_id));
                }
            })?;
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            shared,
        })
    }

    /// Caches the root commit timestamp of `txn_id` once its whole parent
    /// chain has committed.
    pub fn resolve_global_commit_timestamp(
        &self,
        store: &Arc<dyn TransactionStore>,
        txn_id: TxnId,
        asynchronous: bool,
    ) {
        self.submit(ResolveKind::GlobalCommit, store, txn_id, asynchronous);
    }

    /// Rolls back `txn_id` if it is still active past its keep-alive deadline.
    pub fn resolve_timed_out(
        &self,
        store: &Arc<dyn TransactionStore>,
        txn_id: TxnId,
        asynchronous: bool,
    ) {
        self.submit(ResolveKind::TimedOut, store, txn_id, asynchronous);
    }

    fn submit(
        &self,
        kind: ResolveKind,
        store: &Arc<dyn TransactionStore>,
        txn_id: TxnId,
        asynchronous: bool,
    ) {
        if !asynchronous {
            self.shared.run(kind, store.as_ref(), txn_id);
            return;
        }
        if !self.shared.in_flight.lock().insert((kind, txn_id)) {
            self.shared.stats.coalesced.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let request = Request {
            kind,
            txn_id,
            store: Arc::clone(store),
        };
        let sent = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(request).is_ok(),
            None => false,
        };
        if !sent {
            self.shared.in_flight.lock().remove(&(kind, txn_id));
            self.shared.stats.skipped.fetch_add(1, Ordering::Relaxed);
            debug!(txn = %txn_id, ?kind, "resolver shut down, request dropped");
        }
    }

    /// Takes a snapshot of the resolver counters.
    #[must_use]
    pub fn stats(&self) -> ResolverStatsSnapshot {
        let stats = &self.shared.stats;
        ResolverStatsSnapshot {
            resolved_global_commits: stats.resolved_global_commits.load(Ordering::Relaxed),
            resolved_timeouts: stats.resolved_timeouts.load(Ordering::Relaxed),
            skipped: stats.skipped.load(Ordering::Relaxed),
            coalesced: stats.coalesced.load(Ordering::Relaxed),
            failed: stats.failed.load(Ordering::Relaxed),
        }
    }

    /// Stops accepting requests, finishes queued ones and joins the worker.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        let sender = self.sender.lock().take();
        if sender.is_none() {
            return;
        }
        drop(sender);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("transaction resolver worker panicked");
            }
        }
        info!("transaction resolver shut down");
    }
}

impl Drop for TxnResolver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn resolve_global_commit(store: &dyn TransactionStore, txn_id: TxnId) -> CoreResult<Resolution> {
    let view = store.get_transaction(txn_id)?;
    if view.state != TxnState::Committed
        || view.parent.is_none()
        || view.global_commit_timestamp.is_some()
    {
        return Ok(Resolution::Skipped);
    }
    let mut current: TxnView = view;
    let mut depth = 0usize;
    while let Some(parent) = current.parent {
        depth += 1;
        if depth > MAX_CHAIN_DEPTH {
            return Err(CoreError::invalid_operation(format!(
                "parent chain of {txn_id} is cyclic or too deep"
            )));
        }
        current = store.get_transaction(parent)?;
        if current.state != TxnState::Committed {
            return Ok(Resolution::Skipped);
        }
    }
    let Some(root_commit) = current.commit_timestamp else {
        return Ok(Resolution::Skipped);
    };
    store.record_global_commit_timestamp(txn_id, root_commit)?;
    Ok(Resolution::Resolved)
}

fn resolve_timed_out(store: &dyn TransactionStore, txn_id: TxnId) -> CoreResult<Resolution> {
    if store.get_state(txn_id)? != TxnState::Active || !store.is_timed_out(txn_id)? {
        return Ok(Resolution::Skipped);
    }
    match store.record_rollback(txn_id) {
        Ok(()) => {
            info!(txn = %txn_id, "rolled back timed-out transaction");
            Ok(Resolution::Resolved)
        }
        Err(err) if err.is_protocol_violation() => {
            debug!(txn = %txn_id, "timed-out transaction committed concurrently");
            Ok(Resolution::Skipped)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::TxnConfig;
    use crate::txn::TxnStore;
    use crate::types::Timestamp;
    use sitx_storage::InMemoryBackend;
    use std::time::Duration;

    fn nested_store() -> Arc<dyn TransactionStore> {
        let store = TxnStore::in_memory(TxnConfig::default());
        store
            .record_transaction(&TxnView::new(TxnId(1), Timestamp(1)))
            .unwrap();
        store
            .record_transaction(&TxnView::new(TxnId(2), Timestamp(2)).with_parent(TxnId(1)))
            .unwrap();
        store
            .record_transaction(&TxnView::new(TxnId(3), Timestamp(3)).with_parent(TxnId(2)))
            .unwrap();
        Arc::new(store)
    }

    #[test]
    fn cyclic_parent_links_fail_instead_of_spinning() {
        let store = TxnStore::in_memory(TxnConfig::default());
        store
            .record_transaction(&TxnView::new(TxnId(1), Timestamp(1)).with_parent(TxnId(2)))
            .unwrap();
        store
            .record_transaction(&TxnView::new(TxnId(2), Timestamp(2)).with_parent(TxnId(1)))
            .unwrap();
        store.record_commit(TxnId(1), Timestamp(3)).unwrap();
        store.record_commit(TxnId(2), Timestamp(4)).unwrap();
        let store: Arc<dyn TransactionStore> = Arc::new(store);

        let resolver = TxnResolver::start().unwrap();
        resolver.resolve_global_commit_timestamp(&store, TxnId(1), false);
        resolver.resolve_global_commit_timestamp(&store, TxnId(2), true);
        resolver.shutdown();

        assert_eq!(resolver.stats().failed, 2);
        assert_eq!(
            store.get_transaction(TxnId(1)).unwrap().global_commit_timestamp,
            None
        );
    }

    #[test]
    fn caches_root_commit_timestamp_once_chain_commits() {
        let store = nested_store();
        let resolver = TxnResolver::start().unwrap();

        store.record_commit(TxnId(3), Timestamp(4)).unwrap();
        store.record_commit(TxnId(2), Timestamp(5)).unwrap();
        resolver.resolve_global_commit_timestamp(&store, TxnId(3), false);
        assert_eq!(
            store.get_transaction(TxnId(3)).unwrap().global_commit_timestamp,
            None
        );

        store.record_commit(TxnId(1), Timestamp(6)).unwrap();
        resolver.resolve_global_commit_timestamp(&store, TxnId(3), false);
        resolver.resolve_global_commit_timestamp(&store, TxnId(3), false);
        assert_eq!(
            store.get_transaction(TxnId(3)).unwrap().global_commit_timestamp,
            Some(Timestamp(6))
        );

        let stats = resolver.stats();
        assert_eq!(stats.resolved_global_commits, 1);
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.failed, 0);
    }

    #[test]
    fn async_requests_drain_on_shutdown() {
        let store = nested_store();
        store.record_commit(TxnId(3), Timestamp(4)).unwrap();
        store.record_commit(TxnId(2), Timestamp(5)).unwrap();
        store.record_commit(TxnId(1), Timestamp(6)).unwrap();

        let resolver = TxnResolver::start().unwrap();
        resolver.resolve_global_commit_timestamp(&store, TxnId(3), true);
        resolver.resolve_global_commit_timestamp(&store, TxnId(2), true);
        resolver.shutdown();

        assert_eq!(
            store.get_transaction(TxnId(2)).unwrap().global_commit_timestamp,
            Some(Timestamp(6))
        );
        assert_eq!(
            store.get_transaction(TxnId(3)).unwrap().global_commit_timestamp,
            Some(Timestamp(6))
        );

        resolver.resolve_global_commit_timestamp(&store, TxnId(3), true);
        let stats = resolver.stats();
        assert_eq!(stats.resolved_global_commits, 2);
        assert_eq!(stats.skipped, 1);
        resolver.shutdown();
    }

    #[test]
    fn timed_out_transaction_is_rolled_back() {
        let clock = Arc::new(ManualClock::new(0));
        let config = TxnConfig::default().transaction_timeout(Duration::from_millis(10));
        let store: Arc<dyn TransactionStore> = Arc::new(
            TxnStore::open_with_clock(Box::new(InMemoryBackend::new()), config, clock.clone())
                .unwrap(),
        );
        store
            .record_transaction(&TxnView::new(TxnId(1), Timestamp(1)))
            .unwrap();
        store
            .record_transaction(&TxnView::new(TxnId(2), Timestamp(2)))
            .unwrap();
        let resolver = TxnResolver::start().unwrap();

        resolver.resolve_timed_out(&store, TxnId(1), false);
        assert_eq!(store.get_state(TxnId(1)).unwrap(), TxnState::Active);

        clock.advance(11);
        store.record_commit(TxnId(2), Timestamp(3)).unwrap();
        resolver.resolve_timed_out(&store, TxnId(1), false);
        resolver.resolve_timed_out(&store, TxnId(2), false);
        assert_eq!(store.get_state(TxnId(1)).unwrap(), TxnState::RolledBack);
        assert_eq!(store.get_state(TxnId(2)).unwrap(), TxnState::Committed);

        let stats = resolver.stats();
        assert_eq!(stats.resolved_timeouts, 1);
        assert_eq!(stats.skipped, 2);
    }

    #[test]
    fn unknown_transaction_counts_as_failure() {
        let store = nested_store();
        let resolver = TxnResolver::start().unwrap();
        resolver.resolve_global_commit_timestamp(&store, TxnId(99), false);
        assert_eq!(resolver.stats().failed, 1);
    }
}
