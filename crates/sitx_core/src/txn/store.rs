//! Single-partition transaction store.

use crate::clock::{Clock, SystemClock};
use crate::config::TxnConfig;
use crate::error::{CoreError, CoreResult};
use crate::stats::{TxnStats, TxnStatsSnapshot};
use crate::txn::log::{TxnLog, TxnLogRecord};
use crate::txn::view::TxnView;
use crate::txn::TransactionStore;
use crate::types::{Timestamp, TxnId, TxnState};
use parking_lot::RwLock;
use sitx_storage::{InMemoryBackend, StorageBackend};
use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct TxnRecord {
    view: TxnView,
    last_keep_alive: u64,
}

#[derive(Default)]
struct StoreState {
    records: HashMap<TxnId, TxnRecord>,
    by_begin: BTreeSet<(Timestamp, TxnId)>,
}

impl StoreState {
    fn record_mut(&mut self, txn_id: TxnId) -> CoreResult<&mut TxnRecord> {
        self.records
            .get_mut(&txn_id)
            .ok_or(CoreError::NotFound { txn_id })
    }

    fn apply(&mut self, record: TxnLogRecord) -> CoreResult<()> {
        match record {
            TxnLogRecord::Begin { view, keep_alive } => {
                self.by_begin.insert((view.begin_timestamp, view.txn_id));
                self.records.insert(
                    view.txn_id,
                    TxnRecord {
                        view,
                        last_keep_alive: keep_alive,
                    },
                );
            }
            TxnLogRecord::Commit {
                txn_id,
                commit_timestamp,
            } => {
                let record = self.record_mut(txn_id)?;
                record.view.state = TxnState::Committed;
                record.view.commit_timestamp = Some(commit_timestamp);
            }
            TxnLogRecord::Rollback { txn_id } => {
                self.record_mut(txn_id)?.view.state = TxnState::RolledBack;
            }
            TxnLogRecord::GlobalCommit {
                txn_id,
                global_commit_timestamp,
            } => {
                self.record_mut(txn_id)?.view.global_commit_timestamp =
                    Some(global_commit_timestamp);
            }
            TxnLogRecord::KeepAlive { txn_id, at } => {
                self.record_mut(txn_id)?.last_keep_alive = at;
            }
        }
        Ok(())
    }
}

/// One partition of the transaction table.
///
/// Records live in memory behind a single lock; every change is written to
/// the [`TxnLog`] while that lock is held, so the log order is the order in
/// which changes became visible. Opening a store over an existing backend
/// replays the log.
pub struct TxnStore {
    state: RwLock<StoreState>,
    log: TxnLog,
    config: TxnConfig,
    clock: Arc<dyn Clock>,
    stats: TxnStats,
}

impl TxnStore {
    /// Creates an empty store logging to memory.
    #[must_use]
    pub fn in_memory(config: TxnConfig) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            log: TxnLog::new(Box::new(InMemoryBackend::new()), config.sync_on_commit),
            config,
            clock: Arc::new(SystemClock),
            stats: TxnStats::new(),
        }
    }

    /// Opens a store over `backend`, replaying any records it holds.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is corrupted or refers to unknown ids.
    pub fn open(backend: Box<dyn StorageBackend>, config: TxnConfig) -> CoreResult<Self> {
        Self::open_with_clock(backend, config, Arc::new(SystemClock))
    }

    /// Opens a store with an explicit keep-alive clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is corrupted or refers to unknown ids.
    pub fn open_with_clock(
        backend: Box<dyn StorageBackend>,
        config: TxnConfig,
        clock: Arc<dyn Clock>,
    ) -> CoreResult<Self> {
        let log = TxnLog::new(backend, config.sync_on_commit);
        let mut state = StoreState::default();
        let records = log.recover()?;
        let replayed = records.len() as u64;
        for (_, record) in records {
            state.apply(record)?;
        }
        let stats = TxnStats::new();
        stats.record_replayed(replayed);
        if replayed > 0 {
            info!(
                records = replayed,
                transactions = state.records.len(),
                "replayed transaction log"
            );
        }
        Ok(Self {
            state: RwLock::new(state),
            log,
            config,
            clock,
            stats,
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &TxnConfig {
        &self.config
    }

    /// Takes a snapshot of the store's counters.
    #[must_use]
    pub fn stats(&self) -> TxnStatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of records held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    /// Returns true if no records are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flushes the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend flush fails.
    pub fn flush(&self) -> CoreResult<()> {
        self.log.flush()
    }

    /// Consumes the store and returns its log backend, for reopening.
    pub fn into_backend(self) -> Box<dyn StorageBackend> {
        self.log.into_backend()
    }

    /// Active entries in `[min_begin, max_begin)` as `(begin, id)` pairs.
    pub(crate) fn active_entries(
        &self,
        min_begin: Timestamp,
        max_begin: Timestamp,
        table: Option<&str>,
    ) -> Vec<(Timestamp, TxnId)> {
        if min_begin >= max_begin {
            return Vec::new();
        }
        let state = self.state.read();
        state
            .by_begin
            .range((
                Bound::Included((min_begin, TxnId(0))),
                Bound::Excluded((max_begin, TxnId(0))),
            ))
            .filter(|(_, id)| {
                state.records.get(id).is_some_and(|r| {
                    r.view.is_active() && table.map_or(true, |t| r.view.writes_to(t))
                })
            })
            .copied()
            .collect()
    }

    fn violation(&self, err: CoreError) -> CoreError {
        self.stats.record_protocol_violation();
        warn!(error = %err, "transaction protocol violation");
        err
    }
}

impl TransactionStore for TxnStore {
    fn record_transaction(&self, txn: &TxnView) -> CoreResult<()> {
        if !txn.is_active() || txn.commit_timestamp.is_some() {
            return Err(CoreError::invalid_operation(format!(
                "{} must be recorded as a fresh active transaction",
                txn.txn_id
            )));
        }
        let mut state = self.state.write();
        if state.records.contains_key(&txn.txn_id) {
            return Err(self.violation(CoreError::AlreadyExists { txn_id: txn.txn_id }));
        }
        let mut view = txn.clone();
        view.global_commit_timestamp = None;
        let record = TxnLogRecord::Begin {
            view,
            keep_alive: self.clock.now_millis(),
        };
        self.log.append(&record)?;
        state.apply(record)?;
        self.stats.record_begin();
        debug!(txn = %txn.txn_id, begin = %txn.begin_timestamp, parent = ?txn.parent, "recorded transaction");
        Ok(())
    }

    fn record_commit(&self, txn_id: TxnId, commit_timestamp: Timestamp) -> CoreResult<()> {
        let mut state = self.state.write();
        let record = state.record_mut(txn_id)?;
        match record.view.state {
            TxnState::Active => {}
            TxnState::Committed if record.view.commit_timestamp == Some(commit_timestamp) => {
                debug!(txn = %txn_id, "duplicate commit ignored");
                return Ok(());
            }
            from => {
                return Err(self.violation(CoreError::invalid_transition(
                    txn_id,
                    from,
                    TxnState::Committed,
                )))
            }
        }
        if commit_timestamp < record.view.begin_timestamp {
            return Err(CoreError::invalid_operation(format!(
                "{txn_id} cannot commit at {commit_timestamp}, before its begin {}",
                record.view.begin_timestamp
            )));
        }
        let record = TxnLogRecord::Commit {
            txn_id,
            commit_timestamp,
        };
        self.log.append(&record)?;
        state.apply(record)?;
        self.stats.record_commit();
        debug!(txn = %txn_id, commit = %commit_timestamp, "committed");
        Ok(())
    }

    fn record_rollback(&self, txn_id: TxnId) -> CoreResult<()> {
        let mut state = self.state.write();
        match state.record_mut(txn_id)?.view.state {
            TxnState::Active => {}
            TxnState::RolledBack => {
                debug!(txn = %txn_id, "duplicate rollback ignored");
                return Ok(());
            }
            from => {
                return Err(self.violation(CoreError::invalid_transition(
                    txn_id,
                    from,
                    TxnState::RolledBack,
                )))
            }
        }
        let record = TxnLogRecord::Rollback { txn_id };
        self.log.append(&record)?;
        state.apply(record)?;
        self.stats.record_rollback();
        debug!(txn = %txn_id, "rolled back");
        Ok(())
    }

    fn record_global_commit_timestamp(
        &self,
        txn_id: TxnId,
        global_commit_timestamp: Timestamp,
    ) -> CoreResult<()> {
        let mut state = self.state.write();
        let view = &state.record_mut(txn_id)?.view;
        if view.state != TxnState::Committed {
            return Err(CoreError::invalid_operation(format!(
                "{txn_id} is {}, only committed transactions have a global commit timestamp",
                view.state
            )));
        }
        match view.global_commit_timestamp {
            Some(existing) if existing == global_commit_timestamp => return Ok(()),
            Some(existing) => {
                return Err(self.violation(CoreError::ConflictingTimestamp {
                    txn_id,
                    field: "global commit timestamp",
                    existing,
                    requested: global_commit_timestamp,
                }))
            }
            None => {}
        }
        let record = TxnLogRecord::GlobalCommit {
            txn_id,
            global_commit_timestamp,
        };
        self.log.append(&record)?;
        state.apply(record)?;
        self.stats.record_global_commit();
        debug!(txn = %txn_id, global_commit = %global_commit_timestamp, "cached global commit timestamp");
        Ok(())
    }

    fn record_keep_alive(&self, txn_id: TxnId) -> CoreResult<bool> {
        let mut state = self.state.write();
        if state.record_mut(txn_id)?.view.state.is_terminal() {
            return Ok(false);
        }
        let record = TxnLogRecord::KeepAlive {
            txn_id,
            at: self.clock.now_millis(),
        };
        self.log.append(&record)?;
        state.apply(record)?;
        self.stats.record_keep_alive();
        Ok(true)
    }

    fn get_transaction(&self, txn_id: TxnId) -> CoreResult<TxnView> {
        self.state
            .read()
            .records
            .get(&txn_id)
            .map(|r| r.view.clone())
            .ok_or(CoreError::NotFound { txn_id })
    }

    fn get_active_txn_ids(
        &self,
        min_begin: Timestamp,
        max_begin: Timestamp,
        table: Option<&str>,
    ) -> CoreResult<Vec<TxnId>> {
        Ok(self
            .active_entries(min_begin, max_begin, table)
            .into_iter()
            .map(|(_, id)| id)
            .collect())
    }

    fn is_timed_out(&self, txn_id: TxnId) -> CoreResult<bool> {
        let state = self.state.read();
        let record = state
            .records
            .get(&txn_id)
            .ok_or(CoreError::NotFound { txn_id })?;
        if !record.view.is_active() {
            return Ok(false);
        }
        let idle = self
            .clock
            .now_millis()
            .saturating_sub(record.last_keep_alive);
        Ok(idle > self.config.timeout_millis())
    }
}
