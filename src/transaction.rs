//! Multi-transaction bookkeeping: isolation level tagging, undo logging,
//! and timeout-based cleanup.
//!
//! The teacher's `Transaction` (above, in this file before the rewrite)
//! is an RAII wrapper around one global `RwLockWriteGuard<Database>` with
//! rollback-on-drop; only one write transaction can exist at a time and
//! `rollback` works by throwing away buffered dirty pages wholesale.
//! `lowkeydb` supports several concurrently open transactions, so rollback
//! instead needs a real undo log per transaction: each mutation recorded
//! here as an `UndoEntry`, replayed LIFO by the engine on abort. The
//! drop-triggers-rollback idiom itself is kept for the implicit
//! transaction the non-transactional `put`/`delete` API opens internally
//! (see SPEC_FULL.md §9).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::{IsolationLevel, Key, TxId, Value};
use crate::error::{Error, Result, TransactionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Active,
    Committed,
    Aborted,
}

#[derive(Debug, Clone)]
pub enum UndoOp {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct UndoEntry {
    pub op: UndoOp,
    pub key: Key,
    pub old_value: Option<Value>,
}

struct TxState {
    isolation: IsolationLevel,
    status: TxStatus,
    started_at: Instant,
    undo_log: Vec<UndoEntry>,
}

pub struct TransactionManager {
    table: Mutex<HashMap<TxId, TxState>>,
    next_id: AtomicU64,
    lock_timeout: Duration,
}

impl TransactionManager {
    pub fn new(lock_timeout: Duration) -> TransactionManager {
        TransactionManager {
            table: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            lock_timeout,
        }
    }

    pub fn begin(&self, isolation: IsolationLevel) -> TxId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.table.lock().unwrap().insert(
            id,
            TxState {
                isolation,
                status: TxStatus::Active,
                started_at: Instant::now(),
                undo_log: Vec::new(),
            },
        );
        id
    }

    fn with_active<T>(&self, tx_id: TxId, f: impl FnOnce(&mut TxState) -> T) -> Result<T> {
        let mut table = self.table.lock().unwrap();
        let state = table
            .get_mut(&tx_id)
            .ok_or(Error::Transaction(TransactionError::NotFound(tx_id)))?;
        if state.status != TxStatus::Active {
            return Err(Error::Transaction(TransactionError::NotActive(tx_id)));
        }
        Ok(f(state))
    }

    pub fn isolation_of(&self, tx_id: TxId) -> Result<IsolationLevel> {
        self.with_active(tx_id, |s| s.isolation)
    }

    /// Record the inverse of a mutation so `abort` can undo it in LIFO
    /// order. `old_value = None` means the key did not exist before
    /// (the undo is a delete); `Some` means it existed (the undo is a
    /// put of the prior value).
    pub fn record_undo(&self, tx_id: TxId, key: &[u8], old_value: Option<Value>) -> Result<()> {
        self.with_active(tx_id, |s| {
            let op = match &old_value {
                None => UndoOp::Insert,
                Some(_) => UndoOp::Update,
            };
            s.undo_log.push(UndoEntry {
                op,
                key: key.to_vec(),
                old_value,
            });
        })
    }

    pub fn record_undo_delete(&self, tx_id: TxId, key: &[u8], old_value: Value) -> Result<()> {
        self.with_active(tx_id, |s| {
            s.undo_log.push(UndoEntry {
                op: UndoOp::Delete,
                key: key.to_vec(),
                old_value: Some(old_value),
            });
        })
    }

    /// Mark `tx_id` committed and drop its bookkeeping. The WAL commit
    /// record must already be durable by the time this is called.
    pub fn commit(&self, tx_id: TxId) -> Result<()> {
        let mut table = self.table.lock().unwrap();
        let state = table
            .get_mut(&tx_id)
            .ok_or(Error::Transaction(TransactionError::NotFound(tx_id)))?;
        if state.status != TxStatus::Active {
            return Err(Error::Transaction(TransactionError::NotActive(tx_id)));
        }
        table.remove(&tx_id);
        Ok(())
    }

    /// Mark `tx_id` aborted and return its undo log, oldest-first. The
    /// caller replays it in reverse (LIFO) against the B+-tree.
    pub fn abort(&self, tx_id: TxId) -> Result<Vec<UndoEntry>> {
        let mut table = self.table.lock().unwrap();
        let state = table
            .remove(&tx_id)
            .ok_or(Error::Transaction(TransactionError::NotFound(tx_id)))?;
        Ok(state.undo_log)
    }

    pub fn is_active(&self, tx_id: TxId) -> bool {
        matches!(
            self.table.lock().unwrap().get(&tx_id),
            Some(s) if s.status == TxStatus::Active
        )
    }

    /// Transactions whose age exceeds `lock_timeout`, forcibly aborted.
    /// Returns `(tx_id, undo_log)` pairs so the caller can replay the
    /// rollback before the transaction table forgets them.
    pub fn cleanup_timed_out(&self) -> Vec<(TxId, Vec<UndoEntry>)> {
        let mut table = self.table.lock().unwrap();
        let now = Instant::now();
        let timed_out: Vec<TxId> = table
            .iter()
            .filter(|(_, s)| s.status == TxStatus::Active && now.duration_since(s.started_at) > self.lock_timeout)
            .map(|(id, _)| *id)
            .collect();
        timed_out
            .into_iter()
            .map(|id| {
                let state = table.remove(&id).unwrap();
                (id, state.undo_log)
            })
            .collect()
    }

    pub fn active_tx_ids(&self) -> Vec<TxId> {
        self.table
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| s.status == TxStatus::Active)
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_commit_removes_bookkeeping() {
        let mgr = TransactionManager::new(Duration::from_secs(60));
        let tx = mgr.begin(IsolationLevel::ReadCommitted);
        assert!(mgr.is_active(tx));
        mgr.commit(tx).unwrap();
        assert!(!mgr.is_active(tx));
        assert!(matches!(
            mgr.commit(tx),
            Err(Error::Transaction(TransactionError::NotFound(_)))
        ));
    }

    #[test]
    fn abort_returns_undo_log_oldest_first() {
        let mgr = TransactionManager::new(Duration::from_secs(60));
        let tx = mgr.begin(IsolationLevel::Serializable);
        mgr.record_undo(tx, b"a", None).unwrap();
        mgr.record_undo(tx, b"b", Some(b"old".to_vec())).unwrap();
        mgr.record_undo_delete(tx, b"c", b"gone".to_vec()).unwrap();

        let undo = mgr.abort(tx).unwrap();
        assert_eq!(undo.len(), 3);
        assert!(matches!(undo[0].op, UndoOp::Insert));
        assert_eq!(undo[0].key, b"a");
        assert!(matches!(undo[1].op, UndoOp::Update));
        assert_eq!(undo[1].old_value, Some(b"old".to_vec()));
        assert!(matches!(undo[2].op, UndoOp::Delete));
        assert_eq!(undo[2].old_value, Some(b"gone".to_vec()));
        assert!(!mgr.is_active(tx));
    }

    #[test]
    fn operations_on_unknown_tx_fail() {
        let mgr = TransactionManager::new(Duration::from_secs(60));
        assert!(matches!(
            mgr.record_undo(999, b"x", None),
            Err(Error::Transaction(TransactionError::NotFound(999)))
        ));
    }

    #[test]
    fn cleanup_timed_out_forcibly_aborts_old_transactions() {
        let mgr = TransactionManager::new(Duration::from_millis(1));
        let tx = mgr.begin(IsolationLevel::ReadCommitted);
        mgr.record_undo(tx, b"k", None).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let timed_out = mgr.cleanup_timed_out();
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].0, tx);
        assert!(!mgr.is_active(tx));
    }
}
