//! Logical write-ahead log: record append, group flush on commit/abort,
//! and committed-only redo recovery.
//!
//! The teacher's WAL (`store.rs::write_page_to_wal`/recovery loop in
//! `open`) is physical — whole dirty pages, keyed by a running CRC over
//! the transaction. `lowkeydb` needs the logical, operation-level format
//! spec §4.6 describes, so the record layer is grounded instead on
//! `other_examples/.../wal.rs`'s `WALEntry`/`recovery_with_instance`:
//! that file's two-pass "collect committed/aborted transaction ids, then
//! replay" shape is kept, simplified from its redo-and-undo scheme down
//! to spec's redo-only-of-committed rule (an aborted transaction's
//! changes were never applied past the buffer pool's dirty pages, which
//! are discarded wholesale on restart, so there is nothing to undo).

mod record;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::{Lsn, TxId};
use crate::error::{Error, Result, WalError};

pub use record::{Record, RecordPayload};

/// Operation replayed into the engine during recovery, stripped of its
/// transaction bookkeeping.
#[derive(Debug, Clone)]
pub enum WalOp {
    Insert { key: Vec<u8>, value: Vec<u8> },
    Update { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryStats {
    pub records_scanned: usize,
    pub ops_replayed: usize,
    pub committed_transactions: usize,
    pub aborted_transactions: usize,
}

struct Inner {
    file: File,
    path: PathBuf,
}

pub struct Wal {
    inner: Mutex<Inner>,
    next_lsn: AtomicU64,
    checkpoint_thread: Mutex<Option<(JoinHandle<()>, Arc<AtomicBool>)>>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Wal {
    pub fn open(path: &Path) -> Result<Wal> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(Wal {
            inner: Mutex::new(Inner {
                file,
                path: path.to_path_buf(),
            }),
            next_lsn: AtomicU64::new(len),
            checkpoint_thread: Mutex::new(None),
        })
    }

    fn append(&self, tx_id: TxId, payload: RecordPayload) -> Result<Lsn> {
        let record = Record {
            lsn: 0,
            tx_id,
            timestamp_millis: now_millis(),
            payload,
        };
        let bytes = record.encode();
        let mut inner = self.inner.lock().unwrap();
        let lsn = self.next_lsn.fetch_add(bytes.len() as u64, Ordering::SeqCst);
        inner.file.seek(SeekFrom::End(0))?;
        inner.file.write_all(&bytes)?;
        Ok(lsn)
    }

    pub fn write_begin(&self, tx_id: TxId) -> Result<Lsn> {
        self.append(tx_id, RecordPayload::Begin)
    }

    /// Commits force a flush: the record must reach disk before the
    /// caller reports the transaction durable.
    pub fn write_commit(&self, tx_id: TxId) -> Result<()> {
        self.append(tx_id, RecordPayload::Commit)?;
        self.flush()
    }

    pub fn write_abort(&self, tx_id: TxId) -> Result<()> {
        self.append(tx_id, RecordPayload::Abort)?;
        self.flush()
    }

    pub fn write_insert(&self, tx_id: TxId, key: &[u8], value: &[u8]) -> Result<Lsn> {
        self.append(
            tx_id,
            RecordPayload::Insert {
                key: key.to_vec(),
                value: value.to_vec(),
            },
        )
    }

    pub fn write_update(&self, tx_id: TxId, key: &[u8], before: &[u8], after: &[u8]) -> Result<Lsn> {
        self.append(
            tx_id,
            RecordPayload::Update {
                key: key.to_vec(),
                before: before.to_vec(),
                after: after.to_vec(),
            },
        )
    }

    pub fn write_delete(&self, tx_id: TxId, key: &[u8], before: &[u8]) -> Result<Lsn> {
        self.append(
            tx_id,
            RecordPayload::Delete {
                key: key.to_vec(),
                before: before.to_vec(),
            },
        )
    }

    pub fn write_checkpoint(&self, active_tx_ids: &[TxId]) -> Result<Lsn> {
        let lsn = self.append(
            0,
            RecordPayload::Checkpoint {
                active_tx_ids: active_tx_ids.to_vec(),
            },
        )?;
        self.flush()?;
        Ok(lsn)
    }

    pub fn flush(&self) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        inner.file.sync_data().map_err(|_| Error::Wal(WalError::FlushFailed))
    }

    pub fn len_bytes(&self) -> Result<u64> {
        Ok(self.inner.lock().unwrap().file.metadata()?.len())
    }

    /// Rotate the log: truncate to empty once its content has been fully
    /// checkpointed into the data file. Mirrors the size-triggered
    /// rotation in the teacher's `commit()` (`db.wal_pos >=
    /// self.conf.checkpoint_interval`), just against byte size instead of
    /// a running write position.
    pub fn rotate(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.file.set_len(0)?;
        inner.file.seek(SeekFrom::Start(0))?;
        self.next_lsn.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Scan the whole log, determine which transactions committed, and
    /// replay only their data records through `apply`. Aborted and
    /// in-flight (never-committed) transactions are skipped entirely.
    pub fn recover(&self, mut apply: impl FnMut(WalOp) -> Result<()>) -> Result<RecoveryStats> {
        let bytes = {
            let mut inner = self.inner.lock().unwrap();
            inner.file.seek(SeekFrom::Start(0))?;
            let mut buf = Vec::new();
            inner.file.read_to_end(&mut buf)?;
            buf
        };

        let mut records = Vec::new();
        let mut pos = 0usize;
        while pos < bytes.len() {
            match Record::decode(&bytes[pos..], pos as Lsn) {
                Ok((record, consumed)) => {
                    records.push(record);
                    pos += consumed;
                }
                Err(_) => break, // torn write at the tail; stop scanning
            }
        }

        let mut committed = std::collections::HashSet::new();
        let mut aborted = std::collections::HashSet::new();
        for record in &records {
            match &record.payload {
                RecordPayload::Commit => {
                    committed.insert(record.tx_id);
                }
                RecordPayload::Abort => {
                    aborted.insert(record.tx_id);
                }
                _ => {}
            }
        }

        let mut stats = RecoveryStats {
            records_scanned: records.len(),
            committed_transactions: committed.len(),
            aborted_transactions: aborted.len(),
            ..Default::default()
        };

        for record in &records {
            if !committed.contains(&record.tx_id) {
                continue;
            }
            let op = match &record.payload {
                RecordPayload::Insert { key, value } => Some(WalOp::Insert {
                    key: key.clone(),
                    value: value.clone(),
                }),
                RecordPayload::Update { key, after, .. } => Some(WalOp::Update {
                    key: key.clone(),
                    value: after.clone(),
                }),
                RecordPayload::Delete { key, .. } => Some(WalOp::Delete { key: key.clone() }),
                _ => None,
            };
            if let Some(op) = op {
                apply(op)?;
                stats.ops_replayed += 1;
            }
        }
        Ok(stats)
    }

    /// Spawn a background thread that calls `checkpoint_fn` every
    /// `interval` until `stop_checkpoint_task` is called.
    pub fn start_checkpoint_task<F>(&self, interval: Duration, checkpoint_fn: F)
    where
        F: Fn() + Send + 'static,
    {
        let mut guard = self.checkpoint_thread.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let handle = std::thread::spawn(move || {
            while !stop_clone.load(Ordering::Relaxed) {
                std::thread::sleep(interval.min(Duration::from_millis(200)));
                if stop_clone.load(Ordering::Relaxed) {
                    break;
                }
                checkpoint_fn();
                let mut remaining = interval.saturating_sub(Duration::from_millis(200));
                while remaining > Duration::ZERO && !stop_clone.load(Ordering::Relaxed) {
                    let step = remaining.min(Duration::from_millis(200));
                    std::thread::sleep(step);
                    remaining = remaining.saturating_sub(step);
                }
            }
        });
        *guard = Some((handle, stop));
    }

    pub fn stop_checkpoint_task(&self) {
        let handle = self.checkpoint_thread.lock().unwrap().take();
        if let Some((handle, stop)) = handle {
            stop.store(true, Ordering::Relaxed);
            let _ = handle.join();
        }
    }

    pub fn path(&self) -> PathBuf {
        self.inner.lock().unwrap().path.clone()
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        self.stop_checkpoint_task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn wal() -> Wal {
        let path = NamedTempFile::new().unwrap().into_temp_path().to_path_buf();
        Wal::open(&path).unwrap()
    }

    #[test]
    fn recovers_only_committed_inserts() {
        let wal = wal();
        wal.write_begin(1).unwrap();
        wal.write_insert(1, b"a", b"1").unwrap();
        wal.write_commit(1).unwrap();

        wal.write_begin(2).unwrap();
        wal.write_insert(2, b"b", b"2").unwrap();
        wal.write_abort(2).unwrap();

        wal.write_begin(3).unwrap();
        wal.write_insert(3, b"c", b"3").unwrap();
        // transaction 3 never commits or aborts: an in-flight crash.

        let mut replayed = Vec::new();
        let stats = wal
            .recover(|op| {
                replayed.push(op);
                Ok(())
            })
            .unwrap();
        assert_eq!(stats.ops_replayed, 1);
        assert_eq!(stats.committed_transactions, 1);
        assert_eq!(stats.aborted_transactions, 1);
        assert_eq!(replayed.len(), 1);
        assert!(matches!(&replayed[0], WalOp::Insert { key, value } if key == b"a" && value == b"1"));
    }

    #[test]
    fn update_replays_the_after_image() {
        let wal = wal();
        wal.write_begin(1).unwrap();
        wal.write_update(1, b"k", b"old", b"new").unwrap();
        wal.write_commit(1).unwrap();

        let mut replayed = Vec::new();
        wal.recover(|op| {
            replayed.push(op);
            Ok(())
        })
        .unwrap();
        assert!(matches!(&replayed[0], WalOp::Update { key, value } if key == b"k" && value == b"new"));
    }

    #[test]
    fn rotate_resets_length_and_lsn() {
        let wal = wal();
        wal.write_begin(1).unwrap();
        assert!(wal.len_bytes().unwrap() > 0);
        wal.rotate().unwrap();
        assert_eq!(wal.len_bytes().unwrap(), 0);
    }

    #[test]
    fn tolerates_torn_tail_write() {
        let wal = wal();
        wal.write_begin(1).unwrap();
        wal.write_insert(1, b"a", b"1").unwrap();
        wal.write_commit(1).unwrap();
        {
            let mut inner = wal.inner.lock().unwrap();
            inner.file.write_all(&[1, 2, 3]).unwrap();
        }
        let stats = wal.recover(|_| Ok(())).unwrap();
        assert_eq!(stats.ops_replayed, 1);
    }
}
