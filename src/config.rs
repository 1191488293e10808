//! Shared constants and primitive aliases, generalized from the teacher's
//! `config.rs` to the fixed 4096-byte page size and tighter key/value
//! bounds this engine specifies.

use std::time::Duration;

/// Page size is fixed; it is also stamped into the header page and
/// validated against this constant on every `open`.
pub const PAGE_SIZE: usize = 4096;

/// Size of the generic per-page header shared by every page kind:
/// kind(1) + flags(1) + checksum(4) + lsn(8) + reserved(10).
pub const PAGE_HEADER_LEN: usize = 24;

pub const MAGIC: &[u8; 8] = b"LOWKYDB\0";
pub const FORMAT_VERSION: u32 = 1;

pub type PageId = u32;
pub type BufferId = u32;
pub type ItemPointer = usize;
pub type Lsn = u64;
pub type TxId = u64;

pub type Key = Vec<u8>;
pub type Value = Vec<u8>;

/// Page 0 is always the header page; an empty tree has root_page = 0 too
/// (0 is never allocated as a data page since the header occupies it).
pub const HEADER_PID: PageId = 0;

/// Separator keys in internal nodes are bounded to keep fanout predictable.
pub const MAX_KEY_LEN: usize = 64;
/// Conservative bound so at least a handful of entries always fit a leaf.
pub const MAX_VALUE_LEN: usize = PAGE_SIZE / 4;

/// Bounded recursion/path depth for B+-tree descent (spec: depth > 20 is
/// treated as corruption, never a legitimate tree shape).
pub const MAX_DESCENT_DEPTH: usize = 20;

/// A leaf/internal node is compacted once this fraction of its data
/// region is dead space from prior removals.
pub const FRAGMENTATION_COMPACT_THRESHOLD: f32 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn tag(self) -> u8 {
        match self {
            IsolationLevel::ReadUncommitted => 3,
            IsolationLevel::ReadCommitted => 0,
            IsolationLevel::RepeatableRead => 1,
            IsolationLevel::Serializable => 2,
        }
    }
}

/// Generalization of the teacher's `StoreConfig`: buffer pool sizing plus
/// the checkpoint/WAL/transaction knobs the full spec requires.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of 4096-byte frames held by the buffer pool.
    pub cache_capacity: usize,
    /// Background checkpoint task wakeup period.
    pub checkpoint_interval: Duration,
    /// WAL size that triggers a checkpoint + rotation.
    pub max_wal_bytes: u64,
    /// Number of rotated WAL segments retained.
    pub max_archived: usize,
    /// Transactions older than this are eligible for `cleanup_timed_out`.
    pub lock_timeout: Duration,
    /// See SPEC_FULL.md §9: promote a WAL recovery failure to a hard
    /// error on `open` instead of continuing in degraded mode.
    pub strict_recovery: bool,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            cache_capacity: 4096,
            checkpoint_interval: Duration::from_secs(30),
            max_wal_bytes: 64 * 1024 * 1024,
            max_archived: 3,
            lock_timeout: Duration::from_millis(5000),
            strict_recovery: false,
        }
    }
}
