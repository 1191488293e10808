//! Fixed-capacity page cache with LRU eviction.
//!
//! Generalizes the teacher's `BufferManager` (`buffer_manager.rs`) plus
//! the I/O paths `Store::get_page`/`new_page` perform around it
//! (`store.rs`). The teacher keeps one mutex over the hash table and LRU
//! list together "to avoid the well-known deadlock trap of a separate LRU
//! lock ordered inconsistently with the map lock" — this is kept
//! verbatim as the concurrency pattern. Per-page content now lives behind
//! each frame's own `PageLatch` instead of a parallel `Vec<RwLock<PageData>>`,
//! so `flush`/eviction write-back and `get_shared`/`get_exclusive` share a
//! single lock per page rather than coordinating two.
//!
//! Spec §5 names "the synchronous file I/O paths for read-through,
//! eviction write-back, and WAL flush" as blocking points alongside the
//! buffer pool mutex itself — i.e. holding the pool mutex across a page's
//! disk I/O is the documented concurrency model, not an oversight, so
//! `get_frame` below does exactly that instead of the teacher's
//! busy/wait-condvar dance for dropping the lock around reads.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::config::{BufferId, PageId, PAGE_SIZE};
use crate::error::{Error, OperationError, Result};
use crate::latch::{ExclusiveGuard, PageLatch, SharedGuard};
use crate::page::{Page, PageKind};

const NIL: BufferId = 0;

#[derive(Debug, Clone, Copy, PartialEq)]
enum AccessMode {
    Read,
    Write,
    /// The caller is about to overwrite the whole page (new allocation);
    /// skip the read-through entirely.
    Overwrite,
}

struct FrameMeta {
    pid: PageId,
    loaded: bool,
    prev: BufferId,
    next: BufferId,
    collision: BufferId,
}

impl FrameMeta {
    fn empty() -> FrameMeta {
        FrameMeta {
            pid: 0,
            loaded: false,
            prev: NIL,
            next: NIL,
            collision: NIL,
        }
    }
}

struct Inner {
    meta: Vec<FrameMeta>,
    hash_table: Vec<BufferId>,
    head: BufferId, // MRU end
    tail: BufferId, // LRU end
    free_list: BufferId,
    file: Option<File>,
}

impl Inner {
    fn hash(&self, pid: PageId) -> usize {
        pid as usize % self.hash_table.len()
    }

    fn find(&self, pid: PageId) -> Option<BufferId> {
        let mut h = self.hash_table[self.hash(pid)];
        while h != NIL {
            if self.meta[h as usize].pid == pid {
                return Some(h);
            }
            h = self.meta[h as usize].collision;
        }
        None
    }

    fn hash_insert(&mut self, id: BufferId) {
        let h = self.hash(self.meta[id as usize].pid);
        self.meta[id as usize].collision = self.hash_table[h];
        self.hash_table[h] = id;
    }

    fn hash_remove(&mut self, id: BufferId) {
        let h = self.hash(self.meta[id as usize].pid);
        let mut p = self.hash_table[h];
        if p == id {
            self.hash_table[h] = self.meta[id as usize].collision;
            return;
        }
        while self.meta[p as usize].collision != id {
            p = self.meta[p as usize].collision;
        }
        self.meta[p as usize].collision = self.meta[id as usize].collision;
    }

    fn lru_unlink(&mut self, id: BufferId) {
        let prev = self.meta[id as usize].prev;
        let next = self.meta[id as usize].next;
        if prev != NIL {
            self.meta[prev as usize].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.meta[next as usize].prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn lru_push_head(&mut self, id: BufferId) {
        self.meta[id as usize].prev = NIL;
        self.meta[id as usize].next = self.head;
        if self.head != NIL {
            self.meta[self.head as usize].prev = id;
        } else {
            self.tail = id;
        }
        self.head = id;
    }

    fn lru_touch(&mut self, id: BufferId) {
        if self.head == id {
            return;
        }
        self.lru_unlink(id);
        self.lru_push_head(id);
    }
}

#[derive(Debug, Default)]
struct Stats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    writebacks: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferPoolStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writebacks: u64,
    pub hit_ratio: f64,
    pub pages_in_buffer: usize,
    pub capacity: usize,
}

pub struct BufferPool {
    capacity: usize,
    latches: Vec<PageLatch>,
    inner: Mutex<Inner>,
    stats: Stats,
}

pub struct PageRef<'a> {
    pub pid: PageId,
    guard: SharedGuard<'a>,
}

pub struct PageRefMut<'a> {
    pub pid: PageId,
    guard: ExclusiveGuard<'a>,
}

impl<'a> std::ops::Deref for PageRef<'a> {
    type Target = Page;
    fn deref(&self) -> &Page {
        &self.guard
    }
}

impl<'a> std::ops::Deref for PageRefMut<'a> {
    type Target = Page;
    fn deref(&self) -> &Page {
        &self.guard
    }
}

impl<'a> std::ops::DerefMut for PageRefMut<'a> {
    fn deref_mut(&mut self) -> &mut Page {
        &mut self.guard
    }
}

impl<'a> PageRefMut<'a> {
    /// Spec §4.2 `unpin_exclusive(mark_dirty: bool)`: call before the
    /// guard drops to have the dirty bit stamped atomically on release.
    pub fn mark_dirty(&mut self) {
        self.guard.mark_dirty();
    }
}

impl BufferPool {
    pub fn new(capacity: usize) -> BufferPool {
        assert!(capacity > 0);
        let mut meta = Vec::with_capacity(capacity + 1);
        meta.push(FrameMeta::empty()); // index 0 is the nil sentinel
        let mut latches = Vec::with_capacity(capacity + 1);
        latches.push(PageLatch::new(Page::new(PageKind::Free)));
        for i in 1..=capacity {
            meta.push(FrameMeta::empty());
            latches.push(PageLatch::new(Page::new(PageKind::Free)));
            if i < capacity {
                meta[i].next = (i + 1) as BufferId;
            }
        }
        BufferPool {
            capacity,
            latches,
            inner: Mutex::new(Inner {
                meta,
                hash_table: vec![NIL; capacity.max(1)],
                head: NIL,
                tail: NIL,
                free_list: if capacity > 0 { 1 } else { NIL },
                file: None,
            }),
            stats: Stats::default(),
        }
    }

    pub fn set_file(&self, file: File) {
        self.inner.lock().unwrap().file = Some(file);
    }

    fn get_frame(&self, pid: PageId, mode: AccessMode) -> Result<BufferId> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(id) = inner.find(pid) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            inner.lru_touch(id);
            return Ok(id);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        let id = if inner.free_list != NIL {
            let id = inner.free_list;
            inner.free_list = inner.meta[id as usize].next;
            inner.lru_push_head(id);
            id
        } else {
            // Scan from the LRU tail for the first unpinned frame.
            let mut candidate = inner.tail;
            let mut scanned = 0usize;
            loop {
                if candidate == NIL || scanned >= self.capacity {
                    return Err(Error::Operation(OperationError::OutOfMemory));
                }
                if self.latches[candidate as usize].pin_count() == 0 {
                    break;
                }
                candidate = inner.meta[candidate as usize].prev;
                scanned += 1;
            }
            let victim = candidate;
            if self.latches[victim as usize].is_dirty() {
                self.writeback_locked(&mut inner, victim)?;
            }
            inner.hash_remove(victim);
            inner.lru_touch(victim);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            victim
        };

        inner.meta[id as usize].pid = pid;
        inner.meta[id as usize].loaded = false;
        inner.hash_insert(id);

        if mode != AccessMode::Overwrite {
            let mut guard = self.latches[id as usize].pin_exclusive();
            let offset = pid as u64 * PAGE_SIZE as u64;
            let file_len = inner
                .file
                .as_ref()
                .map(|f| f.metadata().map(|m| m.len()).unwrap_or(0))
                .unwrap_or(0);
            if let Some(file) = inner.file.as_ref() {
                if offset < file_len {
                    file.read_exact_at(&mut guard.data, offset)?;
                } else {
                    guard.data = [0u8; PAGE_SIZE];
                }
            } else {
                guard.data = [0u8; PAGE_SIZE];
            }
        } else {
            let mut guard = self.latches[id as usize].pin_exclusive();
            guard.data = [0u8; PAGE_SIZE];
        }
        inner.meta[id as usize].loaded = true;
        Ok(id)
    }

    fn writeback_locked(&self, inner: &mut Inner, id: BufferId) -> Result<()> {
        let pid = inner.meta[id as usize].pid;
        let mut guard = self.latches[id as usize].pin_exclusive();
        guard.update_checksum();
        if let Some(file) = inner.file.as_ref() {
            file.write_all_at(&guard.data, pid as u64 * PAGE_SIZE as u64)?;
        }
        drop(guard);
        self.latches[id as usize].clear_dirty();
        self.stats.writebacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn get_shared(&self, pid: PageId) -> Result<PageRef<'_>> {
        let id = self.get_frame(pid, AccessMode::Read)?;
        Ok(PageRef {
            pid,
            guard: self.latches[id as usize].pin_shared(),
        })
    }

    pub fn get_exclusive(&self, pid: PageId) -> Result<PageRefMut<'_>> {
        let id = self.get_frame(pid, AccessMode::Write)?;
        Ok(PageRefMut {
            pid,
            guard: self.latches[id as usize].pin_exclusive(),
        })
    }

    /// Pin a page for exclusive write without reading its prior content —
    /// used right after the page is freshly allocated.
    pub fn get_exclusive_new(&self, pid: PageId, kind: PageKind) -> Result<PageRefMut<'_>> {
        let id = self.get_frame(pid, AccessMode::Overwrite)?;
        let mut guard = self.latches[id as usize].pin_exclusive();
        guard.set_kind(kind);
        Ok(PageRefMut { pid, guard })
    }

    pub fn flush(&self, pid: PageId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(id) = inner.find(pid) {
            if self.latches[id as usize].is_dirty() {
                self.writeback_locked(&mut inner, id)?;
            }
        }
        Ok(())
    }

    pub fn flush_all(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let dirty_ids: Vec<BufferId> = (1..inner.meta.len() as BufferId)
            .filter(|&id| inner.meta[id as usize].loaded && self.latches[id as usize].is_dirty())
            .collect();
        for id in dirty_ids {
            self.writeback_locked(&mut inner, id)?;
        }
        if let Some(file) = inner.file.as_ref() {
            file.sync_all()?;
        }
        Ok(())
    }

    pub fn stats(&self) -> BufferPoolStats {
        let hits = self.stats.hits.load(Ordering::Relaxed);
        let misses = self.stats.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_ratio = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };
        let pages_in_buffer = {
            let inner = self.inner.lock().unwrap();
            inner.meta.iter().skip(1).filter(|m| m.loaded).count()
        };
        BufferPoolStats {
            hits,
            misses,
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            writebacks: self.stats.writebacks.load(Ordering::Relaxed),
            hit_ratio,
            pages_in_buffer,
            capacity: self.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn pool_with_file(capacity: usize) -> BufferPool {
        let pool = BufferPool::new(capacity);
        let file = NamedTempFile::new().unwrap();
        let file = file.reopen().unwrap();
        pool.set_file(file);
        pool
    }

    #[test]
    fn miss_then_hit_updates_stats() {
        let pool = pool_with_file(4);
        {
            let _p = pool.get_shared(0).unwrap();
        }
        {
            let _p = pool.get_shared(0).unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn eviction_fails_when_everything_pinned() {
        let pool = pool_with_file(2);
        let _a = pool.get_shared(1).unwrap();
        let _b = pool.get_shared(2).unwrap();
        let err = pool.get_shared(3);
        assert!(matches!(
            err,
            Err(Error::Operation(OperationError::OutOfMemory))
        ));
    }

    #[test]
    fn dirty_page_is_written_back_on_eviction() {
        let pool = pool_with_file(1);
        {
            let mut p = pool.get_exclusive(1).unwrap();
            p.data[100] = 0x42;
            p.mark_dirty();
        }
        {
            // Forces eviction of page 1 since capacity is 1.
            let _p = pool.get_shared(2).unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.writebacks, 1);
    }
}
