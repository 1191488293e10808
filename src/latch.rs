//! Per-page reader-writer latch, pin count, and dirty flag.
//!
//! The teacher smears all three concerns across `BufferManager`'s bitflag
//! `state` field (`PAGE_BUSY`/`PAGE_DIRTY`/`PAGE_WAIT`, see
//! `buffer_manager.rs`) plus a *separate* per-page `RwLock<PageData>` held
//! by `Store` (`store.rs`'s `pool: Vec<RwLock<PageData>>`). `PageLatch`
//! folds those into one type per frame: the reader-writer lock it
//! describes *is* the lock guarding the page bytes, so there is exactly
//! one lock per page rather than two that always have to be taken
//! together.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::page::Page;

pub struct PageLatch {
    lock: RwLock<Page>,
    pin_count: AtomicU32,
    dirty: AtomicBool,
}

impl PageLatch {
    pub fn new(page: Page) -> PageLatch {
        PageLatch {
            lock: RwLock::new(page),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
        }
    }
}

pub struct SharedGuard<'a> {
    latch: &'a PageLatch,
    guard: RwLockReadGuard<'a, Page>,
}

pub struct ExclusiveGuard<'a> {
    latch: &'a PageLatch,
    guard: RwLockWriteGuard<'a, Page>,
    mark_dirty: bool,
}

impl<'a> std::ops::Deref for SharedGuard<'a> {
    type Target = Page;
    fn deref(&self) -> &Page {
        &self.guard
    }
}

impl<'a> std::ops::Deref for ExclusiveGuard<'a> {
    type Target = Page;
    fn deref(&self) -> &Page {
        &self.guard
    }
}

impl<'a> std::ops::DerefMut for ExclusiveGuard<'a> {
    fn deref_mut(&mut self) -> &mut Page {
        &mut self.guard
    }
}

impl PageLatch {
    /// Blocks while a writer holds the latch; multiple readers may hold
    /// concurrently.
    pub fn pin_shared(&self) -> SharedGuard<'_> {
        let guard = self.lock.read().unwrap();
        self.pin_count.fetch_add(1, Ordering::AcqRel);
        SharedGuard { latch: self, guard }
    }

    /// Blocks while any reader or writer holds the latch.
    pub fn pin_exclusive(&self) -> ExclusiveGuard<'_> {
        let guard = self.lock.write().unwrap();
        self.pin_count.fetch_add(1, Ordering::AcqRel);
        ExclusiveGuard {
            latch: self,
            guard,
            mark_dirty: false,
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) > 0
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub fn set_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Direct, lock-free access for the buffer pool's own bookkeeping
    /// (reloading a frame from disk on miss) where the caller already
    /// holds the sole reference to an unpinned frame.
    pub fn get_mut(&mut self) -> &mut Page {
        self.lock.get_mut().unwrap()
    }
}

impl<'a> ExclusiveGuard<'a> {
    /// Mirrors spec §4.2: `unpin_exclusive(mark_dirty: bool)` atomically
    /// sets the dirty bit before releasing the write latch.
    pub fn mark_dirty(&mut self) {
        self.mark_dirty = true;
    }
}

impl<'a> Drop for SharedGuard<'a> {
    fn drop(&mut self) {
        self.latch.pin_count.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<'a> Drop for ExclusiveGuard<'a> {
    fn drop(&mut self) {
        if self.mark_dirty {
            self.latch.dirty.store(true, Ordering::Release);
        }
        self.latch.pin_count.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageKind;

    #[test]
    fn pin_counts_track_holders() {
        let latch = PageLatch::new(Page::new(PageKind::Free));
        assert!(!latch.is_pinned());
        let g1 = latch.pin_shared();
        let g2 = latch.pin_shared();
        assert_eq!(latch.pin_count(), 2);
        drop(g1);
        drop(g2);
        assert!(!latch.is_pinned());
    }

    #[test]
    fn exclusive_mark_dirty_sets_flag_on_drop() {
        let latch = PageLatch::new(Page::new(PageKind::Free));
        {
            let mut guard = latch.pin_exclusive();
            guard.mark_dirty();
        }
        assert!(latch.is_dirty());
    }
}
