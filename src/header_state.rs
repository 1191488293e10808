//! In-memory cache of page 0, and the page allocator built on top of it.
//!
//! Generalizes the teacher's `Metadata` (`meta.rs`) — a small packed
//! struct cached in memory and written back to page 0 on commit — to the
//! richer `HeaderPage` fields this engine tracks, plus `new_page`'s
//! free-list-then-extend allocation strategy (`store.rs::new_page`).

use std::sync::Mutex;

use crate::buffer_pool::BufferPool;
use crate::config::{PageId, HEADER_PID};
use crate::error::Result;
use crate::page::{HeaderPage, PageKind};

pub struct HeaderState {
    inner: Mutex<HeaderPage>,
}

impl HeaderState {
    pub fn new(header: HeaderPage) -> HeaderState {
        HeaderState {
            inner: Mutex::new(header),
        }
    }

    pub fn snapshot(&self) -> HeaderPage {
        *self.inner.lock().unwrap()
    }

    pub fn root_page(&self) -> PageId {
        self.inner.lock().unwrap().root_page
    }

    pub fn set_root_page(&self, pid: PageId) {
        self.inner.lock().unwrap().root_page = pid;
    }

    pub fn key_count(&self) -> u64 {
        self.inner.lock().unwrap().key_count
    }

    pub fn adjust_key_count(&self, delta: i64) {
        let mut h = self.inner.lock().unwrap();
        h.key_count = (h.key_count as i64 + delta).max(0) as u64;
    }

    /// Persist the cached header into page 0 of the buffer pool. Callers
    /// still need to flush the pool for this to reach disk.
    pub fn publish(&self, pool: &BufferPool) -> Result<()> {
        let header = self.snapshot();
        let mut page = pool.get_exclusive(HEADER_PID)?;
        header.write(&mut page);
        page.mark_dirty();
        Ok(())
    }

    /// Take a page off the free list if one exists, otherwise extend the
    /// file by one page. Returns the freshly zeroed page pinned for
    /// exclusive write, stamped with `kind`.
    pub fn alloc_page<'a>(
        &self,
        pool: &'a BufferPool,
        kind: PageKind,
    ) -> Result<(PageId, crate::buffer_pool::PageRefMut<'a>)> {
        let mut header = self.inner.lock().unwrap();
        let pid = if header.free_list_head != 0 {
            let free_pid = header.free_list_head;
            let next = {
                let page = pool.get_shared(free_pid)?;
                u32::from_le_bytes(page.payload()[0..4].try_into().unwrap())
            };
            header.free_list_head = next;
            free_pid
        } else {
            let pid = header.page_count;
            header.page_count += 1;
            pid
        };
        drop(header);
        let mut page = pool.get_exclusive_new(pid, kind)?;
        page.mark_dirty();
        Ok((pid, page))
    }

    /// Push `pid` onto the head of the free list. The page's payload is
    /// overwritten with the previous head pointer, mirroring the
    /// teacher's reuse of a freed leaf's first bytes as the free-list
    /// link (`btree_remove`'s `page.set_u32(0, db.meta.free)`).
    pub fn free_page(&self, pool: &BufferPool, pid: PageId) -> Result<()> {
        let mut header = self.inner.lock().unwrap();
        let prev_head = header.free_list_head;
        {
            let mut page = pool.get_exclusive_new(pid, PageKind::Free)?;
            page.payload_mut()[0..4].copy_from_slice(&prev_head.to_le_bytes());
            page.mark_dirty();
        }
        header.free_list_head = pid;
        Ok(())
    }
}

pub fn init_header_page(pool: &BufferPool) -> Result<HeaderPage> {
    let header = HeaderPage::new();
    let mut page: crate::buffer_pool::PageRefMut = pool.get_exclusive_new(HEADER_PID, PageKind::Header)?;
    header.write(&mut page);
    page.mark_dirty();
    Ok(header)
}

pub fn load_header_page(pool: &BufferPool) -> Result<HeaderPage> {
    let page: crate::buffer_pool::PageRef = pool.get_shared(HEADER_PID)?;
    HeaderPage::read(&page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::BufferPool;
    use tempfile::NamedTempFile;

    fn fresh_pool() -> BufferPool {
        let pool = BufferPool::new(16);
        let file = NamedTempFile::new().unwrap().reopen().unwrap();
        pool.set_file(file);
        pool
    }

    #[test]
    fn alloc_extends_then_reuses_free_list() {
        let pool = fresh_pool();
        let header = init_header_page(&pool).unwrap();
        let state = HeaderState::new(header);

        let (a, page_a) = state.alloc_page(&pool, PageKind::BTreeLeaf).unwrap();
        drop(page_a);
        let (b, page_b) = state.alloc_page(&pool, PageKind::BTreeLeaf).unwrap();
        drop(page_b);
        assert_ne!(a, b);

        state.free_page(&pool, a).unwrap();
        let (c, _) = state.alloc_page(&pool, PageKind::BTreeLeaf).unwrap();
        assert_eq!(c, a, "freed page should be reused before extending");
    }

    #[test]
    fn publish_round_trips_through_the_pool() {
        let pool = fresh_pool();
        let header = init_header_page(&pool).unwrap();
        let state = HeaderState::new(header);
        state.set_root_page(7);
        state.adjust_key_count(5);
        state.publish(&pool).unwrap();
        pool.flush_all().unwrap();

        let reloaded = load_header_page(&pool).unwrap();
        assert_eq!(reloaded.root_page, 7);
        assert_eq!(reloaded.key_count, 5);
    }
}
