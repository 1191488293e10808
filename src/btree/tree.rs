//! B+-tree driver: descent, insert-with-split, delete-with-rebalance.
//!
//! The per-page primitives (`node.rs`) are a direct port of the teacher's
//! `pagedata.rs`; this module replaces the teacher's *recursive*
//! `btree_insert`/`btree_remove` (`store.rs`) with an explicit descent
//! pass that records `(PageId, ItemPointer)` per level (spec §9 decision:
//! path-tracked descent over parent back-pointers), then walks that path
//! in reverse to propagate a split or an underflow.
//!
//! Mutating operations (`put`/`delete`) serialize on `structure_lock`
//! so the recorded path cannot go stale between the descent and the
//! mutation pass; `get` takes no tree-wide lock and relies solely on the
//! buffer pool's per-page latches, since it never invalidates slot
//! positions for anyone else.

use std::sync::Mutex;

use crate::buffer_pool::BufferPool;
use crate::config::{
    ItemPointer, Key, PageId, Value, FRAGMENTATION_COMPACT_THRESHOLD, MAX_DESCENT_DEPTH,
    MAX_VALUE_LEN,
};
use crate::error::{Error, OperationError, Result};
use crate::header_state::HeaderState;
use crate::page::PageKind;

use super::node::{key_fits, Node, NodeMut};

pub struct BTree<'a> {
    pool: &'a BufferPool,
    header: &'a HeaderState,
    structure_lock: Mutex<()>,
}

fn child_bytes(pid: PageId) -> [u8; 4] {
    pid.to_be_bytes()
}

impl<'a> BTree<'a> {
    pub fn new(pool: &'a BufferPool, header: &'a HeaderState) -> BTree<'a> {
        BTree {
            pool,
            header,
            structure_lock: Mutex::new(()),
        }
    }

    fn validate_key_value(key: &[u8], value: &[u8]) -> Result<()> {
        if !key_fits(key) {
            return Err(Error::Operation(OperationError::KeyTooLarge));
        }
        if value.len() > MAX_VALUE_LEN {
            return Err(Error::Operation(OperationError::ValueTooLarge));
        }
        Ok(())
    }

    /// Walk from the root to the leaf that would hold `key`, recording
    /// `(page, slot-taken)` at every internal level visited.
    fn descend(&self, key: &[u8]) -> Result<(PageId, Vec<(PageId, ItemPointer)>)> {
        let mut path = Vec::new();
        let mut pid = self.header.root_page();
        loop {
            if path.len() > MAX_DESCENT_DEPTH {
                return Err(Error::internal("B+-tree descent exceeded maximum depth"));
            }
            let page = self.pool.get_shared(pid)?;
            match page.kind()? {
                PageKind::BTreeLeaf => return Ok((pid, path)),
                PageKind::BTreeInternal => {
                    let node = Node::new(&page);
                    let slot = node.find_slot(key);
                    let child = node.get_child(slot);
                    path.push((pid, slot));
                    drop(page);
                    pid = child;
                }
                other => {
                    return Err(Error::internal(format!(
                        "unexpected page kind {:?} during descent",
                        other
                    )))
                }
            }
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        if !key_fits(key) {
            return Err(Error::Operation(OperationError::KeyTooLarge));
        }
        if self.header.root_page() == 0 {
            return Ok(None);
        }
        let (leaf_pid, _path) = self.descend(key)?;
        let page = self.pool.get_shared(leaf_pid)?;
        let node = Node::new(&page);
        let slot = node.find_slot(key);
        if slot < node.n_items() && node.compare_key(slot, key) == std::cmp::Ordering::Equal {
            Ok(Some(node.get_item(slot).1))
        } else {
            Ok(None)
        }
    }

    pub fn put(&self, key: &Key, value: &Value) -> Result<()> {
        Self::validate_key_value(key, value)?;
        let _guard = self.structure_lock.lock().unwrap();

        if self.header.root_page() == 0 {
            let (pid, mut page) = self.header.alloc_page(self.pool, PageKind::BTreeLeaf)?;
            let mut node = NodeMut::new(&mut page);
            node.init();
            node.insert_item(0, key, value);
            drop(page);
            self.header.set_root_page(pid);
            self.header.adjust_key_count(1);
            return Ok(());
        }

        let (leaf_pid, path) = self.descend(key)?;
        let mut overflow = {
            let mut page = self.pool.get_exclusive(leaf_pid)?;
            let mut node = NodeMut::new(&mut page);
            let slot = node.as_node().find_slot(key);
            let n = node.n_items();
            let existing =
                slot < n && node.as_node().compare_key(slot, key) == std::cmp::Ordering::Equal;
            if existing {
                node.remove_key(slot, true);
            }
            let inserted = node.insert_item(slot, key, value);
            page.mark_dirty();
            if inserted {
                if !existing {
                    self.header.adjust_key_count(1);
                }
                None
            } else {
                let mut node = NodeMut::new(&mut page);
                let (new_pid, mut new_page) =
                    self.header.alloc_page(self.pool, PageKind::BTreeLeaf)?;
                let mut new_node = NodeMut::new(&mut new_page);
                new_node.init();
                let split = node.split(&mut new_node, slot);
                let ok = if slot > split {
                    node.insert_item(slot - split - 1, key, value)
                } else {
                    new_node.insert_item(slot, key, value)
                };
                debug_assert!(ok, "post-split insert must fit");
                if !existing {
                    self.header.adjust_key_count(1);
                }
                new_node.set_next_leaf(leaf_pid);
                page.mark_dirty();
                new_page.mark_dirty();
                Some((new_node.as_node().get_last_key(), new_pid))
            }
        };

        for (pid, slot) in path.into_iter().rev() {
            let (sep_key, new_child) = match overflow.take() {
                Some(x) => x,
                None => break,
            };
            let mut page = self.pool.get_exclusive(pid)?;
            let mut node = NodeMut::new(&mut page);
            let inserted = node.insert_item(slot, &sep_key, &child_bytes(new_child));
            page.mark_dirty();
            if inserted {
                overflow = None;
            } else {
                let mut node = NodeMut::new(&mut page);
                let (new_pid, mut new_page) =
                    self.header.alloc_page(self.pool, PageKind::BTreeInternal)?;
                let mut new_node = NodeMut::new(&mut new_page);
                new_node.init();
                let split = node.split(&mut new_node, slot);
                let ok = if slot > split {
                    node.insert_item(slot - split - 1, &sep_key, &child_bytes(new_child))
                } else {
                    new_node.insert_item(slot, &sep_key, &child_bytes(new_child))
                };
                debug_assert!(ok, "post-split internal insert must fit");
                page.mark_dirty();
                new_page.mark_dirty();
                overflow = Some((new_node.as_node().get_last_key(), new_pid));
            }
        }

        if let Some((sep_key, new_child)) = overflow {
            let old_root = self.header.root_page();
            let (new_root_pid, mut new_root) =
                self.header.alloc_page(self.pool, PageKind::BTreeInternal)?;
            let mut node = NodeMut::new(&mut new_root);
            node.init();
            node.insert_item(0, &sep_key, &child_bytes(new_child));
            node.insert_item(1, &[], &child_bytes(old_root));
            new_root.mark_dirty();
            self.header.set_root_page(new_root_pid);
        }
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        if !key_fits(key) {
            return Err(Error::Operation(OperationError::KeyTooLarge));
        }
        let _guard = self.structure_lock.lock().unwrap();
        if self.header.root_page() == 0 {
            return Ok(false);
        }

        let (leaf_pid, path) = self.descend(key)?;
        let (existed, mut underfull) = {
            let mut page = self.pool.get_exclusive(leaf_pid)?;
            let mut node = NodeMut::new(&mut page);
            let slot = node.as_node().find_slot(key);
            let n = node.n_items();
            let found =
                slot < n && node.as_node().compare_key(slot, key) == std::cmp::Ordering::Equal;
            if found {
                node.remove_key(slot, true);
                page.mark_dirty();
                self.header.adjust_key_count(-1);
            }
            (found, node.as_node().fill_fraction() < FRAGMENTATION_COMPACT_THRESHOLD)
        };
        if !existed {
            return Ok(false);
        }

        let mut child_pid_cursor = leaf_pid;
        let mut child_is_leaf = true;
        for (parent_pid, slot) in path.into_iter().rev() {
            if !underfull {
                break;
            }
            underfull = self.rebalance_at(parent_pid, slot, child_is_leaf)?;
            child_pid_cursor = parent_pid;
            child_is_leaf = false;
        }

        if underfull && self.header.root_page() == child_pid_cursor {
            self.collapse_root_if_needed(child_pid_cursor)?;
        }
        Ok(true)
    }

    /// Try to fix underflow of the child at `slot` within `parent_pid` by
    /// borrowing a key from a sibling, falling back to a merge. Returns
    /// whether `parent_pid` itself is now underfull (so the caller keeps
    /// walking up).
    fn rebalance_at(&self, parent_pid: PageId, slot: ItemPointer, child_leaf: bool) -> Result<bool> {
        let mut parent_page = self.pool.get_exclusive(parent_pid)?;
        let parent_n = NodeMut::new(&mut parent_page).n_items();
        let child_pid = Node::new(&parent_page).get_child(slot);

        let left_sibling = if slot > 0 {
            Some((slot - 1, Node::new(&parent_page).get_child(slot - 1)))
        } else {
            None
        };
        let right_sibling = if slot + 1 < parent_n {
            Some((slot + 1, Node::new(&parent_page).get_child(slot + 1)))
        } else {
            None
        };
        drop(parent_page);

        if let Some((left_slot, left_pid)) = left_sibling {
            if self.try_borrow_left(parent_pid, left_slot, left_pid, child_pid, child_leaf)? {
                return Ok(false);
            }
        }
        if let Some((_right_slot, right_pid)) = right_sibling {
            if self.try_borrow_right(parent_pid, slot, child_pid, right_pid, child_leaf)? {
                return Ok(false);
            }
        }
        if let Some((left_slot, left_pid)) = left_sibling {
            return self.merge_siblings(parent_pid, left_slot, left_pid, child_pid, child_leaf);
        }
        if let Some((_right_slot, right_pid)) = right_sibling {
            return self.merge_siblings(parent_pid, slot, child_pid, right_pid, child_leaf);
        }
        // Only child, nothing to borrow or merge with; leave it underfull.
        Ok(false)
    }

    fn try_borrow_left(
        &self,
        parent_pid: PageId,
        left_slot: ItemPointer,
        left_pid: PageId,
        child_pid: PageId,
        child_leaf: bool,
    ) -> Result<bool> {
        let mut left = self.pool.get_exclusive(left_pid)?;
        let mut left_node = NodeMut::new(&mut left);
        if left_node.n_items() <= 1 {
            return Ok(false);
        }
        let donor_slot = left_node.n_items() - 1;
        let (donor_key, donor_value) = left_node.as_node().get_item(donor_slot);

        let mut child = self.pool.get_exclusive(child_pid)?;
        let mut child_node = NodeMut::new(&mut child);
        let inserted = if child_leaf {
            child_node.insert_item(0, &donor_key, &donor_value)
        } else {
            // Rotate through the parent separator: the donor's own key
            // becomes the new left separator, the old separator comes
            // down as the first key of `child`.
            let mut parent = self.pool.get_exclusive(parent_pid)?;
            let parent_node = Node::new(&parent);
            let old_sep = parent_node.get_key(left_slot);
            drop(parent);
            child_node.insert_item(0, &old_sep, &donor_value)
        };
        if !inserted {
            return Ok(false);
        }
        left_node.remove_key(donor_slot, child_leaf);
        left.mark_dirty();
        child.mark_dirty();
        drop(left);
        drop(child);

        let mut parent = self.pool.get_exclusive(parent_pid)?;
        let mut parent_node = NodeMut::new(&mut parent);
        parent_node.remove_key(left_slot, false);
        let new_sep = if child_leaf {
            let child_page = self.pool.get_shared(child_pid)?;
            Node::new(&child_page).get_key(0)
        } else {
            donor_key
        };
        parent_node.insert_item(left_slot, &new_sep, &child_bytes(child_pid));
        parent.mark_dirty();
        Ok(true)
    }

    fn try_borrow_right(
        &self,
        parent_pid: PageId,
        slot: ItemPointer,
        child_pid: PageId,
        right_pid: PageId,
        child_leaf: bool,
    ) -> Result<bool> {
        let mut right = self.pool.get_exclusive(right_pid)?;
        let mut right_node = NodeMut::new(&mut right);
        if right_node.n_items() <= 1 {
            return Ok(false);
        }
        let (donor_key, donor_value) = right_node.as_node().get_item(0);

        let mut child = self.pool.get_exclusive(child_pid)?;
        let mut child_node = NodeMut::new(&mut child);
        let insert_pos = child_node.n_items();
        let inserted = if child_leaf {
            child_node.insert_item(insert_pos, &donor_key, &donor_value)
        } else {
            let mut parent = self.pool.get_exclusive(parent_pid)?;
            let old_sep = Node::new(&parent).get_key(slot);
            drop(parent);
            child_node.insert_item(insert_pos, &old_sep, &donor_value)
        };
        if !inserted {
            return Ok(false);
        }
        right_node.remove_key(0, child_leaf);
        right.mark_dirty();
        child.mark_dirty();
        let new_child_last_key = Node::new(&child).get_last_key();
        drop(right);
        drop(child);

        let mut parent = self.pool.get_exclusive(parent_pid)?;
        let mut parent_node = NodeMut::new(&mut parent);
        parent_node.remove_key(slot, false);
        let sep = if child_leaf { new_child_last_key } else { donor_key };
        parent_node.insert_item(slot, &sep, &child_bytes(child_pid));
        parent.mark_dirty();
        Ok(true)
    }

    /// Merge `right_pid` into `left_pid`, dropping the separator between
    /// them from `parent_pid`. Returns whether `parent_pid` is now
    /// underfull itself.
    fn merge_siblings(
        &self,
        parent_pid: PageId,
        left_slot: ItemPointer,
        left_pid: PageId,
        right_pid: PageId,
        child_leaf: bool,
    ) -> Result<bool> {
        let next_leaf_of_right = {
            let right_page = self.pool.get_shared(right_pid)?;
            Node::new(&right_page).next_leaf()
        };
        {
            let right_page = self.pool.get_shared(right_pid)?;
            let right_node = Node::new(&right_page);
            let mut left_page = self.pool.get_exclusive(left_pid)?;
            let mut left_node = NodeMut::new(&mut left_page);
            if child_leaf {
                left_node.merge_from(&right_node);
                left_node.set_next_leaf(next_leaf_of_right);
            } else {
                // Re-attach the parent separator as the first promoted
                // key so the merged node's key set stays contiguous.
                let mut parent = self.pool.get_exclusive(parent_pid)?;
                let sep = Node::new(&parent).get_key(left_slot);
                drop(parent);
                let n = left_node.n_items();
                let first_child = right_node.get_child(0);
                left_node.insert_item(n, &sep, &child_bytes(first_child));
                for i in 1..right_node.n_items() {
                    let (k, v) = right_node.get_item(i);
                    left_node.insert_item(left_node.n_items(), &k, &v);
                }
            }
            left_page.mark_dirty();
        }
        self.header.free_page(self.pool, right_pid)?;

        let mut parent_page = self.pool.get_exclusive(parent_pid)?;
        let mut parent_node = NodeMut::new(&mut parent_page);
        parent_node.remove_key(left_slot, false);
        parent_page.mark_dirty();

        let parent_page = self.pool.get_shared(parent_pid)?;
        Ok(Node::new(&parent_page).fill_fraction() < FRAGMENTATION_COMPACT_THRESHOLD)
    }

    fn collapse_root_if_needed(&self, root_pid: PageId) -> Result<()> {
        let page = self.pool.get_shared(root_pid)?;
        let kind = page.kind()?;
        let node = Node::new(&page);
        let n_items = node.n_items();
        match kind {
            PageKind::BTreeLeaf if n_items == 0 => {
                drop(page);
                self.header.set_root_page(0);
                self.header.free_page(self.pool, root_pid)?;
            }
            PageKind::BTreeInternal if n_items == 1 => {
                let only_child = node.get_child(0);
                drop(page);
                self.header.set_root_page(only_child);
                self.header.free_page(self.pool, root_pid)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Full structural walk used by `validate_structure`: every leaf is
    /// visited via `next_leaf` links and every key ordering invariant is
    /// checked. Returns the number of keys observed.
    pub fn validate(&self) -> Result<u64> {
        let root = self.header.root_page();
        if root == 0 {
            return Ok(0);
        }
        let mut pid = self.leftmost_leaf(root)?;
        let mut count = 0u64;
        let mut prev_key: Option<Key> = None;
        loop {
            let page = self.pool.get_shared(pid)?;
            page.validate_checksum()?;
            let node = Node::new(&page);
            for i in 0..node.n_items() {
                let key = node.get_key(i);
                if let Some(prev) = &prev_key {
                    if &key <= prev {
                        return Err(Error::internal("keys out of order across leaves"));
                    }
                }
                prev_key = Some(key);
                count += 1;
            }
            let next = node.next_leaf();
            if next == 0 {
                break;
            }
            pid = next;
        }
        Ok(count)
    }

    fn leftmost_leaf(&self, mut pid: PageId) -> Result<PageId> {
        let mut depth = 0;
        loop {
            if depth > MAX_DESCENT_DEPTH {
                return Err(Error::internal("tree exceeds maximum depth during validation"));
            }
            let page = self.pool.get_shared(pid)?;
            match page.kind()? {
                PageKind::BTreeLeaf => return Ok(pid),
                PageKind::BTreeInternal => {
                    pid = Node::new(&page).get_child(0);
                }
                other => {
                    return Err(Error::internal(format!(
                        "unexpected page kind {:?} while finding leftmost leaf",
                        other
                    )))
                }
            }
            depth += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header_state;
    use tempfile::NamedTempFile;

    fn fresh() -> (BufferPool, HeaderState) {
        let pool = BufferPool::new(64);
        let file = NamedTempFile::new().unwrap().reopen().unwrap();
        pool.set_file(file);
        let header = header_state::init_header_page(&pool).unwrap();
        (pool, HeaderState::new(header))
    }

    #[test]
    fn put_then_get_round_trips() {
        let (pool, header) = fresh();
        let tree = BTree::new(&pool, &header);
        tree.put(&b"hello".to_vec(), &b"world".to_vec()).unwrap();
        assert_eq!(tree.get(b"hello").unwrap(), Some(b"world".to_vec()));
        assert_eq!(tree.get(b"missing").unwrap(), None);
    }

    #[test]
    fn put_replaces_existing_key() {
        let (pool, header) = fresh();
        let tree = BTree::new(&pool, &header);
        tree.put(&b"k".to_vec(), &b"v1".to_vec()).unwrap();
        tree.put(&b"k".to_vec(), &b"v2".to_vec()).unwrap();
        assert_eq!(tree.get(b"k").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(header.key_count(), 1);
    }

    #[test]
    fn delete_removes_key_and_reports_existence() {
        let (pool, header) = fresh();
        let tree = BTree::new(&pool, &header);
        tree.put(&b"a".to_vec(), &b"1".to_vec()).unwrap();
        assert!(tree.delete(b"a").unwrap());
        assert!(!tree.delete(b"a").unwrap());
        assert_eq!(tree.get(b"a").unwrap(), None);
        assert_eq!(header.key_count(), 0);
    }

    #[test]
    fn many_keys_split_and_stay_ordered() {
        let (pool, header) = fresh();
        let tree = BTree::new(&pool, &header);
        for i in 0..2000u32 {
            let key = format!("key-{:06}", i).into_bytes();
            tree.put(&key, &i.to_be_bytes().to_vec()).unwrap();
        }
        for i in 0..2000u32 {
            let key = format!("key-{:06}", i).into_bytes();
            assert_eq!(tree.get(&key).unwrap(), Some(i.to_be_bytes().to_vec()));
        }
        assert_eq!(tree.validate().unwrap(), 2000);
        assert_eq!(header.key_count(), 2000);
    }

    #[test]
    fn deleting_every_other_key_keeps_tree_valid() {
        let (pool, header) = fresh();
        let tree = BTree::new(&pool, &header);
        for i in 0..1000u32 {
            let key = format!("k{:05}", i).into_bytes();
            tree.put(&key, &vec![7u8; 16]).unwrap();
        }
        for i in (0..1000u32).step_by(2) {
            let key = format!("k{:05}", i).into_bytes();
            assert!(tree.delete(&key).unwrap());
        }
        assert_eq!(tree.validate().unwrap(), 500);
        for i in 0..1000u32 {
            let key = format!("k{:05}", i).into_bytes();
            let expected = if i % 2 == 0 { None } else { Some(vec![7u8; 16]) };
            assert_eq!(tree.get(&key).unwrap(), expected);
        }
    }

    #[test]
    fn delete_down_to_empty_collapses_root() {
        let (pool, header) = fresh();
        let tree = BTree::new(&pool, &header);
        for i in 0..50u32 {
            tree.put(&i.to_be_bytes().to_vec(), &vec![1u8; 8]).unwrap();
        }
        for i in 0..50u32 {
            assert!(tree.delete(&i.to_be_bytes().to_vec()).unwrap());
        }
        assert_eq!(header.root_page(), 0);
        assert_eq!(tree.get(&0u32.to_be_bytes().to_vec()).unwrap(), None);
    }

    #[test]
    fn rejects_oversized_key() {
        let (pool, header) = fresh();
        let tree = BTree::new(&pool, &header);
        let big_key = vec![0u8; crate::config::MAX_KEY_LEN + 1];
        assert!(matches!(
            tree.put(&big_key, &b"v".to_vec()),
            Err(Error::Operation(OperationError::KeyTooLarge))
        ));
    }
}
