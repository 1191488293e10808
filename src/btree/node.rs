//! Slotted-page node layout shared by leaf and internal B+-tree pages.
//!
//! Directly generalizes the teacher's `PageData` (`pagedata.rs`): the
//! item-pointer array still grows from the low end of the data region and
//! key|value bytes are still packed in from the high end, located by
//! `compare_key`'s binary search. The only structural addition is a
//! 4-byte `next_leaf` field carried in every node's local header (unused
//! by internal nodes) so leaf pages can be walked in key order without
//! re-descending the tree, per spec §4.4's range-scan note.
//!
//! Internal nodes store `(separator_key, child_page_id)` pairs and keep
//! the teacher's right-most-child trick: the last slot's key is a
//! zero-length "infinity" sentinel so every real key compares less than
//! it, giving an N-key/N+1-child node without a separate child array.

use std::cmp::Ordering;

use crate::config::{ItemPointer, Key, PageId, Value, MAX_KEY_LEN, PAGE_HEADER_LEN, PAGE_SIZE};
use crate::page::Page;

/// Bytes reserved in every node's local header, ahead of the item-pointer
/// array: `next_leaf: u32` + `n_items: u16`.
const LOCAL_HEADER_LEN: usize = 6;
pub const DATA_BASE: usize = PAGE_HEADER_LEN + LOCAL_HEADER_LEN;

pub struct Node<'p> {
    page: &'p Page,
}

pub struct NodeMut<'p> {
    page: &'p mut Page,
}

fn get_u16(data: &[u8], offs: usize) -> u16 {
    u16::from_be_bytes(data[offs..offs + 2].try_into().unwrap())
}

fn set_u16(data: &mut [u8], offs: usize, v: u16) {
    data[offs..offs + 2].copy_from_slice(&v.to_be_bytes());
}

fn get_u32(data: &[u8], offs: usize) -> u32 {
    u32::from_be_bytes(data[offs..offs + 4].try_into().unwrap())
}

fn set_u32(data: &mut [u8], offs: usize, v: u32) {
    data[offs..offs + 4].copy_from_slice(&v.to_be_bytes());
}

macro_rules! read_accessors {
    () => {
        pub fn n_items(&self) -> ItemPointer {
            get_u16(&self.page.data, PAGE_HEADER_LEN + 4) as ItemPointer
        }

        pub fn next_leaf(&self) -> PageId {
            get_u32(&self.page.data, PAGE_HEADER_LEN)
        }

        fn slot_offs(&self, ip: ItemPointer) -> usize {
            get_u16(&self.page.data, DATA_BASE + ip * 2) as usize
        }

        fn size(&self) -> usize {
            let n = self.n_items();
            if n == 0 {
                0
            } else {
                PAGE_SIZE - self.slot_offs(n - 1)
            }
        }

        fn item_offs_len(&self, ip: ItemPointer) -> (usize, usize) {
            let offs = self.slot_offs(ip);
            let next_offs = if ip == 0 {
                PAGE_SIZE
            } else {
                self.slot_offs(ip - 1)
            };
            debug_assert!(next_offs > offs);
            (offs, next_offs - offs)
        }

        pub fn get_key(&self, ip: ItemPointer) -> Key {
            let offs = self.slot_offs(ip);
            let key_len = self.page.data[offs] as usize;
            self.page.data[offs + 1..offs + 1 + key_len].to_vec()
        }

        pub fn get_last_key(&self) -> Key {
            self.get_key(self.n_items() - 1)
        }

        pub fn get_child(&self, ip: ItemPointer) -> PageId {
            let offs = self.slot_offs(ip);
            let key_len = self.page.data[offs] as usize;
            get_u32(&self.page.data, offs + key_len + 1)
        }

        pub fn get_item(&self, ip: ItemPointer) -> (Key, Value) {
            let (offs, len) = self.item_offs_len(ip);
            let key_len = self.page.data[offs] as usize;
            (
                self.page.data[offs + 1..offs + 1 + key_len].to_vec(),
                self.page.data[offs + 1 + key_len..offs + len].to_vec(),
            )
        }

        /// Zero-length key compares as +infinity: used by the right-most
        /// slot of internal nodes so it always matches a descent.
        pub fn compare_key(&self, ip: ItemPointer, key: &[u8]) -> Ordering {
            let offs = self.slot_offs(ip);
            let key_len = self.page.data[offs] as usize;
            if key_len == 0 {
                Ordering::Less
            } else {
                key.cmp(&self.page.data[offs + 1..offs + 1 + key_len])
            }
        }

        /// Binary search for the first slot whose key is >= `key`
        /// (the insertion point / descent child for `key`).
        pub fn find_slot(&self, key: &[u8]) -> ItemPointer {
            let mut l: ItemPointer = 0;
            let mut r = self.n_items();
            while l < r {
                let m = (l + r) >> 1;
                if self.compare_key(m, key) == Ordering::Greater {
                    l = m + 1;
                } else {
                    r = m;
                }
            }
            l
        }

        pub fn is_empty(&self) -> bool {
            self.n_items() == 0
        }

        /// Fraction of the data region that is free, used to decide
        /// rebalance-vs-merge on underflow (spec §4.4).
        pub fn fill_fraction(&self) -> f32 {
            self.size() as f32 / (PAGE_SIZE - DATA_BASE) as f32
        }
    };
}

impl<'p> Node<'p> {
    pub fn new(page: &'p Page) -> Node<'p> {
        Node { page }
    }

    read_accessors!();
}

impl<'p> NodeMut<'p> {
    pub fn new(page: &'p mut Page) -> NodeMut<'p> {
        NodeMut { page }
    }

    read_accessors!();

    pub fn as_node(&self) -> Node<'_> {
        Node { page: self.page }
    }

    pub fn init(&mut self) {
        set_u16(&mut self.page.data, PAGE_HEADER_LEN + 4, 0);
        set_u32(&mut self.page.data, PAGE_HEADER_LEN, 0);
    }

    pub fn set_next_leaf(&mut self, pid: PageId) {
        set_u32(&mut self.page.data, PAGE_HEADER_LEN, pid);
    }

    fn set_n_items(&mut self, n: ItemPointer) {
        set_u16(&mut self.page.data, PAGE_HEADER_LEN + 4, n as u16);
    }

    fn set_slot_offs(&mut self, ip: ItemPointer, offs: usize) {
        set_u16(&mut self.page.data, DATA_BASE + ip * 2, offs as u16);
    }

    /// Insert `(key, value)` at slot `ip`, shifting later slots right.
    /// Returns false (page untouched) if there isn't room.
    pub fn insert_item(&mut self, ip: ItemPointer, key: &[u8], value: &[u8]) -> bool {
        let n = self.n_items();
        let size = self.size();
        let item_len = 1 + key.len() + value.len();
        if (n + 1) * 2 + size + item_len > PAGE_SIZE - DATA_BASE {
            return false;
        }
        for i in (ip..n).rev() {
            let o = self.slot_offs(i);
            self.set_slot_offs(i + 1, o - item_len);
        }
        let item_offs = if ip != 0 {
            self.slot_offs(ip - 1) - item_len
        } else {
            PAGE_SIZE - item_len
        };
        self.set_slot_offs(ip, item_offs);
        let items_origin = PAGE_SIZE - size;
        self.page
            .data
            .copy_within(items_origin..item_offs + item_len, items_origin - item_len);
        self.page.data[item_offs] = key.len() as u8;
        self.page.data[item_offs + 1..item_offs + 1 + key.len()].copy_from_slice(key);
        self.page.data[item_offs + 1 + key.len()..item_offs + item_len].copy_from_slice(value);
        self.set_n_items(n + 1);
        true
    }

    /// Remove the slot at `ip`. For internal nodes removing the
    /// right-most child, the previous slot's key is promoted into its
    /// place so the "infinity" sentinel stays last.
    pub fn remove_key(&mut self, ip: ItemPointer, leaf: bool) {
        let n = self.n_items();
        let size = self.size();
        let (item_offs, item_len) = self.item_offs_len(ip);
        for i in ip + 1..n {
            let o = self.slot_offs(i);
            self.set_slot_offs(i - 1, o + item_len);
        }
        let items_origin = PAGE_SIZE - size;
        if !leaf && n > 1 && ip + 1 == n {
            let prev_item_offs = item_offs + item_len;
            let key_len = self.page.data[item_offs] as usize;
            let prev_key_len = self.page.data[prev_item_offs] as usize;
            let new_offs = prev_item_offs + prev_key_len - key_len;
            self.set_slot_offs(ip - 1, new_offs);
            self.page
                .data
                .copy_within(item_offs..item_offs + prev_key_len + 1, new_offs);
        } else {
            self.page
                .data
                .copy_within(items_origin..item_offs, items_origin + item_len);
        }
        self.set_n_items(n - 1);
    }

    /// Split roughly in half by byte offset; smaller keys move to
    /// `new_page`, the larger ones stay here. Returns the split slot.
    pub fn split(&mut self, new_page: &mut NodeMut<'_>, ip: ItemPointer) -> ItemPointer {
        let n = self.n_items();
        let size = self.size();
        let mut r = n;
        if ip == r {
            r -= 1;
        } else {
            let margin = PAGE_SIZE - size / 2;
            let mut l: ItemPointer = 0;
            while l < r {
                let m = (l + r) >> 1;
                if self.slot_offs(m) > margin {
                    l = m + 1;
                } else {
                    r = m;
                }
            }
        }
        let moved_size = PAGE_SIZE - self.slot_offs(r);
        new_page.page.data[DATA_BASE..DATA_BASE + (r + 1) * 2]
            .copy_from_slice(&self.page.data[DATA_BASE..DATA_BASE + (r + 1) * 2]);
        let dst = PAGE_SIZE - moved_size;
        new_page.page.data[dst..].copy_from_slice(&self.page.data[dst..]);
        for i in r + 1..n {
            let o = self.slot_offs(i);
            self.set_slot_offs(i - r - 1, o + moved_size);
        }
        let src = PAGE_SIZE - size;
        self.page.data.copy_within(src..dst, src + moved_size);
        new_page.set_n_items(r + 1);
        self.set_n_items(n - r - 1);
        r
    }

    /// Merge `other` into `self`, appending its items after the existing
    /// ones. Caller guarantees the combined size fits one page.
    pub fn merge_from(&mut self, other: &Node<'_>) {
        let n = self.n_items();
        for i in 0..other.n_items() {
            let (k, v) = other.get_item(i);
            let ok = self.insert_item(n + i, &k, &v);
            debug_assert!(ok, "merge_from assumes caller checked combined size fits");
        }
    }
}

pub fn key_fits(key: &[u8]) -> bool {
    !key.is_empty() && key.len() <= MAX_KEY_LEN
}
