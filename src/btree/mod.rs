//! B+-tree index: slotted-page node layout plus the descent/split/merge
//! driver built on top of it.

mod node;
mod tree;

pub use tree::BTree;
