//! Collections used by Arbor storage.
//!
//! This crate provides:
//! - `LurchTable`, a concurrent hash table linked in insertion, modification
//!   or access order with bounded size
//! - `OrdinalList`, a growable bitset used for free block and handle tracking
//! - `OrderedEnumeration`, a stable paged merge sort with duplicate handling

mod lurch;
mod ordered;
mod ordinal;

pub use lurch::{LurchTable, LurchTableOrder};
pub use ordered::{
    DEFAULT_MEMORY_LIMIT, OrderedEnumeration, OrderedIter, merge, merge_all,
    with_duplicate_handling,
};
pub use ordinal::OrdinalList;
