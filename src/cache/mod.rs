//! In-memory entry store shared by all query controllers.
//!
//! This module knows nothing about fetching:
//! - Entries carry a TTL and expire lazily (purged on access, no timer)
//! - Capacity is bounded; the insertion-oldest entry is evicted first
//! - Values are type-erased so one store serves every query type

mod entry;
mod storage;

pub use entry::Entry;
pub use storage::{EntryStore, DEFAULT_MAX_SIZE};
