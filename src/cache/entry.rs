//! A single stored value and its expiry metadata.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Type-erased value held by the entry store.
pub type ErasedValue = Arc<dyn Any + Send + Sync>;

/// An entry in the [`EntryStore`](super::EntryStore).
///
/// Entries are never patched in place: a `set` swaps in a whole new entry.
#[derive(Clone)]
pub struct Entry {
  value: ErasedValue,
  stored_at: Instant,
  ttl: Duration,
}

impl Entry {
  pub(crate) fn new(value: ErasedValue, ttl: Duration) -> Self {
    Self {
      value,
      stored_at: Instant::now(),
      ttl,
    }
  }

  /// An entry is valid while `now - stored_at <= ttl`.
  pub fn is_valid(&self, now: Instant) -> bool {
    now.saturating_duration_since(self.stored_at) <= self.ttl
  }

  /// When this entry was stored.
  pub fn stored_at(&self) -> Instant {
    self.stored_at
  }

  /// Time-to-live handed in at insertion.
  pub fn ttl(&self) -> Duration {
    self.ttl
  }

  /// Downcast the stored value, cloning it out.
  ///
  /// Returns `None` if the entry holds a different type.
  pub fn value<T: Clone + 'static>(&self) -> Option<T> {
    self.value.downcast_ref::<T>().cloned()
  }
}

impl std::fmt::Debug for Entry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Entry")
      .field("stored_at", &self.stored_at)
      .field("ttl", &self.ttl)
      .finish_non_exhaustive()
  }
}
