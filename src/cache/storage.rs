//! Bounded, TTL-based entry store.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::entry::{Entry, ErasedValue};

/// Default maximum number of entries.
pub const DEFAULT_MAX_SIZE: usize = 100;

struct Slot {
  /// Insertion sequence number, used for eviction order
  seq: u64,
  entry: Entry,
}

struct Inner {
  entries: HashMap<String, Slot>,
  /// Insertion order: seq -> key
  order: BTreeMap<u64, String>,
  next_seq: u64,
  max_size: usize,
}

impl Inner {
  fn remove(&mut self, key: &str) -> Option<Entry> {
    let slot = self.entries.remove(key)?;
    self.order.remove(&slot.seq);
    Some(slot.entry)
  }

  /// Drop every expired entry. Returns how many were removed.
  fn purge_expired(&mut self, now: Instant) -> usize {
    let expired: Vec<String> = self
      .entries
      .iter()
      .filter(|(_, slot)| !slot.entry.is_valid(now))
      .map(|(key, _)| key.clone())
      .collect();

    for key in &expired {
      self.remove(key);
    }

    if !expired.is_empty() {
      trace!(count = expired.len(), "purged expired cache entries");
    }
    expired.len()
  }

  /// Look up a valid entry, deleting it if it has expired.
  fn lookup(&mut self, key: &str, now: Instant) -> Option<&Entry> {
    let expired = match self.entries.get(key) {
      Some(slot) => !slot.entry.is_valid(now),
      None => return None,
    };

    if expired {
      trace!(key, "cache entry expired on read");
      self.remove(key);
      return None;
    }

    self.entries.get(key).map(|slot| &slot.entry)
  }
}

/// Bounded key -> value cache with lazy expiry.
///
/// Every clone of an `EntryStore` addresses the same map, so one store
/// built by the composition root is shared by all controllers.
///
/// Capacity is enforced on insertion: expired entries are purged first,
/// then, if the store is still full, the entry inserted longest ago is
/// evicted. Reads never reorder entries.
#[derive(Clone)]
pub struct EntryStore {
  inner: Arc<Mutex<Inner>>,
}

impl EntryStore {
  /// Create a store holding at most [`DEFAULT_MAX_SIZE`] entries.
  pub fn new() -> Self {
    Self::with_capacity(DEFAULT_MAX_SIZE)
  }

  /// Create a store holding at most `max_size` entries (minimum 1).
  pub fn with_capacity(max_size: usize) -> Self {
    Self {
      inner: Arc::new(Mutex::new(Inner {
        entries: HashMap::new(),
        order: BTreeMap::new(),
        next_seq: 0,
        max_size: max_size.max(1),
      })),
    }
  }

  pub fn max_size(&self) -> usize {
    self.inner.lock().max_size
  }

  /// Insert or replace `key`.
  ///
  /// A replaced key counts as a fresh insertion and moves to the newest
  /// position in eviction order.
  pub fn set<T>(&self, key: impl Into<String>, value: T, ttl: Duration)
  where
    T: Send + Sync + 'static,
  {
    self.set_erased(key.into(), Arc::new(value), ttl);
  }

  pub(crate) fn set_erased(&self, key: String, value: ErasedValue, ttl: Duration) {
    let mut inner = self.inner.lock();
    let now = Instant::now();

    inner.purge_expired(now);
    let replaced = inner.remove(&key).is_some();

    if !replaced && inner.entries.len() >= inner.max_size {
      let oldest = inner.order.first_key_value().map(|(_, k)| k.clone());
      if let Some(oldest) = oldest {
        debug!(evicted = %oldest, "cache at capacity, evicting oldest entry");
        inner.remove(&oldest);
      }
    }

    let seq = inner.next_seq;
    inner.next_seq += 1;
    inner.order.insert(seq, key.clone());
    inner.entries.insert(
      key,
      Slot {
        seq,
        entry: Entry::new(value, ttl),
      },
    );
  }

  /// Get the value for `key`, or `None` if it is missing, expired, or of
  /// another type.
  pub fn get<T>(&self, key: &str) -> Option<T>
  where
    T: Clone + 'static,
  {
    self.get_entry::<T>(key).map(|(value, _)| value)
  }

  /// Get the value for `key` together with the instant it was stored.
  pub fn get_entry<T>(&self, key: &str) -> Option<(T, Instant)>
  where
    T: Clone + 'static,
  {
    let mut inner = self.inner.lock();
    let entry = inner.lookup(key, Instant::now())?;

    match entry.value::<T>() {
      Some(value) => Some((value, entry.stored_at())),
      None => {
        warn!(
          key,
          expected = std::any::type_name::<T>(),
          "cache entry holds a different type"
        );
        None
      }
    }
  }

  /// Whether `key` holds a valid entry. Expired entries are removed.
  pub fn has(&self, key: &str) -> bool {
    self.inner.lock().lookup(key, Instant::now()).is_some()
  }

  /// Remove `key`. Removing a missing key is a no-op.
  pub fn delete(&self, key: &str) {
    if self.inner.lock().remove(key).is_some() {
      debug!(key, "cache entry deleted");
    }
  }

  /// Remove every entry.
  pub fn clear(&self) {
    let mut inner = self.inner.lock();
    inner.entries.clear();
    inner.order.clear();
  }

  /// Number of valid entries, after purging expired ones.
  pub fn size(&self) -> usize {
    let mut inner = self.inner.lock();
    inner.purge_expired(Instant::now());
    inner.entries.len()
  }

  /// Keys of valid entries in insertion order, after purging expired ones.
  pub fn keys(&self) -> Vec<String> {
    let mut inner = self.inner.lock();
    inner.purge_expired(Instant::now());
    inner.order.values().cloned().collect()
  }
}

impl Default for EntryStore {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Debug for EntryStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let inner = self.inner.lock();
    f.debug_struct("EntryStore")
      .field("len", &inner.entries.len())
      .field("max_size", &inner.max_size)
      .finish()
  }
}
