//! Per-key query controller.
//!
//! Inspired by TanStack Query, a `Query<T>` wraps an async fetch function with:
//! - a cache lookup against the shared [`EntryStore`]
//! - staleness tracking (`stale_time`) separate from cache expiry (`cache_time`)
//! - bounded retries with a fixed delay
//! - supersession: a newer fetch cancels the previous one, whose result is
//!   discarded when it arrives
//! - refresh triggers (mount, interval, focus regain) armed by `start()` and
//!   torn down by `stop()`
//!
//! # Example
//!
//! ```ignore
//! let query = client.query("profile:42", move |_cancel| {
//!     let api = api.clone();
//!     async move { api.profile(42).await }
//! }, client.query_options())?;
//!
//! query.start();
//!
//! let mut updates = query.subscribe();
//! while updates.changed().await.is_ok() {
//!     let state = updates.borrow().clone();
//!     render(&state);
//! }
//! ```

mod options;
mod state;

pub use options::{ErrorFn, QueryOptions, SettledFn, SuccessFn};
pub use state::QueryState;

use color_eyre::Result;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::cache::EntryStore;
use crate::cancel::CancelToken;
use crate::error::{self, QueryError};
use crate::focus::{FocusManager, Visibility};
use crate::retry::{self, Attempted};

/// A factory that starts a fetch, observing the given token
type FetcherFn<T> = Arc<dyn Fn(CancelToken) -> BoxFuture<'static, Result<T>> + Send + Sync>;

struct Shared<T> {
  state: QueryState<T>,
  /// Token of the cycle currently allowed to commit
  in_flight: Option<CancelToken>,
  /// Bumped whenever `data` is replaced wholesale
  generation: u64,
  /// Bumped by `stop()`; cycles armed under an older epoch never start
  epoch: u64,
}

#[derive(Default)]
struct Lifecycle {
  started: bool,
  tasks: Vec<JoinHandle<()>>,
}

struct Inner<T> {
  key: String,
  fetcher: FetcherFn<T>,
  options: QueryOptions<T>,
  store: EntryStore,
  focus: FocusManager,
  shared: Mutex<Shared<T>>,
  tx: watch::Sender<QueryState<T>>,
  lifecycle: Mutex<Lifecycle>,
}

/// Async query bound to one cache key.
///
/// Cloning a `Query` yields another handle to the same controller. Dropping
/// the last handle stops it, even while spawned cycles are still running.
pub struct Query<T> {
  inner: Arc<Inner<T>>,
  _lease: Arc<Lease>,
}

/// Shared by handles only, never by background tasks. Stops the query when
/// the last handle goes away.
struct Lease {
  shutdown: Box<dyn Fn() + Send + Sync>,
}

impl Drop for Lease {
  fn drop(&mut self) {
    (self.shutdown)();
  }
}

impl<T> Clone for Query<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
      _lease: Arc::clone(&self._lease),
    }
  }
}

impl<T> Query<T>
where
  T: Clone + Send + Sync + 'static,
{
  /// Create a query for `key`.
  ///
  /// Fails if `options` are inconsistent (e.g. `cache_time < stale_time`).
  /// If the store already holds a valid entry for `key`, the query starts
  /// out with that data.
  pub fn new<F, Fut>(
    key: impl Into<String>,
    fetcher: F,
    options: QueryOptions<T>,
    store: &EntryStore,
    focus: &FocusManager,
  ) -> Result<Self>
  where
    F: Fn(CancelToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    options.validate()?;
    let key = key.into();

    let mut state = QueryState::new(options.enabled);
    if let Some((value, stored_at)) = store.get_entry::<T>(&key) {
      state.data = Some(value);
      state.last_fetch_time = Some(stored_at);
      state.loading = false;
    }

    let (tx, _rx) = watch::channel(state.clone());

    let inner = Arc::new(Inner {
        key,
        fetcher: Arc::new(move |token| Box::pin(fetcher(token))),
        options,
        store: store.clone(),
        focus: focus.clone(),
        shared: Mutex::new(Shared {
          state,
          in_flight: None,
          generation: 0,
          epoch: 0,
        }),
        tx,
        lifecycle: Mutex::new(Lifecycle::default()),
      });
    let weak = Arc::downgrade(&inner);
    let lease = Arc::new(Lease {
      shutdown: Box::new(move || {
        if let Some(inner) = weak.upgrade() {
          inner.shutdown();
        }
      }),
    });

    Ok(Self {
      inner,
      _lease: lease,
    })
  }

  pub fn key(&self) -> &str {
    &self.inner.key
  }

  pub fn options(&self) -> &QueryOptions<T> {
    &self.inner.options
  }

  /// Snapshot of the current state.
  pub fn state(&self) -> QueryState<T> {
    self.inner.shared.lock().state.clone()
  }

  pub fn data(&self) -> Option<T> {
    self.inner.shared.lock().state.data.clone()
  }

  pub fn error(&self) -> Option<QueryError> {
    self.inner.shared.lock().state.error.clone()
  }

  pub fn is_loading(&self) -> bool {
    self.inner.shared.lock().state.loading
  }

  pub fn is_fetching(&self) -> bool {
    self.inner.shared.lock().state.is_fetching
  }

  pub fn is_stale(&self) -> bool {
    self.inner.is_stale()
  }

  pub fn is_success(&self) -> bool {
    self.inner.shared.lock().state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.inner.shared.lock().state.is_error()
  }

  pub fn retry_count(&self) -> u32 {
    self.inner.shared.lock().state.retry_count
  }

  /// Watch every state update.
  pub fn subscribe(&self) -> watch::Receiver<QueryState<T>> {
    self.inner.tx.subscribe()
  }

  /// Fetch unless the store holds fresh data for this key.
  pub async fn fetch(&self) {
    Arc::clone(&self.inner).run_cycle(false, None).await;
  }

  /// Fetch regardless of freshness.
  ///
  /// Resolves when the cycle settles (including retries), or as soon as it
  /// is superseded by a newer cycle.
  pub async fn refetch(&self) {
    Arc::clone(&self.inner).run_cycle(true, None).await;
  }

  /// Drop cached data for this key without fetching.
  pub fn invalidate(&self) {
    let inner = &self.inner;
    inner.store.delete(&inner.key);

    let mut shared = inner.shared.lock();
    shared.state.data = None;
    shared.state.last_fetch_time = None;
    shared.generation += 1;
    inner.publish(&shared);
    debug!(key = %inner.key, "query invalidated");
  }

  /// Replace the data manually, as if it had just been fetched.
  ///
  /// Any in-flight fetch is superseded.
  pub fn set_data(&self, value: T) {
    let inner = &self.inner;
    let mut shared = inner.shared.lock();
    if let Some(token) = shared.in_flight.take() {
      token.cancel();
    }

    inner
      .store
      .set(inner.key.clone(), value.clone(), inner.options.cache_time);
    shared.state.data = Some(value);
    shared.state.last_fetch_time = Some(Instant::now());
    shared.state.loading = false;
    shared.state.is_fetching = false;
    shared.state.error = None;
    shared.state.retry_count = 0;
    shared.generation += 1;
    inner.publish(&shared);
  }

  /// Perform the mount fetch and arm the interval and focus triggers.
  ///
  /// Calling `start()` on a started query is a no-op.
  pub fn start(&self) {
    let inner = &self.inner;
    let mut lifecycle = inner.lifecycle.lock();
    if lifecycle.started {
      return;
    }
    lifecycle.started = true;

    if !inner.options.enabled {
      debug!(key = %inner.key, "query disabled, not arming triggers");
      return;
    }

    let (has_data, epoch) = {
      let shared = inner.shared.lock();
      (shared.state.data.is_some(), shared.epoch)
    };
    if inner.options.refetch_on_mount || !has_data {
      lifecycle
        .tasks
        .push(spawn_cycle(Arc::downgrade(inner), false, epoch));
    }

    if let Some(period) = inner.options.refetch_interval {
      lifecycle
        .tasks
        .push(spawn_interval(Arc::downgrade(inner), period, epoch));
    }

    if inner.options.refetch_on_window_focus {
      lifecycle.tasks.push(spawn_focus_listener(
        Arc::downgrade(inner),
        inner.focus.subscribe(),
        epoch,
      ));
    }
  }

  /// Cancel in-flight work and tear down triggers.
  ///
  /// No state update from work started before `stop()` is applied afterwards,
  /// including trigger cycles that were spawned but had not yet begun.
  pub fn stop(&self) {
    self.inner.shutdown();
  }

  /// Generation of the current data; changes on refetch, invalidation and
  /// `set_data`, but not on `update_data`.
  pub(crate) fn generation(&self) -> u64 {
    self.inner.shared.lock().generation
  }

  /// Edit the current data in place if its generation is still `generation`.
  ///
  /// The edited value is written back to the store. Returns whether the
  /// edit was applied.
  pub(crate) fn update_data(&self, generation: u64, edit: impl FnOnce(&mut T)) -> bool {
    let inner = &self.inner;
    let mut shared = inner.shared.lock();
    if shared.generation != generation {
      return false;
    }

    let Some(data) = shared.state.data.as_mut() else {
      return false;
    };
    edit(data);
    let value = data.clone();

    inner
      .store
      .set(inner.key.clone(), value, inner.options.cache_time);
    inner.publish(&shared);
    true
  }
}

impl<T> Inner<T>
where
  T: Clone + Send + Sync + 'static,
{
  fn is_stale(&self) -> bool {
    self.shared.lock().state.is_stale(self.options.stale_time)
  }

  fn publish(&self, shared: &Shared<T>) {
    self.tx.send_replace(shared.state.clone());
  }

  fn shutdown(&self) {
    let tasks = {
      let mut lifecycle = self.lifecycle.lock();
      lifecycle.started = false;
      std::mem::take(&mut lifecycle.tasks)
    };
    for task in tasks {
      task.abort();
    }

    let mut shared = self.shared.lock();
    shared.epoch += 1;
    if let Some(token) = shared.in_flight.take() {
      token.cancel();
      shared.state.is_fetching = false;
      shared.state.loading = false;
      self.publish(&shared);
      debug!(key = %self.key, "query stopped, in-flight fetch cancelled");
    }
  }

  /// Whether a cycle armed under `epoch` may still run. Manual cycles
  /// (`epoch == None`) always may.
  fn is_current(shared: &Shared<T>, epoch: Option<u64>) -> bool {
    epoch.map_or(true, |epoch| epoch == shared.epoch)
  }

  /// Look for fresh data in the store and adopt it. Returns whether it did.
  fn adopt_fresh_entry(&self, epoch: Option<u64>) -> bool {
    let Some((value, stored_at)) = self.store.get_entry::<T>(&self.key) else {
      return false;
    };
    if Instant::now().saturating_duration_since(stored_at) > self.options.stale_time {
      return false;
    }

    let mut shared = self.shared.lock();
    if !Self::is_current(&shared, epoch) {
      // Stopped meanwhile; the caller bails out on the epoch check too
      return false;
    }
    shared.state.data = Some(value);
    shared.state.last_fetch_time = Some(stored_at);
    shared.state.loading = false;
    self.publish(&shared);
    true
  }

  /// Run one fetch cycle. `epoch` is set for trigger-started cycles, which
  /// give up if the query was stopped after they were armed.
  async fn run_cycle(self: Arc<Self>, force: bool, epoch: Option<u64>) {
    if !self.options.enabled {
      return;
    }

    if !force && self.adopt_fresh_entry(epoch) {
      debug!(key = %self.key, "fresh cache hit");
      return;
    }

    let token = CancelToken::new();
    {
      let mut shared = self.shared.lock();
      if !Self::is_current(&shared, epoch) {
        debug!(key = %self.key, "query stopped before cycle began");
        return;
      }
      if let Some(previous) = shared.in_flight.replace(token.clone()) {
        debug!(key = %self.key, superseded = previous.id(), "superseding in-flight fetch");
        previous.cancel();
      }
      shared.state.loading = shared.state.data.is_none();
      shared.state.is_fetching = true;
      shared.state.error = None;
      shared.state.retry_count = 0;
      self.publish(&shared);
    }
    debug!(key = %self.key, token = token.id(), force, "fetch started");

    let fetcher = Arc::clone(&self.fetcher);
    let outcome = retry::run(
      self.options.retry_policy(),
      &token,
      || fetcher(token.clone()),
      |count, _| {
        let mut shared = self.shared.lock();
        if token.is_cancelled() {
          return false;
        }
        shared.state.retry_count = count;
        self.publish(&shared);
        true
      },
    )
    .await;

    let result = match outcome {
      Attempted::Settled(result) => result,
      Attempted::Abandoned => {
        debug!(key = %self.key, token = token.id(), "discarding superseded fetch");
        return;
      }
    };

    let committed = {
      let mut shared = self.shared.lock();
      if token.is_cancelled() {
        debug!(key = %self.key, token = token.id(), "discarding superseded fetch");
        return;
      }
      shared.in_flight = None;
      shared.state.is_fetching = false;
      shared.state.loading = false;

      let committed = match result {
        Ok(value) => {
          self
            .store
            .set(self.key.clone(), value.clone(), self.options.cache_time);
          shared.state.data = Some(value.clone());
          shared.state.last_fetch_time = Some(Instant::now());
          shared.state.retry_count = 0;
          shared.generation += 1;
          Ok(value)
        }
        Err(report) => {
          let err = error::shared(report);
          shared.state.error = Some(Arc::clone(&err));
          Err(err)
        }
      };
      self.publish(&shared);
      committed
    };

    match committed {
      Ok(value) => {
        debug!(key = %self.key, "fetch succeeded");
        if let Some(on_success) = &self.options.on_success {
          on_success(&value);
        }
        if let Some(on_settled) = &self.options.on_settled {
          on_settled(Some(&value), None);
        }
      }
      Err(err) => {
        debug!(key = %self.key, "fetch failed: {err}");
        if let Some(on_error) = &self.options.on_error {
          on_error(&err);
        }
        if let Some(on_settled) = &self.options.on_settled {
          on_settled(None, Some(&err));
        }
      }
    }
  }
}

impl<T> Drop for Inner<T> {
  fn drop(&mut self) {
    for task in self.lifecycle.get_mut().tasks.drain(..) {
      task.abort();
    }
    if let Some(token) = self.shared.get_mut().in_flight.take() {
      token.cancel();
    }
  }
}

/// Spawn one cycle armed under `epoch`.
fn spawn_cycle<T>(inner: Weak<Inner<T>>, force: bool, epoch: u64) -> JoinHandle<()>
where
  T: Clone + Send + Sync + 'static,
{
  tokio::spawn(async move {
    if let Some(inner) = inner.upgrade() {
      inner.run_cycle(force, Some(epoch)).await;
    }
  })
}

/// Spawn a forced refetch every `period` until the query is stopped.
fn spawn_interval<T>(inner: Weak<Inner<T>>, period: Duration, epoch: u64) -> JoinHandle<()>
where
  T: Clone + Send + Sync + 'static,
{
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
      ticker.tick().await;
      let Some(strong) = inner.upgrade() else {
        break;
      };
      debug!(key = %strong.key, "interval refetch");
      drop(strong);
      spawn_cycle(inner.clone(), true, epoch);
    }
  })
}

/// Refetch stale data whenever the process regains focus.
fn spawn_focus_listener<T>(
  inner: Weak<Inner<T>>,
  mut events: broadcast::Receiver<Visibility>,
  epoch: u64,
) -> JoinHandle<()>
where
  T: Clone + Send + Sync + 'static,
{
  tokio::spawn(async move {
    loop {
      match events.recv().await {
        Ok(Visibility::Focused) => {
          let Some(strong) = inner.upgrade() else {
            break;
          };
          if strong.is_stale() {
            debug!(key = %strong.key, "focus regained with stale data, refetching");
            spawn_cycle(inner.clone(), false, epoch);
          }
        }
        Ok(Visibility::Blurred) => {}
        Err(broadcast::error::RecvError::Lagged(_)) => {}
        Err(broadcast::error::RecvError::Closed) => break,
      }
    }
  })
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.inner.key)
      .field("state", &self.inner.shared.lock().state)
      .field("options", &self.inner.options)
      .finish_non_exhaustive()
  }
}
