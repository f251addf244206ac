//! One-shot writes with retry and callbacks.
//!
//! A `Mutation` never touches the entry store. Keeping cached queries
//! coherent after a write is the caller's job, usually by calling
//! [`Query::invalidate`](crate::Query::invalidate) from `on_success`.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::config::MutationConfig;
use crate::error::{self, QueryError};
use crate::retry::{self, Attempted, RetryPolicy};

type MutateFn<V, D> = Arc<dyn Fn(V) -> BoxFuture<'static, Result<D>> + Send + Sync>;

pub type MutationSuccessFn<V, D> = Arc<dyn Fn(&D, &V) + Send + Sync>;
pub type MutationErrorFn<V> = Arc<dyn Fn(&QueryError, &V) + Send + Sync>;
pub type MutationSettledFn<V, D> = Arc<dyn Fn(Option<&D>, Option<&QueryError>, &V) + Send + Sync>;

/// State of the most recent invocation chain (first attempt plus retries).
#[derive(Debug, Clone)]
pub struct MutationState<D> {
  pub data: Option<D>,
  /// True for the whole chain, retries included
  pub loading: bool,
  pub error: Option<QueryError>,
  pub is_success: bool,
  pub retry_count: u32,
}

impl<D> Default for MutationState<D> {
  fn default() -> Self {
    Self {
      data: None,
      loading: false,
      error: None,
      is_success: false,
      retry_count: 0,
    }
  }
}

impl<D> MutationState<D> {
  pub fn is_error(&self) -> bool {
    self.error.is_some()
  }
}

pub struct MutationOptions<V, D> {
  pub retry: u32,
  pub retry_delay: Duration,
  pub on_success: Option<MutationSuccessFn<V, D>>,
  pub on_error: Option<MutationErrorFn<V>>,
  pub on_settled: Option<MutationSettledFn<V, D>>,
}

impl<V, D> Default for MutationOptions<V, D> {
  fn default() -> Self {
    Self::from(&MutationConfig::default())
  }
}

impl<V, D> From<&MutationConfig> for MutationOptions<V, D> {
  fn from(config: &MutationConfig) -> Self {
    Self {
      retry: config.retry,
      retry_delay: config.retry_delay,
      on_success: None,
      on_error: None,
      on_settled: None,
    }
  }
}

impl<V, D> MutationOptions<V, D> {
  pub fn with_retry(mut self, retry: u32, retry_delay: Duration) -> Self {
    self.retry = retry;
    self.retry_delay = retry_delay;
    self
  }

  pub fn on_success(mut self, f: impl Fn(&D, &V) + Send + Sync + 'static) -> Self {
    self.on_success = Some(Arc::new(f));
    self
  }

  pub fn on_error(mut self, f: impl Fn(&QueryError, &V) + Send + Sync + 'static) -> Self {
    self.on_error = Some(Arc::new(f));
    self
  }

  pub fn on_settled(
    mut self,
    f: impl Fn(Option<&D>, Option<&QueryError>, &V) + Send + Sync + 'static,
  ) -> Self {
    self.on_settled = Some(Arc::new(f));
    self
  }
}

struct Shared<D> {
  state: MutationState<D>,
  /// Sequence number of the chain allowed to write `state`
  chain: u64,
}

struct Inner<V, D> {
  mutate_fn: MutateFn<V, D>,
  options: MutationOptions<V, D>,
  shared: Mutex<Shared<D>>,
  tx: watch::Sender<MutationState<D>>,
}

/// Wraps a write operation with retries and success/error/settle callbacks.
///
/// When calls overlap, every call runs to completion and returns its own
/// outcome, but only the most recently started call writes the observable
/// state.
pub struct Mutation<V, D> {
  inner: Arc<Inner<V, D>>,
}

impl<V, D> Clone for Mutation<V, D> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<V, D> Mutation<V, D>
where
  V: Clone + Send + Sync + 'static,
  D: Clone + Send + Sync + 'static,
{
  pub fn new<F, Fut>(mutate_fn: F, options: MutationOptions<V, D>) -> Self
  where
    F: Fn(V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<D>> + Send + 'static,
  {
    let (tx, _rx) = watch::channel(MutationState::default());
    Self {
      inner: Arc::new(Inner {
        mutate_fn: Arc::new(move |vars| Box::pin(mutate_fn(vars))),
        options,
        shared: Mutex::new(Shared {
          state: MutationState::default(),
          chain: 0,
        }),
        tx,
      }),
    }
  }

  /// Run the mutation, returning `None` on final failure.
  ///
  /// The failure is not lost: it is recorded in [`Mutation::error`] and
  /// passed to `on_error`. This form exists for fire-and-forget call sites
  /// that react through state or callbacks; use [`Mutation::mutate_async`]
  /// to handle the error at the call site.
  pub async fn mutate(&self, vars: V) -> Option<D> {
    self.mutate_async(vars).await.ok()
  }

  /// Run the mutation, propagating the final error.
  pub async fn mutate_async(&self, vars: V) -> Result<D, QueryError> {
    let inner = &self.inner;
    let chain = {
      let mut shared = inner.shared.lock();
      shared.chain += 1;
      shared.state = MutationState {
        loading: true,
        ..MutationState::default()
      };
      inner.publish(&shared);
      shared.chain
    };

    let policy = RetryPolicy::new(inner.options.retry, inner.options.retry_delay);
    // Mutations are never superseded; the token only satisfies the retry loop
    let token = CancelToken::new();
    let outcome = retry::run(
      policy,
      &token,
      || (inner.mutate_fn)(vars.clone()),
      |count, _| {
        let mut shared = inner.shared.lock();
        if shared.chain == chain {
          shared.state.retry_count = count;
          inner.publish(&shared);
        }
        true
      },
    )
    .await;

    let result = match outcome {
      Attempted::Settled(result) => result.map_err(error::shared),
      Attempted::Abandoned => Err(error::shared(eyre!("mutation abandoned"))),
    };

    {
      let mut shared = inner.shared.lock();
      if shared.chain == chain {
        shared.state.loading = false;
        match &result {
          Ok(data) => {
            shared.state.data = Some(data.clone());
            shared.state.is_success = true;
          }
          Err(err) => {
            shared.state.error = Some(Arc::clone(err));
          }
        }
        inner.publish(&shared);
      } else {
        debug!(chain, "newer mutation started, not recording outcome");
      }
    }

    match &result {
      Ok(data) => {
        if let Some(on_success) = &inner.options.on_success {
          on_success(data, &vars);
        }
        if let Some(on_settled) = &inner.options.on_settled {
          on_settled(Some(data), None, &vars);
        }
      }
      Err(err) => {
        debug!("mutation failed: {err}");
        if let Some(on_error) = &inner.options.on_error {
          on_error(err, &vars);
        }
        if let Some(on_settled) = &inner.options.on_settled {
          on_settled(None, Some(err), &vars);
        }
      }
    }

    result
  }

  /// Return to the initial state. A call still running will not write its
  /// outcome afterwards.
  pub fn reset(&self) {
    let mut shared = self.inner.shared.lock();
    shared.chain += 1;
    shared.state = MutationState::default();
    self.inner.publish(&shared);
  }

  pub fn state(&self) -> MutationState<D> {
    self.inner.shared.lock().state.clone()
  }

  pub fn data(&self) -> Option<D> {
    self.inner.shared.lock().state.data.clone()
  }

  pub fn error(&self) -> Option<QueryError> {
    self.inner.shared.lock().state.error.clone()
  }

  pub fn is_loading(&self) -> bool {
    self.inner.shared.lock().state.loading
  }

  pub fn is_success(&self) -> bool {
    self.inner.shared.lock().state.is_success
  }

  pub fn is_error(&self) -> bool {
    self.inner.shared.lock().state.is_error()
  }

  pub fn retry_count(&self) -> u32 {
    self.inner.shared.lock().state.retry_count
  }

  pub fn subscribe(&self) -> watch::Receiver<MutationState<D>> {
    self.inner.tx.subscribe()
  }
}

impl<V, D: Clone> Inner<V, D> {
  fn publish(&self, shared: &Shared<D>) {
    self.tx.send_replace(shared.state.clone());
  }
}

impl<V, D: std::fmt::Debug> std::fmt::Debug for Mutation<V, D> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Mutation")
      .field("state", &self.inner.shared.lock().state)
      .field("retry", &self.inner.options.retry)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};
  use tokio::time::sleep;

  /// Fails the first `failures` calls, then echoes the input doubled
  fn flaky(
    failures: u32,
    calls: Arc<AtomicU32>,
  ) -> impl Fn(u32) -> BoxFuture<'static, Result<u32>> + Send + Sync + 'static {
    move |vars| {
      let n = calls.fetch_add(1, Ordering::SeqCst);
      Box::pin(async move {
        sleep(Duration::from_millis(10)).await;
        if n < failures {
          Err(eyre!("write rejected"))
        } else {
          Ok(vars * 2)
        }
      })
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_mutate_success() {
    let calls = Arc::new(AtomicU32::new(0));
    let mutation = Mutation::new(flaky(0, calls.clone()), MutationOptions::default());

    assert_eq!(mutation.mutate(21).await, Some(42));
    assert!(mutation.is_success());
    assert!(!mutation.is_loading());
    assert_eq!(mutation.data(), Some(42));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_mutate_swallows_and_mutate_async_propagates() {
    let calls = Arc::new(AtomicU32::new(0));
    let mutation = Mutation::new(flaky(u32::MAX, calls), MutationOptions::default());

    assert_eq!(mutation.mutate(1).await, None);
    assert!(mutation.is_error());
    assert!(!mutation.is_success());

    let err = mutation.mutate_async(1).await.unwrap_err();
    assert!(err.to_string().contains("write rejected"));
    assert!(mutation.is_error());
  }

  #[tokio::test(start_paused = true)]
  async fn test_loading_spans_retries() {
    let calls = Arc::new(AtomicU32::new(0));
    let mutation = Mutation::new(
      flaky(2, calls.clone()),
      MutationOptions::default().with_retry(3, Duration::from_millis(100)),
    );

    let handle = {
      let mutation = mutation.clone();
      tokio::spawn(async move { mutation.mutate(5).await })
    };

    sleep(Duration::from_millis(50)).await;
    assert!(mutation.is_loading());
    assert_eq!(mutation.retry_count(), 1);
    assert!(!mutation.is_error());

    assert_eq!(handle.await.unwrap(), Some(10));
    assert!(!mutation.is_loading());
    assert!(mutation.is_success());
    assert_eq!(mutation.retry_count(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_exhaustion_attempt_count() {
    let calls = Arc::new(AtomicU32::new(0));
    let mutation = Mutation::new(
      flaky(u32::MAX, calls.clone()),
      MutationOptions::default().with_retry(2, Duration::from_millis(50)),
    );

    assert!(mutation.mutate_async(1).await.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(mutation.retry_count(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_reset_isolates_invocations() {
    let calls = Arc::new(AtomicU32::new(0));
    let mutation = Mutation::new(
      flaky(1, calls.clone()),
      MutationOptions::default().with_retry(1, Duration::from_millis(10)),
    );

    mutation.mutate(1).await;
    assert!(mutation.is_success());
    assert_eq!(mutation.retry_count(), 1);

    mutation.reset();
    let state = mutation.state();
    assert!(!state.is_success);
    assert!(!state.loading);
    assert!(state.error.is_none());
    assert!(state.data.is_none());
    assert_eq!(state.retry_count, 0);

    // Second chain succeeds first time: its retry count is its own
    mutation.mutate(2).await;
    assert!(mutation.is_success());
    assert_eq!(mutation.retry_count(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_new_call_clears_previous_error() {
    let calls = Arc::new(AtomicU32::new(0));
    let mutation = Mutation::new(flaky(1, calls), MutationOptions::default());

    assert_eq!(mutation.mutate(1).await, None);
    assert!(mutation.is_error());

    let handle = {
      let mutation = mutation.clone();
      tokio::spawn(async move { mutation.mutate(3).await })
    };
    sleep(Duration::from_millis(1)).await;
    assert!(mutation.is_loading());
    assert!(!mutation.is_error());

    assert_eq!(handle.await.unwrap(), Some(6));
    assert!(mutation.is_success());
  }

  #[tokio::test(start_paused = true)]
  async fn test_callbacks_receive_variables() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let options = {
      let on_success = seen.clone();
      let on_error = seen.clone();
      let on_settled = seen.clone();
      MutationOptions::default()
        .on_success(move |data: &u32, vars: &u32| {
          on_success.lock().push(format!("success {vars}->{data}"));
        })
        .on_error(move |_, vars: &u32| {
          on_error.lock().push(format!("error {vars}"));
        })
        .on_settled(move |data: Option<&u32>, err, vars: &u32| {
          on_settled
            .lock()
            .push(format!("settled {vars} {} {}", data.is_some(), err.is_some()));
        })
    };

    let calls = Arc::new(AtomicU32::new(0));
    let mutation = Mutation::new(flaky(1, calls), options);
    mutation.mutate(1).await;
    mutation.mutate(2).await;

    assert_eq!(
      *seen.lock(),
      vec![
        "error 1".to_string(),
        "settled 1 false true".to_string(),
        "success 2->4".to_string(),
        "settled 2 true false".to_string(),
      ]
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_overlapping_calls_latest_owns_state() {
    let mutation = Mutation::new(
      |delay_ms: u64| async move {
        sleep(Duration::from_millis(delay_ms)).await;
        Ok(delay_ms)
      },
      MutationOptions::default(),
    );

    let slow = {
      let mutation = mutation.clone();
      tokio::spawn(async move { mutation.mutate(100).await })
    };
    sleep(Duration::from_millis(1)).await;
    assert_eq!(mutation.mutate(10).await, Some(10));
    assert_eq!(mutation.data(), Some(10));

    // The older call still gets its own result
    assert_eq!(slow.await.unwrap(), Some(100));
    assert_eq!(mutation.data(), Some(10));
  }

  #[tokio::test(start_paused = true)]
  async fn test_reset_during_call_discards_outcome() {
    let calls = Arc::new(AtomicU32::new(0));
    let mutation = Mutation::new(flaky(0, calls), MutationOptions::default());

    let handle = {
      let mutation = mutation.clone();
      tokio::spawn(async move { mutation.mutate(1).await })
    };
    sleep(Duration::from_millis(1)).await;
    mutation.reset();

    assert_eq!(handle.await.unwrap(), Some(2));
    assert!(!mutation.is_success());
    assert!(mutation.data().is_none());
  }

  #[tokio::test]
  async fn test_subscribe_sees_final_state() {
    let calls = Arc::new(AtomicU32::new(0));
    let mutation = Mutation::new(flaky(0, calls), MutationOptions::default());
    let updates = mutation.subscribe();

    mutation.mutate(4).await;
    let state = updates.borrow().clone();
    assert!(state.is_success);
    assert_eq!(state.data, Some(8));
  }
}
