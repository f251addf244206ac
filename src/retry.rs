//! Bounded, fixed-delay retry loop shared by queries and mutations.

use color_eyre::{eyre::Report, Result};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::cancel::CancelToken;

/// How many times to retry a failed operation, and how long to wait between
/// attempts. The delay is fixed; there is no backoff or jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Extra attempts after the first failure
  pub retry: u32,
  /// Wait between attempts
  pub retry_delay: Duration,
}

impl RetryPolicy {
  pub const fn new(retry: u32, retry_delay: Duration) -> Self {
    Self { retry, retry_delay }
  }

  pub const fn none() -> Self {
    Self::new(0, Duration::ZERO)
  }
}

/// Outcome of a retry loop.
#[derive(Debug)]
pub(crate) enum Attempted<T> {
  /// The operation succeeded, or failed with retries exhausted
  Settled(Result<T>),
  /// The token was cancelled, or `on_retry` declined to continue
  Abandoned,
}

/// Run `attempt` until it succeeds or `policy.retry` extra attempts fail.
///
/// `on_retry` is called with the new retry count before each wait; returning
/// `false` abandons the loop. No attempt starts once `token` is cancelled,
/// and the wait between attempts ends early if it is. A result that arrives after `token` was cancelled is
/// reported as [`Attempted::Abandoned`].
pub(crate) async fn run<T, F, Fut, R>(
  policy: RetryPolicy,
  token: &CancelToken,
  mut attempt: F,
  mut on_retry: R,
) -> Attempted<T>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T>>,
  R: FnMut(u32, &Report) -> bool,
{
  let mut retries = 0;

  loop {
    if token.is_cancelled() {
      return Attempted::Abandoned;
    }
    let result = attempt().await;
    if token.is_cancelled() {
      return Attempted::Abandoned;
    }

    let err = match result {
      Ok(value) => return Attempted::Settled(Ok(value)),
      Err(err) => err,
    };

    if retries >= policy.retry {
      return Attempted::Settled(Err(err));
    }

    retries += 1;
    warn!(
      attempt = retries,
      max = policy.retry,
      delay_ms = policy.retry_delay.as_millis() as u64,
      "attempt failed, retrying: {err}"
    );
    if !on_retry(retries, &err) {
      return Attempted::Abandoned;
    }

    tokio::select! {
      _ = tokio::time::sleep(policy.retry_delay) => {}
      _ = token.cancelled() => return Attempted::Abandoned,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;
  use tokio::time::Instant;

  #[tokio::test(start_paused = true)]
  async fn test_exhausts_with_fixed_spacing() {
    let calls = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let start = Instant::now();
    let token = CancelToken::new();

    let outcome: Attempted<()> = run(
      RetryPolicy::new(3, Duration::from_millis(1000)),
      &token,
      || {
        calls.lock().push(start.elapsed());
        async { Err(eyre!("boom")) }
      },
      |_, _| true,
    )
    .await;

    assert!(matches!(outcome, Attempted::Settled(Err(_))));
    let calls = calls.lock();
    assert_eq!(
      *calls,
      vec![
        Duration::ZERO,
        Duration::from_millis(1000),
        Duration::from_millis(2000),
        Duration::from_millis(3000),
      ]
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_succeeds_after_failures() {
    let attempts = AtomicU32::new(0);
    let token = CancelToken::new();
    let mut seen = Vec::new();

    let outcome = run(
      RetryPolicy::new(3, Duration::from_millis(10)),
      &token,
      || {
        let n = attempts.fetch_add(1, Ordering::SeqCst);
        async move {
          if n < 2 {
            Err(eyre!("not yet"))
          } else {
            Ok(n)
          }
        }
      },
      |count, _| {
        seen.push(count);
        true
      },
    )
    .await;

    assert!(matches!(outcome, Attempted::Settled(Ok(2))));
    assert_eq!(seen, vec![1, 2]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancel_during_delay_abandons() {
    let token = CancelToken::new();
    let attempts = Arc::new(AtomicU32::new(0));

    let handle = {
      let token = token.clone();
      let attempts = attempts.clone();
      tokio::spawn(async move {
        run::<(), _, _, _>(
          RetryPolicy::new(5, Duration::from_secs(1)),
          &token,
          || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(eyre!("fail")) }
          },
          |_, _| true,
        )
        .await
      })
    };

    tokio::time::sleep(Duration::from_millis(500)).await;
    token.cancel();

    assert!(matches!(handle.await.unwrap(), Attempted::Abandoned));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_zero_retry_settles_on_first_failure() {
    let token = CancelToken::new();
    let outcome: Attempted<()> = run(
      RetryPolicy::none(),
      &token,
      || async { Err(eyre!("once")) },
      |_, _| panic!("no retries expected"),
    )
    .await;

    assert!(matches!(outcome, Attempted::Settled(Err(_))));
  }

  #[tokio::test]
  async fn test_cancelled_token_makes_no_attempt() {
    let token = CancelToken::new();
    token.cancel();
    let attempts = AtomicU32::new(0);

    let outcome: Attempted<()> = run(
      RetryPolicy::new(3, Duration::from_millis(10)),
      &token,
      || {
        attempts.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }
      },
      |_, _| true,
    )
    .await;

    assert!(matches!(outcome, Attempted::Abandoned));
    assert_eq!(attempts.load(Ordering::SeqCst), 0);
  }
}
