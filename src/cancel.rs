//! Cooperative cancellation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

struct Inner {
  id: u64,
  cancelled: AtomicBool,
  notify: Notify,
}

/// A tagged cancellation token.
///
/// Controllers hand a token to every fetch they start and cancel it when a
/// newer fetch supersedes it. Fetch functions may watch the token to abort
/// work early; the controller discards a cancelled fetch's result either way.
#[derive(Clone)]
pub struct CancelToken {
  inner: Arc<Inner>,
}

impl CancelToken {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(Inner {
        id: NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed),
        cancelled: AtomicBool::new(false),
        notify: Notify::new(),
      }),
    }
  }

  /// Unique tag of this token (shared by its clones).
  pub fn id(&self) -> u64 {
    self.inner.id
  }

  /// Trigger the token. Idempotent.
  pub fn cancel(&self) {
    if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
      self.inner.notify.notify_waiters();
    }
  }

  pub fn is_cancelled(&self) -> bool {
    self.inner.cancelled.load(Ordering::SeqCst)
  }

  /// Resolve once the token is cancelled.
  pub async fn cancelled(&self) {
    loop {
      let notified = self.inner.notify.notified();
      tokio::pin!(notified);
      // Register before checking the flag so a concurrent cancel isn't missed
      notified.as_mut().enable();
      if self.is_cancelled() {
        return;
      }
      notified.await;
    }
  }
}

impl Default for CancelToken {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Debug for CancelToken {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CancelToken")
      .field("id", &self.inner.id)
      .field("cancelled", &self.is_cancelled())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[test]
  fn test_tokens_are_tagged() {
    let a = CancelToken::new();
    let b = CancelToken::new();
    assert_ne!(a.id(), b.id());
    assert_eq!(a.id(), a.clone().id());
  }

  #[test]
  fn test_cancel_is_shared_by_clones() {
    let token = CancelToken::new();
    let clone = token.clone();
    assert!(!clone.is_cancelled());

    token.cancel();
    token.cancel();
    assert!(clone.is_cancelled());
  }

  #[tokio::test]
  async fn test_cancelled_wakes_waiter() {
    let token = CancelToken::new();
    let waiter = {
      let token = token.clone();
      tokio::spawn(async move { token.cancelled().await })
    };

    tokio::time::sleep(Duration::from_millis(5)).await;
    token.cancel();

    tokio::time::timeout(Duration::from_secs(1), waiter)
      .await
      .expect("waiter should wake")
      .unwrap();
  }

  #[tokio::test]
  async fn test_cancelled_returns_immediately_when_already_cancelled() {
    let token = CancelToken::new();
    token.cancel();
    token.cancelled().await;
  }
}
