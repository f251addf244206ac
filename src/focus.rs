//! Foreground/background visibility events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Visibility transitions of the host process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
  /// Process regained the foreground
  Focused,
  /// Process moved to the background
  Blurred,
}

struct Inner {
  focused: AtomicBool,
  tx: broadcast::Sender<Visibility>,
}

/// Source of visibility transitions that queries subscribe to.
///
/// The host (a terminal front end, a window system bridge, a test) reports
/// focus changes with [`FocusManager::set_focused`]; only actual transitions
/// are broadcast.
#[derive(Clone)]
pub struct FocusManager {
  inner: Arc<Inner>,
}

impl FocusManager {
  /// Create a manager that starts out focused.
  pub fn new() -> Self {
    let (tx, _rx) = broadcast::channel(16);
    Self {
      inner: Arc::new(Inner {
        focused: AtomicBool::new(true),
        tx,
      }),
    }
  }

  pub fn is_focused(&self) -> bool {
    self.inner.focused.load(Ordering::SeqCst)
  }

  /// Report the current focus state, broadcasting if it changed.
  pub fn set_focused(&self, focused: bool) {
    let was = self.inner.focused.swap(focused, Ordering::SeqCst);
    if was == focused {
      return;
    }

    let event = if focused {
      Visibility::Focused
    } else {
      Visibility::Blurred
    };
    debug!(?event, "visibility changed");
    // No subscribers is fine
    let _ = self.inner.tx.send(event);
  }

  /// Receive every subsequent transition.
  pub fn subscribe(&self) -> broadcast::Receiver<Visibility> {
    self.inner.tx.subscribe()
  }
}

impl Default for FocusManager {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Debug for FocusManager {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("FocusManager")
      .field("focused", &self.is_focused())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_only_transitions_are_broadcast() {
    let focus = FocusManager::new();
    let mut rx = focus.subscribe();

    focus.set_focused(true);
    focus.set_focused(false);
    focus.set_focused(false);
    focus.set_focused(true);

    assert_eq!(rx.recv().await.unwrap(), Visibility::Blurred);
    assert_eq!(rx.recv().await.unwrap(), Visibility::Focused);
    assert!(rx.try_recv().is_err());
  }

  #[test]
  fn test_starts_focused() {
    let focus = FocusManager::new();
    assert!(focus.is_focused());
    focus.set_focused(false);
    assert!(!focus.clone().is_focused());
  }
}
