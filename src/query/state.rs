use std::time::Duration;
use tokio::time::Instant;

use crate::error::QueryError;

/// Observable state of a query.
///
/// `loading` and `is_fetching` are deliberately separate flags: `loading`
/// means there is no data to show yet, `is_fetching` means a fetch is in
/// flight, possibly refreshing data that is already visible.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
  pub data: Option<T>,
  pub loading: bool,
  pub is_fetching: bool,
  pub error: Option<QueryError>,
  /// When `data` was fetched (or stored, if adopted from the cache)
  pub last_fetch_time: Option<Instant>,
  /// Retries performed by the current cycle
  pub retry_count: u32,
}

impl<T> QueryState<T> {
  pub(crate) fn new(loading: bool) -> Self {
    Self {
      data: None,
      loading,
      is_fetching: false,
      error: None,
      last_fetch_time: None,
      retry_count: 0,
    }
  }

  /// Data is stale if it was never fetched or is older than `stale_time`.
  pub fn is_stale(&self, stale_time: Duration) -> bool {
    match self.last_fetch_time {
      Some(fetched) => Instant::now().saturating_duration_since(fetched) > stale_time,
      None => true,
    }
  }

  pub fn is_success(&self) -> bool {
    !self.loading && self.error.is_none() && self.data.is_some()
  }

  pub fn is_error(&self) -> bool {
    self.error.is_some()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;
  use std::sync::Arc;

  #[test]
  fn test_never_fetched_is_stale() {
    let state = QueryState::<u8>::new(true);
    assert!(state.is_stale(Duration::from_secs(3600)));
    assert!(!state.is_success());
    assert!(!state.is_error());
  }

  #[tokio::test(start_paused = true)]
  async fn test_staleness_boundary() {
    let mut state = QueryState::new(false);
    state.data = Some(1);
    state.last_fetch_time = Some(Instant::now());

    tokio::time::advance(Duration::from_millis(100)).await;
    assert!(!state.is_stale(Duration::from_millis(100)));

    tokio::time::advance(Duration::from_millis(1)).await;
    assert!(state.is_stale(Duration::from_millis(100)));
  }

  #[test]
  fn test_success_requires_data_and_no_error() {
    let mut state = QueryState::new(false);
    state.data = Some("x");
    assert!(state.is_success());

    state.error = Some(Arc::new(eyre!("failed")));
    assert!(!state.is_success());
    assert!(state.is_error());

    state.error = None;
    state.loading = true;
    assert!(!state.is_success());
  }
}
