//! Query options and callbacks.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::config::QueryConfig;
use crate::error::QueryError;
use crate::retry::RetryPolicy;

pub type SuccessFn<T> = Arc<dyn Fn(&T) + Send + Sync>;
pub type ErrorFn = Arc<dyn Fn(&QueryError) + Send + Sync>;
pub type SettledFn<T> = Arc<dyn Fn(Option<&T>, Option<&QueryError>) + Send + Sync>;

/// Options recognized by a [`Query`](super::Query).
pub struct QueryOptions<T> {
  /// A disabled query never fetches
  pub enabled: bool,
  /// Age after which data is considered stale
  pub stale_time: Duration,
  /// TTL of the entry written to the store; must be >= `stale_time`
  pub cache_time: Duration,
  /// Extra attempts after a failed fetch
  pub retry: u32,
  /// Fixed wait between attempts
  pub retry_delay: Duration,
  /// Fetch when `start()` is called
  pub refetch_on_mount: bool,
  /// Fetch stale data when the process regains focus
  pub refetch_on_window_focus: bool,
  /// Periodic forced refetch
  pub refetch_interval: Option<Duration>,
  pub on_success: Option<SuccessFn<T>>,
  pub on_error: Option<ErrorFn>,
  pub on_settled: Option<SettledFn<T>>,
}

impl<T> Default for QueryOptions<T> {
  fn default() -> Self {
    Self {
      enabled: true,
      stale_time: Duration::from_secs(5 * 60),
      cache_time: Duration::from_secs(10 * 60),
      retry: 3,
      retry_delay: Duration::from_millis(1000),
      refetch_on_mount: true,
      refetch_on_window_focus: true,
      refetch_interval: None,
      on_success: None,
      on_error: None,
      on_settled: None,
    }
  }
}

impl<T> Clone for QueryOptions<T> {
  fn clone(&self) -> Self {
    Self {
      enabled: self.enabled,
      stale_time: self.stale_time,
      cache_time: self.cache_time,
      retry: self.retry,
      retry_delay: self.retry_delay,
      refetch_on_mount: self.refetch_on_mount,
      refetch_on_window_focus: self.refetch_on_window_focus,
      refetch_interval: self.refetch_interval,
      on_success: self.on_success.clone(),
      on_error: self.on_error.clone(),
      on_settled: self.on_settled.clone(),
    }
  }
}

impl<T> From<&QueryConfig> for QueryOptions<T> {
  fn from(config: &QueryConfig) -> Self {
    Self {
      enabled: config.enabled,
      stale_time: config.stale_time,
      cache_time: config.cache_time,
      retry: config.retry,
      retry_delay: config.retry_delay,
      refetch_on_mount: config.refetch_on_mount,
      refetch_on_window_focus: config.refetch_on_window_focus,
      refetch_interval: config.refetch_interval,
      ..Self::default()
    }
  }
}

impl<T> QueryOptions<T> {
  /// Reject option combinations that would behave confusingly at runtime.
  pub fn validate(&self) -> Result<()> {
    if self.cache_time < self.stale_time {
      return Err(eyre!(
        "cache_time ({:?}) must not be shorter than stale_time ({:?})",
        self.cache_time,
        self.stale_time
      ));
    }
    if self.refetch_interval == Some(Duration::ZERO) {
      return Err(eyre!("refetch_interval must be greater than zero"));
    }
    Ok(())
  }

  pub(crate) fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy::new(self.retry, self.retry_delay)
  }

  pub fn with_enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }

  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
    self.cache_time = cache_time;
    self
  }

  pub fn with_retry(mut self, retry: u32, retry_delay: Duration) -> Self {
    self.retry = retry;
    self.retry_delay = retry_delay;
    self
  }

  pub fn with_refetch_on_mount(mut self, refetch: bool) -> Self {
    self.refetch_on_mount = refetch;
    self
  }

  pub fn with_refetch_on_window_focus(mut self, refetch: bool) -> Self {
    self.refetch_on_window_focus = refetch;
    self
  }

  pub fn with_refetch_interval(mut self, interval: Option<Duration>) -> Self {
    self.refetch_interval = interval;
    self
  }

  pub fn on_success(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
    self.on_success = Some(Arc::new(f));
    self
  }

  pub fn on_error(mut self, f: impl Fn(&QueryError) + Send + Sync + 'static) -> Self {
    self.on_error = Some(Arc::new(f));
    self
  }

  pub fn on_settled(
    mut self,
    f: impl Fn(Option<&T>, Option<&QueryError>) + Send + Sync + 'static,
  ) -> Self {
    self.on_settled = Some(Arc::new(f));
    self
  }
}

impl<T> std::fmt::Debug for QueryOptions<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryOptions")
      .field("enabled", &self.enabled)
      .field("stale_time", &self.stale_time)
      .field("cache_time", &self.cache_time)
      .field("retry", &self.retry)
      .field("retry_delay", &self.retry_delay)
      .field("refetch_on_mount", &self.refetch_on_mount)
      .field("refetch_on_window_focus", &self.refetch_on_window_focus)
      .field("refetch_interval", &self.refetch_interval)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let options = QueryOptions::<()>::default();
    assert!(options.enabled);
    assert_eq!(options.stale_time, Duration::from_secs(300));
    assert_eq!(options.cache_time, Duration::from_secs(600));
    assert_eq!(options.retry, 3);
    assert_eq!(options.retry_delay, Duration::from_millis(1000));
    assert!(options.refetch_on_mount);
    assert!(options.refetch_on_window_focus);
    assert_eq!(options.refetch_interval, None);
    assert!(options.validate().is_ok());
  }

  #[test]
  fn test_cache_time_shorter_than_stale_time_is_rejected() {
    let options = QueryOptions::<()>::default()
      .with_stale_time(Duration::from_secs(60))
      .with_cache_time(Duration::from_secs(30));

    let err = options.validate().unwrap_err();
    assert!(err.to_string().contains("cache_time"));
  }

  #[test]
  fn test_equal_times_are_allowed() {
    let options = QueryOptions::<()>::default()
      .with_stale_time(Duration::from_secs(60))
      .with_cache_time(Duration::from_secs(60));
    assert!(options.validate().is_ok());
  }

  #[test]
  fn test_zero_interval_is_rejected() {
    let options = QueryOptions::<()>::default().with_refetch_interval(Some(Duration::ZERO));
    assert!(options.validate().is_err());
  }

  #[test]
  fn test_from_config() {
    let config = QueryConfig {
      retry: 1,
      refetch_interval: Some(Duration::from_secs(30)),
      ..QueryConfig::default()
    };
    let options = QueryOptions::<u8>::from(&config);
    assert_eq!(options.retry, 1);
    assert_eq!(options.refetch_interval, Some(Duration::from_secs(30)));
    assert!(options.on_success.is_none());
  }
}
