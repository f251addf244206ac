//! Composition root owning the shared store and focus source.

use color_eyre::Result;
use std::future::Future;
use tracing::debug;

use crate::cache::EntryStore;
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::focus::FocusManager;
use crate::mutation::{Mutation, MutationOptions};
use crate::paginated::{PaginatedOptions, PaginatedQuery};
use crate::query::{Query, QueryOptions};

/// Builds controllers that share one [`EntryStore`] and one [`FocusManager`].
///
/// Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct QueryClient {
  store: EntryStore,
  focus: FocusManager,
  config: Config,
}

impl QueryClient {
  /// A client with default options and a store of default capacity.
  pub fn new() -> Self {
    Self {
      store: EntryStore::new(),
      focus: FocusManager::new(),
      config: Config::default(),
    }
  }

  /// A client whose store capacity and default options come from `config`.
  pub fn from_config(config: &Config) -> Result<Self> {
    config.validate()?;
    debug!(max_size = config.cache.max_size, "creating query client");
    Ok(Self {
      store: EntryStore::with_capacity(config.cache.max_size),
      focus: FocusManager::new(),
      config: config.clone(),
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn store(&self) -> &EntryStore {
    &self.store
  }

  pub fn focus(&self) -> &FocusManager {
    &self.focus
  }

  /// Query defaults taken from the configuration.
  pub fn query_options<T>(&self) -> QueryOptions<T> {
    QueryOptions::from(&self.config.query)
  }

  /// Mutation defaults taken from the configuration.
  pub fn mutation_options<V, D>(&self) -> MutationOptions<V, D> {
    MutationOptions::from(&self.config.mutation)
  }

  pub fn query<T, F, Fut>(
    &self,
    key: impl Into<String>,
    fetcher: F,
    options: QueryOptions<T>,
  ) -> Result<Query<T>>
  where
    T: Clone + Send + Sync + 'static,
    F: Fn(CancelToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    Query::new(key, fetcher, options, &self.store, &self.focus)
  }

  pub fn mutation<V, D, F, Fut>(&self, mutate_fn: F, options: MutationOptions<V, D>) -> Mutation<V, D>
  where
    V: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
    F: Fn(V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<D>> + Send + 'static,
  {
    Mutation::new(mutate_fn, options)
  }

  pub fn paginated<T, P, F, Fut>(
    &self,
    key: impl Into<String>,
    fetch_page: F,
    options: PaginatedOptions<T, P>,
  ) -> Result<PaginatedQuery<T, P>>
  where
    T: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
    F: Fn(P, CancelToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<T>>> + Send + 'static,
  {
    PaginatedQuery::new(key, fetch_page, options, &self.store, &self.focus)
  }

  /// Drop the cached entry for `key`.
  ///
  /// Controllers already holding data keep it until their next fetch, which
  /// will miss the cache.
  pub fn invalidate(&self, key: &str) {
    self.store.delete(key);
  }

  pub fn clear(&self) {
    self.store.clear();
  }
}

impl Default for QueryClient {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Debug for QueryClient {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryClient")
      .field("store", &self.store)
      .field("config", &self.config)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::paginated::Page;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;
  use std::time::Duration;

  #[tokio::test(start_paused = true)]
  async fn test_queries_share_the_client_store() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let fetcher = {
      let calls = calls.clone();
      move |_token: CancelToken| {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Ok(String::from("alice")) }
      }
    };

    let first = client
      .query("user:1", fetcher.clone(), client.query_options())
      .unwrap();
    first.fetch().await;
    assert_eq!(client.store().get::<String>("user:1").as_deref(), Some("alice"));

    let second = client
      .query("user:1", fetcher, client.query_options())
      .unwrap();
    second.fetch().await;
    assert_eq!(second.data().as_deref(), Some("alice"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_forces_next_fetch() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let fetcher = {
      let calls = calls.clone();
      move |_token: CancelToken| {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move { Ok(n) }
      }
    };
    let query = client
      .query("counter", fetcher, client.query_options())
      .unwrap();

    query.fetch().await;
    client.invalidate("counter");
    assert!(!client.store().has("counter"));

    // Fresh in the controller, but the cache no longer has it
    query.fetch().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(query.data(), Some(1));
  }

  #[test]
  fn test_from_config_applies_defaults() {
    let config = Config::from_yaml(
      "cache:\n  max_size: 3\nquery:\n  retry: 1\n  stale_time_ms: 10\nmutation:\n  retry: 2\n",
    )
    .unwrap();
    let client = QueryClient::from_config(&config).unwrap();

    assert_eq!(client.store().max_size(), 3);
    let options: QueryOptions<u8> = client.query_options();
    assert_eq!(options.retry, 1);
    assert_eq!(options.stale_time, Duration::from_millis(10));
    let mutation: MutationOptions<u8, u8> = client.mutation_options();
    assert_eq!(mutation.retry, 2);
  }

  #[test]
  fn test_from_config_rejects_invalid_config() {
    let mut config = Config::default();
    config.query.cache_time = Duration::from_secs(1);
    config.query.stale_time = Duration::from_secs(2);
    assert!(QueryClient::from_config(&config).is_err());
  }

  #[tokio::test(start_paused = true)]
  async fn test_clear_empties_store() {
    let client = QueryClient::new();
    let mutation = client.mutation(
      |n: u32| async move { Ok(n + 1) },
      client.mutation_options(),
    );
    assert_eq!(mutation.mutate(1).await, Some(2));

    let options = PaginatedOptions::new(0u32, |_: &[u32], _: &[Page<u32, u32>]| None)
      .with_query_options(client.query_options().with_refetch_on_window_focus(false));
    let pages = client
      .paginated("list", |page: u32, _token| async move { Ok(vec![page]) }, options)
      .unwrap();
    pages.refetch().await;
    assert_eq!(client.store().size(), 1);

    client.clear();
    assert_eq!(client.store().size(), 0);
  }
}
