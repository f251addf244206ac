//! Cursor-based page accumulation on top of a [`Query`].
//!
//! The base query loads the first page; `fetch_next_page` and
//! `fetch_previous_page` derive a cursor from the edge page and append or
//! prepend the result. Pages are never de-duplicated: avoiding overlap is up
//! to the fetch and cursor functions.

use color_eyre::Result;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::cache::EntryStore;
use crate::cancel::CancelToken;
use crate::error::{self, QueryError};
use crate::focus::FocusManager;
use crate::query::{Query, QueryOptions, QueryState};
use crate::retry::{self, Attempted, RetryPolicy};

/// One fetched page and the cursor that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T, P> {
  pub param: P,
  pub items: Vec<T>,
}

/// Derives the cursor for the page beyond `edge` (the last page going
/// forward, the first going back). `None` means there is no such page.
pub type PageParamFn<T, P> = Arc<dyn Fn(&[T], &[Page<T, P>]) -> Option<P> + Send + Sync>;

type PageFetcherFn<T, P> =
  Arc<dyn Fn(P, CancelToken) -> BoxFuture<'static, Result<Vec<T>>> + Send + Sync>;

pub struct PaginatedOptions<T, P> {
  /// Cursor of the first page loaded by the base query
  pub initial_page_param: P,
  pub get_next_page_param: PageParamFn<T, P>,
  pub get_previous_page_param: Option<PageParamFn<T, P>>,
  /// Options of the base query; its retry policy also applies to page fetches
  pub query: QueryOptions<Vec<Page<T, P>>>,
}

impl<T, P> PaginatedOptions<T, P> {
  pub fn new(
    initial_page_param: P,
    get_next_page_param: impl Fn(&[T], &[Page<T, P>]) -> Option<P> + Send + Sync + 'static,
  ) -> Self {
    Self {
      initial_page_param,
      get_next_page_param: Arc::new(get_next_page_param),
      get_previous_page_param: None,
      query: QueryOptions::default(),
    }
  }

  pub fn with_previous_page_param(
    mut self,
    get_previous_page_param: impl Fn(&[T], &[Page<T, P>]) -> Option<P> + Send + Sync + 'static,
  ) -> Self {
    self.get_previous_page_param = Some(Arc::new(get_previous_page_param));
    self
  }

  pub fn with_query_options(mut self, query: QueryOptions<Vec<Page<T, P>>>) -> Self {
    self.query = query;
    self
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
  Next,
  Previous,
}

#[derive(Default)]
struct PageFlags {
  next: Option<CancelToken>,
  previous: Option<CancelToken>,
  error: Option<QueryError>,
}

impl PageFlags {
  fn slot(&mut self, direction: Direction) -> &mut Option<CancelToken> {
    match direction {
      Direction::Next => &mut self.next,
      Direction::Previous => &mut self.previous,
    }
  }
}

/// A query whose data is an ordered list of pages.
///
/// Every base fetch cycle reloads the first page and replaces the whole list.
/// That includes the base query's triggers: a `refetch_interval` tick, or
/// focus regain while the list is stale, drops every page but the first.
/// Lists that accumulate pages usually want `refetch_interval: None` and
/// `refetch_on_window_focus: false`.
pub struct PaginatedQuery<T, P> {
  base: Query<Vec<Page<T, P>>>,
  fetch_page: PageFetcherFn<T, P>,
  get_next_page_param: PageParamFn<T, P>,
  get_previous_page_param: Option<PageParamFn<T, P>>,
  retry: RetryPolicy,
  flags: Arc<Mutex<PageFlags>>,
}

impl<T, P> Clone for PaginatedQuery<T, P> {
  fn clone(&self) -> Self {
    Self {
      base: self.base.clone(),
      fetch_page: Arc::clone(&self.fetch_page),
      get_next_page_param: Arc::clone(&self.get_next_page_param),
      get_previous_page_param: self.get_previous_page_param.clone(),
      retry: self.retry,
      flags: Arc::clone(&self.flags),
    }
  }
}

impl<T, P> PaginatedQuery<T, P>
where
  T: Clone + Send + Sync + 'static,
  P: Clone + Send + Sync + 'static,
{
  pub fn new<F, Fut>(
    key: impl Into<String>,
    fetch_page: F,
    options: PaginatedOptions<T, P>,
    store: &EntryStore,
    focus: &FocusManager,
  ) -> Result<Self>
  where
    F: Fn(P, CancelToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<T>>> + Send + 'static,
  {
    let fetch_page: PageFetcherFn<T, P> =
      Arc::new(move |param, token| Box::pin(fetch_page(param, token)));
    let retry = options.query.retry_policy();

    let first_page = {
      let fetch_page = Arc::clone(&fetch_page);
      let initial = options.initial_page_param;
      move |token: CancelToken| {
        let fetch = fetch_page(initial.clone(), token);
        let param = initial.clone();
        async move {
          let items = fetch.await?;
          Ok(vec![Page { param, items }])
        }
      }
    };

    let base = Query::new(key, first_page, options.query, store, focus)?;

    Ok(Self {
      base,
      fetch_page,
      get_next_page_param: options.get_next_page_param,
      get_previous_page_param: options.get_previous_page_param,
      retry,
      flags: Arc::new(Mutex::new(PageFlags::default())),
    })
  }

  /// The underlying query holding the page list.
  pub fn base(&self) -> &Query<Vec<Page<T, P>>> {
    &self.base
  }

  pub fn key(&self) -> &str {
    self.base.key()
  }

  pub fn pages(&self) -> Vec<Page<T, P>> {
    self.base.data().unwrap_or_default()
  }

  /// All pages' items concatenated in page order.
  pub fn data(&self) -> Vec<T> {
    self
      .pages()
      .into_iter()
      .flat_map(|page| page.items)
      .collect()
  }

  pub fn has_next_page(&self) -> bool {
    self.next_param(Direction::Next, &self.pages()).is_some()
  }

  pub fn has_previous_page(&self) -> bool {
    self.next_param(Direction::Previous, &self.pages()).is_some()
  }

  pub fn is_fetching_next_page(&self) -> bool {
    self.flags.lock().next.is_some()
  }

  pub fn is_fetching_previous_page(&self) -> bool {
    self.flags.lock().previous.is_some()
  }

  pub fn is_loading(&self) -> bool {
    self.base.is_loading()
  }

  pub fn is_fetching(&self) -> bool {
    self.base.is_fetching()
  }

  /// The last page-fetch failure, or else the base query's error.
  pub fn error(&self) -> Option<QueryError> {
    self
      .flags
      .lock()
      .error
      .clone()
      .or_else(|| self.base.error())
  }

  pub fn is_error(&self) -> bool {
    self.error().is_some()
  }

  pub fn state(&self) -> QueryState<Vec<Page<T, P>>> {
    self.base.state()
  }

  pub fn subscribe(&self) -> watch::Receiver<QueryState<Vec<Page<T, P>>>> {
    self.base.subscribe()
  }

  pub fn start(&self) {
    self.base.start();
  }

  /// Stop the base query and cancel page fetches in flight.
  pub fn stop(&self) {
    self.base.stop();
    let mut flags = self.flags.lock();
    for token in [flags.next.take(), flags.previous.take()].into_iter().flatten() {
      token.cancel();
    }
  }

  /// Reload from the first page, dropping accumulated pages. The base
  /// query's interval and focus triggers do the same.
  pub async fn refetch(&self) {
    self.flags.lock().error = None;
    self.base.refetch().await;
  }

  pub fn invalidate(&self) {
    self.flags.lock().error = None;
    self.base.invalidate();
  }

  /// Fetch the page after the last one and append it.
  ///
  /// No-op when there is no first page yet, when the cursor function reports
  /// no further page, or when a next-page fetch is already in flight.
  ///
  /// A page fetch fires the base query's callbacks like a base fetch does:
  /// `on_success` and `on_settled` receive the whole page list after the page
  /// was added, `on_error` and `on_settled` receive the final error. A page
  /// that is discarded or cancelled fires none.
  pub async fn fetch_next_page(&self) {
    self.fetch_adjacent(Direction::Next).await;
  }

  /// Fetch the page before the first one and prepend it.
  pub async fn fetch_previous_page(&self) {
    self.fetch_adjacent(Direction::Previous).await;
  }

  fn next_param(&self, direction: Direction, pages: &[Page<T, P>]) -> Option<P> {
    match direction {
      Direction::Next => {
        let last = pages.last()?;
        (self.get_next_page_param)(&last.items, pages)
      }
      Direction::Previous => {
        let first = pages.first()?;
        let get_previous = self.get_previous_page_param.as_ref()?;
        get_previous(&first.items, pages)
      }
    }
  }

  async fn fetch_adjacent(&self, direction: Direction) {
    // Read the generation first: if the page list is replaced after this,
    // the result is discarded rather than attached to the wrong list.
    let generation = self.base.generation();
    let pages = self.pages();
    let Some(param) = self.next_param(direction, &pages) else {
      debug!(key = %self.key(), ?direction, "no further page");
      return;
    };

    let token = {
      let mut flags = self.flags.lock();
      let slot = flags.slot(direction);
      if slot.is_some() {
        debug!(key = %self.key(), ?direction, "page fetch already in flight");
        return;
      }
      let token = CancelToken::new();
      *slot = Some(token.clone());
      flags.error = None;
      token
    };
    debug!(key = %self.key(), ?direction, "fetching page");

    let fetch_page = Arc::clone(&self.fetch_page);
    let outcome = retry::run(
      self.retry,
      &token,
      || fetch_page(param.clone(), token.clone()),
      |_, _| !token.is_cancelled(),
    )
    .await;

    {
      let mut flags = self.flags.lock();
      let slot = flags.slot(direction);
      if slot.as_ref().map(CancelToken::id) == Some(token.id()) {
        *slot = None;
      }
    }

    match outcome {
      Attempted::Settled(Ok(items)) => {
        let page = Page { param, items };
        let mut updated = None;
        self.base.update_data(generation, |pages| {
          match direction {
            Direction::Next => pages.push(page),
            Direction::Previous => pages.insert(0, page),
          }
          updated = Some(pages.clone());
        });
        match updated {
          Some(pages) => {
            let options = self.base.options();
            if let Some(on_success) = &options.on_success {
              on_success(&pages);
            }
            if let Some(on_settled) = &options.on_settled {
              on_settled(Some(&pages), None);
            }
          }
          None => {
            debug!(key = %self.key(), ?direction, "page list replaced during fetch, discarding page");
          }
        }
      }
      Attempted::Settled(Err(report)) => {
        let err = error::shared(report);
        debug!(key = %self.key(), ?direction, "page fetch failed: {err}");
        self.flags.lock().error = Some(Arc::clone(&err));
        let options = self.base.options();
        if let Some(on_error) = &options.on_error {
          on_error(&err);
        }
        if let Some(on_settled) = &options.on_settled {
          on_settled(None, Some(&err));
        }
      }
      Attempted::Abandoned => {
        debug!(key = %self.key(), ?direction, "page fetch cancelled");
      }
    }
  }
}

impl<T, P> std::fmt::Debug for PaginatedQuery<T, P>
where
  T: std::fmt::Debug,
  P: std::fmt::Debug,
{
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PaginatedQuery")
      .field("base", &self.base)
      .finish_non_exhaustive()
  }
}
