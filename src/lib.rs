//! Client-side data synchronization.
//!
//! - [`EntryStore`]: bounded key/value store with per-entry TTL
//! - [`Query`]: cached, retried, refreshable reads bound to a key
//! - [`Mutation`]: retried writes with observable state
//! - [`PaginatedQuery`]: cursor-based page accumulation over a query
//! - [`QueryClient`]: owns the shared store and builds the above

pub mod cache;
pub mod cancel;
pub mod client;
pub mod config;
pub mod error;
pub mod focus;
pub mod mutation;
pub mod paginated;
pub mod query;
pub mod retry;

pub use cache::{Entry, EntryStore, DEFAULT_MAX_SIZE};
pub use cancel::CancelToken;
pub use client::QueryClient;
pub use config::Config;
pub use error::QueryError;
pub use focus::{FocusManager, Visibility};
pub use mutation::{Mutation, MutationOptions, MutationState};
pub use paginated::{Page, PaginatedOptions, PaginatedQuery};
pub use query::{Query, QueryOptions, QueryState};
pub use retry::RetryPolicy;
