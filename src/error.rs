//! Error types shared by the controllers.

use color_eyre::eyre::Report;
use std::sync::Arc;

/// A fetch or mutation failure.
///
/// Reports are not `Clone`, but a failure has to live in published state,
/// reach callbacks and be handed to callers, so it is shared behind an `Arc`.
pub type QueryError = Arc<Report>;

pub(crate) fn shared(report: Report) -> QueryError {
  Arc::new(report)
}
