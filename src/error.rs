//! Engine-internal error taxonomy
//!
//! Public engine methods are fire-and-forget; these types only travel between
//! the operation executor and the job loop, where they decide whether a queued
//! operation is retried or dropped.

use thiserror::Error;

use crate::contacts::api::RequestError;

/// Failure classification for a single queued operation attempt.
#[derive(Debug, Error)]
pub enum OperationError {
    /// Transport-level failure. The operation stays at the queue head and the
    /// job is retried.
    #[error("request failed: {0}")]
    Request(#[from] RequestError),

    /// The operation requires a resolved contact identity and none exists.
    /// The operation is dropped without retry.
    #[error("operation requires a resolved contact identity")]
    MissingIdentity,
}
