//! Error types reported by upstream live queries.

use thiserror::Error;

/// Faults an upstream live query can report.
///
/// The cache never surfaces these to subscribers; they degrade to an empty
/// snapshot and are kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    /// The caller lost (or never had) read access to the query.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Transport failure (connection dropped, read timeout).
    #[error("connection error: {0}")]
    Connection(String),

    /// The backend rejected or aborted the query.
    #[error("backend error: {0}")]
    Backend(String),

    /// A delivery could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}
