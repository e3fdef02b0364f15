//! Error taxonomy for the cache fabric.
//!
//! This module defines [`FabricError`], covering every error kind described
//! by the fabric's error handling design: validation failures at the edge,
//! not-found conditions, upstream transport failures, storage and FX
//! unavailability, data-quality rejections, and an internal catch-all.

use thiserror::Error;

/// Errors that can occur anywhere in the cache fabric.
///
/// `Clone` so that a single populate failure under single-flight coalescing
/// (§4.2.2) can be broadcast to every waiter as the same error kind, rather
/// than collapsed to a stringified message.
#[derive(Error, Debug, Clone)]
pub enum FabricError {
    /// Malformed input at an API boundary (bad symbol, missing parameter).
    #[error("validation error: {0}")]
    Validation(String),

    /// The requested entity does not exist, or not enough data exists to
    /// serve the request (unknown symbol, zero bars, insufficient series
    /// length for an indicator).
    #[error("not found: {0}")]
    NotFound(String),

    /// An upstream provider fetch exceeded its bounded timeout.
    #[error("upstream timeout after {0:?} talking to {1}")]
    UpstreamTimeout(std::time::Duration, String),

    /// An upstream provider is unreachable or returned a transport-level
    /// failure.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The persistent storage tier is unreachable.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// No FX rate could be obtained from cache or any configured provider.
    #[error("fx unavailable for {from}->{to}")]
    FxUnavailable {
        /// Source currency.
        from: String,
        /// Target currency.
        to: String,
    },

    /// Normalization rejected a batch because it violates a bar invariant.
    #[error("data quality error: {0}")]
    DataQuality(String),

    /// An unexpected internal condition.
    #[error("internal error: {0}")]
    Internal(String),
}

impl FabricError {
    /// Returns true if this error kind should never be written to the cache
    /// (timeouts and upstream failures are never cached, per the fabric's
    /// propagation policy).
    #[must_use]
    pub const fn is_cacheable_failure(&self) -> bool {
        !matches!(
            self,
            Self::UpstreamTimeout(..) | Self::UpstreamUnavailable(_)
        )
    }
}

/// Result type alias using [`FabricError`].
pub type Result<T> = std::result::Result<T, FabricError>;
