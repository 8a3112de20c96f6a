use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by the prefetch cache.
///
/// Every variant is `Clone` so the single outcome of one fetch can fan out
/// to all of the callers coalesced onto it; the underlying sources are held
/// behind `Arc` for that reason.
#[derive(Error, Debug, Clone)]
pub enum PrefetchError {
    /// The fetcher rejected for a non-cancellation reason. The entry is
    /// marked failed but keeps any previously cached value, and the next
    /// `prefetch_once` for the key retries.
    #[error("Fetch failed: {0}")]
    Fetch(Arc<anyhow::Error>),

    /// A cached value did not decode into the type requested at the call
    /// site.
    #[error("Cached value could not be decoded: {0}")]
    Decode(Arc<serde_json::Error>),

    /// A value could not be encoded for storage.
    #[error("Value could not be encoded for caching: {0}")]
    Encode(Arc<serde_json::Error>),
}
