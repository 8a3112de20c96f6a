//! Session-lifetime prefetch cache with single-flight coalescing.
//!
//! This module provides the `PrefetchCache` shared by every feature module.
//! Values are stored type-erased as JSON and decoded back at the call site,
//! which is what lets one map serve feed, livestock and land callers with
//! different payload types.
//!
//! The cache lives only for the process; there is no persistence and no
//! size or age based eviction. Entries leave the map through `clear_cache`
//! and nothing else.

pub mod entry;
pub mod error;
pub mod key;
pub mod prefetch;

pub use entry::EntryStatus;
pub use error::PrefetchError;
pub use key::CacheKey;
pub use prefetch::{PrefetchCache, PrefetchOptions};
