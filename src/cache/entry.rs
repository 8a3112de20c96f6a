//! Cache entry bookkeeping for the prefetch cache.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use serde_json::Value;

use super::error::PrefetchError;

/// Shared in-flight fetch. Every coalesced waiter (and the detached driver
/// task) holds a clone of the same future and observes its one outcome.
pub(crate) type SharedFetch = Shared<BoxFuture<'static, Result<Value, PrefetchError>>>;

/// Lifecycle state of a cache entry.
///
/// `Empty` is reported for keys with no entry at all; an entry that exists
/// is always `Pending`, `Resolved` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Empty,
    Pending,
    Resolved,
    Failed,
}

/// One slot in the prefetch cache.
///
/// Invariants:
/// - at most one `inflight` future per key at any instant;
/// - `value` survives a failed refresh and is only cleared by explicit
///   invalidation or overwritten by a successful fetch or seed.
pub(crate) struct CacheEntry {
    pub(crate) value: Option<Value>,
    pub(crate) status: EntryStatus,
    pub(crate) inflight: Option<SharedFetch>,
    /// Bumped whenever a new fetch is installed. A settling fetch only
    /// writes back into the entry while its recorded generation still
    /// matches, so a cleared or superseded fetch cannot repopulate the slot.
    pub(crate) generation: u64,
    pub(crate) updated_at: DateTime<Utc>,
}

impl Default for CacheEntry {
    fn default() -> Self {
        Self {
            value: None,
            status: EntryStatus::Empty,
            inflight: None,
            generation: 0,
            updated_at: Utc::now(),
        }
    }
}
