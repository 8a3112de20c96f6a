//! Single-flight prefetch coordinator over the shared cache store.
//!
//! `prefetch_once` is the entry point every domain caller goes through: it
//! serves resolved entries without touching the network, coalesces
//! concurrent callers onto one in-flight fetch, and retains stale values
//! across failed refreshes so screens can keep rendering the last known
//! data.
//!
//! All bookkeeping is synchronous under one mutex acquisition; the lock is
//! never held across an await. That is what preserves the single-flight
//! invariant (check entry, install in-flight future) under the
//! multi-threaded runtime.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::entry::{CacheEntry, EntryStatus, SharedFetch};
use super::error::PrefetchError;
use super::key::CacheKey;

/// Options for a `prefetch_once` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefetchOptions {
    /// Start a fresh fetch even when a resolved entry or pending fetch
    /// already exists for the key.
    pub force: bool,
}

impl PrefetchOptions {
    pub fn forced() -> Self {
        Self { force: true }
    }
}

/// What `prefetch_once` decided to do for a key, computed under the lock.
enum FetchPlan {
    CachedValue(Value),
    JoinInflight(SharedFetch),
    StartFetch,
}

/// Keyed prefetch cache with single-flight fetch-or-serve semantics.
///
/// Cloning is cheap; clones share the same store. One instance is created
/// at app startup and handed to every feature module.
#[derive(Clone, Default)]
pub struct PrefetchCache {
    store: Arc<Store>,
}

#[derive(Default)]
struct Store {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl PrefetchCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch-or-serve for one cache key.
    ///
    /// - Resolved entry, not forced: returns the cached value, no fetch.
    /// - Pending entry, not forced: awaits the existing in-flight fetch, so
    ///   N concurrent callers observe the identical outcome of one fetch.
    /// - Otherwise (forced, or empty/failed entry): runs `fetcher` once and
    ///   stores the result. On failure the entry is marked failed but keeps
    ///   any previous value, and the next call retries.
    ///
    /// A forced call that finds a fetch already pending supersedes it: the
    /// older fetch still settles and its waiters still receive its outcome,
    /// but the store only honours the newest fetch for the key.
    pub async fn prefetch_once<T, F, Fut>(
        &self,
        key: &CacheKey,
        fetcher: F,
        options: PrefetchOptions,
    ) -> Result<T, PrefetchError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let shared = {
            let mut entries = self.store.lock_entries();
            let entry = entries.entry(key.as_str().to_owned()).or_default();

            match Self::classify(entry, options.force) {
                FetchPlan::CachedValue(value) => {
                    debug!(key = %key, "prefetch cache hit");
                    return decode_value(key, value);
                }
                FetchPlan::JoinInflight(inflight) => {
                    debug!(key = %key, "coalescing onto in-flight fetch");
                    inflight
                }
                FetchPlan::StartFetch => self.install_fetch(entry, key, fetcher()),
            }
        };

        let value = shared.await?;
        decode_value(key, value)
    }

    /// Last known value for the key, or `None`. Never triggers a fetch and
    /// never fails: a value that does not decode into `T` is logged and
    /// reported as absent.
    pub fn get_cached_data<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let value = {
            let entries = self.store.lock_entries();
            entries.get(key.as_str()).and_then(|entry| entry.value.clone())
        }?;

        match serde_json::from_value(value) {
            Ok(data) => Some(data),
            Err(error) => {
                warn!(key = %key, %error, "cached value did not decode to the requested type");
                None
            }
        }
    }

    /// Seed the cache with an authoritative value (typically the response of
    /// a mutation). Marks the entry resolved and refreshes its timestamp.
    ///
    /// A fetch already running for the key is not cancelled; if it completes
    /// later it overwrites this seed (last completion wins).
    pub fn set_cache<T: Serialize>(&self, key: &CacheKey, data: &T) -> Result<(), PrefetchError> {
        let value = serde_json::to_value(data).map_err(|e| PrefetchError::Encode(Arc::new(e)))?;

        let mut entries = self.store.lock_entries();
        let entry = entries.entry(key.as_str().to_owned()).or_default();
        entry.value = Some(value);
        entry.status = EntryStatus::Resolved;
        entry.updated_at = Utc::now();
        // Generation untouched: an in-flight fetch keeps the right to
        // overwrite this seed when it settles.
        debug!(key = %key, "cache seeded");
        Ok(())
    }

    /// Delete the entry outright. A fetch still running for the key is not
    /// aborted; its result is discarded on arrival because the entry (and
    /// with it the recorded generation) is gone.
    pub fn clear_cache(&self, key: &CacheKey) {
        let removed = self.store.lock_entries().remove(key.as_str());
        if removed.is_some() {
            debug!(key = %key, "cache entry cleared");
        }
    }

    /// Drop every entry (logout-style reset).
    pub fn clear_all(&self) {
        let mut entries = self.store.lock_entries();
        let count = entries.len();
        entries.clear();
        debug!(count, "cache cleared");
    }

    /// Advisory status of the entry; `Empty` for keys never fetched or
    /// already cleared.
    pub fn entry_status(&self, key: &CacheKey) -> EntryStatus {
        self.store
            .lock_entries()
            .get(key.as_str())
            .map(|entry| entry.status)
            .unwrap_or(EntryStatus::Empty)
    }

    /// When the entry last changed (resolved, failed or seeded).
    pub fn last_updated(&self, key: &CacheKey) -> Option<DateTime<Utc>> {
        self.store
            .lock_entries()
            .get(key.as_str())
            .map(|entry| entry.updated_at)
    }

    fn classify(entry: &CacheEntry, force: bool) -> FetchPlan {
        if force {
            return FetchPlan::StartFetch;
        }
        match entry.status {
            EntryStatus::Resolved => match &entry.value {
                Some(value) => FetchPlan::CachedValue(value.clone()),
                None => FetchPlan::StartFetch,
            },
            EntryStatus::Pending => match &entry.inflight {
                Some(inflight) => FetchPlan::JoinInflight(inflight.clone()),
                None => FetchPlan::StartFetch,
            },
            EntryStatus::Empty | EntryStatus::Failed => FetchPlan::StartFetch,
        }
    }

    /// Install a new in-flight fetch for the entry. Called with the store
    /// lock held; nothing here awaits.
    fn install_fetch<T, Fut>(&self, entry: &mut CacheEntry, key: &CacheKey, fut: Fut) -> SharedFetch
    where
        T: Serialize + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        entry.status = EntryStatus::Pending;
        entry.generation = entry.generation.wrapping_add(1);
        let generation = entry.generation;

        let store = Arc::clone(&self.store);
        let rendered = key.as_str().to_owned();

        let shared: SharedFetch = async move {
            let result = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(data)) => {
                    serde_json::to_value(data).map_err(|e| PrefetchError::Encode(Arc::new(e)))
                }
                Ok(Err(error)) => Err(PrefetchError::Fetch(Arc::new(error))),
                Err(_) => Err(PrefetchError::Fetch(Arc::new(anyhow!("fetcher panicked")))),
            };
            store.apply_fetch_outcome(&rendered, generation, result)
        }
        .boxed()
        .shared();

        entry.inflight = Some(shared.clone());

        // Detached driver: the fetch settles and the entry is updated even
        // if every caller awaiting it has been dropped.
        tokio::spawn(shared.clone().map(|_| ()));

        debug!(key = %key, generation, "fetch started");
        shared
    }
}

impl Store {
    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write a settled fetch back into its entry, unless the entry was
    /// cleared or the fetch was superseded in the meantime. The outcome is
    /// returned either way so waiters always observe the fetch they joined.
    fn apply_fetch_outcome(
        &self,
        key: &str,
        generation: u64,
        result: Result<Value, PrefetchError>,
    ) -> Result<Value, PrefetchError> {
        let mut entries = self.lock_entries();

        let Some(entry) = entries.get_mut(key) else {
            debug!(key, "entry cleared while fetch was in flight, discarding result");
            return result;
        };
        if entry.generation != generation {
            debug!(
                key,
                generation,
                current = entry.generation,
                "fetch superseded, discarding result"
            );
            return result;
        }

        entry.inflight = None;
        entry.updated_at = Utc::now();
        match &result {
            Ok(value) => {
                entry.value = Some(value.clone());
                entry.status = EntryStatus::Resolved;
                debug!(key, "fetch resolved");
            }
            Err(error) => {
                entry.status = EntryStatus::Failed;
                debug!(key, %error, "fetch failed, retaining stale value");
            }
        }
        result
    }
}

fn decode_value<T: DeserializeOwned>(key: &CacheKey, value: Value) -> Result<T, PrefetchError> {
    serde_json::from_value(value).map_err(|e| {
        warn!(key = %key, error = %e, "cached value did not decode to the requested type");
        PrefetchError::Decode(Arc::new(e))
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::oneshot;
    use tokio::task::yield_now;

    use super::*;

    /// Opt-in log output for debugging: RUST_LOG=debug cargo test -- --nocapture
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// Spin until the entry reaches the wanted status; the fetch driver runs
    /// on the same cooperative runtime, so a bounded number of yields is
    /// always enough.
    async fn wait_for_status(cache: &PrefetchCache, key: &CacheKey, status: EntryStatus) {
        for _ in 0..200 {
            if cache.entry_status(key) == status {
                return;
            }
            yield_now().await;
        }
        panic!("entry never reached {:?}", status);
    }

    #[tokio::test]
    async fn test_single_flight_coalesces_concurrent_calls() {
        init_tracing();
        let cache = PrefetchCache::new();
        let key = CacheKey::new("livestock");
        let calls = Arc::new(AtomicUsize::new(0));
        let (release, gate) = oneshot::channel::<()>();

        let first = {
            let cache = cache.clone();
            let key = key.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cache
                    .prefetch_once(
                        &key,
                        move || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            async move {
                                let _ = gate.await;
                                Ok(vec![1, 2, 3])
                            }
                        },
                        PrefetchOptions::default(),
                    )
                    .await
            })
        };

        wait_for_status(&cache, &key, EntryStatus::Pending).await;

        let second = {
            let cache = cache.clone();
            let key = key.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cache
                    .prefetch_once(
                        &key,
                        move || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            async move { Ok(vec![9, 9, 9]) }
                        },
                        PrefetchOptions::default(),
                    )
                    .await
            })
        };

        // Give the second caller time to join before the fetch settles.
        for _ in 0..10 {
            yield_now().await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        release.send(()).unwrap();

        let a = first.await.unwrap().unwrap();
        let b = second.await.unwrap().unwrap();
        assert_eq!(a, vec![1, 2, 3]);
        assert_eq!(b, vec![1, 2, 3]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_hit_short_circuits_later_calls() {
        let cache = PrefetchCache::new();
        let key = CacheKey::new("feed_batches");

        let value: Vec<i32> = cache
            .prefetch_once(&key, || async { Ok(vec![7]) }, PrefetchOptions::default())
            .await
            .unwrap();
        assert_eq!(value, vec![7]);

        let second_invoked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&second_invoked);
        let value: Vec<i32> = cache
            .prefetch_once(
                &key,
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(vec![8]) }
                },
                PrefetchOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(value, vec![7]);
        assert_eq!(second_invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_force_bypasses_resolved_entry() {
        let cache = PrefetchCache::new();
        let key = CacheKey::new("parcels");

        let _: String = cache
            .prefetch_once(
                &key,
                || async { Ok("first".to_string()) },
                PrefetchOptions::default(),
            )
            .await
            .unwrap();

        let invoked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&invoked);
        let value: String = cache
            .prefetch_once(
                &key,
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async move { Ok("second".to_string()) }
                },
                PrefetchOptions::forced(),
            )
            .await
            .unwrap();

        assert_eq!(value, "second");
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get_cached_data::<String>(&key), Some("second".to_string()));
    }

    #[tokio::test]
    async fn test_failed_refresh_retains_stale_value() {
        let cache = PrefetchCache::new();
        let key = CacheKey::new("herd_summary");

        let _: String = cache
            .prefetch_once(
                &key,
                || async { Ok("stale".to_string()) },
                PrefetchOptions::default(),
            )
            .await
            .unwrap();

        let result: Result<String, _> = cache
            .prefetch_once(
                &key,
                || async { Err(anyhow!("backend unavailable")) },
                PrefetchOptions::forced(),
            )
            .await;

        assert!(matches!(result, Err(PrefetchError::Fetch(_))));
        assert_eq!(cache.entry_status(&key), EntryStatus::Failed);
        assert_eq!(cache.get_cached_data::<String>(&key), Some("stale".to_string()));
    }

    #[tokio::test]
    async fn test_failed_entry_retries_without_force() {
        let cache = PrefetchCache::new();
        let key = CacheKey::new("paddocks");

        let result: Result<u32, _> = cache
            .prefetch_once(
                &key,
                || async { Err(anyhow!("timeout")) },
                PrefetchOptions::default(),
            )
            .await;
        assert!(result.is_err());

        let value: u32 = cache
            .prefetch_once(&key, || async { Ok(42) }, PrefetchOptions::default())
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(cache.entry_status(&key), EntryStatus::Resolved);
    }

    #[tokio::test]
    async fn test_manual_seed_serves_without_fetch() {
        let cache = PrefetchCache::new();
        let key = CacheKey::with_params("livestock", &[("herd", "4")]);

        cache.set_cache(&key, &vec!["bess", "clover"]).unwrap();

        assert_eq!(
            cache.get_cached_data::<Vec<String>>(&key),
            Some(vec!["bess".to_string(), "clover".to_string()])
        );
        assert_eq!(cache.entry_status(&key), EntryStatus::Resolved);
    }

    #[tokio::test]
    async fn test_clear_cache_forces_refetch() {
        let cache = PrefetchCache::new();
        let key = CacheKey::new("soil_tests");
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let counter = Arc::clone(&calls);
            let _: u32 = cache
                .prefetch_once(
                    &key,
                    move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                        async move { Ok(1) }
                    },
                    PrefetchOptions::default(),
                )
                .await
                .unwrap();
            cache.clear_cache(&key);
            assert_eq!(cache.entry_status(&key), EntryStatus::Empty);
            assert_eq!(cache.get_cached_data::<u32>(&key), None);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_clear_during_fetch_discards_late_result() {
        let cache = PrefetchCache::new();
        let key = CacheKey::new("invoices");
        let (release, gate) = oneshot::channel::<()>();

        let waiter = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move {
                cache
                    .prefetch_once(
                        &key,
                        move || async move {
                            let _ = gate.await;
                            Ok("late".to_string())
                        },
                        PrefetchOptions::default(),
                    )
                    .await
            })
        };

        wait_for_status(&cache, &key, EntryStatus::Pending).await;
        cache.clear_cache(&key);
        release.send(()).unwrap();

        // The waiter still observes the fetch it joined...
        let value = waiter.await.unwrap().unwrap();
        assert_eq!(value, "late");

        // ...but the cleared entry is not repopulated by the late result.
        for _ in 0..20 {
            yield_now().await;
        }
        assert_eq!(cache.entry_status(&key), EntryStatus::Empty);
        assert_eq!(cache.get_cached_data::<String>(&key), None);
    }

    #[tokio::test]
    async fn test_forced_call_supersedes_pending_fetch() {
        init_tracing();
        let cache = PrefetchCache::new();
        let key = CacheKey::new("deliveries");
        let (release_old, gate_old) = oneshot::channel::<()>();
        let (release_new, gate_new) = oneshot::channel::<()>();

        let old = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move {
                cache
                    .prefetch_once(
                        &key,
                        move || async move {
                            let _ = gate_old.await;
                            Ok("old".to_string())
                        },
                        PrefetchOptions::default(),
                    )
                    .await
            })
        };

        wait_for_status(&cache, &key, EntryStatus::Pending).await;

        let new = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move {
                cache
                    .prefetch_once(
                        &key,
                        move || async move {
                            let _ = gate_new.await;
                            Ok("new".to_string())
                        },
                        PrefetchOptions::forced(),
                    )
                    .await
            })
        };

        for _ in 0..10 {
            yield_now().await;
        }

        // The superseded fetch settles first; its waiter gets its outcome,
        // the store discards it.
        release_old.send(()).unwrap();
        assert_eq!(old.await.unwrap().unwrap(), "old");
        assert_eq!(cache.get_cached_data::<String>(&key), None);
        assert_eq!(cache.entry_status(&key), EntryStatus::Pending);

        release_new.send(()).unwrap();
        assert_eq!(new.await.unwrap().unwrap(), "new");
        assert_eq!(cache.get_cached_data::<String>(&key), Some("new".to_string()));
        assert_eq!(cache.entry_status(&key), EntryStatus::Resolved);
    }

    #[tokio::test]
    async fn test_seed_overwritten_when_inflight_fetch_completes() {
        let cache = PrefetchCache::new();
        let key = CacheKey::new("feed_plan");
        let (release, gate) = oneshot::channel::<()>();

        let waiter = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move {
                cache
                    .prefetch_once(
                        &key,
                        move || async move {
                            let _ = gate.await;
                            Ok("fresh".to_string())
                        },
                        PrefetchOptions::default(),
                    )
                    .await
            })
        };

        wait_for_status(&cache, &key, EntryStatus::Pending).await;
        cache.set_cache(&key, &"seed").unwrap();
        assert_eq!(cache.get_cached_data::<String>(&key), Some("seed".to_string()));

        release.send(()).unwrap();
        waiter.await.unwrap().unwrap();

        // Last completion wins: the fetch that was already running
        // overwrites the seed.
        assert_eq!(cache.get_cached_data::<String>(&key), Some("fresh".to_string()));
    }

    #[tokio::test]
    async fn test_fetch_settles_after_all_waiters_dropped() {
        let cache = PrefetchCache::new();
        let key = CacheKey::new("weather");
        let (release, gate) = oneshot::channel::<()>();

        let waiter = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move {
                cache
                    .prefetch_once(
                        &key,
                        move || async move {
                            let _ = gate.await;
                            Ok("sunny".to_string())
                        },
                        PrefetchOptions::default(),
                    )
                    .await
            })
        };

        wait_for_status(&cache, &key, EntryStatus::Pending).await;
        waiter.abort();

        release.send(()).unwrap();
        wait_for_status(&cache, &key, EntryStatus::Resolved).await;
        assert_eq!(cache.get_cached_data::<String>(&key), Some("sunny".to_string()));
    }

    #[tokio::test]
    async fn test_fetcher_panic_marks_entry_failed() {
        let cache = PrefetchCache::new();
        let key = CacheKey::new("machinery");

        let result: Result<u32, PrefetchError> = cache
            .prefetch_once(&key, || async { panic!("boom") }, PrefetchOptions::default())
            .await;

        assert!(matches!(result, Err(PrefetchError::Fetch(_))));
        assert_eq!(cache.entry_status(&key), EntryStatus::Failed);

        let value: u32 = cache
            .prefetch_once(&key, || async { Ok(5) }, PrefetchOptions::default())
            .await
            .unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn test_get_cached_data_decode_mismatch_is_none() {
        let cache = PrefetchCache::new();
        let key = CacheKey::new("notes");

        cache.set_cache(&key, &"free text").unwrap();
        assert_eq!(cache.get_cached_data::<Vec<u32>>(&key), None);
        // The value itself is intact for callers asking for the right type.
        assert_eq!(cache.get_cached_data::<String>(&key), Some("free text".to_string()));
    }

    #[tokio::test]
    async fn test_clear_all_empties_every_entry() {
        let cache = PrefetchCache::new();
        let feed = CacheKey::new("feed");
        let land = CacheKey::new("land");

        cache.set_cache(&feed, &1).unwrap();
        cache.set_cache(&land, &2).unwrap();
        cache.clear_all();

        assert_eq!(cache.get_cached_data::<u32>(&feed), None);
        assert_eq!(cache.get_cached_data::<u32>(&land), None);
        assert_eq!(cache.entry_status(&feed), EntryStatus::Empty);
    }

    #[tokio::test]
    async fn test_last_updated_tracks_changes() {
        let cache = PrefetchCache::new();
        let key = CacheKey::new("staff");

        assert!(cache.last_updated(&key).is_none());
        cache.set_cache(&key, &"crew").unwrap();
        assert!(cache.last_updated(&key).is_some());
    }
}
