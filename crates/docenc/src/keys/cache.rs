//! Time-to-live cache with single-flight fetches and proactive refresh.
//!
//! Each key has one slot. A slot's entry moves through [`EntryState`]:
//!
//! - `Fresh`: returned as is.
//! - `StaleButValid`: remaining TTL fell under the refresh threshold. The cached
//!   value is returned immediately and one detached background refresh runs.
//! - `Expired`: callers wait on the slot's fetch lock, so concurrent misses
//!   trigger a single backing fetch.
//!
//! An optional [`DistributedCache`] is consulted before fetching and written
//! through after. Its failures are logged and swallowed: a read failure falls
//! back to fetching, a write failure leaves the in-memory entry in place.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::KeyResolutionError;

/// Errors from the cache layer.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The refresh threshold is not strictly less than the TTL.
    #[error("refresh threshold {refresh:?} must be less than ttl {ttl:?}")]
    InvalidThreshold { ttl: Duration, refresh: Duration },

    /// The distributed backing store failed.
    #[error("distributed cache error: {0}")]
    Backing(String),
}

/// Optional shared cache behind the in-memory one, keyed `{prefix}:{key}`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DistributedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;
}

/// Lifecycle state of a cached entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Fresh,
    StaleButValid,
    Expired,
}

struct Entry<T> {
    value: Arc<T>,
    expires_at: Instant,
}

impl<T> Entry<T> {
    fn state(&self, now: Instant, refresh_threshold: Duration) -> EntryState {
        match self.expires_at.checked_duration_since(now) {
            None => EntryState::Expired,
            Some(left) if left.is_zero() => EntryState::Expired,
            Some(left) if left <= refresh_threshold => EntryState::StaleButValid,
            Some(_) => EntryState::Fresh,
        }
    }
}

struct Slot<T> {
    entry: ArcSwapOption<Entry<T>>,
    fetch_lock: Mutex<()>,
    refreshing: AtomicBool,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            entry: ArcSwapOption::empty(),
            fetch_lock: Mutex::new(()),
            refreshing: AtomicBool::new(false),
        }
    }
}

struct Inner<T> {
    slots: RwLock<HashMap<String, Arc<Slot<T>>>>,
    ttl: Duration,
    refresh_threshold: Duration,
    prefix: String,
    distributed: Option<Arc<dyn DistributedCache>>,
    shutdown: CancellationToken,
}

/// One cache instance per key prefix. Cloning shares the same entries.
pub struct TtlCache<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for TtlCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for TtlCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("prefix", &self.inner.prefix)
            .field("ttl", &self.inner.ttl)
            .field("refresh_threshold", &self.inner.refresh_threshold)
            .field("entries", &self.inner.slots.read().len())
            .finish()
    }
}

impl<T> TtlCache<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// # Errors
    ///
    /// [`CacheError::InvalidThreshold`] unless `refresh_threshold < ttl`.
    pub fn new(
        ttl: Duration,
        refresh_threshold: Duration,
        prefix: impl Into<String>,
        distributed: Option<Arc<dyn DistributedCache>>,
    ) -> Result<Self, CacheError> {
        if refresh_threshold >= ttl {
            return Err(CacheError::InvalidThreshold {
                ttl,
                refresh: refresh_threshold,
            });
        }
        Ok(Self {
            inner: Arc::new(Inner {
                slots: RwLock::new(HashMap::new()),
                ttl,
                refresh_threshold,
                prefix: prefix.into(),
                distributed,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Key used in the distributed cache.
    pub fn distributed_key(&self, key: &str) -> String {
        format!("{}:{key}", self.inner.prefix)
    }

    /// Current state of `key`, or `None` if never cached.
    pub fn state(&self, key: &str) -> Option<EntryState> {
        let slot = self.inner.slots.read().get(key).cloned()?;
        let entry = slot.entry.load_full()?;
        Some(entry.state(Instant::now(), self.inner.refresh_threshold))
    }

    /// Number of keys with a slot.
    pub fn len(&self) -> usize {
        self.inner.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop `key` from memory. The distributed cache is left alone.
    pub fn remove(&self, key: &str) {
        self.inner.slots.write().remove(key);
    }

    /// Cancel every background refresh in flight.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Cache `value` in memory only, with a full TTL.
    pub fn insert_local(&self, key: &str, value: T) -> Arc<T> {
        let value = Arc::new(value);
        self.store(&self.slot(key), Arc::clone(&value));
        value
    }

    /// Return the cached value for `key`, fetching it on a miss.
    ///
    /// `fetch` is called at most once per call: inline on a miss, or in a
    /// detached task when the entry is stale but still valid.
    ///
    /// # Errors
    ///
    /// Whatever `fetch` returns, or [`KeyResolutionError::Cancelled`] if
    /// `cancel` fires while waiting.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        cancel: &CancellationToken,
        fetch: F,
    ) -> Result<Arc<T>, KeyResolutionError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, KeyResolutionError>> + Send + 'static,
    {
        let slot = self.slot(key);
        if let Some(entry) = slot.entry.load_full() {
            match entry.state(Instant::now(), self.inner.refresh_threshold) {
                EntryState::Fresh => return Ok(Arc::clone(&entry.value)),
                EntryState::StaleButValid => {
                    self.spawn_refresh(key, &slot, fetch);
                    return Ok(Arc::clone(&entry.value));
                }
                EntryState::Expired => {}
            }
        }

        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(KeyResolutionError::Cancelled),
            guard = slot.fetch_lock.lock() => guard,
        };
        // Another caller may have filled the slot while we waited.
        if let Some(entry) = slot.entry.load_full() {
            if entry.state(Instant::now(), self.inner.refresh_threshold) != EntryState::Expired {
                return Ok(Arc::clone(&entry.value));
            }
        }

        if let Some(value) = self.read_distributed(key).await {
            let value = Arc::new(value);
            self.store(&slot, Arc::clone(&value));
            debug!(key, "cache filled from distributed cache");
            return Ok(value);
        }

        let value = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(KeyResolutionError::Cancelled),
            fetched = fetch(cancel.clone()) => Arc::new(fetched?),
        };
        self.store(&slot, Arc::clone(&value));
        self.write_distributed(key, &value).await;
        Ok(value)
    }

    fn slot(&self, key: &str) -> Arc<Slot<T>> {
        if let Some(slot) = self.inner.slots.read().get(key) {
            return Arc::clone(slot);
        }
        Arc::clone(self.inner.slots.write().entry(key.to_owned()).or_default())
    }

    fn store(&self, slot: &Slot<T>, value: Arc<T>) {
        slot.entry.store(Some(Arc::new(Entry {
            value,
            expires_at: Instant::now() + self.inner.ttl,
        })));
    }

    fn spawn_refresh<F, Fut>(&self, key: &str, slot: &Arc<Slot<T>>, fetch: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, KeyResolutionError>> + Send + 'static,
    {
        if slot.refreshing.swap(true, Ordering::AcqRel) {
            return;
        }
        let cache = self.clone();
        let slot = Arc::clone(slot);
        let key = key.to_owned();
        let token = self.inner.shutdown.child_token();
        tokio::spawn(async move {
            let fetched = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                fetched = fetch(token.clone()) => Some(fetched),
            };
            match fetched {
                Some(Ok(value)) => {
                    let value = Arc::new(value);
                    cache.store(&slot, Arc::clone(&value));
                    cache.write_distributed(&key, &value).await;
                    debug!(key = %key, "cache entry refreshed in background");
                }
                Some(Err(e)) => {
                    warn!(key = %key, error = %e, "background refresh failed; serving cached value until expiry")
                }
                None => debug!(key = %key, "background refresh cancelled"),
            }
            slot.refreshing.store(false, Ordering::Release);
        });
    }

    async fn read_distributed(&self, key: &str) -> Option<T> {
        let backing = self.inner.distributed.as_ref()?;
        let dkey = self.distributed_key(key);
        match backing.get(&dkey).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(key = %dkey, error = %e, "ignoring undecodable distributed cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key = %dkey, error = %e, "distributed cache read failed; fetching");
                None
            }
        }
    }

    async fn write_distributed(&self, key: &str, value: &T) {
        let Some(backing) = self.inner.distributed.as_ref() else {
            return;
        };
        let dkey = self.distributed_key(key);
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %dkey, error = %e, "cannot serialize cache entry for distributed cache");
                return;
            }
        };
        if let Err(e) = backing.set(&dkey, bytes, self.inner.ttl).await {
            warn!(key = %dkey, error = %e, "distributed cache write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const TTL: Duration = Duration::from_secs(60);
    const REFRESH: Duration = Duration::from_secs(10);

    fn cache(distributed: Option<Arc<dyn DistributedCache>>) -> TtlCache<String> {
        TtlCache::new(TTL, REFRESH, "dek", distributed).unwrap()
    }

    fn counting_fetch(
        calls: &Arc<AtomicUsize>,
        value: &'static str,
    ) -> impl FnOnce(CancellationToken) -> std::future::Ready<Result<String, KeyResolutionError>> {
        let calls = Arc::clone(calls);
        move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(value.to_owned()))
        }
    }

    #[test]
    fn threshold_must_be_below_ttl() {
        assert!(TtlCache::<String>::new(TTL, TTL, "dek", None).is_err());
    }

    #[test]
    fn distributed_keys_are_prefixed() {
        assert_eq!(cache(None).distributed_key("k1"), "dek:k1");
    }

    #[tokio::test(start_paused = true)]
    async fn entry_moves_through_states() {
        let cache = cache(None);
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        assert_eq!(cache.state("k"), None);
        let v = cache.get_or_fetch("k", &cancel, counting_fetch(&calls, "v1")).await.unwrap();
        assert_eq!(*v, "v1");
        assert_eq!(cache.state("k"), Some(EntryState::Fresh));

        // Fresh hit does not fetch.
        cache.get_or_fetch("k", &cancel, counting_fetch(&calls, "x")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(TTL - REFRESH + Duration::from_secs(1)).await;
        assert_eq!(cache.state("k"), Some(EntryState::StaleButValid));

        tokio::time::advance(REFRESH).await;
        assert_eq!(cache.state("k"), Some(EntryState::Expired));

        let v = cache.get_or_fetch("k", &cancel, counting_fetch(&calls, "v2")).await.unwrap();
        assert_eq!(*v, "v2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entry_is_served_while_refreshing() {
        let cache = cache(None);
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        cache.get_or_fetch("k", &cancel, counting_fetch(&calls, "old")).await.unwrap();

        tokio::time::advance(TTL - REFRESH + Duration::from_secs(1)).await;
        let v = cache.get_or_fetch("k", &cancel, counting_fetch(&calls, "new")).await.unwrap();
        assert_eq!(*v, "old");

        // Let the detached refresh run.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let v = cache.get_or_fetch("k", &cancel, counting_fetch(&calls, "unused")).await.unwrap();
        assert_eq!(*v, "new");
        assert_eq!(cache.state("k"), Some(EntryState::Fresh));
    }

    #[tokio::test]
    async fn concurrent_misses_fetch_once() {
        let cache = cache(None);
        let calls = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            tasks.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                cache
                    .get_or_fetch("k", &cancel, move |_| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok("v".to_owned())
                    })
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            assert_eq!(*task.await.unwrap(), "v");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_errors_propagate_and_are_not_cached() {
        let cache = cache(None);
        let cancel = CancellationToken::new();
        let err = cache
            .get_or_fetch("k", &cancel, |_| async {
                Err(KeyResolutionError::NotFound { dek_id: "k".into() })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, KeyResolutionError::NotFound { .. }));
        assert_eq!(cache.state("k"), None);
    }

    #[tokio::test]
    async fn cancelled_wait_returns_cancelled() {
        let cache = cache(None);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = cache
            .get_or_fetch("k", &cancel, |_| std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, KeyResolutionError::Cancelled));
    }

    #[tokio::test]
    async fn distributed_hit_skips_fetch() {
        let mut backing = MockDistributedCache::new();
        backing
            .expect_get()
            .withf(|key| key == "dek:k")
            .returning(|_| Ok(Some(serde_json::to_vec("remote").unwrap())));
        backing.expect_set().never();
        let cache = cache(Some(Arc::new(backing)));
        let calls = Arc::new(AtomicUsize::new(0));
        let v = cache
            .get_or_fetch("k", &CancellationToken::new(), counting_fetch(&calls, "local"))
            .await
            .unwrap();
        assert_eq!(*v, "remote");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn distributed_failures_are_swallowed() {
        let mut backing = MockDistributedCache::new();
        backing
            .expect_get()
            .returning(|_| Err(CacheError::Backing("connection reset".into())));
        backing
            .expect_set()
            .times(1)
            .returning(|_, _, _| Err(CacheError::Backing("read only".into())));
        let cache = cache(Some(Arc::new(backing)));
        let calls = Arc::new(AtomicUsize::new(0));
        let v = cache
            .get_or_fetch("k", &CancellationToken::new(), counting_fetch(&calls, "local"))
            .await
            .unwrap();
        assert_eq!(*v, "local");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.state("k"), Some(EntryState::Fresh));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_background_refresh() {
        let cache = cache(None);
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        cache.get_or_fetch("k", &cancel, counting_fetch(&calls, "old")).await.unwrap();
        tokio::time::advance(TTL - REFRESH + Duration::from_secs(1)).await;

        cache.shutdown();
        let v = cache
            .get_or_fetch("k", &cancel, |_| std::future::pending())
            .await
            .unwrap();
        assert_eq!(*v, "old");
        tokio::task::yield_now().await;
        assert_eq!(cache.state("k"), Some(EntryState::StaleButValid));
    }
}
