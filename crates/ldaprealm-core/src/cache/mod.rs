//! Memoized directory searches.
//!
//! A [`SearchCache`] wraps a [`Searcher`] and remembers its outcomes per key.
//! The key table sits behind one short-lived lock that is never held across
//! a directory round-trip; each entry carries its own async gate so that
//! concurrent lookups of the same key share a single search.

mod eviction;

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RealmError;
use crate::handler::ConnectionHandler;
use crate::search::Searcher;

use eviction::{EvictionScheduler, Expire};

/// Eviction policy of a cache.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum CachePolicy {
    /// No caching; every lookup searches.
    #[default]
    Off,
    /// Entries expire a fixed time after they were first searched.
    BySearchTime,
    /// Entries expire a fixed time after they were last looked up.
    ByAccessTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    /// Time until an entry expires; zero keeps entries until removed.
    pub eviction_time: Duration,
    /// Remember failed searches as well as successful ones.
    pub cache_failures: bool,
    /// Maximum number of entries; zero is unbounded.
    pub max_size: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            eviction_time: Duration::from_secs(900),
            cache_failures: false,
            max_size: 0,
        }
    }
}

type Outcome<R> = Result<Arc<R>, RealmError>;

struct CacheEntry<R> {
    id: u64,
    outcome: OnceLock<Outcome<R>>,
    gate: tokio::sync::Mutex<()>,
}

impl<R> CacheEntry<R> {
    fn value(&self) -> Option<&R> {
        match self.outcome.get() {
            Some(Ok(value)) => Some(value.as_ref()),
            _ => None,
        }
    }
}

struct Slot<R> {
    entry: Arc<CacheEntry<R>>,
    timer: Option<Arc<AtomicBool>>,
}

impl<R> Slot<R> {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.store(true, Ordering::SeqCst);
        }
    }
}

struct Table<K: Hash + Eq, R> {
    entries: LruCache<K, Slot<R>>,
    next_id: u64,
}

impl<K: Hash + Eq, R> Table<K, R> {
    fn remove(&mut self, key: &K) -> bool {
        match self.entries.pop(key) {
            Some(mut slot) => {
                slot.cancel_timer();
                true
            }
            None => false,
        }
    }
}

impl<K, R> Expire<K> for Mutex<Table<K, R>>
where
    K: Hash + Eq + fmt::Debug + Send + 'static,
    R: Send + Sync + 'static,
{
    fn expire(&self, key: &K, id: u64, cancelled: &AtomicBool) {
        let mut table = self.lock();
        if cancelled.load(Ordering::SeqCst) {
            return;
        }
        if table.entries.peek(key).is_some_and(|slot| slot.entry.id == id) {
            table.entries.pop(key);
            debug!("Cache entry {:?} expired", key);
        }
    }
}

/// Search results memoized per key.
///
/// Shared by every concurrent authentication attempt of a realm; all
/// operations are safe to call while searches are in flight.
pub struct SearchCache<K: Hash + Eq, R> {
    name: String,
    policy: CachePolicy,
    settings: CacheSettings,
    searcher: Arc<dyn Searcher<K, R>>,
    table: Arc<Mutex<Table<K, R>>>,
    scheduler: OnceLock<EvictionScheduler<K>>,
}

impl<K, R> SearchCache<K, R>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    pub fn new(
        name: impl Into<String>,
        policy: CachePolicy,
        settings: CacheSettings,
        searcher: Arc<dyn Searcher<K, R>>,
    ) -> Self {
        Self {
            name: name.into(),
            policy,
            settings,
            searcher,
            table: Arc::new(Mutex::new(Table {
                entries: LruCache::unbounded(),
                next_id: 0,
            })),
            scheduler: OnceLock::new(),
        }
    }

    /// A cache that never remembers anything.
    pub fn passthrough(name: impl Into<String>, searcher: Arc<dyn Searcher<K, R>>) -> Self {
        Self::new(name, CachePolicy::Off, CacheSettings::default(), searcher)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    /// Look `key` up, searching the directory through `handler` if needed.
    ///
    /// At most one search per key runs at a time; concurrent callers for the
    /// same key wait for it and receive the same result.
    pub async fn search(
        &self,
        handler: &mut ConnectionHandler,
        key: &K,
    ) -> Result<Arc<R>, RealmError> {
        if self.policy == CachePolicy::Off {
            return self.searcher.search(handler, key).await.map(Arc::new);
        }

        loop {
            let entry = self.entry_for(key);
            if let Some(outcome) = entry.outcome.get() {
                debug!("{}: cache hit for {:?}", self.name, key);
                return outcome.clone();
            }

            let _gate = entry.gate.lock().await;
            if let Some(outcome) = entry.outcome.get() {
                debug!("{}: cache hit for {:?} after wait", self.name, key);
                return outcome.clone();
            }
            if !self.holds(key, entry.id) {
                // Removed while we waited; start again with a fresh entry.
                continue;
            }

            debug!("{}: cache miss for {:?}", self.name, key);
            let outcome = self.searcher.search(handler, key).await.map(Arc::new);
            match &outcome {
                Err(e) if !self.settings.cache_failures => {
                    debug!("{}: not remembering failure for {:?}: {}", self.name, key, e);
                    self.forget(key, entry.id);
                }
                _ => {
                    let _ = entry.outcome.set(outcome.clone());
                }
            }
            return outcome;
        }
    }

    /// Number of entries for which `predicate` holds. The predicate sees the
    /// key and, once resolved successfully, the cached value.
    pub fn count<P>(&self, predicate: P) -> usize
    where
        P: Fn(&K, Option<&R>) -> bool,
    {
        let table = self.table.lock();
        table
            .entries
            .iter()
            .filter(|(key, slot)| predicate(key, slot.entry.value()))
            .count()
    }

    pub fn contains<P>(&self, predicate: P) -> bool
    where
        P: Fn(&K, Option<&R>) -> bool,
    {
        let table = self.table.lock();
        table
            .entries
            .iter()
            .any(|(key, slot)| predicate(key, slot.entry.value()))
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.table.lock().entries.contains(key)
    }

    /// Remove one key. Returns whether it was present.
    pub fn clear(&self, key: &K) -> bool {
        let removed = self.table.lock().remove(key);
        if removed {
            debug!("{}: cleared {:?}", self.name, key);
        }
        removed
    }

    /// Remove every entry for which `predicate` holds. Returns how many went.
    pub fn clear_where<P>(&self, predicate: P) -> usize
    where
        P: Fn(&K, Option<&R>) -> bool,
    {
        let mut table = self.table.lock();
        let doomed: Vec<K> = table
            .entries
            .iter()
            .filter(|(key, slot)| predicate(key, slot.entry.value()))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            table.remove(key);
        }
        debug!("{}: cleared {} entries", self.name, doomed.len());
        doomed.len()
    }

    pub fn clear_all(&self) {
        let mut table = self.table.lock();
        for (_, slot) in table.entries.iter_mut() {
            slot.cancel_timer();
        }
        table.entries.clear();
        debug!("{}: cleared all entries", self.name);
    }

    pub fn current_size(&self) -> usize {
        self.table.lock().entries.len()
    }

    /// Find or create the entry for `key`, applying the access policy.
    fn entry_for(&self, key: &K) -> Arc<CacheEntry<R>> {
        let mut table = self.table.lock();

        if self.policy == CachePolicy::ByAccessTime {
            if let Some(slot) = table.entries.get_mut(key) {
                slot.cancel_timer();
                slot.timer = self.schedule(key, slot.entry.id);
                return slot.entry.clone();
            }
        } else if let Some(slot) = table.entries.peek(key) {
            return slot.entry.clone();
        }

        if self.settings.max_size > 0 {
            while table.entries.len() >= self.settings.max_size {
                match table.entries.pop_lru() {
                    Some((evicted, mut slot)) => {
                        slot.cancel_timer();
                        debug!("{}: evicted {:?} to make room", self.name, evicted);
                    }
                    None => break,
                }
            }
        }

        let id = table.next_id;
        table.next_id += 1;
        let entry = Arc::new(CacheEntry {
            id,
            outcome: OnceLock::new(),
            gate: tokio::sync::Mutex::new(()),
        });
        let timer = self.schedule(key, id);
        table.entries.put(
            key.clone(),
            Slot {
                entry: entry.clone(),
                timer,
            },
        );
        entry
    }

    fn schedule(&self, key: &K, id: u64) -> Option<Arc<AtomicBool>> {
        if self.settings.eviction_time.is_zero() {
            return None;
        }
        let scheduler = self
            .scheduler
            .get_or_init(|| EvictionScheduler::start(Arc::downgrade(&self.table)));
        Some(scheduler.schedule(key.clone(), id, self.settings.eviction_time))
    }

    fn holds(&self, key: &K, id: u64) -> bool {
        self.table
            .lock()
            .entries
            .peek(key)
            .is_some_and(|slot| slot.entry.id == id)
    }

    fn forget(&self, key: &K, id: u64) {
        let mut table = self.table.lock();
        if table.entries.peek(key).is_some_and(|slot| slot.entry.id == id) {
            table.remove(key);
        }
    }
}

impl<K: Hash + Eq, R> fmt::Debug for SearchCache<K, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchCache")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use crate::memory::MemoryDirectory;

    /// Echoes the key, counting calls; keys starting with "bad" fail.
    #[derive(Default)]
    struct Echo {
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl Searcher<String, String> for Echo {
        async fn search(
            &self,
            _handler: &mut ConnectionHandler,
            key: &String,
        ) -> Result<String, RealmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if key.starts_with("bad") {
                return Err(RealmError::Directory(format!("cannot reach {key}")));
            }
            Ok(format!("result:{key}"))
        }
    }

    fn handler() -> ConnectionHandler {
        let dir = MemoryDirectory::from_ldif("ldap://localhost:389", "dn: dc=example\n").unwrap();
        ConnectionHandler::new(Arc::new(dir))
    }

    fn cache(
        policy: CachePolicy,
        settings: CacheSettings,
        echo: Arc<Echo>,
    ) -> Arc<SearchCache<String, String>> {
        Arc::new(SearchCache::new("test", policy, settings, echo))
    }

    fn no_expiry(max_size: usize) -> CacheSettings {
        CacheSettings {
            eviction_time: Duration::ZERO,
            cache_failures: false,
            max_size,
        }
    }

    async fn lookup(cache: &SearchCache<String, String>, key: &str) -> Result<Arc<String>, RealmError> {
        cache.search(&mut handler(), &key.to_string()).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_lookups_share_one_search() {
        let echo = Arc::new(Echo {
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let cache = cache(CachePolicy::BySearchTime, no_expiry(0), echo.clone());

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { lookup(&cache, "alice").await.unwrap() })
            })
            .collect();
        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }

        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
        assert_eq!(results[0].as_str(), "result:alice");
    }

    #[tokio::test]
    async fn test_off_policy_passes_through() {
        let echo = Arc::new(Echo::default());
        let cache = cache(CachePolicy::Off, CacheSettings::default(), echo.clone());
        lookup(&cache, "alice").await.unwrap();
        lookup(&cache, "alice").await.unwrap();
        assert_eq!(echo.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.current_size(), 0);
    }

    #[tokio::test]
    async fn test_size_never_exceeds_maximum() {
        let echo = Arc::new(Echo::default());
        let cache = cache(CachePolicy::BySearchTime, no_expiry(3), echo.clone());
        for i in 0..20 {
            lookup(&cache, &format!("user{i}")).await.unwrap();
            assert!(cache.current_size() <= 3);
        }
        assert_eq!(cache.current_size(), 3);
    }

    #[tokio::test]
    async fn test_by_search_time_evicts_oldest_insertion() {
        let echo = Arc::new(Echo::default());
        let cache = cache(CachePolicy::BySearchTime, no_expiry(2), echo.clone());
        lookup(&cache, "a").await.unwrap();
        lookup(&cache, "b").await.unwrap();
        lookup(&cache, "a").await.unwrap();
        lookup(&cache, "c").await.unwrap();
        assert!(!cache.contains_key(&"a".to_string()));
        assert!(cache.contains_key(&"b".to_string()));
        assert!(cache.contains_key(&"c".to_string()));
    }

    #[tokio::test]
    async fn test_by_access_time_evicts_least_recently_used() {
        let echo = Arc::new(Echo::default());
        let cache = cache(CachePolicy::ByAccessTime, no_expiry(2), echo.clone());
        lookup(&cache, "a").await.unwrap();
        lookup(&cache, "b").await.unwrap();
        lookup(&cache, "a").await.unwrap();
        lookup(&cache, "c").await.unwrap();
        assert!(cache.contains_key(&"a".to_string()));
        assert!(!cache.contains_key(&"b".to_string()));
        assert!(cache.contains_key(&"c".to_string()));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_by_access_time_three_keys() {
        let echo = Arc::new(Echo::default());
        let cache = cache(CachePolicy::ByAccessTime, no_expiry(3), echo.clone());
        for key in ["a", "b", "c", "a", "d"] {
            lookup(&cache, key).await.unwrap();
        }
        assert!(cache.contains_key(&"a".to_string()));
        assert!(!cache.contains_key(&"b".to_string()));
        assert_eq!(cache.current_size(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_by_search_time_expiry_is_not_extended_by_access() {
        let echo = Arc::new(Echo::default());
        let settings = CacheSettings {
            eviction_time: Duration::from_secs(60),
            ..no_expiry(0)
        };
        let cache = cache(CachePolicy::BySearchTime, settings, echo.clone());
        lookup(&cache, "a").await.unwrap();
        tokio::time::sleep(Duration::from_secs(40)).await;
        lookup(&cache, "a").await.unwrap();
        tokio::time::sleep(Duration::from_secs(25)).await;
        tokio::task::yield_now().await;
        assert!(!cache.contains_key(&"a".to_string()));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_by_access_time_expiry_restarts_on_access() {
        let echo = Arc::new(Echo::default());
        let settings = CacheSettings {
            eviction_time: Duration::from_secs(60),
            ..no_expiry(0)
        };
        let cache = cache(CachePolicy::ByAccessTime, settings, echo.clone());
        lookup(&cache, "a").await.unwrap();
        tokio::time::sleep(Duration::from_secs(40)).await;
        lookup(&cache, "a").await.unwrap();
        tokio::time::sleep(Duration::from_secs(40)).await;
        tokio::task::yield_now().await;
        assert!(cache.contains_key(&"a".to_string()));

        tokio::time::sleep(Duration::from_secs(25)).await;
        tokio::task::yield_now().await;
        assert!(!cache.contains_key(&"a".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleared_entry_timer_does_not_evict_replacement() {
        let echo = Arc::new(Echo::default());
        let settings = CacheSettings {
            eviction_time: Duration::from_secs(60),
            ..no_expiry(0)
        };
        let cache = cache(CachePolicy::BySearchTime, settings, echo.clone());
        let key = "a".to_string();

        lookup(&cache, "a").await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(cache.clear(&key));
        assert!(!cache.contains_key(&key));

        tokio::time::sleep(Duration::from_secs(10)).await;
        lookup(&cache, "a").await.unwrap();
        assert_eq!(echo.calls.load(Ordering::SeqCst), 2);

        // The first timer would have fired at 60s; the replacement lives until 80s.
        tokio::time::sleep(Duration::from_secs(45)).await;
        tokio::task::yield_now().await;
        assert!(cache.contains_key(&key));
        lookup(&cache, "a").await.unwrap();
        assert_eq!(echo.calls.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(20)).await;
        tokio::task::yield_now().await;
        assert!(!cache.contains_key(&key));
    }

    #[tokio::test]
    async fn test_failures_not_cached_by_default() {
        let echo = Arc::new(Echo::default());
        let cache = cache(CachePolicy::BySearchTime, no_expiry(0), echo.clone());
        assert!(lookup(&cache, "bad").await.is_err());
        assert!(!cache.contains_key(&"bad".to_string()));
        assert!(lookup(&cache, "bad").await.is_err());
        assert_eq!(echo.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failures_cached_when_enabled() {
        let echo = Arc::new(Echo::default());
        let settings = CacheSettings {
            cache_failures: true,
            ..no_expiry(0)
        };
        let cache = cache(CachePolicy::BySearchTime, settings, echo.clone());
        let first = lookup(&cache, "bad").await.unwrap_err();
        let second = lookup(&cache, "bad").await.unwrap_err();
        assert_eq!(first, second);
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
        assert!(cache.contains_key(&"bad".to_string()));
    }

    #[tokio::test]
    async fn test_management_operations() {
        let echo = Arc::new(Echo::default());
        let cache = cache(CachePolicy::BySearchTime, no_expiry(0), echo.clone());
        for key in ["alice", "albert", "bob"] {
            lookup(&cache, key).await.unwrap();
        }

        assert_eq!(cache.count(|k, _| k.starts_with("al")), 2);
        assert!(cache.contains(|_, v| v == Some(&"result:bob".to_string())));
        assert!(!cache.contains(|k, _| k == "carol"));

        assert_eq!(cache.clear_where(|k, _| k.starts_with("al")), 2);
        assert_eq!(cache.current_size(), 1);
        assert!(!cache.clear(&"alice".to_string()));

        cache.clear_all();
        assert_eq!(cache.current_size(), 0);
        lookup(&cache, "bob").await.unwrap();
        assert_eq!(echo.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_policy_names() {
        assert_eq!(CachePolicy::ByAccessTime.to_string(), "by-access-time");
        assert_eq!(
            "by-search-time".parse::<CachePolicy>().unwrap(),
            CachePolicy::BySearchTime
        );
    }
}
