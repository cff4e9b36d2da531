//! Time-bounded resource cache.
//!
//! Memoizes expensive handles (remote daemon connections, project caches)
//! with an allocate → generate → validate → expire → close lifecycle. Every
//! close of a cached resource goes through the eviction path; removal from
//! the map under the cache mutex is the exactly-once point.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;

/// A cache key describing the full lifecycle of the resource it maps to.
///
/// `validate` is consulted on every lookup and must be read-only; an entry
/// failing validation is evicted and closed by the cache. `close` runs
/// exactly once per allocated resource.
pub trait CacheKey: Eq + Hash + Clone + Send + Sync + 'static {
    type Resource: Send + Sync + 'static;
    type Handle: Clone + Send + Sync + 'static;

    /// Create the underlying resource.
    fn allocate(&self) -> Result<Self::Resource, CacheError>;

    /// Wrap the resource into the handle handed to callers.
    fn generate(&self, resource: &Arc<Self::Resource>) -> Self::Handle;

    /// Whether the entry may still be handed out.
    fn validate(&self, handle: &Self::Handle, resource: &Arc<Self::Resource>) -> bool;

    /// Idle linger before the entry is evicted.
    fn expiry(&self) -> Duration;

    /// Release the resource. Runs on eviction, invalidation and cache close.
    fn close(&self, resource: &Self::Resource);
}

struct Entry<K: CacheKey> {
    resource: Arc<K::Resource>,
    handle: K::Handle,
    last_access: Instant,
}

struct State<K: CacheKey> {
    entries: HashMap<K, Entry<K>>,
    closed: bool,
}

struct Shared<K: CacheKey> {
    state: Mutex<State<K>>,
    wakeup: Condvar,
}

impl<K: CacheKey> Shared<K> {
    fn lock(&self) -> MutexGuard<'_, State<K>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Keyed cache with idle expiry driven by a reaper thread.
pub struct ResourceCache<K: CacheKey> {
    shared: Arc<Shared<K>>,
}

impl<K: CacheKey> ResourceCache<K> {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                entries: HashMap::new(),
                closed: false,
            }),
            wakeup: Condvar::new(),
        });
        let reaper_shared = Arc::clone(&shared);
        std::thread::Builder::new()
            .name("cache-reaper".to_string())
            .spawn(move || reap_expired(&reaper_shared))
            .ok();
        Self { shared }
    }

    /// Look up or create the entry for `key` and return its handle.
    pub fn get(&self, key: &K) -> Result<K::Handle, CacheError> {
        if let Some(handle) = self.lookup(key)? {
            return Ok(handle);
        }

        // Allocate outside the lock; dialing may take a while and must not
        // stall lookups of unrelated keys.
        let resource = Arc::new(key.allocate()?);
        let handle = key.generate(&resource);

        let mut state = self.shared.lock();
        loop {
            if state.closed {
                drop(state);
                key.close(&resource);
                return Err(CacheError::Closed);
            }
            match state.entries.get_mut(key) {
                Some(existing) if key.validate(&existing.handle, &existing.resource) => {
                    // Lost the allocation race; keep the established entry.
                    existing.last_access = Instant::now();
                    let winner = existing.handle.clone();
                    drop(state);
                    key.close(&resource);
                    return Ok(winner);
                }
                Some(_) => {
                    let stale = state.entries.remove(key);
                    drop(state);
                    if let Some(stale) = stale {
                        key.close(&stale.resource);
                    }
                    state = self.shared.lock();
                }
                None => break,
            }
        }
        state.entries.insert(
            key.clone(),
            Entry {
                resource,
                handle: handle.clone(),
                last_access: Instant::now(),
            },
        );
        drop(state);
        self.shared.wakeup.notify_all();
        Ok(handle)
    }

    fn lookup(&self, key: &K) -> Result<Option<K::Handle>, CacheError> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(CacheError::Closed);
        }
        let Some(entry) = state.entries.get_mut(key) else {
            return Ok(None);
        };
        if key.validate(&entry.handle, &entry.resource) {
            entry.last_access = Instant::now();
            return Ok(Some(entry.handle.clone()));
        }
        let entry = state.entries.remove(key);
        drop(state);
        if let Some(entry) = entry {
            key.close(&entry.resource);
        }
        Ok(None)
    }

    /// Number of live entries. Expired-but-unreaped entries count.
    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict and close every entry and refuse further lookups.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let entries: Vec<(K, Entry<K>)> = state.entries.drain().collect();
        drop(state);
        self.shared.wakeup.notify_all();
        for (key, entry) in entries {
            key.close(&entry.resource);
        }
    }
}

impl<K: CacheKey> Drop for ResourceCache<K> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<K: CacheKey> Default for ResourceCache<K> {
    fn default() -> Self {
        Self::new()
    }
}

fn reap_expired<K: CacheKey>(shared: &Shared<K>) {
    let mut state = shared.lock();
    loop {
        if state.closed {
            return;
        }
        let now = Instant::now();
        let expired: Vec<K> = state
            .entries
            .iter()
            .filter(|(key, entry)| entry.last_access + key.expiry() <= now)
            .map(|(key, _)| key.clone())
            .collect();
        if !expired.is_empty() {
            let mut removed = Vec::with_capacity(expired.len());
            for key in expired {
                if let Some(entry) = state.entries.remove(&key) {
                    removed.push((key, entry));
                }
            }
            drop(state);
            for (key, entry) in removed {
                key.close(&entry.resource);
            }
            state = shared.lock();
            continue;
        }
        let next_deadline = state
            .entries
            .iter()
            .map(|(key, entry)| entry.last_access + key.expiry())
            .min();
        state = match next_deadline {
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(now);
                match shared.wakeup.wait_timeout(state, wait) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                }
            }
            None => match shared.wakeup.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            },
        };
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CacheError {
    #[error("cache is closed")]
    Closed,

    #[error("failed to allocate cached resource: {0}")]
    Allocate(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Clone)]
    struct TestKey {
        id: u32,
        expiry: Duration,
        valid: Arc<AtomicBool>,
        allocated: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    impl TestKey {
        fn new(id: u32, expiry: Duration) -> Self {
            Self {
                id,
                expiry,
                valid: Arc::new(AtomicBool::new(true)),
                allocated: Arc::new(AtomicUsize::new(0)),
                closed: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl PartialEq for TestKey {
        fn eq(&self, other: &Self) -> bool {
            self.id == other.id
        }
    }
    impl Eq for TestKey {}
    impl std::hash::Hash for TestKey {
        fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
            self.id.hash(state);
        }
    }

    impl CacheKey for TestKey {
        type Resource = u32;
        type Handle = u32;

        fn allocate(&self) -> Result<u32, CacheError> {
            self.allocated.fetch_add(1, Ordering::SeqCst);
            Ok(self.id)
        }

        fn generate(&self, resource: &Arc<u32>) -> u32 {
            **resource
        }

        fn validate(&self, _handle: &u32, _resource: &Arc<u32>) -> bool {
            self.valid.load(Ordering::SeqCst)
        }

        fn expiry(&self) -> Duration {
            self.expiry
        }

        fn close(&self, _resource: &u32) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn second_lookup_reuses_entry() {
        let cache = ResourceCache::new();
        let key = TestKey::new(1, Duration::from_secs(60));
        cache.get(&key).unwrap();
        cache.get(&key).unwrap();
        assert_eq!(key.allocated.load(Ordering::SeqCst), 1);
        assert_eq!(key.closed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_validation_closes_and_reallocates() {
        let cache = ResourceCache::new();
        let key = TestKey::new(1, Duration::from_secs(60));
        cache.get(&key).unwrap();
        key.valid.store(false, Ordering::SeqCst);
        cache.get(&key).unwrap();
        assert_eq!(key.allocated.load(Ordering::SeqCst), 2);
        assert_eq!(key.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn idle_entries_expire_exactly_once() {
        let cache = ResourceCache::new();
        let key = TestKey::new(1, Duration::from_millis(30));
        cache.get(&key).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while key.closed.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(key.closed.load(Ordering::SeqCst), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn access_refreshes_the_linger() {
        let cache = ResourceCache::new();
        let key = TestKey::new(1, Duration::from_millis(120));
        cache.get(&key).unwrap();
        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(40));
            cache.get(&key).unwrap();
        }
        assert_eq!(key.allocated.load(Ordering::SeqCst), 1);
        assert_eq!(key.closed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn close_evicts_everything_and_rejects_lookups() {
        let cache = ResourceCache::new();
        let a = TestKey::new(1, Duration::from_secs(60));
        let b = TestKey::new(2, Duration::from_secs(60));
        cache.get(&a).unwrap();
        cache.get(&b).unwrap();
        cache.close();
        assert_eq!(a.closed.load(Ordering::SeqCst), 1);
        assert_eq!(b.closed.load(Ordering::SeqCst), 1);
        assert!(matches!(cache.get(&a), Err(CacheError::Closed)));
    }

    #[test]
    fn distinct_keys_get_distinct_entries() {
        let cache = ResourceCache::new();
        let a = TestKey::new(1, Duration::from_secs(60));
        let b = TestKey::new(2, Duration::from_secs(60));
        assert_eq!(cache.get(&a).unwrap(), 1);
        assert_eq!(cache.get(&b).unwrap(), 2);
        assert_eq!(cache.len(), 2);
    }
}
