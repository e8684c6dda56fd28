//! Simulated network cache.
//!
//! Behaves like a remote key/value cache, with fault injection:
//! - Reachability switch (every call fails while unreachable)
//! - Random call failures at a configurable rate
//! - Fixed latency per call, to exercise caller timeouts
//!
//! TTLs are evaluated against an injected [`Clock`]. Expired keys behave as
//! absent but stay in memory until touched, like a lazily evicting cache.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::cache::{CacheClient, CacheEntry, CacheError, CasOutcome};
use crate::time::{Clock, duration_to_ms};

/// Configuration for fault injection.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability that a call fails (0.0 - 1.0).
    pub failure_rate: f64,
    /// Delay applied to every call before it is served.
    pub latency: Duration,
}

impl FaultConfig {
    /// No faults and no latency.
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Every call is delayed by `latency`.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            failure_rate: 0.0,
            latency,
        }
    }
}

#[derive(Debug)]
struct Slot {
    value: Vec<u8>,
    version: u64,
    expires_at_ms: Option<u64>,
}

impl Slot {
    fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_none_or(|expires_at| now_ms < expires_at)
    }
}

#[derive(Debug, Default)]
struct SetSlot {
    members: BTreeSet<String>,
    expires_at_ms: Option<u64>,
}

impl SetSlot {
    fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_none_or(|expires_at| now_ms < expires_at)
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, Slot>,
    sets: HashMap<String, SetSlot>,
}

impl CacheState {
    /// Drop `key` if its TTL elapsed, then return the live slot.
    fn live_slot(&mut self, key: &str, now_ms: u64) -> Option<&mut Slot> {
        if self.entries.get(key).is_some_and(|slot| !slot.is_live(now_ms)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    /// Drop the set at `key` if its TTL elapsed, then return the live set.
    fn live_set(&mut self, key: &str, now_ms: u64) -> Option<&mut SetSlot> {
        if self.sets.get(key).is_some_and(|set| !set.is_live(now_ms)) {
            self.sets.remove(key);
        }
        self.sets.get_mut(key)
    }
}

#[derive(Debug)]
struct FaultInjector {
    config: FaultConfig,
    rng: StdRng,
}

impl FaultInjector {
    fn should_inject_fault(&mut self) -> bool {
        if self.config.failure_rate <= 0.0 {
            return false;
        }
        self.rng.random::<f64>() < self.config.failure_rate
    }
}

/// In-memory implementation of [`CacheClient`] with fault injection.
///
/// # Thread Safety
///
/// All state sits behind one `Mutex`; no lock is held across an await point.
#[derive(Debug)]
pub struct InMemoryCache {
    clock: Arc<dyn Clock>,
    state: Mutex<CacheState>,
    faults: Mutex<FaultInjector>,
    reachable: AtomicBool,
    next_version: AtomicU64,
    calls: AtomicU64,
    injected_failures: AtomicU64,
}

impl InMemoryCache {
    /// Create a fault-free cache using `clock` for TTLs.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_faults(clock, 0, FaultConfig::default())
    }

    /// Create a cache with fault injection seeded by `seed`.
    ///
    /// The same seed produces the same sequence of injected failures.
    #[must_use]
    pub fn with_faults(clock: Arc<dyn Clock>, seed: u64, config: FaultConfig) -> Self {
        Self {
            clock,
            state: Mutex::new(CacheState::default()),
            faults: Mutex::new(FaultInjector {
                config,
                rng: StdRng::seed_from_u64(seed),
            }),
            reachable: AtomicBool::new(true),
            next_version: AtomicU64::new(1),
            calls: AtomicU64::new(0),
            injected_failures: AtomicU64::new(0),
        }
    }

    /// Simulate the cache going down or coming back.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Replace the fault configuration.
    pub fn set_fault_config(&self, config: FaultConfig) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.config = config;
        }
    }

    /// Number of calls served or rejected so far.
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Number of calls failed by fault injection.
    #[must_use]
    pub fn injected_failures(&self) -> u64 {
        self.injected_failures.load(Ordering::Relaxed)
    }

    /// Number of keys physically held, including ones whose TTL elapsed.
    #[must_use]
    pub fn physical_len(&self) -> usize {
        self.state.lock().map_or(0, |state| state.entries.len())
    }

    /// Whether `key` is physically held, regardless of its TTL.
    #[must_use]
    pub fn physically_contains(&self, key: &str) -> bool {
        self.state
            .lock()
            .is_ok_and(|state| state.entries.contains_key(key))
    }

    /// Number of members physically held in the set at `key`, including a
    /// set whose TTL elapsed.
    #[must_use]
    pub fn physical_set_len(&self, key: &str) -> usize {
        self.state
            .lock()
            .map_or(0, |state| state.sets.get(key).map_or(0, |set| set.members.len()))
    }

    /// Overwrite the raw bytes of `key`, keeping its version and TTL.
    ///
    /// Lets tests plant corrupt payloads.
    pub fn overwrite_raw(&self, key: &str, value: Vec<u8>) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        state.entries.get_mut(key).is_some_and(|slot| {
            slot.value = value;
            true
        })
    }

    /// Gate every call through the fault injector.
    async fn admit(&self, operation: &str) -> Result<(), CacheError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable(format!(
                "{operation}: connection refused"
            )));
        }

        let (latency, fail) = {
            let mut faults = self
                .faults
                .lock()
                .map_err(|_| CacheError::Unavailable("fault injector lock poisoned".to_string()))?;
            let fail = faults.should_inject_fault();
            (faults.config.latency, fail)
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if fail {
            self.injected_failures.fetch_add(1, Ordering::Relaxed);
            return Err(CacheError::Unavailable(format!(
                "{operation}: injected fault"
            )));
        }
        Ok(())
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, CacheState>, CacheError> {
        self.state
            .lock()
            .map_err(|_| CacheError::Unavailable("cache lock poisoned".to_string()))
    }

    fn allocate_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst)
    }

    fn expires_at(&self, ttl: Option<Duration>) -> Option<u64> {
        ttl.map(|ttl| self.clock.now_ms().saturating_add(duration_to_ms(ttl)))
    }
}

impl CacheClient for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        self.admit("get").await?;
        let now = self.clock.now_ms();
        let mut state = self.lock_state()?;
        Ok(state.live_slot(key, now).map(|slot| CacheEntry {
            value: slot.value.clone(),
            version: slot.version,
        }))
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<u64, CacheError> {
        self.admit("put").await?;
        let version = self.allocate_version();
        let expires_at_ms = self.expires_at(ttl);
        let mut state = self.lock_state()?;
        state.entries.insert(
            key.to_string(),
            Slot {
                value,
                version,
                expires_at_ms,
            },
        );
        Ok(version)
    }

    async fn insert_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<Option<u64>, CacheError> {
        self.admit("insert_if_absent").await?;
        let now = self.clock.now_ms();
        let expires_at_ms = self.expires_at(ttl);
        let mut state = self.lock_state()?;
        if state.live_slot(key, now).is_some() {
            return Ok(None);
        }
        let version = self.allocate_version();
        state.entries.insert(
            key.to_string(),
            Slot {
                value,
                version,
                expires_at_ms,
            },
        );
        Ok(Some(version))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<CasOutcome, CacheError> {
        self.admit("compare_and_swap").await?;
        let now = self.clock.now_ms();
        let expires_at_ms = self.expires_at(ttl);
        let mut state = self.lock_state()?;
        let Some(slot) = state.live_slot(key, now) else {
            return Ok(CasOutcome::Missing);
        };
        if slot.version != expected_version {
            return Ok(CasOutcome::VersionMismatch);
        }
        let version = self.allocate_version();
        *slot = Slot {
            value,
            version,
            expires_at_ms,
        };
        Ok(CasOutcome::Swapped { version })
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.admit("delete").await?;
        let now = self.clock.now_ms();
        let mut state = self.lock_state()?;
        Ok(state
            .entries
            .remove(key)
            .is_some_and(|slot| slot.is_live(now)))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        self.admit("scan_prefix").await?;
        let now = self.clock.now_ms();
        let state = self.lock_state()?;
        let mut keys: Vec<String> = state
            .entries
            .iter()
            .filter(|(key, slot)| key.starts_with(prefix) && slot.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.admit("set_add").await?;
        let now = self.clock.now_ms();
        let expires_at_ms = self.expires_at(ttl);
        let mut state = self.lock_state()?;
        if state.live_set(key, now).is_none() {
            state.sets.insert(
                key.to_string(),
                SetSlot {
                    members: BTreeSet::new(),
                    expires_at_ms,
                },
            );
        }
        if let Some(set) = state.sets.get_mut(key) {
            set.expires_at_ms = match (set.expires_at_ms, expires_at_ms) {
                (Some(current), Some(requested)) => Some(current.max(requested)),
                _ => None,
            };
            set.members.insert(member.to_string());
        }
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), CacheError> {
        self.admit("set_remove").await?;
        let now = self.clock.now_ms();
        let mut state = self.lock_state()?;
        if let Some(set) = state.live_set(key, now) {
            set.members.remove(member);
            if set.members.is_empty() {
                state.sets.remove(key);
            }
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, CacheError> {
        self.admit("set_members").await?;
        let now = self.clock.now_ms();
        let mut state = self.lock_state()?;
        Ok(state
            .live_set(key, now)
            .map(|set| set.members.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    fn cache() -> (Arc<ManualClock>, InMemoryCache) {
        let clock = Arc::new(ManualClock::default_start());
        let cache = InMemoryCache::new(clock.clone());
        (clock, cache)
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (_, cache) = cache();
        let version = cache.put("k", b"v".to_vec(), None).await.unwrap();
        let entry = cache.get("k").await.unwrap().unwrap();
        assert_eq!(entry.value, b"v".to_vec());
        assert_eq!(entry.version, version);
    }

    #[tokio::test]
    async fn test_insert_if_absent() {
        let (_, cache) = cache();
        assert!(cache.insert_if_absent("k", b"1".to_vec(), None).await.unwrap().is_some());
        assert!(cache.insert_if_absent("k", b"2".to_vec(), None).await.unwrap().is_none());
        assert_eq!(cache.get("k").await.unwrap().unwrap().value, b"1".to_vec());
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let (_, cache) = cache();
        let version = cache.insert_if_absent("k", b"1".to_vec(), None).await.unwrap().unwrap();

        let outcome = cache.compare_and_swap("k", version, b"2".to_vec(), None).await.unwrap();
        let CasOutcome::Swapped { version: second } = outcome else {
            panic!("expected swap, got {outcome:?}");
        };
        assert_ne!(second, version);

        // The old version no longer matches.
        assert_eq!(
            cache.compare_and_swap("k", version, b"3".to_vec(), None).await.unwrap(),
            CasOutcome::VersionMismatch
        );
        assert_eq!(
            cache.compare_and_swap("missing", 1, b"3".to_vec(), None).await.unwrap(),
            CasOutcome::Missing
        );
    }

    #[tokio::test]
    async fn test_ttl_expiry_is_lazy() {
        let (clock, cache) = cache();
        cache.put("k", b"v".to_vec(), Some(Duration::from_secs(10))).await.unwrap();

        clock.advance_ms(9_999);
        assert!(cache.get("k").await.unwrap().is_some());

        clock.advance_ms(1);
        assert!(cache.physically_contains("k"));
        assert!(cache.scan_prefix("").await.unwrap().is_empty());
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(!cache.physically_contains("k"));
    }

    #[tokio::test]
    async fn test_scan_prefix_sorted() {
        let (_, cache) = cache();
        for key in ["a:2", "b:1", "a:1"] {
            cache.put(key, Vec::new(), None).await.unwrap();
        }
        assert_eq!(cache.scan_prefix("a:").await.unwrap(), vec!["a:1", "a:2"]);
    }

    #[tokio::test]
    async fn test_sets() {
        let (_, cache) = cache();
        cache.set_add("s", "x", None).await.unwrap();
        cache.set_add("s", "y", None).await.unwrap();
        cache.set_add("s", "x", None).await.unwrap();
        assert_eq!(cache.set_members("s").await.unwrap(), vec!["x", "y"]);

        cache.set_remove("s", "x").await.unwrap();
        cache.set_remove("s", "y").await.unwrap();
        assert!(cache.set_members("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_ttl_follows_longest_member() {
        let (clock, cache) = cache();
        cache.set_add("s", "long", Some(Duration::from_secs(10))).await.unwrap();
        cache.set_add("s", "short", Some(Duration::from_secs(1))).await.unwrap();

        clock.advance_ms(9_999);
        assert_eq!(cache.set_members("s").await.unwrap(), vec!["long", "short"]);

        clock.advance_ms(1);
        assert!(cache.set_members("s").await.unwrap().is_empty());
        assert_eq!(cache.physical_set_len("s"), 0);
    }

    #[tokio::test]
    async fn test_set_without_ttl_persists() {
        let (clock, cache) = cache();
        cache.set_add("s", "x", Some(Duration::from_secs(1))).await.unwrap();
        cache.set_add("s", "y", None).await.unwrap();

        clock.advance_ms(60_000);
        assert_eq!(cache.set_members("s").await.unwrap(), vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_unreachable() {
        let (_, cache) = cache();
        cache.set_reachable(false);
        assert!(matches!(cache.get("k").await, Err(CacheError::Unavailable(_))));

        cache.set_reachable(true);
        assert!(cache.get("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_fault_injection_always_fails() {
        let clock = Arc::new(ManualClock::default_start());
        let config = FaultConfig {
            failure_rate: 1.0,
            ..FaultConfig::default()
        };
        let cache = InMemoryCache::with_faults(clock, 12345, config);

        assert!(cache.put("k", Vec::new(), None).await.is_err());
        assert_eq!(cache.injected_failures(), 1);
        assert_eq!(cache.calls(), 1);
    }

    #[tokio::test]
    async fn test_fault_injection_deterministic() {
        let config = FaultConfig {
            failure_rate: 0.5,
            ..FaultConfig::default()
        };
        let first = InMemoryCache::with_faults(Arc::new(ManualClock::default_start()), 7, config.clone());
        let second = InMemoryCache::with_faults(Arc::new(ManualClock::default_start()), 7, config);

        for _ in 0..50 {
            let a = first.get("k").await.is_ok();
            let b = second.get("k").await.is_ok();
            assert_eq!(a, b);
        }
        assert_eq!(first.injected_failures(), second.injected_failures());
    }
}
