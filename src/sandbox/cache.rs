//! Compiled bytecode caching for repeated scripts.
//!
//! This module provides a content-addressed LRU cache with a time-to-live,
//! shared by every call of a pipeline so identical scripts compile once.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::error::{Result, SandboxError};

/// Fixed per-entry overhead used by the size estimate.
const ENTRY_OVERHEAD: usize = 64;

/// A compiled chunk in the interpreter's binary dump format.
#[derive(Clone, PartialEq, Eq)]
pub struct Bytecode {
    bytes: Vec<u8>,
    chunk_name: String,
}

impl fmt::Debug for Bytecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bytecode")
            .field("chunk_name", &self.chunk_name)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl Bytecode {
    /// Wrap dumped bytes compiled under `chunk_name`.
    pub fn new(bytes: Vec<u8>, chunk_name: impl Into<String>) -> Self {
        Self {
            bytes,
            chunk_name: chunk_name.into(),
        }
    }

    /// The raw dump.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The chunk name used in error messages.
    pub fn chunk_name(&self) -> &str {
        &self.chunk_name
    }

    /// Dump length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the dump is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Reporting-only size estimate. The dump already contains the
    /// instructions, constants and debug info.
    pub fn estimated_size(&self) -> usize {
        ENTRY_OVERHEAD + self.bytes.len() + self.chunk_name.len()
    }
}

/// Cache sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of entries.
    pub max_size: usize,
    /// Age after which an entry is treated as absent.
    pub ttl: Duration,
}

impl CacheConfig {
    /// Default maximum entry count.
    pub const DEFAULT_MAX_SIZE: usize = 100;
    /// Default entry lifetime.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

    /// Replace zero values with defaults.
    pub fn normalized(mut self) -> Self {
        if self.max_size == 0 {
            self.max_size = Self::DEFAULT_MAX_SIZE;
        }
        if self.ttl.is_zero() {
            self.ttl = Self::DEFAULT_TTL;
        }
        self
    }

    /// Reject configurations that cannot hold anything.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(SandboxError::Config(
                "cache max_size must be positive".to_string(),
            ));
        }
        if self.ttl.is_zero() {
            return Err(SandboxError::Config("cache ttl must be positive".to_string()));
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: Self::DEFAULT_MAX_SIZE,
            ttl: Self::DEFAULT_TTL,
        }
    }
}

/// A point-in-time view of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Entries currently held, expired or not.
    pub size: usize,
    /// Configured capacity.
    pub max_size: usize,
    /// Sum of entry size estimates.
    pub memory_estimate: usize,
    /// Configured entry lifetime.
    pub ttl: Duration,
    /// Lookups that returned an entry.
    pub hits: u64,
    /// Lookups that found nothing or an expired entry.
    pub misses: u64,
    /// Entries dropped to stay within capacity.
    pub evictions: u64,
}

/// Deterministic cache key for a script compiled under `filename`.
///
/// Hex SHA-256 of `filename:script`.
pub fn generate_key(script: &str, filename: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(filename.as_bytes());
    hasher.update(b":");
    hasher.update(script.as_bytes());
    format!("{:x}", hasher.finalize())
}

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Entry {
    key: String,
    bytecode: Arc<Bytecode>,
    inserted: Instant,
    prev: usize,
    next: usize,
}

/// Slab-backed doubly linked list; `head` is most recently used.
#[derive(Debug)]
struct Lru {
    slots: Vec<Option<Entry>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    head: usize,
    tail: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl Lru {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: NIL,
            tail: NIL,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn entry(&self, slot: usize) -> Option<&Entry> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    fn entry_mut(&mut self, slot: usize) -> Option<&mut Entry> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = match self.entry(slot) {
            Some(entry) => (entry.prev, entry.next),
            None => return,
        };
        match self.entry_mut(prev) {
            Some(p) => p.next = next,
            None => self.head = next,
        }
        match self.entry_mut(next) {
            Some(n) => n.prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        if let Some(entry) = self.entry_mut(slot) {
            entry.prev = NIL;
            entry.next = old_head;
        }
        match self.entry_mut(old_head) {
            Some(h) => h.prev = slot,
            None => self.tail = slot,
        }
        self.head = slot;
    }

    fn touch(&mut self, slot: usize) {
        if self.head != slot {
            self.unlink(slot);
            self.push_front(slot);
        }
    }

    fn remove(&mut self, slot: usize) -> Option<Entry> {
        self.unlink(slot);
        let entry = self.slots.get_mut(slot)?.take()?;
        self.index.remove(&entry.key);
        self.free.push(slot);
        Some(entry)
    }

    fn insert(&mut self, entry: Entry) {
        let key = entry.key.clone();
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                slot
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, slot);
        self.push_front(slot);
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

/// LRU cache of compiled chunks with lazy TTL expiry.
///
/// All access goes through one exclusive lock because hits reorder the LRU list.
/// Eviction is purely count-based; the size estimate is only reported.
pub struct BytecodeCache {
    config: CacheConfig,
    inner: Mutex<Lru>,
}

impl fmt::Debug for BytecodeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BytecodeCache")
            .field("config", &self.config)
            .field("len", &self.len())
            .finish()
    }
}

impl Default for BytecodeCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl BytecodeCache {
    /// Create an empty cache. Zero values in `config` take defaults.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config: config.normalized(),
            inner: Mutex::new(Lru::new()),
        }
    }

    /// The effective configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up `key`, refreshing its LRU position on a hit.
    ///
    /// Expired entries are removed and reported as a miss.
    pub fn get(&self, key: &str) -> Option<Arc<Bytecode>> {
        let mut lru = self.inner.lock();
        let slot = match lru.index.get(key).copied() {
            Some(slot) => slot,
            None => {
                lru.misses += 1;
                return None;
            }
        };

        let expired = lru
            .entry(slot)
            .map_or(true, |entry| entry.inserted.elapsed() > self.config.ttl);
        if expired {
            lru.remove(slot);
            lru.misses += 1;
            trace!(key, "cache entry expired");
            return None;
        }

        lru.touch(slot);
        lru.hits += 1;
        lru.entry(slot).map(|entry| Arc::clone(&entry.bytecode))
    }

    /// Insert or overwrite `key`.
    ///
    /// Overwriting refreshes the entry's TTL and moves it to the front. Once
    /// the cache is over `max_size`, least recently used entries are evicted.
    ///
    /// # Arguments
    ///
    /// * `key` - Usually [`generate_key`] of the script text and chunk name.
    /// * `bytecode` - The dumped chunk. Empty bytecode is ignored.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let cache = BytecodeCache::new(CacheConfig::default());
    /// let key = generate_key("return 1", "main.lua");
    /// cache.put(key.clone(), Arc::new(Bytecode::new(bytes, "=main.lua")));
    /// assert!(cache.contains(&key));
    /// ```
    pub fn put(&self, key: impl Into<String>, bytecode: Arc<Bytecode>) {
        if bytecode.is_empty() {
            return;
        }
        let key = key.into();
        let mut lru = self.inner.lock();

        if let Some(slot) = lru.index.get(&key).copied() {
            if let Some(entry) = lru.entry_mut(slot) {
                entry.bytecode = bytecode;
                entry.inserted = Instant::now();
            }
            lru.touch(slot);
            return;
        }

        lru.insert(Entry {
            key,
            bytecode,
            inserted: Instant::now(),
            prev: NIL,
            next: NIL,
        });

        while lru.len() > self.config.max_size {
            let tail = lru.tail;
            match lru.remove(tail) {
                Some(evicted) => {
                    lru.evictions += 1;
                    trace!(key = %evicted.key, "cache entry evicted");
                }
                None => break,
            }
        }
    }

    /// Whether `key` is present and unexpired, without touching LRU order.
    pub fn contains(&self, key: &str) -> bool {
        let lru = self.inner.lock();
        lru.index
            .get(key)
            .and_then(|&slot| lru.entry(slot))
            .is_some_and(|entry| entry.inserted.elapsed() <= self.config.ttl)
    }

    /// Remove every entry.
    pub fn clear(&self) {
        let mut lru = self.inner.lock();
        let (hits, misses, evictions) = (lru.hits, lru.misses, lru.evictions);
        *lru = Lru::new();
        lru.hits = hits;
        lru.misses = misses;
        lru.evictions = evictions;
    }

    /// Number of entries, including ones not yet found expired.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current statistics.
    pub fn stats(&self) -> CacheStats {
        let lru = self.inner.lock();
        let memory_estimate = lru
            .slots
            .iter()
            .flatten()
            .map(|entry| entry.bytecode.estimated_size())
            .sum();
        CacheStats {
            size: lru.len(),
            max_size: self.config.max_size,
            memory_estimate,
            ttl: self.config.ttl,
            hits: lru.hits,
            misses: lru.misses,
            evictions: lru.evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(tag: u8) -> Arc<Bytecode> {
        Arc::new(Bytecode::new(vec![tag; 8], "=test"))
    }

    fn cache(max_size: usize, ttl: Duration) -> BytecodeCache {
        BytecodeCache::new(CacheConfig { max_size, ttl })
    }

    #[test]
    fn test_generate_key_is_deterministic() {
        let a = generate_key("return 1", "main.lua");
        let b = generate_key("return 1", "main.lua");
        let c = generate_key("return 1", "other.lua");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_put_and_get() {
        let cache = BytecodeCache::default();
        assert!(cache.get("k").is_none());
        cache.put("k", chunk(1));
        assert_eq!(cache.get("k").unwrap().as_bytes(), &[1; 8]);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
        assert_eq!(stats.memory_estimate, ENTRY_OVERHEAD + 8 + 5);
    }

    #[test]
    fn test_empty_bytecode_is_ignored() {
        let cache = BytecodeCache::default();
        cache.put("k", Arc::new(Bytecode::new(Vec::new(), "=x")));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_overwrite_does_not_duplicate() {
        let cache = cache(2, Duration::from_secs(60));
        cache.put("k", chunk(1));
        cache.put("k", chunk(2));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("k").unwrap().as_bytes(), &[2; 8]);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = cache(3, Duration::from_secs(60));
        cache.put("a", chunk(1));
        cache.put("b", chunk(2));
        cache.put("c", chunk(3));

        // a becomes most recent, so b is next out
        assert!(cache.get("a").is_some());
        cache.put("d", chunk(4));
        assert!(!cache.contains("b"));
        assert!(cache.contains("a"));

        cache.put("e", chunk(5));
        assert!(!cache.contains("c"));
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.stats().evictions, 2);
    }

    #[test]
    fn test_slot_reuse_after_eviction() {
        let cache = cache(2, Duration::from_secs(60));
        for i in 0..50u8 {
            cache.put(format!("k{i}"), chunk(i));
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.contains("k49"));
        assert!(cache.contains("k48"));
        assert!(cache.inner.lock().slots.len() <= 3);
    }

    #[test]
    fn test_ttl_expiry_is_lazy() {
        let ttl = Duration::from_millis(80);
        let cache = cache(10, ttl);
        cache.put("k", chunk(1));

        std::thread::sleep(ttl / 2);
        assert!(cache.get("k").is_some());

        std::thread::sleep(ttl * 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("k").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_clear_keeps_counters() {
        let cache = BytecodeCache::default();
        cache.put("k", chunk(1));
        let _ = cache.get("k");
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_zero_config_takes_defaults() {
        let cache = cache(0, Duration::ZERO);
        assert_eq!(cache.config().max_size, CacheConfig::DEFAULT_MAX_SIZE);
        assert_eq!(cache.config().ttl, CacheConfig::DEFAULT_TTL);
        assert!(CacheConfig { max_size: 0, ttl: Duration::ZERO }.validate().is_err());
    }
}
