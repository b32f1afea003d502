//! Execution metrics for the pipeline.
//!
//! Counters are lock-free atomics so every call can record its outcome without
//! contending on the pool or cache locks. Use [`PipelineMetrics::snapshot`] for
//! a copyable view.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::sandbox::cache::CacheStats;
use crate::sandbox::health::HealthStatistics;
use crate::sandbox::pool::PoolMetrics;

/// Shared counters updated by every pipeline call.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    calls_executed: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    compile_nanos: AtomicU64,
    exec_nanos: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    memory_used: AtomicUsize,
    memory_peak: AtomicUsize,
}

/// A point-in-time snapshot of [`PipelineMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PipelineSnapshot {
    /// Calls attempted, whatever their outcome.
    pub calls_executed: u64,
    /// Compilations skipped thanks to the cache.
    pub cache_hits: u64,
    /// Scripts compiled fresh.
    pub cache_misses: u64,
    /// Total time spent compiling.
    pub compile_time: Duration,
    /// Total time spent running guest code.
    pub exec_time: Duration,
    /// Calls that returned an error.
    pub errors: u64,
    /// Calls that hit their deadline mid-execution.
    pub timeouts: u64,
    /// Heap size of the most recently released instance.
    pub memory_used: usize,
    /// Largest heap size observed on any instance.
    pub memory_peak: usize,
}

impl PipelineSnapshot {
    /// Share of cache lookups that hit, zero before the first lookup.
    pub fn cache_hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

impl PipelineMetrics {
    /// Zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one attempted call.
    pub fn record_call(&self) {
        self.calls_executed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cache hit.
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cache miss and the compile time it cost.
    pub fn record_cache_miss(&self, compile: Duration) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        self.compile_nanos.fetch_add(nanos(compile), Ordering::Relaxed);
    }

    /// Add guest execution time.
    pub fn record_exec_time(&self, exec: Duration) {
        self.exec_nanos.fetch_add(nanos(exec), Ordering::Relaxed);
    }

    /// Record a failed call.
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a call that timed out mid-execution.
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an instance's heap size after a call and the highest size the
    /// call reached.
    pub fn record_memory(&self, used: usize, peak: usize) {
        self.memory_used.store(used, Ordering::Relaxed);
        self.memory_peak.fetch_max(peak.max(used), Ordering::Relaxed);
    }

    /// Returns a point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            calls_executed: self.calls_executed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            compile_time: Duration::from_nanos(self.compile_nanos.load(Ordering::Relaxed)),
            exec_time: Duration::from_nanos(self.exec_nanos.load(Ordering::Relaxed)),
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            memory_used: self.memory_used.load(Ordering::Relaxed),
            memory_peak: self.memory_peak.load(Ordering::Relaxed),
        }
    }
}

/// Everything the engine reports in one read.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EngineMetrics {
    /// Pool gauges and totals.
    pub pool: PoolMetrics,
    /// Pipeline counters.
    pub pipeline: PipelineSnapshot,
    /// Bytecode cache statistics.
    pub cache: CacheStats,
    /// Instance health aggregate.
    pub health: HealthStatistics,
}
