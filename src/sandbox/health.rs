//! Per-instance health scoring.
//!
//! The score starts at 1.0 and accumulates penalties for error rate, slow
//! calls, memory growth, idleness and wear. The pool recycles any instance whose
//! score drops below its configured threshold.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

const MB: usize = 1024 * 1024;

/// Running statistics for one instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthMetrics {
    /// Calls recorded.
    pub executions: u64,
    /// Calls that returned an error.
    pub errors: u64,
    /// Sum of recorded call durations.
    pub total_duration: Duration,
    /// Last observed heap size in bytes.
    pub memory_usage: usize,
    /// When the instance last finished a call.
    pub last_used: Instant,
    /// When the instance was first seen.
    pub created: Instant,
}

impl HealthMetrics {
    fn new(now: Instant) -> Self {
        Self {
            executions: 0,
            errors: 0,
            total_duration: Duration::ZERO,
            memory_usage: 0,
            last_used: now,
            created: now,
        }
    }

    /// Fraction of calls that failed, in `[0, 1]`.
    pub fn error_rate(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.errors as f64 / self.executions as f64
        }
    }

    /// Mean call duration, zero before the first call.
    pub fn average_duration(&self) -> Duration {
        if self.executions == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.executions.min(u64::from(u32::MAX)) as u32
        }
    }

    /// Health score at `now`.
    pub fn score_at(&self, now: Instant) -> f64 {
        let mut score = 1.0;

        score -= self.error_rate();

        let average = self.average_duration();
        score -= if average > Duration::from_secs(1) {
            0.3
        } else if average > Duration::from_millis(200) {
            0.2
        } else if average > Duration::from_millis(50) {
            0.1
        } else {
            0.0
        };

        score -= if self.memory_usage > 100 * MB {
            0.3
        } else if self.memory_usage > 50 * MB {
            0.2
        } else if self.memory_usage > 10 * MB {
            0.1
        } else {
            0.0
        };

        let idle = now.saturating_duration_since(self.last_used);
        score -= if idle > Duration::from_secs(2 * 60 * 60) {
            0.2
        } else if idle > Duration::from_secs(30 * 60) {
            0.1
        } else {
            0.0
        };

        score -= if self.executions > 10_000 {
            0.1
        } else if self.executions > 1_000 {
            0.05
        } else {
            0.0
        };

        (score.clamp(0.0, 1.0) * 100.0).round() / 100.0
    }
}

/// Aggregate view over every tracked instance.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct HealthStatistics {
    /// Instances tracked.
    pub instances: usize,
    /// Instances scoring at least 0.8.
    pub healthy: usize,
    /// Instances scoring below 0.5.
    pub unhealthy: usize,
    /// Mean score, 1.0 when nothing is tracked.
    pub average_score: f64,
    /// Calls recorded across all instances.
    pub total_executions: u64,
    /// Failed calls across all instances.
    pub total_errors: u64,
}

/// Tracks execution statistics per instance id.
#[derive(Debug, Default)]
pub struct HealthMonitor {
    records: RwLock<HashMap<u64, HealthMetrics>>,
}

impl HealthMonitor {
    /// An empty monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished call.
    pub fn record_execution(&self, id: u64, duration: Duration, failed: bool) {
        let now = Instant::now();
        let mut records = self.records.write();
        let metrics = records.entry(id).or_insert_with(|| HealthMetrics::new(now));
        metrics.executions += 1;
        metrics.total_duration += duration;
        if failed {
            metrics.errors += 1;
        }
        metrics.last_used = now;
    }

    /// Record the instance's current heap size.
    pub fn update_memory_usage(&self, id: u64, bytes: usize) {
        let now = Instant::now();
        self.records
            .write()
            .entry(id)
            .or_insert_with(|| HealthMetrics::new(now))
            .memory_usage = bytes;
    }

    /// Mark the instance as leased now, which resets its idle penalty.
    pub fn touch(&self, id: u64) {
        let now = Instant::now();
        self.records
            .write()
            .entry(id)
            .or_insert_with(|| HealthMetrics::new(now))
            .last_used = now;
    }

    /// Statistics for `id`, if tracked.
    pub fn metrics(&self, id: u64) -> Option<HealthMetrics> {
        self.records.read().get(&id).copied()
    }

    /// Current score; untracked instances score 1.0.
    pub fn score(&self, id: u64) -> f64 {
        self.records
            .read()
            .get(&id)
            .map_or(1.0, |m| m.score_at(Instant::now()))
    }

    /// Whether the score is below `threshold`.
    pub fn should_recycle(&self, id: u64, threshold: f64) -> bool {
        self.score(id) < threshold
    }

    /// Stop tracking a destroyed instance.
    pub fn forget(&self, id: u64) {
        self.records.write().remove(&id);
    }

    /// Aggregate statistics.
    pub fn statistics(&self) -> HealthStatistics {
        let now = Instant::now();
        let records = self.records.read();
        let mut stats = HealthStatistics {
            instances: records.len(),
            average_score: 1.0,
            ..Default::default()
        };
        if records.is_empty() {
            return stats;
        }

        let mut total = 0.0;
        for metrics in records.values() {
            let score = metrics.score_at(now);
            total += score;
            if score >= 0.8 {
                stats.healthy += 1;
            } else if score < 0.5 {
                stats.unhealthy += 1;
            }
            stats.total_executions += metrics.executions;
            stats.total_errors += metrics.errors;
        }
        stats.average_score = total / records.len() as f64;
        stats
    }
}
