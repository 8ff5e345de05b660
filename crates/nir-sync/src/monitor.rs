//! In-process counters for cache effectiveness.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

/// Nominal cost of a full pipeline run, credited for every cache hit.
pub const NOMINAL_RUN_SECS: f64 = 10.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OptimizationStats {
    pub total_runs: u64,
    pub cache_hits: u64,
    pub reprocessed: u64,
    pub hit_ratio: f64,
    pub estimated_time_saved_secs: f64,
}

#[derive(Debug, Default)]
struct Counters {
    cache_hits: u64,
    reprocessed: u64,
    time_saved_secs: f64,
}

#[derive(Debug, Default)]
pub struct OptimizationMonitor {
    counters: Mutex<Counters>,
}

impl OptimizationMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_hit(&self) {
        let mut counters = self.counters();
        counters.cache_hits += 1;
        counters.time_saved_secs += NOMINAL_RUN_SECS;
    }

    pub fn record_reprocess(&self, elapsed: Duration) {
        let mut counters = self.counters();
        counters.reprocessed += 1;
        counters.time_saved_secs += (NOMINAL_RUN_SECS - elapsed.as_secs_f64()).max(0.0);
    }

    pub fn stats(&self) -> OptimizationStats {
        let counters = self.counters();
        let total_runs = counters.cache_hits + counters.reprocessed;
        if total_runs == 0 {
            return OptimizationStats::default();
        }
        OptimizationStats {
            total_runs,
            cache_hits: counters.cache_hits,
            reprocessed: counters.reprocessed,
            hit_ratio: counters.cache_hits as f64 / total_runs as f64,
            estimated_time_saved_secs: counters.time_saved_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_runs_report_zeros() {
        assert_eq!(OptimizationMonitor::new().stats(), OptimizationStats::default());
    }

    #[test]
    fn hits_and_reprocesses_accumulate() {
        let monitor = OptimizationMonitor::new();
        monitor.record_hit();
        monitor.record_hit();
        monitor.record_reprocess(Duration::from_secs(4));
        monitor.record_reprocess(Duration::from_secs(25));

        let stats = monitor.stats();
        assert_eq!(stats.total_runs, 4);
        assert_eq!(stats.cache_hits, 2);
        assert_eq!(stats.reprocessed, 2);
        assert!((stats.hit_ratio - 0.5).abs() < f64::EPSILON);
        assert!((stats.estimated_time_saved_secs - 26.0).abs() < 1e-9);
    }
}
