use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

/// Process-wide request counters.
#[derive(Debug)]
pub struct ProxyStats {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    started_at: Instant,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub uptime_seconds: u64,
}

impl Default for ProxyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyStats {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn record_request(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.successful.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let successful = self.successful.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);

        let success_rate = if total == 0 {
            0.0
        } else {
            (successful as f64 / total as f64 * 10000.0).round() / 100.0
        };

        StatsSnapshot {
            total_requests: total,
            successful_requests: successful,
            failed_requests: failed,
            success_rate,
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_snapshot() {
        let stats = ProxyStats::new();
        assert_eq!(stats.snapshot().success_rate, 0.0);

        for _ in 0..3 {
            stats.record_request();
        }
        stats.record_success();
        stats.record_success();
        stats.record_failure();
        tokio::time::advance(Duration::from_secs(90)).await;

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_requests, 3);
        assert_eq!(snapshot.successful_requests, 2);
        assert_eq!(snapshot.failed_requests, 1);
        assert_eq!(snapshot.success_rate, 66.67);
        assert_eq!(snapshot.uptime_seconds, 90);
    }
}
