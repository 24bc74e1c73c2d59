use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Three process-local counters the front-end bumps on every request
/// outcome. Best-effort: loss on crash is acceptable, nothing here is
/// persisted.
#[derive(Clone, Default)]
pub struct RequestCounters {
    success: Arc<AtomicU64>,
    throttled: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl RequestCounters {
    pub fn record_success(&self) {
        self.success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_throttled(&self) {
        self.throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot_and_reset(&self) -> (u64, u64, u64) {
        (
            self.success.swap(0, Ordering::Relaxed),
            self.throttled.swap(0, Ordering::Relaxed),
            self.failed.swap(0, Ordering::Relaxed),
        )
    }
}

/// Wakes every second, snapshots-and-resets the counters, and emits one log
/// line if the sum is positive. Runs until `shutdown` is notified.
pub async fn run(node_id: String, counters: RequestCounters, shutdown: Arc<Notify>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
            _ = shutdown.notified() => return,
        }

        let (success, throttled, failed) = counters.snapshot_and_reset();
        let total = success + throttled + failed;
        if total > 0 {
            tracing::info!(
                "metrics: node={} throughput={}/s success={} throttled={} failed={}",
                node_id,
                total,
                success,
                throttled,
                failed,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_resets_counters() {
        let counters = RequestCounters::default();
        counters.record_success();
        counters.record_success();
        counters.record_throttled();
        counters.record_failed();

        let (s, t, f) = counters.snapshot_and_reset();
        assert_eq!((s, t, f), (2, 1, 1));

        let (s2, t2, f2) = counters.snapshot_and_reset();
        assert_eq!((s2, t2, f2), (0, 0, 0));
    }
}
