//! 处理结果计数
//!
//! 进程内两个单调递增计数，由消费管道持有并递增，同时同步到 Prometheus。

use std::sync::atomic::{AtomicU64, Ordering};

use order_shared::observability::metrics;
use serde::Serialize;

#[derive(Debug, Default)]
pub struct OrderCounters {
    processed: AtomicU64,
    failed: AtomicU64,
}

/// 某一时刻的计数快照，两个值之间不保证一致
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub processed: u64,
    pub failed: u64,
}

impl OrderCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// 返回递增后的值
    pub fn record_processed(&self) -> u64 {
        metrics::record_processed();
        self.processed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_failed(&self) -> u64 {
        metrics::record_failed();
        self.failed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            processed: self.processed(),
            failed: self.failed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters_start_at_zero() {
        let counters = OrderCounters::new();
        assert_eq!(
            counters.snapshot(),
            CounterSnapshot {
                processed: 0,
                failed: 0
            }
        );
    }

    #[test]
    fn test_counters_are_independent() {
        let counters = OrderCounters::new();
        assert_eq!(counters.record_processed(), 1);
        assert_eq!(counters.record_processed(), 2);
        assert_eq!(counters.record_failed(), 1);
        assert_eq!(counters.processed(), 2);
        assert_eq!(counters.failed(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments() {
        let counters = Arc::new(OrderCounters::new());
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let counters = counters.clone();
            tasks.spawn(async move {
                for _ in 0..1000 {
                    counters.record_processed();
                    counters.record_failed();
                }
            });
        }
        while tasks.join_next().await.is_some() {}

        assert_eq!(counters.processed(), 8000);
        assert_eq!(counters.failed(), 8000);
    }
}
