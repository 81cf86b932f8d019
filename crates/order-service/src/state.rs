//! 应用状态定义

use std::sync::Arc;

use tokio::sync::watch;

use crate::broadcast::BroadcastSink;
use crate::counters::OrderCounters;
use crate::ingest::IngestService;
use crate::publisher::ImperativePublisher;

/// Axum 路由共享状态
#[derive(Clone)]
pub struct AppState {
    pub ingest: IngestService,
    pub publisher: ImperativePublisher,
    pub sink: BroadcastSink,
    pub counters: Arc<OrderCounters>,
    /// 关闭信号，用于结束长连接（SSE）
    pub shutdown: watch::Receiver<bool>,
}
