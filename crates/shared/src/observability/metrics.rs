//! Prometheus 指标
//!
//! 记录端统一走 metrics crate 的宏，导出端是 metrics-exporter-prometheus 的 recorder，
//! 通过单独端口上的 `/metrics` 供抓取。recorder 未安装时所有记录调用都是空操作，
//! 单元测试无需任何准备。

use std::net::SocketAddr;

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::ObservabilityConfig;

/// 指标名称
pub mod names {
    pub const HTTP_REQUESTS: &str = "http_requests_total";
    pub const HTTP_DURATION: &str = "http_request_duration_seconds";
    pub const INGESTED: &str = "orders_ingested_total";
    pub const INGEST_TIMEOUTS: &str = "orders_ingest_timeouts_total";
    pub const PUBLISHED: &str = "orders_published_total";
    pub const PROCESSED: &str = "orders_processed_total";
    pub const FAILED: &str = "orders_failed_total";
    pub const DEAD_LETTERED: &str = "orders_dead_lettered_total";
    pub const BROADCAST_DROPPED: &str = "orders_broadcast_dropped_total";
    pub const SERVICE_STARTS: &str = "service_starts_total";
}

/// 指标服务句柄
pub struct MetricsHandle {
    stop: Option<oneshot::Sender<()>>,
    _server: JoinHandle<()>,
}

impl MetricsHandle {
    /// 停止 `/metrics` 服务，已建立的抓取连接处理完后退出
    pub fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// 安装 recorder 并在 `metrics_port` 上启动导出服务
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let recorder = PrometheusBuilder::new().install_recorder()?;

    describe_order_metrics();
    metrics::counter!(names::SERVICE_STARTS, "service" => config.service_name.clone())
        .increment(1);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    serve(addr, recorder).await
}

fn describe_order_metrics() {
    metrics::describe_counter!(names::HTTP_REQUESTS, "HTTP requests by method, route and status");
    metrics::describe_histogram!(names::HTTP_DURATION, "HTTP request latency in seconds");
    metrics::describe_counter!(
        names::INGESTED,
        "Orders turned into outbound events, by resulting status"
    );
    metrics::describe_counter!(
        names::INGEST_TIMEOUTS,
        "Orders that exceeded the ingest deadline"
    );
    metrics::describe_counter!(
        names::PUBLISHED,
        "Outbound events handed to the broker, by source and outcome"
    );
    metrics::describe_counter!(
        names::PROCESSED,
        "Consumed events that passed business logic and were acknowledged"
    );
    metrics::describe_counter!(
        names::FAILED,
        "Consumed deliveries rejected by business logic or undecodable"
    );
    metrics::describe_counter!(
        names::DEAD_LETTERED,
        "Messages moved to the dead-letter topic after exhausting redelivery"
    );
    metrics::describe_counter!(
        names::BROADCAST_DROPPED,
        "Processed events lost to lagging subscribers or a full warm-up buffer"
    );
}

async fn serve(addr: SocketAddr, recorder: PrometheusHandle) -> Result<MetricsHandle> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(recorder.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "指标服务已监听");

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let shutdown = async {
            let _ = stop_rx.await;
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(error = %e, "指标服务异常退出");
        }
    });

    Ok(MetricsHandle {
        stop: Some(stop_tx),
        _server: server,
    })
}

// ============================================================================
// 记录函数
// ============================================================================

/// HTTP 请求计数与耗时，`route` 应为路由模板而不是实际路径
pub fn record_http_request(method: &str, route: &str, status: u16, duration_secs: f64) {
    let status = status.to_string();
    metrics::counter!(
        names::HTTP_REQUESTS,
        "method" => method.to_string(),
        "path" => route.to_string(),
        "status" => status.clone()
    )
    .increment(1);
    metrics::histogram!(
        names::HTTP_DURATION,
        "method" => method.to_string(),
        "path" => route.to_string(),
        "status" => status
    )
    .record(duration_secs);
}

/// 一条请求被转换成的事件状态
pub fn record_ingest(status: &str) {
    metrics::counter!(names::INGESTED, "status" => status.to_string()).increment(1);
}

pub fn record_ingest_timeout() {
    metrics::counter!(names::INGEST_TIMEOUTS).increment(1);
}

/// source: pipeline / imperative；outcome: ok / error
pub fn record_publish(source: &str, outcome: &str) {
    metrics::counter!(
        names::PUBLISHED,
        "source" => source.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_processed() {
    metrics::counter!(names::PROCESSED).increment(1);
}

pub fn record_failed() {
    metrics::counter!(names::FAILED).increment(1);
}

pub fn record_dead_letter(source_topic: &str) {
    metrics::counter!(names::DEAD_LETTERED, "topic" => source_topic.to_string()).increment(1);
}

pub fn record_broadcast_dropped(count: u64) {
    metrics::counter!(names::BROADCAST_DROPPED).increment(count);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_http_request("POST", "/ingest", 200, 0.01);
        record_ingest("RECEIVED");
        record_ingest_timeout();
        record_publish("imperative", "ok");
        record_processed();
        record_failed();
        record_dead_letter("orders.v1");
        record_broadcast_dropped(3);
    }

    #[test]
    fn test_order_metrics_share_prefix() {
        for name in [
            names::INGESTED,
            names::INGEST_TIMEOUTS,
            names::PUBLISHED,
            names::PROCESSED,
            names::FAILED,
            names::DEAD_LETTERED,
            names::BROADCAST_DROPPED,
        ] {
            assert!(name.starts_with("orders_") && name.ends_with("_total"), "{name}");
        }
    }
}
