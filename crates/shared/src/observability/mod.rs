//! 可观测性入口
//!
//! 日志、分布式追踪和 Prometheus 指标都从 [`init`] 启动，返回的守卫决定它们的生命周期。
//! 配置来自 `[observability]` 配置段，字段全部可省略。

pub mod metrics;
pub mod middleware;
pub mod tracing;

use ::tracing::info;
use anyhow::Result;
use serde::Deserialize;

/// `[observability]` 配置段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// 追踪 resource 与 `service_starts_total` 标签中的服务名，启动时由 AppConfig 注入
    pub service_name: String,

    /// OTLP gRPC 端点；缺省或空串时只输出本地日志
    pub otlp_endpoint: Option<String>,

    /// `/metrics` 监听端口，0 表示不启动导出
    pub metrics_port: u16,

    /// RUST_LOG 未设置时使用的过滤指令
    pub log_level: String,

    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: "order-service".to_string(),
            otlp_endpoint: None,
            metrics_port: 9090,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl ObservabilityConfig {
    pub fn with_service_name(mut self, service_name: &str) -> Self {
        self.service_name = service_name.to_string();
        self
    }

    /// 有效的 OTLP 端点
    ///
    /// 环境变量覆盖只能写字符串，`ORDER_OBSERVABILITY__OTLP_ENDPOINT=` 等同于关闭。
    pub fn otlp_endpoint(&self) -> Option<&str> {
        self.otlp_endpoint
            .as_deref()
            .map(str::trim)
            .filter(|endpoint| !endpoint.is_empty())
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port != 0
    }
}

/// 可观测性守卫
///
/// 持有期间指标端口保持监听；drop 时停止指标服务并把未导出的 span 刷出。
pub struct ObservabilityGuard {
    metrics: Option<metrics::MetricsHandle>,
    _tracing: Option<tracing::TracingGuard>,
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        if let Some(metrics) = self.metrics.take() {
            metrics.stop();
        }
        info!("可观测性组件已关闭");
    }
}

/// 启动日志、追踪与指标
///
/// tracing 必须最先就绪，否则指标端口绑定失败时的日志会丢失。
pub async fn init(config: &ObservabilityConfig) -> Result<ObservabilityGuard> {
    let tracing_guard = tracing::init(config)?;

    let metrics_handle = if config.metrics_enabled() {
        Some(metrics::init(config).await?)
    } else {
        info!("metrics_port = 0，跳过 Prometheus 导出");
        None
    };

    info!(
        service = %config.service_name,
        metrics_port = config.metrics_port,
        otlp_endpoint = config.otlp_endpoint().unwrap_or("-"),
        json_logs = config.json_logs,
        "可观测性已初始化"
    );

    Ok(ObservabilityGuard {
        metrics: metrics_handle,
        _tracing: Some(tracing_guard),
    })
}
