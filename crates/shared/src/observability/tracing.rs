//! 日志与分布式追踪初始化
//!
//! 日志层总是启用（pretty 或 JSON），配置了 OTLP 端点时再叠加 OpenTelemetry 导出层。
//! 追踪上下文通过 W3C `traceparent` header 随 Kafka 消息在生产端与消费端之间传播。

use std::collections::HashMap;

use anyhow::Result;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::{TraceContextExt, TracerProvider as _};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, SdkTracerProvider};
use tracing_opentelemetry::OpenTelemetrySpanExt;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use super::ObservabilityConfig;

/// 追踪导出守卫
///
/// drop 时关闭 provider，批量导出器里尚未发送的 span 会被刷出。
pub struct TracingGuard {
    provider: Option<SdkTracerProvider>,
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        let Some(provider) = self.provider.take() else {
            return;
        };
        if let Err(e) = provider.shutdown() {
            eprintln!("关闭 tracer provider 失败: {e:?}");
        }
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// 安装全局 subscriber
///
/// 过滤指令优先取 RUST_LOG，其次是配置中的 `log_level`。
pub fn init(config: &ObservabilityConfig) -> Result<TracingGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let provider = config
        .otlp_endpoint()
        .map(|endpoint| build_provider(&config.service_name, endpoint))
        .transpose()?;

    let mut layers: Vec<BoxedLayer> = vec![log_layer(config.json_logs)];
    if let Some(provider) = &provider {
        let tracer = provider.tracer(config.service_name.clone());
        layers.push(tracing_opentelemetry::layer().with_tracer(tracer).boxed());
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()?;

    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    Ok(TracingGuard { provider })
}

/// 本地日志层：生产环境输出 JSON 并在 span 结束时打点，开发环境输出彩色文本
fn log_layer(json: bool) -> BoxedLayer {
    if json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_thread_ids(true)
            .boxed()
    } else {
        fmt::layer().with_target(true).with_ansi(true).boxed()
    }
}

fn build_provider(service_name: &str, endpoint: &str) -> Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let provider = SdkTracerProvider::builder()
        .with_resource(
            Resource::builder()
                .with_service_name(service_name.to_string())
                .build(),
        )
        .with_sampler(Sampler::ParentBased(Box::new(Sampler::AlwaysOn)))
        .with_id_generator(RandomIdGenerator::default())
        .with_batch_exporter(exporter)
        .build();

    opentelemetry::global::set_tracer_provider(provider.clone());
    Ok(provider)
}

/// 当前 span 的 trace ID，未启用 OpenTelemetry 时为 None
pub fn current_trace_id() -> Option<String> {
    let context = tracing::Span::current().context();
    let span_ref = context.span();
    let span_context = span_ref.span_context();

    span_context
        .is_valid()
        .then(|| span_context.trace_id().to_string())
}

// ============================================================================
// 追踪上下文传播
// ============================================================================

struct HeaderExtractor<'a>(&'a HashMap<String, String>);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

struct HeaderInjector<'a>(&'a mut HashMap<String, String>);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

/// 从消息 header 中恢复上游追踪上下文
pub fn extract_from_headers(headers: &HashMap<String, String>) -> opentelemetry::Context {
    TraceContextPropagator::new().extract(&HeaderExtractor(headers))
}

/// 将当前 span 的追踪上下文写入消息 header
///
/// 当前 span 没有有效上下文时不写入任何 header。
pub fn inject_to_headers(headers: &mut HashMap<String, String>) {
    let context = tracing::Span::current().context();
    TraceContextPropagator::new().inject_context(&context, &mut HeaderInjector(headers));
}

/// 以消息 header 中的上下文作为 span 的父级
pub fn set_parent_from_headers(span: &tracing::Span, headers: &HashMap<String, String>) {
    let _ = span.set_parent(extract_from_headers(headers));
}
