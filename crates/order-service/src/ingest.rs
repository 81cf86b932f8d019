//! 摄取管道
//!
//! 请求 → 校验 → 事件 → 待发送消息。每个输入恰好产生一个输出，顺序与到达顺序一致。
//!
//! 每条请求从到达起有固定的处理时限，超时的请求单独失败，不影响后续请求；
//! 结构不合法的请求转换为拒绝事件，同样不会中断整个流。
//!
//! 发送端并发等待 broker 回执，按到达顺序依次发起，因此同一 key 的顺序不变，
//! 而 broker 变慢时摄取队列仍会被持续取空。

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use order_shared::error::StreamError;
use order_shared::observability::metrics;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, Span, debug, info, info_span, warn};

use crate::codec::{EventCodec, OutboundMessage};
use crate::error::{OrderError, Result};
use crate::models::{ErrorInfo, OrderRequest};
use crate::publisher::EventTransport;
use crate::validation::{OrderValidator, ValidationResult};

/// 到达的一条原始请求
///
/// `span` 在请求到达时创建，后台处理与发送都在其中执行，
/// 发出的记录因此带上发起请求的追踪上下文。
#[derive(Debug, Clone)]
pub struct InboundOrder {
    pub received_at: Instant,
    pub payload: Value,
    pub span: Span,
}

impl InboundOrder {
    pub fn new(payload: Value) -> Self {
        Self {
            received_at: Instant::now(),
            payload,
            span: info_span!("ingest_order"),
        }
    }
}

// ---------------------------------------------------------------------------
// IngestPipeline
// ---------------------------------------------------------------------------

pub struct IngestPipeline {
    validator: OrderValidator,
    timeout: Duration,
}

impl IngestPipeline {
    pub fn new(timeout: Duration) -> Self {
        Self {
            validator: OrderValidator::new(),
            timeout,
        }
    }

    /// 处理单条请求
    ///
    /// 只有超时会返回错误；校验失败和结构不合法都产出 VALIDATION_FAILED 消息。
    pub fn process(&self, item: InboundOrder) -> Result<OutboundMessage> {
        let waited = Instant::now().saturating_duration_since(item.received_at);
        if waited >= self.timeout {
            metrics::record_ingest_timeout();
            return Err(OrderError::IngestTimeout {
                order_id: string_field(&item.payload, "orderId")
                    .unwrap_or_else(|| "unknown".to_string()),
                waited_ms: waited.as_millis() as u64,
            });
        }

        let message = match serde_json::from_value::<OrderRequest>(item.payload.clone()) {
            Ok(request) => self.build(&request),
            Err(e) => Self::reject_malformed(&item.payload, e.to_string()),
        };

        metrics::record_ingest(message.event.status.as_str());
        Ok(message)
    }

    /// 将请求流转换为消息流，每条结果附带其请求的 span
    pub fn run<S>(&self, input: S) -> impl Stream<Item = (Span, Result<OutboundMessage>)> + '_
    where
        S: Stream<Item = InboundOrder> + 'static,
    {
        input.map(move |item| {
            let span = item.span.clone();
            let result = span.in_scope(|| self.process(item));
            (span, result)
        })
    }

    fn build(&self, request: &OrderRequest) -> OutboundMessage {
        match self.validator.validate(request) {
            ValidationResult::Valid => {
                debug!(order_id = %request.order_id, "订单校验通过");
                EventCodec::received(&request.order_id, &request.customer_id)
            }
            ValidationResult::FirstViolation(violation) => {
                warn!(
                    order_id = %request.order_id,
                    violation = %violation,
                    "订单校验失败"
                );
                EventCodec::validation_failed(
                    &order_id_or_placeholder(&request.order_id),
                    &request.customer_id,
                    ErrorInfo::new("VALIDATION_ERROR", violation.to_string()),
                )
            }
        }
    }

    /// 结构不合法的请求：尽量从原始 JSON 中找回 orderId/customerId
    fn reject_malformed(payload: &Value, reason: String) -> OutboundMessage {
        let order_id = string_field(payload, "orderId").unwrap_or_default();
        let customer_id = string_field(payload, "customerId").unwrap_or_default();
        let error = OrderError::InvalidPayload(reason);

        warn!(order_id = %order_id, error = %error, "请求结构不合法");

        EventCodec::validation_failed(
            &order_id_or_placeholder(&order_id),
            &customer_id,
            ErrorInfo::new(error.code(), error.to_string()),
        )
    }
}

fn string_field(payload: &Value, name: &str) -> Option<String> {
    payload.get(name).and_then(Value::as_str).map(String::from)
}

/// 线上事件的 orderId 不能为空，缺失时生成占位 ID
fn order_id_or_placeholder(order_id: &str) -> String {
    if order_id.trim().is_empty() {
        format!("unknown-{}", uuid::Uuid::new_v4())
    } else {
        order_id.to_string()
    }
}

// ---------------------------------------------------------------------------
// IngestService
// ---------------------------------------------------------------------------

/// HTTP 边界与摄取管道之间的入口
///
/// 请求进入有界队列后立即返回；后台任务按到达顺序处理并交给传输层，
/// 最多 `max_in_flight` 条同时等待 broker 回执。只有队列与在途发送都占满时
/// `submit` 才会等待。队列积压导致的等待计入每条请求的处理时限。
#[derive(Clone)]
pub struct IngestService {
    tx: mpsc::Sender<InboundOrder>,
}

impl IngestService {
    pub fn spawn(
        pipeline: IngestPipeline,
        transport: Arc<dyn EventTransport>,
        queue_capacity: usize,
        max_in_flight: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let handle = tokio::spawn(drain(pipeline, transport, rx, max_in_flight.max(1)));
        (Self { tx }, handle)
    }

    /// 提交单个请求对象或请求数组，返回接受的条数
    pub async fn submit(&self, body: Value) -> Result<usize> {
        let items = match body {
            Value::Array(items) => items,
            single => vec![single],
        };

        // 同一批请求共享到达时刻，span 以当前 HTTP span 为父级
        let received_at = Instant::now();
        let count = items.len();
        for payload in items {
            let item = InboundOrder {
                received_at,
                payload,
                span: info_span!("ingest_order"),
            };
            self.tx
                .send(item)
                .await
                .map_err(|_| StreamError::Internal("摄取管道已停止".to_string()))?;
        }

        debug!(count, "请求已进入摄取队列");
        Ok(count)
    }
}

async fn drain(
    pipeline: IngestPipeline,
    transport: Arc<dyn EventTransport>,
    rx: mpsc::Receiver<InboundOrder>,
    max_in_flight: usize,
) {
    info!(max_in_flight, "摄取管道已启动");

    pipeline
        .run(ReceiverStream::new(rx))
        .map(|(span, result)| publish(transport.clone(), result).instrument(span))
        .buffered(max_in_flight)
        .for_each(|()| async {})
        .await;

    info!("摄取管道已停止");
}

async fn publish(transport: Arc<dyn EventTransport>, result: Result<OutboundMessage>) {
    let message = match result {
        Ok(message) => message,
        Err(e) => {
            warn!(code = e.code(), error = %e, "请求未能转换为事件");
            return;
        }
    };

    match transport.send(&message).await {
        Ok(()) => metrics::record_publish("pipeline", "ok"),
        Err(e) => {
            metrics::record_publish("pipeline", "error");
            warn!(
                order_id = %message.event.order_id,
                error = %e,
                "订单事件发送失败"
            );
        }
    }
}
