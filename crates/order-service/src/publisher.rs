//! 事件发布
//!
//! `EventTransport` 抽象出"把一条消息交给 broker"的能力，
//! 生产环境由 Kafka 实现，测试中替换为 mock 或内存实现。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use order_shared::kafka::KafkaProducer;
use order_shared::observability::{metrics, tracing as otel};
use tracing::{debug, warn};

use crate::codec::{EventCodec, OutboundMessage};
use crate::error::{OrderError, Result};
use crate::models::OrderEvent;

/// 事件传输接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<()>;
}

/// 线上 header：标记 header 加上当前 span 的追踪上下文
pub fn wire_headers(message: &OutboundMessage) -> HashMap<String, String> {
    let mut headers = message.headers.clone();
    otel::inject_to_headers(&mut headers);
    headers
}

/// 基于 Kafka 的传输实现
pub struct KafkaTransport {
    producer: KafkaProducer,
    topic: String,
}

impl KafkaTransport {
    pub fn new(producer: KafkaProducer, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl EventTransport for KafkaTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        let payload = EventCodec::encode(&message.event)?;
        let headers = wire_headers(message);

        let (partition, offset) = self
            .producer
            .send_with_headers(
                &self.topic,
                Some(message.key.as_str()),
                &payload,
                &headers,
                None,
            )
            .await
            .map_err(|e| OrderError::Transport(e.to_string()))?;

        debug!(
            order_id = %message.event.order_id,
            key = %message.key,
            partition,
            offset,
            "订单事件已发送"
        );
        Ok(())
    }
}

/// 命令式发布入口
///
/// 供管道之外的调用方直接注入事件。发送失败返回 false 而不是错误，
/// 是否重试由调用方决定。
#[derive(Clone)]
pub struct ImperativePublisher {
    transport: Arc<dyn EventTransport>,
}

impl ImperativePublisher {
    pub fn new(transport: Arc<dyn EventTransport>) -> Self {
        Self { transport }
    }

    pub async fn publish(&self, event: OrderEvent) -> bool {
        let message = EventCodec::imperative(event);

        match self.transport.send(&message).await {
            Ok(()) => {
                metrics::record_publish("imperative", "ok");
                true
            }
            Err(e) => {
                metrics::record_publish("imperative", "error");
                warn!(
                    order_id = %message.event.order_id,
                    error = %e,
                    "命令式发布失败"
                );
                false
            }
        }
    }
}
