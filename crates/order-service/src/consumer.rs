//! 消费管道
//!
//! 对每条投递：记录投递元数据 → 执行业务规则 →
//! 成功则广播、计数并确认；失败则计数、记录错误且不确认。
//! 不确认的消息由 broker 侧按退避策略重投递，耗尽后进入死信 topic，
//! 本模块从不自行重试。

use std::sync::Arc;

use order_shared::ack::Acknowledgment;
use order_shared::config::AppConfig;
use order_shared::dlq::DeadLetterPublisher;
use order_shared::kafka::{ConsumeOptions, ConsumerMessage, KafkaConsumer};
use order_shared::observability::tracing as otel;
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span};

use crate::broadcast::BroadcastSink;
use crate::codec::EventCodec;
use crate::counters::OrderCounters;
use crate::error::Result;
use crate::models::OrderEvent;
use crate::policy::BusinessPolicy;

/// 单条投递的元数据
///
/// `ack` 只能由收到该消息的分区 worker 兑现一次。
#[derive(Debug)]
pub struct DeliveryMetadata {
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    /// 第几次投递（从 1 开始）
    pub attempt: u32,
    pub ack: Acknowledgment,
}

impl DeliveryMetadata {
    pub fn from_message(msg: &ConsumerMessage, ack: Acknowledgment) -> Self {
        Self {
            partition: msg.partition,
            offset: msg.offset,
            key: msg.key.clone(),
            attempt: msg.delivery_attempt,
            ack,
        }
    }
}

pub struct ConsumePipeline {
    policy: Arc<dyn BusinessPolicy>,
    sink: BroadcastSink,
    counters: Arc<OrderCounters>,
}

impl ConsumePipeline {
    pub fn new(
        policy: Arc<dyn BusinessPolicy>,
        sink: BroadcastSink,
        counters: Arc<OrderCounters>,
    ) -> Self {
        Self {
            policy,
            sink,
            counters,
        }
    }

    pub fn counters(&self) -> &Arc<OrderCounters> {
        &self.counters
    }

    /// 处理一个已解码的事件
    ///
    /// 只有业务规则成功时才确认；失败时句柄随 `meta` 一起被丢弃。
    pub async fn handle(&self, event: OrderEvent, meta: DeliveryMetadata) -> Result<()> {
        let order_id = event.order_id.clone();

        info!(
            order_id = %order_id,
            status = %event.status,
            partition = meta.partition,
            offset = meta.offset,
            key = ?meta.key,
            attempt = meta.attempt,
            "处理订单事件"
        );

        match self.policy.apply(event).await {
            Ok(processed) => {
                self.sink.publish(processed);
                self.counters.record_processed();
                meta.ack.acknowledge();
                debug!(
                    order_id = %order_id,
                    partition = meta.partition,
                    offset = meta.offset,
                    "订单事件已确认"
                );
                Ok(())
            }
            Err(e) => {
                self.counters.record_failed();
                error!(
                    order_id = %order_id,
                    partition = meta.partition,
                    offset = meta.offset,
                    attempt = meta.attempt,
                    error = %e,
                    "订单事件处理失败，不确认以等待重投递"
                );
                Err(e)
            }
        }
    }

    /// 处理一条原始 Kafka 消息
    ///
    /// 无法解码的消息按处理失败对待，最终进入死信 topic。
    pub async fn handle_message(&self, msg: ConsumerMessage, ack: Acknowledgment) -> Result<()> {
        let span = info_span!(
            "consume_order",
            partition = msg.partition,
            offset = msg.offset,
            attempt = msg.delivery_attempt,
        );
        otel::set_parent_from_headers(&span, &msg.headers);

        self.decode_and_handle(msg, ack).instrument(span).await
    }

    async fn decode_and_handle(&self, msg: ConsumerMessage, ack: Acknowledgment) -> Result<()> {
        let meta = DeliveryMetadata::from_message(&msg, ack);

        let event = match EventCodec::decode(&msg.payload) {
            Ok(event) => event,
            Err(e) => {
                self.counters.record_failed();
                error!(
                    partition = meta.partition,
                    offset = meta.offset,
                    attempt = meta.attempt,
                    error = %e,
                    "订单事件解码失败"
                );
                return Err(e);
            }
        };

        self.handle(event, meta).await
    }
}

// ---------------------------------------------------------------------------
// OrderConsumer
// ---------------------------------------------------------------------------

/// 订单 topic 消费者：把 Kafka 消费循环接到消费管道上
pub struct OrderConsumer {
    consumer: KafkaConsumer,
    topic: String,
    options: ConsumeOptions,
    dead_letter: DeadLetterPublisher,
    pipeline: Arc<ConsumePipeline>,
}

impl OrderConsumer {
    pub fn new(
        config: &AppConfig,
        dead_letter: DeadLetterPublisher,
        pipeline: Arc<ConsumePipeline>,
    ) -> Result<Self> {
        let consumer = KafkaConsumer::new(&config.kafka)?;
        Ok(Self {
            consumer,
            topic: config.kafka.orders_topic.clone(),
            options: ConsumeOptions {
                redelivery: config.kafka.redelivery_policy(),
                queue_capacity: config.pipeline.worker_queue_capacity,
            },
            dead_letter,
            pipeline,
        })
    }

    /// 运行直到收到关闭信号
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        self.consumer.subscribe(&[self.topic.as_str()])?;

        info!(
            topic = %self.topic,
            max_attempts = self.options.redelivery.max_attempts(),
            "订单消费者已启动"
        );

        let pipeline = self.pipeline;
        self.consumer
            .start(shutdown, self.options, self.dead_letter, move |msg, ack| {
                let pipeline = pipeline.clone();
                async move { pipeline.handle_message(msg, ack).await }
            })
            .await;

        info!("订单消费者已停止");
        Ok(())
    }
}
