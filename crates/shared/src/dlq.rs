//! 死信 topic 投递
//!
//! 投递次数耗尽的消息原样转发到 `{topic}.DLT`：保持原 key、原 header，
//! 额外附加失败上下文 header，便于排查或人工回放。原分区号在死信 topic 中存在时
//! 沿用原分区；死信 topic 若事先以更少的分区创建，则按 key 哈希分区。

use std::collections::HashMap;

use chrono::Utc;
use tracing::warn;

use crate::error::StreamError;
use crate::kafka::{ConsumerMessage, KafkaProducer};

/// 死信 header 名称
pub mod headers {
    pub const ORIGINAL_TOPIC: &str = "x-original-topic";
    pub const ORIGINAL_PARTITION: &str = "x-original-partition";
    pub const ORIGINAL_OFFSET: &str = "x-original-offset";
    pub const EXCEPTION_MESSAGE: &str = "x-exception-message";
    pub const ATTEMPTS: &str = "x-attempts";
    pub const FAILED_AT: &str = "x-failed-at";
}

/// 主 topic 对应的死信 topic 名称
pub fn dead_letter_topic(source_topic: &str) -> String {
    format!("{source_topic}.DLT")
}

/// 死信消息的目标分区，None 表示按 key 哈希
pub fn dead_letter_partition(source_partition: i32, dead_letter_partitions: i32) -> Option<i32> {
    (source_partition < dead_letter_partitions).then_some(source_partition)
}

/// 构造死信消息的 header：原 header + 失败上下文
pub fn dead_letter_headers(
    msg: &ConsumerMessage,
    attempts: u32,
    error: &str,
) -> HashMap<String, String> {
    let mut out = msg.headers.clone();
    out.insert(headers::ORIGINAL_TOPIC.to_string(), msg.topic.clone());
    out.insert(
        headers::ORIGINAL_PARTITION.to_string(),
        msg.partition.to_string(),
    );
    out.insert(headers::ORIGINAL_OFFSET.to_string(), msg.offset.to_string());
    out.insert(headers::EXCEPTION_MESSAGE.to_string(), error.to_string());
    out.insert(headers::ATTEMPTS.to_string(), attempts.to_string());
    out.insert(headers::FAILED_AT.to_string(), Utc::now().to_rfc3339());
    out
}

/// 死信发布器
#[derive(Clone)]
pub struct DeadLetterPublisher {
    producer: KafkaProducer,
    /// 死信 topic 实际的分区数
    partitions: i32,
}

impl DeadLetterPublisher {
    pub fn new(producer: KafkaProducer, partitions: i32) -> Self {
        Self {
            producer,
            partitions,
        }
    }

    /// 将消息转发到死信 topic
    pub async fn publish(
        &self,
        msg: &ConsumerMessage,
        attempts: u32,
        error: &str,
    ) -> Result<(i32, i64), StreamError> {
        let topic = dead_letter_topic(&msg.topic);
        let headers = dead_letter_headers(msg, attempts, error);
        let partition = dead_letter_partition(msg.partition, self.partitions);

        let delivered = self
            .producer
            .send_with_headers(
                &topic,
                msg.key.as_deref(),
                &msg.payload,
                &headers,
                partition,
            )
            .await?;

        crate::observability::metrics::record_dead_letter(&msg.topic);
        warn!(
            dead_letter_topic = %topic,
            dead_letter_partition = delivered.0,
            source_partition = msg.partition,
            source_offset = msg.offset,
            attempts,
            error,
            "消息已转入死信 topic"
        );

        Ok(delivered)
    }
}
