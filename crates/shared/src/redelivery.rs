//! 未确认消息的重投递
//!
//! 处理函数只负责"确认或不确认"，重投递完全在这里完成：
//! 同一条消息在退避后再次交给处理函数，每次投递都换一个新的确认句柄；
//! 投递次数耗尽后交由调用方转入死信 topic。
//!
//! 与 Kafka 无关的部分单独放在本模块，方便用暂停的 tokio 时钟测试。

use std::fmt::Display;
use std::future::Future;

use tokio::sync::watch;
use tracing::warn;

use crate::ack::Acknowledgment;
use crate::kafka::ConsumerMessage;
use crate::retry::RetryPolicy;

/// 一条消息的最终处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// 某次投递中句柄被兑现
    Acknowledged { attempts: u32 },
    /// 所有投递都未确认
    Exhausted { attempts: u32, last_error: String },
    /// 等待重投递期间收到关闭信号
    Cancelled { attempts: u32 },
}

/// 等待关闭信号
///
/// 发送端被丢弃视为永远不会关闭。
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// 投递一条消息，未确认时按策略重投递
pub async fn deliver_with_redelivery<F, Fut, E>(
    msg: &ConsumerMessage,
    policy: &RetryPolicy,
    shutdown: &mut watch::Receiver<bool>,
    handler: &F,
) -> DeliveryOutcome
where
    F: Fn(ConsumerMessage, Acknowledgment) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let mut attempt: u32 = 0;

    loop {
        let (ack, mut receipt) = Acknowledgment::pair(&msg.topic, msg.partition, msg.offset);
        let mut delivery = msg.clone();
        delivery.delivery_attempt = attempt + 1;

        let result = handler(delivery, ack).await;
        if receipt.is_acknowledged() {
            return DeliveryOutcome::Acknowledged {
                attempts: attempt + 1,
            };
        }

        let last_error = match result {
            Err(e) => e.to_string(),
            Ok(()) => "处理函数返回但未确认消息".to_string(),
        };

        if !policy.should_retry(attempt) {
            warn!(
                topic = %msg.topic,
                partition = msg.partition,
                offset = msg.offset,
                attempts = attempt + 1,
                error = %last_error,
                "消息投递次数已耗尽"
            );
            return DeliveryOutcome::Exhausted {
                attempts: attempt + 1,
                last_error,
            };
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            topic = %msg.topic,
            partition = msg.partition,
            offset = msg.offset,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            error = %last_error,
            "消息未确认，退避后重新投递"
        );

        tokio::select! {
            biased;
            _ = shutdown_requested(shutdown) => {
                return DeliveryOutcome::Cancelled { attempts: attempt + 1 };
            }
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
    }
}
