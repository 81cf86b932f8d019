//! 手动确认句柄
//!
//! 每条投递给处理函数的消息都附带一个 [`Acknowledgment`]，绑定到
//! (topic, partition, offset)。句柄只能按值兑现一次，且不可克隆：
//! - 兑现 → 消费循环提交该 offset，消息视为已被消费组持久消费
//! - 丢弃不兑现 → 消费循环按重投递策略再次投递，耗尽后转入死信 topic
//!
//! 句柄必须在处理函数返回前兑现，之后兑现不再生效。

use tokio::sync::oneshot;

/// 单次有效的确认句柄
#[derive(Debug)]
pub struct Acknowledgment {
    topic: String,
    partition: i32,
    offset: i64,
    tx: oneshot::Sender<()>,
}

/// 确认结果的接收端，由消费 worker 持有
#[derive(Debug)]
pub struct AckReceipt {
    rx: oneshot::Receiver<()>,
}

impl Acknowledgment {
    /// 为一次投递创建句柄和对应的回执
    pub fn pair(topic: impl Into<String>, partition: i32, offset: i64) -> (Self, AckReceipt) {
        let (tx, rx) = oneshot::channel();
        let handle = Self {
            topic: topic.into(),
            partition,
            offset,
            tx,
        };
        (handle, AckReceipt { rx })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// 确认消费成功
    ///
    /// 消耗句柄本身，编译期保证同一条消息最多确认一次。
    pub fn acknowledge(self) {
        // 接收端已放弃（例如消费循环正在关闭）时确认无意义，忽略即可
        let _ = self.tx.send(());
        tracing::debug!(
            topic = %self.topic,
            partition = self.partition,
            offset = self.offset,
            "消息已确认"
        );
    }
}

impl AckReceipt {
    /// 句柄是否已被兑现
    ///
    /// 句柄被丢弃或尚未兑现都返回 false。
    pub fn is_acknowledged(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acknowledge_is_observed_by_receipt() {
        let (ack, mut receipt) = Acknowledgment::pair("orders.v1", 2, 41);
        assert_eq!(ack.topic(), "orders.v1");
        assert_eq!(ack.partition(), 2);
        assert_eq!(ack.offset(), 41);

        ack.acknowledge();
        assert!(receipt.is_acknowledged());
    }

    #[test]
    fn test_dropped_handle_is_not_acknowledged() {
        let (ack, mut receipt) = Acknowledgment::pair("orders.v1", 0, 7);
        drop(ack);
        assert!(!receipt.is_acknowledged());
    }

    #[test]
    fn test_pending_handle_is_not_acknowledged() {
        let (_ack, mut receipt) = Acknowledgment::pair("orders.v1", 0, 7);
        assert!(!receipt.is_acknowledged());
    }

    #[test]
    fn test_acknowledge_after_receipt_dropped_does_not_panic() {
        let (ack, receipt) = Acknowledgment::pair("orders.v1", 1, 3);
        drop(receipt);
        ack.acknowledge();
    }
}
