//! 已处理事件的进程内广播
//!
//! 基于 `tokio::sync::broadcast`：发布永不阻塞，每个订阅者有独立的有界缓冲，
//! 落后太多的订阅者丢失最旧的事件。
//!
//! 没有任何订阅者时，事件暂存在同样有界的预热缓冲中（满了丢最旧的），
//! 第一个订阅者接入时一次性取走。状态只在内存中，重启即丢失。

use std::collections::VecDeque;
use std::sync::Arc;

use futures::Stream;
use order_shared::observability::metrics;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::models::OrderEvent;

#[derive(Clone)]
pub struct BroadcastSink {
    inner: Arc<Inner>,
}

struct Inner {
    tx: broadcast::Sender<OrderEvent>,
    /// 无订阅者期间的暂存事件；发布与订阅都在此锁内完成
    pending: Mutex<VecDeque<OrderEvent>>,
    capacity: usize,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(Inner {
                tx,
                pending: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
            }),
        }
    }

    /// 发布事件，返回是否直接送达了在线订阅者
    pub fn publish(&self, event: OrderEvent) -> bool {
        let mut pending = self.inner.pending.lock();

        if self.inner.tx.receiver_count() > 0 {
            match self.inner.tx.send(event) {
                Ok(receivers) => {
                    debug!(receivers, "事件已广播");
                    return true;
                }
                // 检查之后最后一个订阅者恰好退出，转入暂存
                Err(broadcast::error::SendError(event)) => {
                    self.buffer(&mut pending, event);
                    return false;
                }
            }
        }

        self.buffer(&mut pending, event);
        false
    }

    fn buffer(&self, pending: &mut VecDeque<OrderEvent>, event: OrderEvent) {
        if pending.len() >= self.inner.capacity {
            pending.pop_front();
            metrics::record_broadcast_dropped(1);
        }
        pending.push_back(event);
    }

    /// 新增订阅者
    ///
    /// 订阅者随时可以接入或退出，不影响发布方。
    pub fn subscribe(&self) -> Subscription {
        let mut pending = self.inner.pending.lock();
        let rx = self.inner.tx.subscribe();
        let backlog = std::mem::take(&mut *pending);
        Subscription { backlog, rx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }

    /// 当前暂存的事件数
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

/// 单个订阅者
pub struct Subscription {
    backlog: VecDeque<OrderEvent>,
    rx: broadcast::Receiver<OrderEvent>,
}

impl Subscription {
    /// 接收下一个事件，广播端关闭后返回 None
    pub async fn recv(&mut self) -> Option<OrderEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }

        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    metrics::record_broadcast_dropped(skipped);
                    warn!(skipped, "广播订阅者处理过慢，丢弃最旧的事件");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = OrderEvent> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn event(id: &str) -> OrderEvent {
        OrderEvent::received(id, "C1")
    }

    #[tokio::test]
    async fn test_live_subscribers_all_receive() {
        let sink = BroadcastSink::new(8);
        let mut a = sink.subscribe();
        let mut b = sink.subscribe();

        assert!(sink.publish(event("O1")));

        assert_eq!(a.recv().await.unwrap().order_id, "O1");
        assert_eq!(b.recv().await.unwrap().order_id, "O1");
    }

    #[tokio::test]
    async fn test_first_subscriber_drains_warmup_buffer() {
        let sink = BroadcastSink::new(8);
        assert!(!sink.publish(event("O1")));
        assert!(!sink.publish(event("O2")));
        assert_eq!(sink.pending_len(), 2);

        let mut sub = sink.subscribe();
        sink.publish(event("O3"));

        assert_eq!(sub.recv().await.unwrap().order_id, "O1");
        assert_eq!(sub.recv().await.unwrap().order_id, "O2");
        assert_eq!(sub.recv().await.unwrap().order_id, "O3");
        assert_eq!(sink.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_warmup_buffer_drops_oldest() {
        let sink = BroadcastSink::new(2);
        for id in ["O1", "O2", "O3"] {
            sink.publish(event(id));
        }

        let mut sub = sink.subscribe();
        assert_eq!(sub.recv().await.unwrap().order_id, "O2");
        assert_eq!(sub.recv().await.unwrap().order_id, "O3");
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_oldest() {
        let sink = BroadcastSink::new(2);
        let mut sub = sink.subscribe();

        for id in ["O1", "O2", "O3", "O4"] {
            assert!(sink.publish(event(id)));
        }

        // 容量为 2，O1/O2 被覆盖
        assert_eq!(sub.recv().await.unwrap().order_id, "O3");
        assert_eq!(sub.recv().await.unwrap().order_id, "O4");
    }

    #[tokio::test]
    async fn test_detached_subscriber_does_not_block_publisher() {
        let sink = BroadcastSink::new(4);
        let sub = sink.subscribe();
        drop(sub);

        assert_eq!(sink.subscriber_count(), 0);
        assert!(!sink.publish(event("O1")));
        assert_eq!(sink.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_stream_ends_when_sink_dropped() {
        let sink = BroadcastSink::new(4);
        let sub = sink.subscribe();
        sink.publish(event("O1"));
        drop(sink);

        let ids: Vec<_> = sub.into_stream().map(|e| e.order_id).collect().await;
        assert_eq!(ids, vec!["O1"]);
    }
}
