//! 端到端管道测试
//!
//! 用内存 broker 替代 Kafka：摄取端写入按 key 分区的日志，
//! 消费端按分区顺序读取，并复用共享库的重投递逻辑。

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use order_service::broadcast::BroadcastSink;
use order_service::codec::{EventCodec, OutboundMessage};
use order_service::consumer::ConsumePipeline;
use order_service::counters::OrderCounters;
use order_service::ingest::{IngestPipeline, IngestService};
use order_service::policy::RejectValidationFailed;
use order_service::publisher::{EventTransport, ImperativePublisher, wire_headers};
use order_service::{OrderError, OrderEvent, OrderStatus};
use order_shared::kafka::ConsumerMessage;
use order_shared::redelivery::{DeliveryOutcome, deliver_with_redelivery};
use order_shared::retry::RetryPolicy;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;

const TOPIC: &str = "orders.v1";
const PARTITIONS: usize = 3;

// ---------------------------------------------------------------------------
// 内存 broker
// ---------------------------------------------------------------------------

#[derive(Default)]
struct InMemoryBroker {
    partitions: Mutex<Vec<Vec<ConsumerMessage>>>,
    reject_sends: Mutex<bool>,
    /// 每次发送等待回执的时长
    ack_latency: Mutex<Duration>,
}

impl InMemoryBroker {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            partitions: Mutex::new(vec![Vec::new(); PARTITIONS]),
            reject_sends: Mutex::new(false),
            ack_latency: Mutex::new(Duration::ZERO),
        })
    }

    fn partition_for(key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % PARTITIONS as u64) as usize
    }

    fn log(&self, partition: usize) -> Vec<ConsumerMessage> {
        self.partitions.lock()[partition].clone()
    }

    fn all(&self) -> Vec<ConsumerMessage> {
        self.partitions.lock().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl EventTransport for InMemoryBroker {
    async fn send(&self, message: &OutboundMessage) -> order_service::Result<()> {
        if *self.reject_sends.lock() {
            return Err(OrderError::Transport("broker unavailable".to_string()));
        }

        let latency = *self.ack_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let payload = EventCodec::encode(&message.event)?;
        let partition = Self::partition_for(&message.key);
        let mut partitions = self.partitions.lock();
        let log = &mut partitions[partition];
        log.push(ConsumerMessage {
            topic: TOPIC.to_string(),
            partition: partition as i32,
            offset: log.len() as i64,
            key: Some(message.key.clone()),
            payload,
            timestamp: None,
            headers: wire_headers(message),
            delivery_attempt: 1,
        });
        Ok(())
    }
}

fn consume_pipeline() -> (Arc<ConsumePipeline>, BroadcastSink) {
    let sink = BroadcastSink::new(64);
    let pipeline = Arc::new(ConsumePipeline::new(
        Arc::new(RejectValidationFailed),
        sink.clone(),
        Arc::new(OrderCounters::new()),
    ));
    (pipeline, sink)
}

fn redelivery(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries: max_attempts - 1,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        multiplier: 2.0,
    }
}

async fn deliver(
    pipeline: &Arc<ConsumePipeline>,
    msg: &ConsumerMessage,
    policy: &RetryPolicy,
) -> DeliveryOutcome {
    let (_tx, mut shutdown) = watch::channel(false);
    let handler = |m, ack| {
        let pipeline = pipeline.clone();
        async move { pipeline.handle_message(m, ack).await }
    };
    deliver_with_redelivery(msg, policy, &mut shutdown, &handler).await
}

async fn ingest_all(broker: &Arc<InMemoryBroker>, bodies: Vec<serde_json::Value>) {
    let (service, handle) = IngestService::spawn(
        IngestPipeline::new(Duration::from_secs(15)),
        broker.clone(),
        16,
        16,
    );
    for body in bodies {
        service.submit(body).await.unwrap();
    }
    drop(service);
    handle.await.unwrap();
}

// ---------------------------------------------------------------------------
// 场景
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn valid_order_flows_to_subscribers_and_is_acknowledged() {
    let broker = InMemoryBroker::new();
    ingest_all(
        &broker,
        vec![json!({"orderId":"O1","customerId":"C1","customerName":"Alice","amount":10.0})],
    )
    .await;

    let records = broker.log(InMemoryBroker::partition_for("C1"));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key.as_deref(), Some("C1"));

    let (pipeline, sink) = consume_pipeline();
    let mut sub = sink.subscribe();

    let outcome = deliver(&pipeline, &records[0], &redelivery(3)).await;
    assert_eq!(outcome, DeliveryOutcome::Acknowledged { attempts: 1 });

    let event = sub.recv().await.unwrap();
    assert_eq!(event.order_id, "O1");
    assert_eq!(event.status, OrderStatus::Received);
    assert_eq!(pipeline.counters().processed(), 1);
    assert_eq!(pipeline.counters().failed(), 0);
}

#[tokio::test(start_paused = true)]
async fn invalid_order_is_never_acknowledged_and_exhausts_redelivery() {
    let broker = InMemoryBroker::new();
    ingest_all(
        &broker,
        vec![json!({"orderId":"O2","customerId":"","customerName":"Bob","amount":5.0})],
    )
    .await;

    let records = broker.all();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].header("validation"), Some("true"));

    let event = EventCodec::decode(&records[0].payload).unwrap();
    assert_eq!(event.status, OrderStatus::ValidationFailed);
    let error = event.error.unwrap();
    assert_eq!(error.code, "VALIDATION_ERROR");
    assert_eq!(error.message, "customerId: must not be blank");

    let (pipeline, sink) = consume_pipeline();
    let outcome = deliver(&pipeline, &records[0], &redelivery(3)).await;

    match outcome {
        DeliveryOutcome::Exhausted {
            attempts,
            last_error,
        } => {
            assert_eq!(attempts, 3);
            assert_eq!(last_error, "Downstream refused invalid order");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    // 每次投递都计一次失败，从未广播或计为成功
    assert_eq!(pipeline.counters().failed(), 3);
    assert_eq!(pipeline.counters().processed(), 0);
    assert_eq!(sink.pending_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn same_key_orders_are_consumed_in_publish_order() {
    let broker = InMemoryBroker::new();
    let batch: Vec<_> = (1..=5)
        .map(|i| json!({"orderId": format!("O{i}"), "customerId": "C42", "customerName": "n", "amount": i as f64}))
        .collect();
    ingest_all(&broker, vec![json!(batch)]).await;

    let (pipeline, sink) = consume_pipeline();
    let sub = sink.subscribe();

    for msg in broker.log(InMemoryBroker::partition_for("C42")) {
        let outcome = deliver(&pipeline, &msg, &redelivery(1)).await;
        assert_eq!(outcome, DeliveryOutcome::Acknowledged { attempts: 1 });
    }
    drop(sink);
    drop(pipeline);

    let seen: Vec<String> = sub.into_stream().map(|e| e.order_id).collect().await;
    assert_eq!(seen, vec!["O1", "O2", "O3", "O4", "O5"]);
}

#[tokio::test(start_paused = true)]
async fn redelivered_message_is_broadcast_once_per_acknowledged_delivery() {
    let (pipeline, sink) = consume_pipeline();
    let sub_sink = sink.clone();
    let mut sub = sub_sink.subscribe();

    let msg = ConsumerMessage {
        topic: TOPIC.to_string(),
        partition: 0,
        offset: 7,
        key: Some("C1".to_string()),
        payload: EventCodec::encode(&OrderEvent::received("O1", "C1")).unwrap(),
        timestamp: None,
        headers: HashMap::new(),
        delivery_attempt: 1,
    };

    // broker 在确认提交前崩溃，重启后再次投递同一条消息
    for _ in 0..2 {
        let outcome = deliver(&pipeline, &msg, &redelivery(3)).await;
        assert_eq!(outcome, DeliveryOutcome::Acknowledged { attempts: 1 });
    }

    assert_eq!(sub.recv().await.unwrap().order_id, "O1");
    assert_eq!(sub.recv().await.unwrap().order_id, "O1");
    assert_eq!(pipeline.counters().processed(), 2);
    assert_eq!(pipeline.counters().failed(), 0);
}

#[tokio::test(start_paused = true)]
async fn malformed_items_do_not_stop_the_batch() {
    let broker = InMemoryBroker::new();
    ingest_all(
        &broker,
        vec![json!([
            {"orderId":"A1","customerId":"C7","customerName":"a","amount":1.0},
            "not an order",
            {"orderId":"A2","customerId":"C7","customerName":"b","amount":"NaN"},
            {"orderId":"A3","customerId":"C7","customerName":"c","amount":3.0}
        ])],
    )
    .await;

    let events: Vec<OrderEvent> = broker
        .all()
        .iter()
        .map(|m| EventCodec::decode(&m.payload).unwrap())
        .collect();
    assert_eq!(events.len(), 4);

    let c7: Vec<_> = broker
        .log(InMemoryBroker::partition_for("C7"))
        .iter()
        .filter(|m| m.key.as_deref() == Some("C7"))
        .map(|m| EventCodec::decode(&m.payload).unwrap())
        .collect();
    let ids: Vec<_> = c7.iter().map(|e| e.order_id.as_str()).collect();
    assert_eq!(ids, vec!["A1", "A2", "A3"]);
    assert_eq!(c7[1].error.as_ref().unwrap().code, "INVALID_PAYLOAD");
}

#[tokio::test(start_paused = true)]
async fn request_queued_behind_slow_broker_times_out_without_publishing() {
    let broker = InMemoryBroker::new();
    *broker.ack_latency.lock() = Duration::from_secs(16);

    // 一次只允许一条在途发送：第二条在队列中等待第一条的回执
    let (service, handle) = IngestService::spawn(
        IngestPipeline::new(Duration::from_secs(15)),
        broker.clone(),
        4,
        1,
    );
    let started = tokio::time::Instant::now();
    service
        .submit(json!([
            {"orderId":"first","customerId":"C1","customerName":"x","amount":1.0},
            {"orderId":"late","customerId":"C1","customerName":"y","amount":2.0}
        ]))
        .await
        .unwrap();
    assert_eq!(started.elapsed(), Duration::ZERO);

    drop(service);
    handle.await.unwrap();
    assert_eq!(started.elapsed(), Duration::from_secs(16));

    let published: Vec<String> = broker
        .all()
        .iter()
        .map(|m| EventCodec::decode(&m.payload).unwrap().order_id)
        .collect();
    assert_eq!(published, vec!["first"]);
}

#[tokio::test]
async fn imperative_publish_reports_transport_outcome() {
    let broker = InMemoryBroker::new();
    let publisher = ImperativePublisher::new(broker.clone());

    assert!(publisher.publish(OrderEvent::received("P1", "C1")).await);
    let records = broker.all();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].header("source"), Some("imperative"));

    *broker.reject_sends.lock() = true;
    assert!(!publisher.publish(OrderEvent::received("P2", "C1")).await);
    assert_eq!(broker.all().len(), 1);
}
