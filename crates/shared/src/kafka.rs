//! Kafka 基础设施封装
//!
//! 将 rdkafka 的底层 API 封装为业务友好的 Producer/Consumer 抽象：
//! - `KafkaProducer`：带 header 的发送，返回落盘的 (partition, offset)
//! - `KafkaConsumer`：手动确认模式，每个分区一个 worker 保证分区内顺序，
//!   未确认的消息按退避策略重投递，耗尽后转入死信 topic。
//!   某个分区的 worker 积压时只暂停该分区的拉取，其他分区不受影响
//! - `ensure_topics`：启动时创建主 topic 与死信 topic

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::ack::Acknowledgment;
use crate::config::KafkaConfig;
use crate::dlq::DeadLetterPublisher;
use crate::error::StreamError;
use crate::redelivery::{DeliveryOutcome, deliver_with_redelivery, shutdown_requested};
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的 Kafka 消息的统一表示
///
/// 将 rdkafka 的 `BorrowedMessage`（带生命周期约束）转换为拥有所有权的结构体，
/// 使消息可以安全地跨 await 点传递给分区 worker。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
    /// 第几次投递（从 1 开始），重投递时递增
    pub delivery_attempt: u32,
}

impl ConsumerMessage {
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for idx in 0..h.count() {
                let header = h.get(idx);
                if let Some(raw) = header.value
                    && let Ok(value) = std::str::from_utf8(raw)
                {
                    headers.insert(header.key.to_string(), value.to_string());
                }
            }
        }

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload,
            timestamp: msg.timestamp().to_millis(),
            headers,
            delivery_attempt: 1,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// KafkaProducer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 生产者
///
/// `FutureProducer` 内部是 Arc 包装的，Clone 开销很小。
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaProducer {
    /// 根据配置创建生产者
    ///
    /// `message.timeout.ms` 与发送等待时间一致：超时后由调用方决定重试还是放弃，
    /// 而不是在 librdkafka 内部无限排队。
    pub fn new(config: &KafkaConfig) -> Result<Self, StreamError> {
        let timeout = config.producer_timeout();
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| StreamError::Kafka(format!("创建生产者失败: {e}")))?;

        info!(brokers = %config.brokers, "Kafka 生产者已初始化");
        Ok(Self { producer, timeout })
    }

    /// 发送带 header 的原始字节消息
    ///
    /// `partition` 为 None 时由 key 哈希决定分区，同一 key 始终落在同一分区。
    pub async fn send_with_headers(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
        headers: &HashMap<String, String>,
        partition: Option<i32>,
    ) -> Result<(i32, i64), StreamError> {
        let mut owned = OwnedHeaders::new_with_capacity(headers.len());
        for (name, value) in headers {
            owned = owned.insert(Header {
                key: name.as_str(),
                value: Some(value.as_str()),
            });
        }

        let mut record: FutureRecord<'_, str, [u8]> =
            FutureRecord::to(topic).payload(payload).headers(owned);
        if let Some(key) = key {
            record = record.key(key);
        }
        if let Some(partition) = partition {
            record = record.partition(partition);
        }

        let delivery = self
            .producer
            .send(record, self.timeout)
            .await
            .map_err(|(e, _)| send_error(topic, e))?;

        debug!(
            topic,
            key = ?key,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok((delivery.partition, delivery.offset))
    }

    /// 查询 topic 当前的分区数
    ///
    /// 元数据请求是阻塞调用，放到阻塞线程池执行。
    pub async fn partition_count(&self, topic: &str) -> Result<i32, StreamError> {
        let producer = self.producer.clone();
        let topic = topic.to_string();
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || {
            let metadata = producer.client().fetch_metadata(Some(topic.as_str()), timeout)?;
            metadata
                .topics()
                .iter()
                .find(|t| t.name() == topic)
                .map(|t| t.partitions().len() as i32)
                .filter(|&count| count > 0)
                .ok_or_else(|| StreamError::Kafka(format!("topic {topic} 没有可用分区")))
        })
        .await
        .map_err(|e| StreamError::Internal(format!("查询分区数任务失败: {e}")))?
    }
}

/// 投递超时单独归类，其余发送失败统一视为 Kafka 错误
fn send_error(topic: &str, err: KafkaError) -> StreamError {
    match err {
        KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut) => StreamError::Timeout {
            operation: format!("发送到 {topic}"),
        },
        other => StreamError::Kafka(format!("发送消息失败: {other}")),
    }
}

// ---------------------------------------------------------------------------
// Topic 管理
// ---------------------------------------------------------------------------

/// 创建主 topic 与对应的死信 topic
///
/// 两者分区数相同，死信消息可以保持原分区号。topic 已存在视为成功。
pub async fn ensure_topics(config: &KafkaConfig) -> Result<(), StreamError> {
    let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
        .set("bootstrap.servers", &config.brokers)
        .create()?;

    let dead_letter = config.dead_letter_topic();
    let topics = [
        NewTopic::new(
            &config.orders_topic,
            config.partitions,
            TopicReplication::Fixed(config.replication_factor),
        ),
        NewTopic::new(
            &dead_letter,
            config.partitions,
            TopicReplication::Fixed(config.replication_factor),
        ),
    ];

    let options = AdminOptions::new().operation_timeout(Some(Duration::from_secs(10)));
    let results = admin.create_topics(&topics, &options).await?;

    for result in results {
        match result {
            Ok(topic) => info!(topic = %topic, partitions = config.partitions, "topic 已创建"),
            Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                debug!(topic = %topic, "topic 已存在，跳过创建")
            }
            Err((topic, code)) => {
                return Err(StreamError::Kafka(format!("创建 topic {topic} 失败: {code}")));
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// KafkaConsumer
// ---------------------------------------------------------------------------

/// 手动确认模式的 Kafka 消费者
///
/// 关闭自动提交：只有处理函数兑现了 [`Acknowledgment`] 的消息才会提交 offset。
pub struct KafkaConsumer {
    consumer: StreamConsumer,
}

/// 消费循环的运行参数
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub redelivery: RetryPolicy,
    /// 每个分区 worker 的待处理队列长度，满了之后暂停该分区的拉取
    pub queue_capacity: usize,
}

/// 积压分区检查 worker 队列是否腾出空间的间隔
const BACKLOG_FLUSH_INTERVAL: Duration = Duration::from_millis(50);

impl KafkaConsumer {
    /// 创建消费者
    pub fn new(config: &KafkaConfig) -> Result<Self, StreamError> {
        let group_id = config.consumer_group.as_str();

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| StreamError::Kafka(format!("创建消费者失败: {e}")))?;

        info!(brokers = %config.brokers, group_id, "Kafka 消费者已初始化（手动确认）");
        Ok(Self { consumer })
    }

    /// 订阅指定的 topic 列表
    pub fn subscribe(&self, topics: &[&str]) -> Result<(), StreamError> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| StreamError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(?topics, "已订阅 Kafka topics");
        Ok(())
    }

    /// 启动手动确认消费循环
    ///
    /// 拉取端按 (topic, partition) 把消息分发到各自的 worker，
    /// 同一分区的消息严格按 offset 顺序处理，不同分区之间并行。
    /// 关闭信号到达后停止拉取，等待所有 worker 退出；未确认的消息不提交，
    /// 重启后由 broker 重新投递。
    pub async fn start<F, Fut, E>(
        self,
        mut shutdown: watch::Receiver<bool>,
        options: ConsumeOptions,
        dead_letter: DeadLetterPublisher,
        handler: F,
    ) where
        F: Fn(ConsumerMessage, Acknowledgment) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        use futures::StreamExt;

        let consumer = Arc::new(self.consumer);
        let handler = Arc::new(handler);
        let mut dispatcher = PartitionDispatcher::new(options.queue_capacity);
        let mut tasks = JoinSet::new();

        let mut flush_tick = tokio::time::interval(BACKLOG_FLUSH_INTERVAL);
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let stream = consumer.stream();
        futures::pin_mut!(stream);

        info!("Kafka 消费循环已启动");

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("收到关闭信号，Kafka 消费循环退出");
                        break;
                    }
                }

                _ = flush_tick.tick(), if dispatcher.has_backlog() => {
                    for (topic, partition) in dispatcher.flush() {
                        set_partition_paused(&consumer, &topic, partition, false);
                    }
                }

                msg_result = stream.next() => {
                    let Some(msg_result) = msg_result else {
                        warn!("Kafka 消息流意外结束");
                        break;
                    };

                    let msg = match msg_result {
                        Ok(borrowed) => ConsumerMessage::from_borrowed(&borrowed),
                        Err(e) => {
                            error!(error = %e, "接收 Kafka 消息出错");
                            continue;
                        }
                    };

                    let topic = msg.topic.clone();
                    let partition = msg.partition;
                    let dispatched = dispatcher.dispatch(msg, |rx| {
                        tasks.spawn(partition_worker(
                            consumer.clone(),
                            rx,
                            shutdown.clone(),
                            options.redelivery.clone(),
                            dead_letter.clone(),
                            handler.clone(),
                        ));
                        info!(topic = %topic, partition, "分区 worker 已启动");
                    });

                    match dispatched {
                        Dispatch::Queued | Dispatch::Backlogged => {}
                        Dispatch::Pause => set_partition_paused(&consumer, &topic, partition, true),
                        Dispatch::WorkerGone => {
                            warn!(topic = %topic, partition, "分区 worker 已退出，消息留待重新投递");
                        }
                    }
                }
            }
        }

        // 关闭所有分区队列，worker 处理完手头消息后退出；积压中的消息不提交
        drop(dispatcher);
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "分区 worker 异常退出");
            }
        }

        info!("Kafka 消费循环已停止");
    }
}

// ---------------------------------------------------------------------------
// 分区分发
// ---------------------------------------------------------------------------

type PartitionKey = (String, i32);

/// 一条消息的分发结果
#[derive(Debug, PartialEq, Eq)]
enum Dispatch {
    /// 已进入 worker 队列
    Queued,
    /// worker 队列刚刚占满，消息进入积压，调用方应暂停该分区
    Pause,
    /// 分区已在积压中，消息排在积压末尾
    Backlogged,
    /// worker 已退出，消息留待重新投递
    WorkerGone,
}

struct PartitionSlot {
    tx: mpsc::Sender<ConsumerMessage>,
    backlog: VecDeque<ConsumerMessage>,
}

/// 按 (topic, partition) 把消息交给各自的 worker
///
/// 分发从不等待单个 worker：队列已满的分区把消息留在本地积压里并暂停拉取，
/// 其他分区照常分发。积压清空后分区恢复拉取。
struct PartitionDispatcher {
    slots: HashMap<PartitionKey, PartitionSlot>,
    queue_capacity: usize,
}

impl PartitionDispatcher {
    fn new(queue_capacity: usize) -> Self {
        Self {
            slots: HashMap::new(),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// 分发一条消息，分区第一次出现时通过 `spawn_worker` 启动它的 worker
    fn dispatch(
        &mut self,
        msg: ConsumerMessage,
        spawn_worker: impl FnOnce(mpsc::Receiver<ConsumerMessage>),
    ) -> Dispatch {
        let key = (msg.topic.clone(), msg.partition);
        let capacity = self.queue_capacity;
        let slot = self.slots.entry(key.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(capacity);
            spawn_worker(rx);
            PartitionSlot {
                tx,
                backlog: VecDeque::new(),
            }
        });

        // 积压未清空时新消息只能排在后面，否则会越过更早的 offset
        if !slot.backlog.is_empty() {
            slot.backlog.push_back(msg);
            return Dispatch::Backlogged;
        }

        match slot.tx.try_send(msg) {
            Ok(()) => Dispatch::Queued,
            Err(TrySendError::Full(msg)) => {
                slot.backlog.push_back(msg);
                Dispatch::Pause
            }
            Err(TrySendError::Closed(_)) => {
                self.slots.remove(&key);
                Dispatch::WorkerGone
            }
        }
    }

    fn has_backlog(&self) -> bool {
        self.slots.values().any(|slot| !slot.backlog.is_empty())
    }

    /// 把积压补进已腾出空间的 worker 队列，返回积压已清空、可以恢复拉取的分区
    fn flush(&mut self) -> Vec<PartitionKey> {
        let mut drained = Vec::new();
        let mut gone = Vec::new();

        for (key, slot) in self.slots.iter_mut() {
            if slot.backlog.is_empty() {
                continue;
            }

            let mut closed = false;
            while let Some(msg) = slot.backlog.pop_front() {
                match slot.tx.try_send(msg) {
                    Ok(()) => {}
                    Err(TrySendError::Full(msg)) => {
                        slot.backlog.push_front(msg);
                        break;
                    }
                    Err(TrySendError::Closed(_)) => {
                        closed = true;
                        break;
                    }
                }
            }

            if closed {
                gone.push(key.clone());
            } else if slot.backlog.is_empty() {
                drained.push(key.clone());
            }
        }

        for key in gone {
            warn!(topic = %key.0, partition = key.1, "分区 worker 已退出，积压消息留待重新投递");
            self.slots.remove(&key);
        }
        drained
    }
}

/// 暂停或恢复单个分区的拉取
fn set_partition_paused(consumer: &StreamConsumer, topic: &str, partition: i32, paused: bool) {
    let mut tpl = TopicPartitionList::new();
    tpl.add_partition(topic, partition);

    let result = if paused {
        consumer.pause(&tpl)
    } else {
        consumer.resume(&tpl)
    };

    match result {
        Ok(()) if paused => info!(topic, partition, "分区 worker 积压，暂停拉取"),
        Ok(()) => info!(topic, partition, "分区积压已清空，恢复拉取"),
        Err(e) => warn!(topic, partition, paused, error = %e, "切换分区拉取状态失败"),
    }
}

/// 单个分区的顺序处理 worker
///
/// 一条消息的最终结局只有三种：确认后提交、耗尽重试后转入死信再提交、
/// 因关闭而放弃。放弃后 worker 立即退出，不能继续处理后续消息，
/// 否则提交后面的 offset 会把前面未确认的消息一并提交掉。
async fn partition_worker<F, Fut, E>(
    consumer: Arc<StreamConsumer>,
    mut rx: mpsc::Receiver<ConsumerMessage>,
    mut shutdown: watch::Receiver<bool>,
    policy: RetryPolicy,
    dead_letter: DeadLetterPublisher,
    handler: Arc<F>,
) where
    F: Fn(ConsumerMessage, Acknowledgment) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), E>> + Send,
    E: std::fmt::Display + Send,
{
    while let Some(msg) = rx.recv().await {
        match deliver_with_redelivery(&msg, &policy, &mut shutdown, handler.as_ref()).await {
            DeliveryOutcome::Acknowledged { .. } => commit_offset(&consumer, &msg),
            DeliveryOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                let published = publish_dead_letter(
                    &dead_letter,
                    &msg,
                    attempts,
                    &last_error,
                    &policy,
                    &mut shutdown,
                )
                .await;
                if !published {
                    break;
                }
                commit_offset(&consumer, &msg);
            }
            DeliveryOutcome::Cancelled { attempts } => {
                info!(
                    topic = %msg.topic,
                    partition = msg.partition,
                    offset = msg.offset,
                    attempts,
                    "关闭中，未确认消息留待重新投递"
                );
                break;
            }
        }
    }
}

/// 死信发布失败时持续重试，直到成功或收到关闭信号
///
/// 返回 false 表示因关闭而放弃，调用方不得提交该 offset。
async fn publish_dead_letter(
    dead_letter: &DeadLetterPublisher,
    msg: &ConsumerMessage,
    attempts: u32,
    last_error: &str,
    policy: &RetryPolicy,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    loop {
        match dead_letter.publish(msg, attempts, last_error).await {
            Ok(_) => return true,
            Err(e) => {
                error!(
                    topic = %msg.topic,
                    partition = msg.partition,
                    offset = msg.offset,
                    code = e.code(),
                    error = %e,
                    "发送到死信 topic 失败，稍后重试"
                );
                tokio::select! {
                    biased;
                    _ = shutdown_requested(shutdown) => return false,
                    _ = tokio::time::sleep(policy.max_delay) => {}
                }
            }
        }
    }
}

/// 提交下一条待消费的 offset
///
/// 提交失败只影响"是否会被重复投递"，不影响正确性，记录告警即可。
fn commit_offset(consumer: &StreamConsumer, msg: &ConsumerMessage) {
    let mut tpl = TopicPartitionList::new();
    let committed = tpl
        .add_partition_offset(&msg.topic, msg.partition, Offset::Offset(msg.offset + 1))
        .and_then(|_| consumer.commit(&tpl, CommitMode::Async));

    match committed {
        Ok(()) => debug!(
            topic = %msg.topic,
            partition = msg.partition,
            offset = msg.offset,
            "offset 已提交"
        ),
        Err(e) => warn!(
            topic = %msg.topic,
            partition = msg.partition,
            offset = msg.offset,
            error = %e,
            "提交 offset 失败，消息可能被重复投递"
        ),
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------
