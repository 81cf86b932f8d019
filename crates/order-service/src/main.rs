//! 订单流服务
//!
//! HTTP 摄取订单请求并发布到 Kafka，同时消费订单 topic，
//! 业务成功的事件广播给在线订阅者。

use std::sync::Arc;
use std::time::Duration;

use order_service::{
    broadcast::BroadcastSink,
    consumer::{ConsumePipeline, OrderConsumer},
    counters::OrderCounters,
    ingest::{IngestPipeline, IngestService},
    policy::RejectValidationFailed,
    publisher::{EventTransport, ImperativePublisher, KafkaTransport},
    routes,
    state::AppState,
};
use order_shared::{
    config::AppConfig,
    dlq::DeadLetterPublisher,
    error::StreamError,
    kafka::{KafkaProducer, ensure_topics},
    observability,
    retry::{RetryPolicy, retry_with_policy},
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// 关闭时等待后台任务收尾的上限
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load("order-service")?;

    let obs_config = config
        .observability
        .clone()
        .with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config).await?;

    info!(
        environment = %config.environment,
        brokers = %config.kafka.brokers,
        topic = %config.kafka.orders_topic,
        "Starting order-service on {}",
        config.server_addr()
    );

    // broker 可能比服务晚就绪，建 topic 时按退避重试
    let startup_policy = RetryPolicy {
        max_retries: 5,
        ..RetryPolicy::default()
    };
    retry_with_policy(
        &startup_policy,
        "ensure_topics",
        StreamError::is_retryable,
        || ensure_topics(&config.kafka),
    )
    .await?;

    let producer = KafkaProducer::new(&config.kafka)?;
    let transport: Arc<dyn EventTransport> = Arc::new(KafkaTransport::new(
        producer.clone(),
        config.kafka.orders_topic.clone(),
    ));

    // 死信 topic 可能事先以更少的分区创建，按实际分区数决定能否沿用原分区号
    let dead_letter_topic = config.kafka.dead_letter_topic();
    let dead_letter_partitions = producer.partition_count(&dead_letter_topic).await?;
    if dead_letter_partitions < config.kafka.partitions {
        warn!(
            topic = %dead_letter_topic,
            partitions = dead_letter_partitions,
            expected = config.kafka.partitions,
            "死信 topic 分区数少于主 topic，超出范围的分区改按 key 分区"
        );
    }
    let dead_letter = DeadLetterPublisher::new(producer, dead_letter_partitions);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // 消费端
    let sink = BroadcastSink::new(config.pipeline.broadcast_capacity);
    let counters = Arc::new(OrderCounters::new());
    let consume_pipeline = Arc::new(ConsumePipeline::new(
        Arc::new(RejectValidationFailed),
        sink.clone(),
        counters.clone(),
    ));
    let consumer = OrderConsumer::new(&config, dead_letter, consume_pipeline)?;
    let consumer_handle = tokio::spawn(consumer.run(shutdown_rx.clone()));

    // 摄取端
    let (ingest, ingest_handle) = IngestService::spawn(
        IngestPipeline::new(config.pipeline.ingest_timeout()),
        transport.clone(),
        config.pipeline.worker_queue_capacity,
        config.pipeline.max_in_flight_sends,
    );

    let state = AppState {
        ingest,
        publisher: ImperativePublisher::new(transport),
        sink,
        counters,
        shutdown: shutdown_rx,
    };

    let app = routes::app(state);

    let listener = TcpListener::bind(config.server_addr()).await?;
    info!("Listening on {}", config.server_addr());

    // SIGTERM / Ctrl+C：先通知长连接与消费者，再等待 HTTP 请求处理完毕
    let signal_tx = shutdown_tx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = signal_tx.send(true);
        })
        .await?;

    let _ = shutdown_tx.send(true);

    // 路由状态已释放，摄取队列关闭后后台任务处理完积压即退出
    match tokio::time::timeout(DRAIN_TIMEOUT, ingest_handle).await {
        Ok(Ok(())) => info!("Ingest pipeline drained"),
        Ok(Err(e)) => error!(error = %e, "Ingest pipeline task failed"),
        Err(_) => warn!("Ingest pipeline did not drain in time"),
    }

    match tokio::time::timeout(DRAIN_TIMEOUT, consumer_handle).await {
        Ok(Ok(Ok(()))) => info!("Consumer stopped"),
        Ok(Ok(Err(e))) => error!(error = %e, "Consumer exited with error"),
        Ok(Err(e)) => error!(error = %e, "Consumer task failed"),
        Err(_) => warn!("Consumer did not stop in time"),
    }

    info!("Server shutdown complete");

    Ok(())
}

/// 监听关闭信号
///
/// K8s 通过 SIGTERM 通知 Pod 停止；本地开发通过 Ctrl+C。
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("注册 Ctrl+C 处理器失败");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("注册 SIGTERM 处理器失败")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}
