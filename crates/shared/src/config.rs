//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::observability::ObservabilityConfig;
use crate::retry::RetryPolicy;

/// Kafka 配置
///
/// 除连接参数外，还包含 topic 规划和重投递策略。重投递属于 broker 侧契约，
/// 业务管道只负责"确认或不确认"，具体重试几次、间隔多久都在这里配置。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub brokers: String,
    pub consumer_group: String,
    pub auto_offset_reset: String,
    /// 主 topic 名称，死信 topic 为 `{orders_topic}.DLT`
    pub orders_topic: String,
    pub partitions: i32,
    pub replication_factor: i32,
    /// 单条消息最多投递次数（含首次），耗尽后进入死信 topic
    pub max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_max_ms: u64,
    pub producer_timeout_ms: u64,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            consumer_group: "order-service".to_string(),
            auto_offset_reset: "earliest".to_string(),
            orders_topic: "orders.v1".to_string(),
            partitions: 3,
            replication_factor: 1,
            max_attempts: 3,
            backoff_initial_ms: 1000,
            backoff_multiplier: 2.0,
            backoff_max_ms: 10_000,
            producer_timeout_ms: 5000,
        }
    }
}

impl KafkaConfig {
    /// 死信 topic 名称
    pub fn dead_letter_topic(&self) -> String {
        crate::dlq::dead_letter_topic(&self.orders_topic)
    }

    /// 将投递次数配置换算为重试策略
    ///
    /// `max_attempts` 包含首次投递，因此重试次数为 `max_attempts - 1`。
    pub fn redelivery_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_attempts.saturating_sub(1),
            initial_delay: Duration::from_millis(self.backoff_initial_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
            multiplier: self.backoff_multiplier,
        }
    }

    pub fn producer_timeout(&self) -> Duration {
        Duration::from_millis(self.producer_timeout_ms)
    }
}

/// 服务配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// 管道配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 请求到达至事件构造完成的最长时间
    pub ingest_timeout_secs: u64,
    /// 广播通道容量，慢订阅者落后超过该值会丢失最旧的事件
    pub broadcast_capacity: usize,
    /// 每个分区 worker 的待处理队列长度，也是摄取队列的长度
    pub worker_queue_capacity: usize,
    /// 摄取端同时等待 broker 回执的消息数上限
    pub max_in_flight_sends: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ingest_timeout_secs: 15,
            broadcast_capacity: 256,
            worker_queue_capacity: 64,
            max_in_flight_sends: 256,
        }
    }
}

impl PipelineConfig {
    pub fn ingest_timeout(&self) -> Duration {
        Duration::from_secs(self.ingest_timeout_secs)
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub server: ServerConfig,
    pub kafka: KafkaConfig,
    pub pipeline: PipelineConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. config/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（ORDER_ 前缀，双下划线分隔层级，如 ORDER_KAFKA__BROKERS -> kafka.brokers）
    /// 5. 服务特定端口环境变量（如 ORDER_SERVICE_PORT）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        // .env 只在本地开发时存在，缺失不算错误
        let _ = dotenvy::dotenv();

        let env = std::env::var("ORDER_ENV").unwrap_or_else(|_| "development".to_string());

        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", service_name)))
                    .required(false),
            )
            .add_source(
                Environment::with_prefix("ORDER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut config: Self = builder.build()?.try_deserialize()?;

        if let Some(port) = Self::get_service_port_from_env(service_name) {
            config.server.port = port;
        }

        Ok(config)
    }

    /// 从环境变量获取服务特定端口
    ///
    /// 将 "order-service" 转换为 "ORDER_SERVICE_PORT"
    fn get_service_port_from_env(service_name: &str) -> Option<u16> {
        let env_var_name = Self::service_port_env_var(service_name);
        std::env::var(&env_var_name)
            .ok()
            .and_then(|v| v.parse().ok())
    }

    fn service_port_env_var(service_name: &str) -> String {
        format!("{}_PORT", service_name.to_uppercase().replace('-', "_"))
    }

    /// 获取服务地址
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
