//! 共享库
//!
//! 订单流服务共用的配置、错误处理、Kafka 收发、确认与重投递、死信以及可观测性基础设施。

pub mod ack;
pub mod config;
pub mod dlq;
pub mod error;
pub mod kafka;
pub mod observability;
pub mod redelivery;
pub mod retry;
