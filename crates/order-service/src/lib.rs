//! 订单流服务
//!
//! 摄取 → 校验 → 发布 → 消费 → 确认或不确认 → 广播。
//!
//! ## 模块结构
//!
//! - `validation`: 请求字段校验，只报告第一条违规
//! - `codec`: 事件消息构造与版本化线上格式
//! - `ingest`: 摄取管道（带处理时限）及 HTTP 入口队列
//! - `consumer`: 消费管道，业务成功才确认
//! - `broadcast`: 已处理事件的进程内广播
//! - `counters`: 成功/失败计数
//! - `publisher`: 传输抽象与命令式发布
//! - `policy`: 可替换的消费端业务规则
//! - `handlers` / `routes` / `state`: HTTP 边界

pub mod broadcast;
pub mod codec;
pub mod consumer;
pub mod counters;
pub mod demo;
pub mod dto;
pub mod error;
pub mod handlers;
pub mod ingest;
pub mod models;
pub mod policy;
pub mod publisher;
pub mod routes;
pub mod state;
pub mod validation;

pub use error::{OrderError, Result};
pub use models::{ErrorInfo, OrderEvent, OrderRequest, OrderStatus};
