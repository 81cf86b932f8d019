//! 事件编解码
//!
//! 负责两件事：
//! - 把事件包装成待发送的 `OutboundMessage`（路由 key = customerId，附带标记 header）
//! - 线上 JSON 格式的版本化编码与解码

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::OrderError;
use crate::models::{ErrorInfo, OrderEvent};

/// 当前线上格式版本
pub const SCHEMA_VERSION: u32 = 1;

/// 标记 header 名称
pub mod headers {
    /// 校验失败的事件带 `validation=true`
    pub const VALIDATION: &str = "validation";
    /// 命令式发布的事件带 `source=imperative`
    pub const SOURCE: &str = "source";

    pub const SOURCE_IMPERATIVE: &str = "imperative";
}

/// 待发送的事件消息，构造后不再修改
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub event: OrderEvent,
    /// 分区路由 key，同一客户的事件落在同一分区
    pub key: String,
    pub headers: HashMap<String, String>,
}

impl OutboundMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireEventRef<'a> {
    schema_version: u32,
    #[serde(flatten)]
    event: &'a OrderEvent,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent {
    schema_version: u32,
    #[serde(flatten)]
    event: OrderEvent,
}

pub struct EventCodec;

impl EventCodec {
    /// 以 customerId 为路由 key 构造消息
    pub fn build(event: OrderEvent, extra_headers: &[(&str, &str)]) -> OutboundMessage {
        let headers = extra_headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        OutboundMessage {
            key: event.customer_id.clone(),
            event,
            headers,
        }
    }

    /// 校验通过：RECEIVED，除路由 key 外不带 header
    pub fn received(order_id: &str, customer_id: &str) -> OutboundMessage {
        Self::build(OrderEvent::received(order_id, customer_id), &[])
    }

    /// 校验失败：VALIDATION_FAILED + ErrorInfo，带 `validation=true`
    pub fn validation_failed(order_id: &str, customer_id: &str, error: ErrorInfo) -> OutboundMessage {
        Self::build(
            OrderEvent::validation_failed(order_id, customer_id, error),
            &[(headers::VALIDATION, "true")],
        )
    }

    /// 命令式发布：原样转发事件，带 `source=imperative`
    pub fn imperative(event: OrderEvent) -> OutboundMessage {
        Self::build(event, &[(headers::SOURCE, headers::SOURCE_IMPERATIVE)])
    }

    pub fn encode(event: &OrderEvent) -> Result<Vec<u8>, OrderError> {
        let wire = WireEventRef {
            schema_version: SCHEMA_VERSION,
            event,
        };
        serde_json::to_vec(&wire).map_err(|e| OrderError::Shared(e.into()))
    }

    /// 解码线上事件
    ///
    /// 拒绝未知版本、封闭枚举之外的状态，以及违反 ErrorInfo 不变式的事件。
    pub fn decode(payload: &[u8]) -> Result<OrderEvent, OrderError> {
        let wire: WireEvent = serde_json::from_slice(payload)
            .map_err(|e| OrderError::InvalidPayload(e.to_string()))?;

        if wire.schema_version != SCHEMA_VERSION {
            return Err(OrderError::InvalidPayload(format!(
                "unsupported schemaVersion {}",
                wire.schema_version
            )));
        }

        wire.event
            .check_invariants()
            .map_err(OrderError::InvalidPayload)?;

        Ok(wire.event)
    }
}
