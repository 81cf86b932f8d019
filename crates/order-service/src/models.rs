//! 订单领域模型
//!
//! `OrderRequest` 由 HTTP 边界反序列化得到，只在摄取端使用；
//! `OrderEvent` 是在 topic 上流转的事件，每一跳都按值转移所有权。

use serde::{Deserialize, Deserializer, Serialize};
use validator::{Validate, ValidationError};

// ---------------------------------------------------------------------------
// OrderRequest
// ---------------------------------------------------------------------------

/// 下单请求
///
/// 缺失或为 null 的字段反序列化为默认值（空串、0），交给校验规则统一拒绝，
/// 而不是在反序列化阶段报错。字段声明顺序即校验报告的优先顺序。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    #[serde(default, deserialize_with = "null_as_default")]
    #[validate(custom(function = "not_blank"))]
    pub order_id: String,

    #[serde(default, deserialize_with = "null_as_default")]
    #[validate(custom(function = "not_blank"))]
    pub customer_id: String,

    #[serde(default, deserialize_with = "null_as_default")]
    #[validate(custom(function = "not_blank"))]
    pub customer_name: String,

    #[serde(default, deserialize_with = "null_as_default")]
    #[validate(range(exclusive_min = 0.0, message = "must be greater than 0"))]
    pub amount: f64,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// 非空白校验：空串和纯空白都视为缺失
fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("not_blank").with_message("must not be blank".into()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// OrderEvent
// ---------------------------------------------------------------------------

/// 事件状态（封闭枚举）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// 请求通过校验
    Received,
    /// 请求未通过校验，必须携带 ErrorInfo
    ValidationFailed,
    /// 下游已处理（由命令式发布路径注入）
    Processed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::Processed => "PROCESSED",
        }
    }

    /// 该状态是否表示失败（失败状态必须携带 ErrorInfo）
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::ValidationFailed)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 错误详情
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// 订单事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEvent {
    pub order_id: String,
    pub customer_id: String,
    pub status: OrderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl OrderEvent {
    pub fn received(order_id: impl Into<String>, customer_id: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            customer_id: customer_id.into(),
            status: OrderStatus::Received,
            error: None,
        }
    }

    pub fn validation_failed(
        order_id: impl Into<String>,
        customer_id: impl Into<String>,
        error: ErrorInfo,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            customer_id: customer_id.into(),
            status: OrderStatus::ValidationFailed,
            error: Some(error),
        }
    }

    /// 检查线上事件的不变式
    ///
    /// orderId 非空；失败状态必须带 ErrorInfo，其它状态不得带。
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.order_id.trim().is_empty() {
            return Err("orderId must not be blank".to_string());
        }
        match (self.status.is_failure(), self.error.is_some()) {
            (true, false) => Err(format!("status {} requires error info", self.status)),
            (false, true) => Err(format!("status {} must not carry error info", self.status)),
            _ => Ok(()),
        }
    }
}
