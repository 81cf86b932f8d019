//! 订单服务错误类型定义
//!
//! 分类与管道中的失败点一一对应：
//! - 校验失败在摄取端就地转换为 VALIDATION_FAILED 事件，不会返回给 HTTP 调用方
//! - 摄取超时只影响单条请求，不会中断整个流
//! - 业务拒绝在消费端被捕获，转换为"不确认"
//! - 传输失败对命令式调用方表现为 false，对消费端表现为未确认

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use order_shared::error::StreamError;
use serde_json::json;

/// 订单服务错误类型
#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("{field}: {message}")]
    Validation { field: String, message: String },

    #[error("订单 {order_id} 摄取超时（已等待 {waited_ms}ms）")]
    IngestTimeout { order_id: String, waited_ms: u64 },

    #[error("Invalid request payload: {0}")]
    InvalidPayload(String),

    #[error("{0}")]
    BusinessLogic(String),

    #[error("消息发送失败: {0}")]
    Transport(String),

    #[error(transparent)]
    Shared(#[from] StreamError),
}

impl OrderError {
    /// 返回错误码（用于 API 响应和事件中的 ErrorInfo）
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::IngestTimeout { .. } => "INGEST_TIMEOUT",
            Self::InvalidPayload(_) => "INVALID_PAYLOAD",
            Self::BusinessLogic(_) => "BUSINESS_LOGIC_ERROR",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Shared(e) => e.code(),
        }
    }

    /// 返回对应的 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation { .. } | Self::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            Self::IngestTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::BusinessLogic(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Shared(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for OrderError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // 基础设施错误只返回通用提示，详细信息仅记录日志
        let message = match &self {
            Self::Shared(e) => {
                tracing::error!(error = %e, "内部错误");
                "服务内部错误，请稍后重试".to_string()
            }
            other => other.to_string(),
        };

        let body = json!({
            "success": false,
            "code": self.code(),
            "message": message,
            "data": serde_json::Value::Null
        });

        (status, axum::Json(body)).into_response()
    }
}

/// 服务层 Result 类型别名
pub type Result<T> = std::result::Result<T, OrderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_format() {
        let err = OrderError::Validation {
            field: "customerId".to_string(),
            message: "must not be blank".to_string(),
        };
        assert_eq!(err.to_string(), "customerId: must not be blank");
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_invalid_payload_message() {
        let err = OrderError::InvalidPayload("expected a map".to_string());
        assert_eq!(err.to_string(), "Invalid request payload: expected a map");
        assert_eq!(err.code(), "INVALID_PAYLOAD");
    }

    #[test]
    fn test_shared_error_keeps_its_code() {
        let err: OrderError = StreamError::Kafka("broker down".to_string()).into();
        assert_eq!(err.code(), "KAFKA_ERROR");
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_into_response_body() {
        use http_body_util::BodyExt;

        let response = OrderError::Transport("queue full".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "TRANSPORT_ERROR");
        assert_eq!(body["message"], "消息发送失败: queue full");
        assert!(body["data"].is_null());
    }

    #[tokio::test]
    async fn test_shared_error_message_is_masked() {
        use http_body_util::BodyExt;

        let response =
            OrderError::Shared(StreamError::Internal("secret detail".to_string())).into_response();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["message"], "服务内部错误，请稍后重试");
    }
}
