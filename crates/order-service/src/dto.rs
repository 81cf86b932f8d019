//! HTTP 响应体

use serde::Serialize;

/// API 统一响应
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub success: bool,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            code: "SUCCESS".to_string(),
            message: "操作成功".to_string(),
            data: Some(data),
        }
    }
}

/// 摄取受理结果：只表示已进入管道，不代表已送达 broker
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestAccepted {
    pub accepted: usize,
}

#[derive(Debug, Serialize)]
pub struct PublishResult {
    pub published: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub subscribers: usize,
}
