//! HTTP 处理函数
//!
//! 摄取接口是"受理即返回"：200 只表示请求已进入管道，
//! 处理结果只能通过广播流、计数或死信 topic 观察。

use axum::{
    Json,
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};
use order_shared::redelivery::shutdown_requested;
use serde_json::Value;
use tracing::info;

use crate::counters::CounterSnapshot;
use crate::demo;
use crate::dto::{ApiResponse, HealthResponse, IngestAccepted, PublishResult};
use crate::error::{OrderError, Result};
use crate::models::OrderEvent;
use crate::state::AppState;

/// POST /ingest：单个请求对象或请求数组
pub async fn ingest(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<ApiResponse<IngestAccepted>>> {
    let accepted = state.ingest.submit(body).await?;
    info!(accepted, "订单请求已受理");
    Ok(Json(ApiResponse::success(IngestAccepted { accepted })))
}

/// POST /orders/events：绕过摄取管道直接发布事件
pub async fn publish_event(
    State(state): State<AppState>,
    Json(event): Json<OrderEvent>,
) -> Result<Json<PublishResult>> {
    event
        .check_invariants()
        .map_err(|message| OrderError::Validation {
            field: "event".to_string(),
            message,
        })?;

    let published = state.publisher.publish(event).await;
    Ok(Json(PublishResult { published }))
}

/// GET /orders/processed/stream：已处理事件的 SSE 流
pub async fn processed_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>> {
    let mut shutdown = state.shutdown.clone();
    let stream = state
        .sink
        .subscribe()
        .into_stream()
        .take_until(async move { shutdown_requested(&mut shutdown).await })
        .map(|event| Event::default().event("order").json_data(&event));

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// GET /stats
pub async fn stats(State(state): State<AppState>) -> Json<CounterSnapshot> {
    Json(state.counters.snapshot())
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "UP",
        subscribers: state.sink.subscriber_count(),
    })
}

/// POST /reverse
pub async fn reverse(body: String) -> String {
    demo::reverse(&body)
}

/// POST /uppercase
pub async fn uppercase(body: String) -> String {
    demo::uppercase(&body)
}
