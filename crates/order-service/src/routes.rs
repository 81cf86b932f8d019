//! 路由配置模块

use axum::{
    Router, middleware,
    routing::{get, post},
};
use order_shared::observability::middleware as obs_middleware;

use crate::{handlers, state::AppState};

/// 订单相关路由
fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/ingest", post(handlers::ingest))
        .route("/orders/events", post(handlers::publish_event))
        .route("/orders/processed/stream", get(handlers::processed_stream))
        .route("/stats", get(handlers::stats))
}

/// 演示用字符串变换路由
fn demo_routes() -> Router<AppState> {
    Router::new()
        .route("/reverse", post(handlers::reverse))
        .route("/uppercase", post(handlers::uppercase))
}

/// 构建完整的应用路由
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(order_routes())
        .merge(demo_routes())
        .route("/health", get(handlers::health))
        .layer(middleware::from_fn(obs_middleware::http_tracing))
        .layer(middleware::from_fn(obs_middleware::request_id))
        .with_state(state)
}
