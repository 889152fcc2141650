//! 网关进程：HTTP 控制接口与后台服务编排。

pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod utils;
pub mod workers;

use axum::Router;
use ds_store::DataStore;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

/// HTTP 处理器共享状态。
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<DataStore>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(store: Arc<DataStore>) -> Self {
        Self {
            store,
            started_at: Instant::now(),
        }
    }
}

/// 组装完整的 HTTP 应用（路由 + 追踪中间件）。
pub fn build_app(state: AppState) -> Router {
    routes::create_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        // 注入 request_id/trace_id
        .layer(axum::middleware::from_fn(middleware::request_context))
}
