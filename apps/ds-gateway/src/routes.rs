//! 路由定义
//!
//! - 健康检查：/health
//! - 读取：/data, /addr, /entries, /history, /stats
//! - 写入：/register, /write

use super::AppState;
use super::handlers::*;
use axum::{
    Router,
    routing::{get, post},
};

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/data", get(get_data))
        .route("/addr", get(get_address_window))
        .route("/entries", get(list_entries))
        .route("/history", get(get_history))
        .route("/stats", get(get_stats))
        .route("/register", post(register_entry))
        .route("/write", post(write_value))
}
