//! 运行统计
//!
//! - GET /stats

use crate::AppState;
use api_contract::{MetricsSnapshotDto, StatsResponse, StoreStatsDto};
use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use ds_telemetry::metrics;

pub async fn get_stats(State(state): State<AppState>) -> Response {
    let store = state.store.statistics();
    let snapshot = metrics().snapshot();
    (
        StatusCode::OK,
        Json(StatsResponse {
            uptime_secs: state.started_at.elapsed().as_secs(),
            store: StoreStatsDto {
                entries: store.entries,
                addressed_entries: store.addressed_entries,
                writes: store.writes,
                adjusted_writes: store.adjusted_writes,
                rejected_writes: store.rejected_writes,
                history_points: store.history_points,
                history_entries: store.history_entries,
                bad_quality_points: store.bad_quality_points,
            },
            metrics: MetricsSnapshotDto {
                ipc_connections: snapshot.ipc_connections,
                ipc_requests: snapshot.ipc_requests,
                ipc_failures: snapshot.ipc_failures,
                protocol_writes: snapshot.protocol_writes,
                protocol_rejections: snapshot.protocol_rejections,
                http_writes: snapshot.http_writes,
                mqtt_published: snapshot.mqtt_published,
                mqtt_publish_failures: snapshot.mqtt_publish_failures,
                mqtt_dropped: snapshot.mqtt_dropped,
                worker_failures: snapshot.worker_failures,
            },
        }),
    )
        .into_response()
}
