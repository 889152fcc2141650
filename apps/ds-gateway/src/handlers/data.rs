//! 读取类 handlers
//!
//! - GET /data
//! - GET /addr?start=&count=
//! - GET /entries
//! - GET /history?key=&limit=

use crate::AppState;
use crate::utils::response::{bad_request_error, entry_to_dto, not_found_error};
use crate::utils::validation::{history_limit, normalize_required, window_bounds};
use api_contract::{AddrQuery, EntryDto, HistoryQuery, HistoryResponse, HistorySampleDto};
use axum::{
    Json,
    extract::{Query, State, rejection::QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};

pub async fn get_data(State(state): State<AppState>) -> Response {
    (StatusCode::OK, Json(state.store.snapshot())).into_response()
}

pub async fn get_address_window(
    State(state): State<AppState>,
    query: Result<Query<AddrQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return bad_request_error(rejection.body_text()),
    };
    let (start, count) = match window_bounds(&query) {
        Ok(bounds) => bounds,
        Err(response) => return response,
    };
    (StatusCode::OK, Json(state.store.address_window(start, count))).into_response()
}

pub async fn list_entries(State(state): State<AppState>) -> Response {
    let data: Vec<EntryDto> = state.store.entries().into_iter().map(entry_to_dto).collect();
    (StatusCode::OK, Json(data)).into_response()
}

pub async fn get_history(
    State(state): State<AppState>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return bad_request_error(rejection.body_text()),
    };
    let key = match normalize_required(query.key.unwrap_or_default(), "key") {
        Ok(key) => key,
        Err(response) => return response,
    };
    let limit = match history_limit(query.limit) {
        Ok(limit) => limit,
        Err(response) => return response,
    };
    if !state.store.contains_key(&key) {
        return not_found_error(format!("unknown key: {key}"));
    }
    let samples = state
        .store
        .history(&key, limit)
        .into_iter()
        .map(|sample| HistorySampleDto {
            timestamp_ms: sample.timestamp_ms,
            value: sample.value,
        })
        .collect();
    (StatusCode::OK, Json(HistoryResponse { key, samples })).into_response()
}
