//! 写入类 handlers
//!
//! - POST /register
//! - POST /write

use crate::AppState;
use crate::utils::response::{bad_request_error, store_error};
use crate::utils::validation::{normalize_required, write_target};
use api_contract::{RegisterRequest, RegisterResponse, WriteRequest, WriteResponse};
use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use ds_store::Registration;
use ds_telemetry::record_http_write;
use tracing::info;

pub async fn register_entry(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return bad_request_error(rejection.body_text()),
    };
    let key = match normalize_required(req.key, "key") {
        Ok(key) => key,
        Err(response) => return response,
    };

    let mut registration = Registration::new(key.clone());
    registration.address = req.address;
    if let Some(default) = req.default {
        registration.default = default;
    }
    registration.data_type = req.data_type;
    registration.units = req.units;
    registration.allow_address_conflict = req.allow_address_conflict;
    registration.auto_allocate = req.auto_allocate;

    match state.store.register(registration) {
        Ok(address) => {
            info!(target: "ds.http", key = %key, address = ?address, "entry registered");
            (
                StatusCode::OK,
                Json(RegisterResponse {
                    ok: true,
                    key,
                    address,
                }),
            )
                .into_response()
        }
        Err(err) => store_error(err),
    }
}

pub async fn write_value(
    State(state): State<AppState>,
    payload: Result<Json<WriteRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return bad_request_error(rejection.body_text()),
    };
    let target = match write_target(req.key, req.address) {
        Ok(target) => target,
        Err(response) => return response,
    };

    match state.store.write(target, req.value) {
        Ok(outcome) => {
            record_http_write();
            info!(
                target: "ds.http",
                key = %outcome.key,
                value = %outcome.value,
                adjusted = outcome.adjusted,
                "value written"
            );
            (
                StatusCode::OK,
                Json(WriteResponse {
                    ok: true,
                    key: outcome.key,
                    address: outcome.address,
                    value: outcome.value,
                    adjusted: outcome.adjusted,
                    changed: outcome.changed,
                }),
            )
                .into_response()
        }
        Err(err) => store_error(err),
    }
}
