//! HTTP 错误响应与 DTO 转换
//!
//! 所有错误返回统一的 `{ok: false, error: {code, message}}`，状态码与错误码对应。

use api_contract::{EntryDto, ErrorResponse, error_codes};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use ds_store::{EntrySnapshot, StoreError};

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (status, Json(ErrorResponse::new(code, message))).into_response()
}

/// 错误请求响应
pub fn bad_request_error(message: impl Into<String>) -> Response {
    error_response(StatusCode::BAD_REQUEST, error_codes::INVALID_REQUEST, message)
}

/// 资源不存在响应
pub fn not_found_error(message: impl Into<String>) -> Response {
    error_response(StatusCode::NOT_FOUND, error_codes::NOT_FOUND, message)
}

/// 存储错误响应：地址冲突 409，其余 400。
pub fn store_error(err: StoreError) -> Response {
    let message = err.to_string();
    if err.is_validation() {
        bad_request_error(message)
    } else {
        error_response(StatusCode::CONFLICT, error_codes::STORE_CONFLICT, message)
    }
}

pub fn entry_to_dto(entry: EntrySnapshot) -> EntryDto {
    EntryDto {
        key: entry.key,
        address: entry.address,
        value: entry.value,
        default: entry.default,
        data_type: entry.data_type,
        units: entry.units,
        quality: entry.quality,
        updated_at_ms: entry.updated_at_ms,
        changed_at_ms: entry.changed_at_ms,
    }
}
