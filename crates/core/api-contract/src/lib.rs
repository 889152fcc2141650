//! HTTP 控制接口的稳定 DTO 与错误契约。
//!
//! 成功响应按端点各自定义（写入类带 `ok: true`），失败响应统一为
//! `{"ok": false, "error": {"code": ..., "message": ...}}`。

use domain::{DataType, Quality, Value};
use serde::{Deserialize, Serialize};

/// 错误码。
pub mod error_codes {
    pub const INVALID_REQUEST: &str = "INVALID.REQUEST";
    pub const STORE_CONFLICT: &str = "STORE.CONFLICT";
    pub const NOT_FOUND: &str = "RESOURCE.NOT_FOUND";
}

/// 失败响应的错误体。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

/// 统一失败响应。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub ok: bool,
    pub error: ApiError,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: ApiError {
                code: code.into(),
                message: message.into(),
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

impl HealthResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

/// `GET /addr` 查询参数。
#[derive(Debug, Default, Deserialize)]
pub struct AddrQuery {
    pub start: Option<u32>,
    pub count: Option<u32>,
}

/// `GET /history` 查询参数。`limit` 缺省 100，0 表示全部。
#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub key: Option<String>,
    pub limit: Option<usize>,
}

/// 注册请求体。
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub key: String,
    pub address: Option<u32>,
    pub default: Option<Value>,
    pub data_type: Option<DataType>,
    #[serde(default)]
    pub units: String,
    #[serde(default)]
    pub allow_address_conflict: bool,
    /// 未给地址时按类型区间自动分配。
    #[serde(default)]
    pub auto_allocate: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub ok: bool,
    pub key: String,
    pub address: Option<u32>,
}

/// 写入请求体：`key` 与 `address` 二选一。
#[derive(Debug, Deserialize)]
pub struct WriteRequest {
    pub key: Option<String>,
    pub address: Option<u32>,
    pub value: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WriteResponse {
    pub ok: bool,
    pub key: String,
    pub address: Option<u32>,
    pub value: Value,
    /// 输入被清洗（NaN/Inf → 0）。
    pub adjusted: bool,
    pub changed: bool,
}

/// 数据点详情。
#[derive(Debug, Serialize, Deserialize)]
pub struct EntryDto {
    pub key: String,
    pub address: Option<u32>,
    pub value: Value,
    pub default: Value,
    pub data_type: DataType,
    pub units: String,
    pub quality: Quality,
    pub updated_at_ms: Option<i64>,
    pub changed_at_ms: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct HistorySampleDto {
    pub timestamp_ms: i64,
    pub value: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub key: String,
    pub samples: Vec<HistorySampleDto>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreStatsDto {
    pub entries: usize,
    pub addressed_entries: usize,
    pub writes: u64,
    pub adjusted_writes: u64,
    pub rejected_writes: u64,
    pub history_points: usize,
    pub history_entries: usize,
    pub bad_quality_points: usize,
}

/// 网关计数指标。
#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsSnapshotDto {
    pub ipc_connections: u64,
    pub ipc_requests: u64,
    pub ipc_failures: u64,
    pub protocol_writes: u64,
    pub protocol_rejections: u64,
    pub http_writes: u64,
    pub mqtt_published: u64,
    pub mqtt_publish_failures: u64,
    pub mqtt_dropped: u64,
    pub worker_failures: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub uptime_secs: u64,
    pub store: StoreStatsDto,
    pub metrics: MetricsSnapshotDto,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_shape() {
        let body = serde_json::to_value(ErrorResponse::new(
            error_codes::STORE_CONFLICT,
            "address 0 already bound",
        ))
        .unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "ok": false,
                "error": { "code": "STORE.CONFLICT", "message": "address 0 already bound" }
            })
        );
    }

    #[test]
    fn register_request_optional_fields() {
        let req: RegisterRequest = serde_json::from_str(r#"{"key":"flow"}"#).unwrap();
        assert_eq!(req.key, "flow");
        assert!(req.address.is_none());
        assert!(!req.allow_address_conflict);
        assert!(!req.auto_allocate);
        assert!(req.units.is_empty());

        let req: RegisterRequest = serde_json::from_str(
            r#"{"key":"valve","address":9,"default":true,"data_type":"bool","allow_address_conflict":true}"#,
        )
        .unwrap();
        assert_eq!(req.address, Some(9));
        assert_eq!(req.default, Some(Value::Bool(true)));
        assert_eq!(req.data_type, Some(DataType::Bool));
        assert!(req.allow_address_conflict);
    }

    #[test]
    fn history_query_fields_are_optional() {
        let query: HistoryQuery = serde_json::from_str(r#"{"key":"temperature"}"#).unwrap();
        assert_eq!(query.key.as_deref(), Some("temperature"));
        assert!(query.limit.is_none());
    }

    #[test]
    fn write_request_accepts_numbers_and_bools() {
        let req: WriteRequest = serde_json::from_str(r#"{"key":"temperature","value":21.5}"#).unwrap();
        assert_eq!(req.value, Value::Float(21.5));
        let req: WriteRequest = serde_json::from_str(r#"{"address":3,"value":2}"#).unwrap();
        assert_eq!(req.address, Some(3));
        assert_eq!(req.value, Value::Int(2));
        assert!(serde_json::from_str::<WriteRequest>(r#"{"key":"x","value":"hot"}"#).is_err());
    }
}
