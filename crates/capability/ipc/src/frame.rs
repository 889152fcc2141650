//! IPC 帧定义

use domain::{Value, WriteTarget};
use ds_store::WriteOutcome;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// IPC 请求（按 `action` 字段区分）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum IpcRequest {
    Write(WriteItem),
    BulkWrite { updates: Vec<WriteItem> },
}

/// 单个写入项：`key` 与 `address` 二选一。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<u32>,
    #[serde(with = "wire_value")]
    pub value: Value,
}

/// JSON 无法表示 NaN/±Inf：非有限浮点数在线上编码为 `null`，
/// 服务端解码为 NaN，由存储清洗为 0 并计入 adjusted。
mod wire_value {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Value, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Value::Float(number) if !number.is_finite() => serializer.serialize_none(),
            other => other.serialize(serializer),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Value, D::Error> {
        Ok(Option::<Value>::deserialize(deserializer)?.unwrap_or(Value::Float(f64::NAN)))
    }
}

impl WriteItem {
    pub fn key(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: Some(key.into()),
            address: None,
            value,
        }
    }

    pub fn address(address: u32, value: Value) -> Self {
        Self {
            key: None,
            address: Some(address),
            value,
        }
    }

    pub fn target(&self) -> Result<WriteTarget, String> {
        match (&self.key, self.address) {
            (Some(key), None) => Ok(WriteTarget::Key(key.clone())),
            (None, Some(address)) => Ok(WriteTarget::Address(address)),
            (Some(_), Some(_)) => Err("specify either key or address, not both".to_string()),
            (None, None) => Err("key or address required".to_string()),
        }
    }
}

/// IPC 响应。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpcResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjusted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<IpcResponse>>,
    /// 帧级错误：服务端随后关闭该连接。
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub closing: bool,
}

impl IpcResponse {
    pub fn written(outcome: &WriteOutcome) -> Self {
        Self {
            ok: true,
            key: Some(outcome.key.clone()),
            value: Some(outcome.value),
            adjusted: Some(outcome.adjusted),
            ..Self::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// 帧级错误响应（格式错误、超长、非 UTF-8），发送后连接被关闭。
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            closing: true,
            ..Self::failure(message)
        }
    }

    /// 批量写入响应：帧本身处理成功，逐项结果见 `results`。
    pub fn bulk(results: Vec<IpcResponse>) -> Self {
        Self {
            ok: true,
            results: Some(results),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_write_by_key_and_address() {
        let request: IpcRequest =
            serde_json::from_str(r#"{"action":"write","key":"temperature","value":28.7}"#)
                .expect("by key");
        assert_eq!(
            request,
            IpcRequest::Write(WriteItem::key("temperature", Value::Float(28.7)))
        );

        let request: IpcRequest =
            serde_json::from_str(r#"{"action":"write","address":3,"value":1}"#).expect("by addr");
        assert_eq!(request, IpcRequest::Write(WriteItem::address(3, Value::Int(1))));
    }

    #[test]
    fn parses_bulk_write() {
        let request: IpcRequest = serde_json::from_str(
            r#"{"action":"bulk_write","updates":[{"key":"a","value":1.5},{"address":2,"value":true}]}"#,
        )
        .expect("bulk");
        let IpcRequest::BulkWrite { updates } = request else {
            panic!("expected bulk write");
        };
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].value, Value::Bool(true));
    }

    #[test]
    fn rejects_unknown_action_and_missing_value() {
        assert!(serde_json::from_str::<IpcRequest>(r#"{"action":"delete","key":"a"}"#).is_err());
        assert!(serde_json::from_str::<IpcRequest>(r#"{"action":"write","key":"a"}"#).is_err());
    }

    #[test]
    fn target_requires_exactly_one_selector() {
        let both = WriteItem {
            key: Some("a".to_string()),
            address: Some(1),
            value: Value::Int(1),
        };
        assert!(both.target().is_err());
        let neither = WriteItem {
            key: None,
            address: None,
            value: Value::Int(1),
        };
        assert!(neither.target().is_err());
    }

    #[test]
    fn non_finite_values_travel_as_null() {
        let json = serde_json::to_string(&IpcRequest::Write(WriteItem::key(
            "humidity",
            Value::Float(f64::INFINITY),
        )))
        .expect("json");
        assert_eq!(json, r#"{"action":"write","key":"humidity","value":null}"#);

        let IpcRequest::Write(item) = serde_json::from_str(&json).expect("parse") else {
            panic!("expected write");
        };
        assert!(matches!(item.value, Value::Float(number) if number.is_nan()));
    }

    #[test]
    fn fatal_response_marks_closing() {
        let json = serde_json::to_string(&IpcResponse::fatal("frame is not utf-8")).expect("json");
        assert_eq!(json, r#"{"ok":false,"error":"frame is not utf-8","closing":true}"#);
    }

    #[test]
    fn failure_response_omits_empty_fields() {
        let json = serde_json::to_string(&IpcResponse::failure("unknown key: x")).expect("json");
        assert_eq!(json, r#"{"ok":false,"error":"unknown key: x"}"#);
    }
}
