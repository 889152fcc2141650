//! 上游数据源
//!
//! 上游返回 `device → tag_id → {value, status, tag_name?, name?}` 的 JSON 映射。

use crate::error::SyncError;
use async_trait::async_trait;
use domain::Value;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// 单个标签的轮询结果。
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PolledTag {
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub tag_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl PolledTag {
    /// 读数状态为 SUCCESS/OK（不区分大小写）且值非空。
    pub fn is_valid(&self) -> bool {
        let status_ok = self
            .status
            .as_deref()
            .map(|status| {
                let status = status.trim();
                status.eq_ignore_ascii_case("success") || status.eq_ignore_ascii_case("ok")
            })
            .unwrap_or(false);
        status_ok && !self.value.is_null()
    }

    /// 标签名：优先 `tag_name`，其次 `name`，最后回落为标签 ID。
    pub fn display_name<'a>(&'a self, tag_id: &'a str) -> &'a str {
        self.tag_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .or(self.name.as_deref().filter(|name| !name.is_empty()))
            .unwrap_or(tag_id)
    }
}

/// 设备 → 标签 ID → 轮询结果。
pub type PolledValues = BTreeMap<String, BTreeMap<String, PolledTag>>;

/// 过滤并转换：返回 `(key, 原始值)` 列表，键为 `"{device}.{tag}"`。
pub fn collect_updates(values: &PolledValues) -> Vec<(String, serde_json::Value)> {
    values
        .iter()
        .flat_map(|(device, tags)| {
            tags.iter()
                .filter(|(_, tag)| tag.is_valid())
                .map(move |(tag_id, tag)| {
                    (
                        format!("{device}.{}", tag.display_name(tag_id)),
                        tag.value.clone(),
                    )
                })
        })
        .collect()
}

/// 将上游 JSON 值转换为数据值；数字字符串按数字处理。
pub fn json_to_value(raw: &serde_json::Value) -> Option<Value> {
    match raw {
        serde_json::Value::Bool(flag) => Some(Value::Bool(*flag)),
        serde_json::Value::Number(number) => number
            .as_i64()
            .map(Value::Int)
            .or_else(|| number.as_f64().map(Value::Float)),
        serde_json::Value::String(text) => {
            let text = text.trim();
            text.parse::<i64>()
                .map(Value::Int)
                .ok()
                .or_else(|| text.parse::<f64>().ok().map(Value::Float))
        }
        _ => None,
    }
}

/// 上游数据源接口。
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    async fn poll(&self) -> Result<PolledValues, SyncError>;
}

/// HTTP 上游（GET 返回 JSON 映射）。
pub struct HttpUpstream {
    client: reqwest::Client,
    url: reqwest::Url,
}

impl HttpUpstream {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, SyncError> {
        let url = reqwest::Url::parse(url)
            .map_err(|err| SyncError::InvalidConfig(format!("upstream url {url}: {err}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| SyncError::InvalidConfig(err.to_string()))?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }
}

#[async_trait]
impl UpstreamSource for HttpUpstream {
    async fn poll(&self) -> Result<PolledValues, SyncError> {
        let values = self
            .client
            .get(self.url.clone())
            .send()
            .await?
            .error_for_status()?
            .json::<PolledValues>()
            .await?;
        Ok(values)
    }
}
