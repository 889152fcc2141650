//! 输入验证辅助函数
//!
//! 失败时直接返回 `bad_request_error` 响应。

use crate::utils::response::bad_request_error;
use api_contract::AddrQuery;
use axum::response::Response;
use domain::WriteTarget;
use ds_store::HISTORY_CAPACITY;

pub const DEFAULT_WINDOW_COUNT: u32 = 16;
pub const MAX_WINDOW_COUNT: u32 = 1000;
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// 验证必填字段，去除空格并检查非空
pub fn normalize_required(value: String, field: &str) -> Result<String, Response> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(bad_request_error(format!("{field} required")));
    }
    Ok(trimmed.to_string())
}

/// `key` 与 `address` 必须恰好提供一个。
pub fn write_target(key: Option<String>, address: Option<u32>) -> Result<WriteTarget, Response> {
    match (key, address) {
        (Some(_), Some(_)) => Err(bad_request_error("provide either key or address, not both")),
        (Some(key), None) => normalize_required(key, "key").map(WriteTarget::Key),
        (None, Some(address)) => Ok(WriteTarget::Address(address)),
        (None, None) => Err(bad_request_error("key or address required")),
    }
}

pub fn window_bounds(query: &AddrQuery) -> Result<(u32, u32), Response> {
    let start = query.start.unwrap_or(0);
    let count = query.count.unwrap_or(DEFAULT_WINDOW_COUNT);
    if count > MAX_WINDOW_COUNT {
        return Err(bad_request_error(format!(
            "count must not exceed {MAX_WINDOW_COUNT}"
        )));
    }
    Ok((start, count))
}

/// `limit` 缺省 100；0 表示全部，超过历史容量返回 400。
pub fn history_limit(limit: Option<usize>) -> Result<usize, Response> {
    let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    if limit > HISTORY_CAPACITY {
        return Err(bad_request_error(format!(
            "limit must not exceed {HISTORY_CAPACITY}"
        )));
    }
    Ok(limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_target_requires_exactly_one() {
        assert!(write_target(None, None).is_err());
        assert!(write_target(Some("a".to_string()), Some(1)).is_err());
        assert!(write_target(Some("  ".to_string()), None).is_err());
        assert_eq!(
            write_target(Some(" temperature ".to_string()), None).ok(),
            Some(WriteTarget::Key("temperature".to_string()))
        );
        assert_eq!(write_target(None, Some(2)).ok(), Some(WriteTarget::Address(2)));
    }

    #[test]
    fn window_defaults_and_limit() {
        assert_eq!(window_bounds(&AddrQuery::default()).ok(), Some((0, 16)));
        let query = AddrQuery {
            start: Some(4),
            count: Some(MAX_WINDOW_COUNT),
        };
        assert_eq!(window_bounds(&query).ok(), Some((4, 1000)));
        let query = AddrQuery {
            start: None,
            count: Some(MAX_WINDOW_COUNT + 1),
        };
        assert!(window_bounds(&query).is_err());
    }

    #[test]
    fn history_limit_defaults_and_cap() {
        assert_eq!(history_limit(None).ok(), Some(DEFAULT_HISTORY_LIMIT));
        assert_eq!(history_limit(Some(0)).ok(), Some(0));
        assert_eq!(history_limit(Some(HISTORY_CAPACITY)).ok(), Some(HISTORY_CAPACITY));
        assert!(history_limit(Some(HISTORY_CAPACITY + 1)).is_err());
    }
}
