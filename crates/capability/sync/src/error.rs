//! 同步错误类型

/// 同步进程错误。
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// 上游不可达、返回错误状态或响应无法解析。
    #[error("upstream poll failed: {0}")]
    Upstream(String),
    /// 启动参数错误（致命）。
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Upstream(err.to_string())
    }
}
