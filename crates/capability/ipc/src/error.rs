//! IPC 错误类型

use std::time::Duration;

/// IPC 客户端/服务端错误。
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("connect to {path} failed: {source}")]
    Connect {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("ipc request timed out after {0:?}")]
    Timeout(Duration),
    #[error("ipc connection closed by peer")]
    Closed,
    #[error("ipc io error: {0}")]
    Io(#[from] std::io::Error),
    /// 响应无法解析或帧格式错误。
    #[error("ipc protocol error: {0}")]
    Protocol(String),
    /// 服务端返回 `ok:false`。
    #[error("rejected by gateway: {0}")]
    Rejected(String),
    #[error("socket {0} is already served by another process")]
    AddressInUse(String),
}

impl IpcError {
    /// 是否为端点不可达类错误（同步循环据此退避）。
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            IpcError::Connect { .. } | IpcError::Timeout(_) | IpcError::Closed | IpcError::Io(_)
        )
    }
}
