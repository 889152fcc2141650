//! 协议错误类型定义

/// 协议服务错误
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// 监听地址绑定失败
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// IO 错误
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// 报文解析错误（帧结构、BER 编码等）
    #[error("decode error: {0}")]
    Decode(String),

    /// 配置错误
    #[error("config error: {0}")]
    Config(String),
}

impl ProtocolError {
    pub(crate) fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }
}
