/// 转发链路错误。
#[derive(Debug, thiserror::Error)]
pub enum ForwarderError {
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("publish error: {0}")]
    Publish(String),
}
