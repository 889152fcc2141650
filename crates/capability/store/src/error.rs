//! 存储层错误类型

/// DataStore 操作错误。
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// 地址已被其他键占用且未允许覆盖。
    #[error("address {address} already bound to key '{existing_key}'")]
    Conflict { address: u32, existing_key: String },
    #[error("unknown key: {0}")]
    UnknownKey(String),
    #[error("address {0} is not mapped")]
    UnmappedAddress(u32),
    #[error("address range for {0} points is exhausted")]
    AddressRangeExhausted(&'static str),
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl StoreError {
    /// 是否属于校验类错误（未知目标或非法参数）。
    pub fn is_validation(&self) -> bool {
        !matches!(self, StoreError::Conflict { .. })
    }
}
