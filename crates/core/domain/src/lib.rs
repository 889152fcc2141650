//! 网关共享领域模型：数据值、数据类型、写入目标与关停信号。

pub mod data;
pub mod shutdown;

pub use data::{DataType, Quality, Value, WriteTarget};
pub use shutdown::{Shutdown, ShutdownTrigger, shutdown_channel, termination_signal};

use std::time::{SystemTime, UNIX_EPOCH};

/// 当前 Unix 时间戳（毫秒）。
pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
