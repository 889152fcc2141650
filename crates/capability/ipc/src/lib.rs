//! 网关与同步进程之间的本地 IPC。
//!
//! 传输层为 Unix Domain Socket，帧格式为换行分隔的 JSON 对象：
//! 每行一个请求，按顺序每行一个响应，同一连接上可流水线发送。
//!
//! ```text
//! → {"action":"write","key":"temperature","value":28.7}
//! ← {"ok":true,"key":"temperature","value":28.7,"adjusted":false}
//! ```

pub mod client;
pub mod error;
pub mod frame;
pub mod server;

pub use client::{IpcClient, IpcClientConfig, WriteAck};
pub use error::IpcError;
pub use frame::{IpcRequest, IpcResponse, WriteItem};
pub use server::{IpcServer, IpcServerConfig};

/// 单帧最大长度（字节，不含换行）。
pub const MAX_FRAME_BYTES: usize = 64 * 1024;
