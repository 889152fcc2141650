//! 共享数据存储。
//!
//! 网关唯一的数据源：所有协议服务、IPC、HTTP 与 MQTT 转发均通过
//! `Arc<DataStore>` 读写同一份数据。

pub mod error;
pub mod store;

pub use error::StoreError;
pub use store::{
    ChangeEvent, DEFAULT_SCHEMA, DataStore, EntrySnapshot, HISTORY_CAPACITY, HistorySample,
    Registration, StoreStatistics, WriteOutcome, allocation_range,
};
