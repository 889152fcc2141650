//! 同步进程核心逻辑。
//!
//! 周期性地从上游拉取已轮询的现场值，过滤出有效读数，
//! 以 `"{device}.{tag}"` 为键通过 IPC 写入网关，并维护同步统计。

pub mod error;
pub mod runner;
pub mod stats;
pub mod upstream;

pub use error::SyncError;
pub use runner::{CycleReport, SyncConfig, SyncRunner, SyncState, SyncWriter};
pub use stats::{MAX_ERROR_RECORDS, SyncErrorRecord, SyncStats, spawn_stats_reporter};
pub use upstream::{
    HttpUpstream, PolledTag, PolledValues, UpstreamSource, collect_updates, json_to_value,
};
