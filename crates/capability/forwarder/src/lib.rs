//! MQTT 快照转发
//!
//! ```text
//! DataStore ──采样──▶ SnapshotQueue ──发布──▶ MQTT Broker
//!            (定时)    (有界，满则丢最旧)   (仅在连接可用时)
//! ```
//!
//! 采样与发布解耦：Broker 不可用时采样照常进行，快照在队列中缓存，
//! 连接恢复后按先后顺序补发。

pub mod error;
pub mod forwarder;
pub mod publisher;
pub mod queue;
pub mod sampler;

pub use error::ForwarderError;
pub use forwarder::{ForwarderConfig, MqttForwarder};
pub use publisher::{MqttPublisher, SnapshotPublisher, drain, qos_from_u8};
pub use queue::{QueuedSnapshot, SnapshotQueue};
pub use sampler::{run_sampler, snapshot_payload};
