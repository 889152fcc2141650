//! 快照采样任务

use crate::error::ForwarderError;
use crate::queue::{QueuedSnapshot, SnapshotQueue};
use domain::{Shutdown, now_epoch_ms};
use ds_store::DataStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 将存储快照序列化为 JSON 对象（键 → 值）。
pub fn snapshot_payload(store: &DataStore) -> Result<Vec<u8>, ForwarderError> {
    Ok(serde_json::to_vec(&store.snapshot())?)
}

/// 按固定间隔采样并入队，直到收到关停信号。返回采样次数。
///
/// 与 Broker 连接状态无关，断线期间也持续采样。
pub async fn run_sampler(
    store: Arc<DataStore>,
    queue: Arc<SnapshotQueue>,
    interval: Duration,
    shutdown: Shutdown,
) -> u64 {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut sequence = 0u64;
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = ticker.tick() => {
                let payload = match snapshot_payload(&store) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(target: "ds.mqtt", error = %err, "snapshot serialization failed");
                        continue;
                    }
                };
                sequence += 1;
                let evicted = queue.push(QueuedSnapshot {
                    sequence,
                    timestamp_ms: now_epoch_ms(),
                    payload,
                });
                if let Some(evicted) = evicted {
                    debug!(
                        target: "ds.mqtt",
                        dropped_sequence = evicted.sequence,
                        queued = queue.len(),
                        "queue full, oldest snapshot dropped"
                    );
                }
            }
        }
    }
    info!(target: "ds.mqtt", samples = sequence, dropped = queue.dropped(), "sampler stopped");
    sequence
}
