//! MQTT 发布端
//!
//! `SnapshotPublisher` 是发布接缝：生产实现基于 rumqttc，测试中可替换为内存实现。

use crate::error::ForwarderError;
use crate::queue::SnapshotQueue;
use domain::Shutdown;
use ds_telemetry::{record_mqtt_publish_failure, record_mqtt_published};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// 快照发布接口。
pub trait SnapshotPublisher: Send + Sync {
    /// 当前是否已与 Broker 建立会话。
    fn is_connected(&self) -> bool;

    /// 非阻塞发布一条快照。
    fn try_publish(&self, payload: Vec<u8>) -> Result<(), ForwarderError>;
}

/// 连接可用时按顺序发布队列中的全部快照，返回成功条数。
///
/// 发布失败的快照放回队首，下一轮重试。
pub fn drain(queue: &SnapshotQueue, publisher: &dyn SnapshotPublisher) -> usize {
    let mut published = 0;
    while publisher.is_connected() {
        let Some(item) = queue.pop() else {
            break;
        };
        let sequence = item.sequence;
        match publisher.try_publish(item.payload.clone()) {
            Ok(()) => {
                record_mqtt_published();
                published += 1;
            }
            Err(err) => {
                record_mqtt_publish_failure();
                debug!(target: "ds.mqtt", sequence, error = %err, "publish deferred");
                queue.requeue(item);
                break;
            }
        }
    }
    published
}

pub fn qos_from_u8(value: u8) -> QoS {
    match value {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// 基于 rumqttc 的发布实现。
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    topic: String,
    qos: QoS,
    retain: bool,
    connected: Arc<AtomicBool>,
}

impl MqttPublisher {
    pub fn new(options: MqttOptions, topic: String, qos: QoS, retain: bool) -> (Self, EventLoop) {
        let (client, eventloop) = AsyncClient::new(options, 64);
        let publisher = Self {
            client,
            topic,
            qos,
            retain,
            connected: Arc::new(AtomicBool::new(false)),
        };
        (publisher, eventloop)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// 驱动 rumqttc 事件循环并维护连接状态；出错后间隔重连，直到关停。
    pub async fn drive(&self, mut eventloop: EventLoop, shutdown: Shutdown) {
        loop {
            let event = tokio::select! {
                _ = shutdown.wait() => break,
                event = eventloop.poll() => event,
            };
            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    let accepted = ack.code == ConnectReturnCode::Success;
                    self.connected.store(accepted, Ordering::Release);
                    if accepted {
                        info!(target: "ds.mqtt", topic = %self.topic, "connected to broker");
                    } else {
                        warn!(target: "ds.mqtt", code = ?ack.code, "broker refused connection");
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    self.connected.store(false, Ordering::Release);
                    warn!(target: "ds.mqtt", "broker closed session");
                }
                Ok(_) => {}
                Err(err) => {
                    if self.connected.swap(false, Ordering::AcqRel) {
                        warn!(target: "ds.mqtt", error = %err, "broker connection lost");
                    } else {
                        debug!(target: "ds.mqtt", error = %err, "broker unavailable");
                    }
                    tokio::select! {
                        _ = shutdown.wait() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }
        self.connected.store(false, Ordering::Release);
    }

    pub async fn disconnect(&self) {
        if let Err(err) = self.client.disconnect().await {
            debug!(target: "ds.mqtt", error = %err, "disconnect request failed");
        }
    }
}

impl SnapshotPublisher for MqttPublisher {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn try_publish(&self, payload: Vec<u8>) -> Result<(), ForwarderError> {
        self.client
            .try_publish(self.topic.as_str(), self.qos, self.retain, payload)
            .map_err(|err| ForwarderError::Publish(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueuedSnapshot;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        connected: AtomicBool,
        fail_after: Option<usize>,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl SnapshotPublisher for Recorder {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::Relaxed)
        }

        fn try_publish(&self, payload: Vec<u8>) -> Result<(), ForwarderError> {
            let mut sent = self.sent.lock().unwrap();
            if self.fail_after.is_some_and(|limit| sent.len() >= limit) {
                return Err(ForwarderError::Publish("request queue full".to_string()));
            }
            sent.push(payload);
            Ok(())
        }
    }

    fn filled_queue(count: u64) -> SnapshotQueue {
        let queue = SnapshotQueue::new(16);
        for sequence in 1..=count {
            queue.push(QueuedSnapshot {
                sequence,
                timestamp_ms: 0,
                payload: sequence.to_string().into_bytes(),
            });
        }
        queue
    }

    #[test]
    fn drain_waits_for_connection() {
        let queue = filled_queue(3);
        let recorder = Recorder::default();
        assert_eq!(drain(&queue, &recorder), 0);
        assert_eq!(queue.len(), 3);

        recorder.connected.store(true, Ordering::Relaxed);
        assert_eq!(drain(&queue, &recorder), 3);
        assert!(queue.is_empty());
        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.as_slice(), [b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
    }

    #[test]
    fn failed_publish_keeps_item_at_head() {
        let queue = filled_queue(3);
        let recorder = Recorder {
            connected: AtomicBool::new(true),
            fail_after: Some(1),
            ..Default::default()
        };
        assert_eq!(drain(&queue, &recorder), 1);
        assert_eq!(queue.sequences(), [2, 3]);
    }

    #[test]
    fn unknown_qos_defaults_to_at_least_once() {
        assert_eq!(qos_from_u8(0), QoS::AtMostOnce);
        assert_eq!(qos_from_u8(2), QoS::ExactlyOnce);
        assert_eq!(qos_from_u8(9), QoS::AtLeastOnce);
    }
}
