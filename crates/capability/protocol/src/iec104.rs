//! IEC 60870-5-104 从站
//!
//! 信息对象地址 `IOA = ioa_base + 存储地址`。float 条目以短浮点（M_ME_NC_1）
//! 上送，int/bool 条目以标度化值（M_ME_NB_1）上送。
//!
//! 会话流程：
//! - STARTDT 之前只处理 U 帧，收到的 I 帧被丢弃
//! - 数据传输开启后，存储值变化时立即把变化的点位以突发（COT 3）上送，
//!   发布周期兜底补发遗漏的变化
//! - 每收到 8 个 I 帧回一个 S 帧确认
//! - 帧结构错误关闭该连接，不影响其他连接

use crate::apdu::{Apdu, Asdu, Cot, Element, UFunction, cause, read_apdu, type_id};
use crate::error::ProtocolError;
use crate::{bind_tcp, local_addr_or_unknown};
use domain::{DataType, Shutdown, Value};
use ds_store::DataStore;
use ds_telemetry::{record_protocol_rejection, record_protocol_write};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// 广播公共地址。
pub const BROADCAST_COMMON_ADDRESS: u16 = 0xFFFF;
/// 单个 ASDU 内的最大信息对象数。
const MAX_OBJECTS_PER_ASDU: usize = 30;
/// QDS 溢出位。
const QDS_OVERFLOW: u8 = 0x01;

/// IEC104 从站配置
#[derive(Debug, Clone)]
pub struct Iec104Config {
    pub bind_addr: String,
    pub common_address: u16,
    pub ioa_base: u32,
    pub publish_interval: Duration,
    /// 接收多少个 I 帧后发送 S 帧确认（w）。
    pub ack_window: u16,
}

impl Iec104Config {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            common_address: 1,
            ioa_base: 1,
            publish_interval: Duration::from_secs(1),
            ack_window: 8,
        }
    }
}

/// 存储值 → 监视方向信息元素。
pub fn measurement(value: Value, data_type: DataType) -> (u8, Element) {
    match data_type {
        DataType::Float => (
            type_id::M_ME_NC_1,
            Element::ShortFloat {
                value: value.as_f64() as f32,
                quality: 0,
            },
        ),
        DataType::Int | DataType::Bool => {
            let raw = value.as_i64();
            let clamped = raw.clamp(i64::from(i16::MIN), i64::from(i16::MAX));
            let quality = if clamped == raw { 0 } else { QDS_OVERFLOW };
            (
                type_id::M_ME_NB_1,
                Element::Scaled {
                    value: clamped as i16,
                    quality,
                },
            )
        }
    }
}

/// 控制方向信息元素 → 存储值。
pub fn command_value(element: &Element) -> Option<Value> {
    match element {
        Element::SingleCommand { sco } => Some(Value::Int(i64::from(sco & 0x01))),
        Element::SetpointScaled { value, .. } => Some(Value::Int(i64::from(*value))),
        Element::SetpointFloat { value, .. } => Some(Value::Float(f64::from(*value))),
        _ => None,
    }
}

/// IEC104 从站服务
pub struct Iec104Server {
    store: Arc<DataStore>,
    config: Arc<Iec104Config>,
}

impl Iec104Server {
    pub fn new(store: Arc<DataStore>, config: Iec104Config) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }

    /// 绑定并运行，直到收到关停信号。
    pub async fn run(self, shutdown: Shutdown) -> Result<(), ProtocolError> {
        let listener = bind_tcp(&self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    pub async fn serve(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), ProtocolError> {
        info!(
            target: "ds.iec104",
            addr = %local_addr_or_unknown(listener.local_addr()),
            common_address = self.config.common_address,
            "iec104 server listening"
        );
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(target: "ds.iec104", error = %err, "accept failed");
                            continue;
                        }
                    };
                    let store = self.store.clone();
                    let config = self.config.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, peer, store, config, shutdown).await {
                            warn!(target: "ds.iec104", %peer, error = %err, "connection closed with error");
                        }
                    });
                }
            }
        }
        info!(target: "ds.iec104", "iec104 server stopped");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    store: Arc<DataStore>,
    config: Arc<Iec104Config>,
    shutdown: Shutdown,
) -> Result<(), ProtocolError> {
    info!(target: "ds.iec104", %peer, "client connected");
    let (mut reader, mut writer) = stream.into_split();

    // 读端单独成任务，避免 read_exact 在 select 中被取消导致半帧丢失
    let (tx, mut rx) = mpsc::channel::<Result<Apdu, ProtocolError>>(32);
    let reader_task = tokio::spawn(async move {
        loop {
            match read_apdu(&mut reader).await {
                Ok(Some(apdu)) => {
                    if tx.send(Ok(apdu)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    break;
                }
            }
        }
    });

    let mut changes = store.subscribe_changes();
    let mut session = Session::new(store, config.clone());
    let mut ticker = tokio::time::interval(config.publish_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            _ = shutdown.wait() => break Ok(()),
            received = rx.recv() => {
                let apdu = match received {
                    None => break Ok(()),
                    Some(Err(err)) => break Err(err),
                    Some(Ok(apdu)) => apdu,
                };
                let replies = session.handle(apdu);
                if let Err(err) = send_all(&mut writer, &replies).await {
                    break Err(err);
                }
            }
            change = changes.recv(), if session.started => {
                if let Err(broadcast::error::RecvError::Lagged(skipped)) = change {
                    debug!(target: "ds.iec104", %peer, skipped, "change events lagged");
                }
                let frames = session.spontaneous();
                if let Err(err) = send_all(&mut writer, &frames).await {
                    break Err(err);
                }
            }
            _ = ticker.tick(), if session.started => {
                let frames = session.spontaneous();
                if let Err(err) = send_all(&mut writer, &frames).await {
                    break Err(err);
                }
            }
        }
    };

    reader_task.abort();
    info!(target: "ds.iec104", %peer, "client disconnected");
    result
}

async fn send_all<W>(writer: &mut W, frames: &[Apdu]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    for frame in frames {
        writer.write_all(&frame.encode()).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// 单个连接的会话状态。
pub struct Session {
    store: Arc<DataStore>,
    config: Arc<Iec104Config>,
    started: bool,
    send_seq: u16,
    recv_seq: u16,
    unacked: u16,
    /// 最近一次上送给该客户端的值（按存储地址）。
    published: HashMap<u32, Value>,
}

impl Session {
    pub fn new(store: Arc<DataStore>, config: Arc<Iec104Config>) -> Self {
        Self {
            store,
            config,
            started: false,
            send_seq: 0,
            recv_seq: 0,
            unacked: 0,
            published: HashMap::new(),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// 处理一个收到的 APDU，返回需要发送的帧。
    pub fn handle(&mut self, apdu: Apdu) -> Vec<Apdu> {
        match apdu {
            Apdu::U(function) => self.handle_u(function),
            Apdu::S { .. } => Vec::new(),
            Apdu::I { send_seq, asdu, .. } => {
                if !self.started {
                    debug!(target: "ds.iec104", "dropping I frame before STARTDT");
                    return Vec::new();
                }
                self.recv_seq = (send_seq + 1) % crate::apdu::SEQUENCE_MODULO;
                self.unacked += 1;
                let mut frames: Vec<Apdu> = self
                    .handle_asdu(asdu)
                    .into_iter()
                    .map(|asdu| self.i_frame(asdu))
                    .collect();
                if self.unacked >= self.config.ack_window {
                    frames.push(Apdu::S {
                        recv_seq: self.recv_seq,
                    });
                    self.unacked = 0;
                }
                frames
            }
        }
    }

    fn handle_u(&mut self, function: UFunction) -> Vec<Apdu> {
        match function {
            UFunction::StartDtAct => {
                self.started = true;
                self.mark_published();
                debug!(target: "ds.iec104", "data transfer started");
            }
            UFunction::StopDtAct => {
                self.started = false;
                debug!(target: "ds.iec104", "data transfer stopped");
            }
            _ => {}
        }
        function
            .confirmation()
            .map(|confirmation| vec![Apdu::U(confirmation)])
            .unwrap_or_default()
    }

    fn i_frame(&mut self, asdu: Asdu) -> Apdu {
        let frame = Apdu::I {
            send_seq: self.send_seq,
            recv_seq: self.recv_seq,
            asdu,
        };
        self.send_seq = (self.send_seq + 1) % crate::apdu::SEQUENCE_MODULO;
        frame
    }

    fn handle_asdu(&mut self, asdu: Asdu) -> Vec<Asdu> {
        if asdu.common_address != self.config.common_address
            && asdu.common_address != BROADCAST_COMMON_ADDRESS
        {
            debug!(target: "ds.iec104", common_address = asdu.common_address, "unknown common address");
            return vec![asdu.mirror(cause::UNKNOWN_COMMON_ADDRESS, true)];
        }
        match asdu.type_id {
            type_id::C_IC_NA_1 => self.interrogation(asdu),
            type_id::C_CS_NA_1 => match asdu.cot.cause {
                cause::ACTIVATION => vec![asdu.mirror(cause::ACTIVATION_CON, false)],
                _ => vec![asdu.mirror(cause::UNKNOWN_CAUSE, true)],
            },
            type_id::C_SC_NA_1 | type_id::C_SE_NB_1 | type_id::C_SE_NC_1 => self.command(asdu),
            other => {
                debug!(target: "ds.iec104", type_id = other, "unsupported type");
                vec![asdu.mirror(cause::UNKNOWN_TYPE, true)]
            }
        }
    }

    fn interrogation(&mut self, asdu: Asdu) -> Vec<Asdu> {
        match asdu.cot.cause {
            cause::ACTIVATION => {}
            cause::DEACTIVATION => return vec![asdu.mirror(cause::DEACTIVATION_CON, false)],
            _ => return vec![asdu.mirror(cause::UNKNOWN_CAUSE, true)],
        }
        let mut replies = vec![asdu.mirror(cause::ACTIVATION_CON, false)];
        let entries: Vec<(u32, Value, DataType)> = self
            .store
            .entries()
            .into_iter()
            .filter_map(|entry| entry.address.map(|address| (address, entry.value, entry.data_type)))
            .collect();
        replies.extend(self.measurements(&entries, cause::INTERROGATED_BY_STATION));
        for (address, value, _) in entries {
            self.published.insert(address, value);
        }
        replies.push(asdu.mirror(cause::ACTIVATION_TERM, false));
        replies
    }

    fn command(&mut self, asdu: Asdu) -> Vec<Asdu> {
        if asdu.cot.cause != cause::ACTIVATION {
            return vec![asdu.mirror(cause::UNKNOWN_CAUSE, true)];
        }
        let Some(object) = asdu.objects.first() else {
            return vec![asdu.mirror(cause::UNKNOWN_IOA, true)];
        };
        let address = object.ioa.checked_sub(self.config.ioa_base);
        let mapped = address.filter(|address| self.store.entry_by_address(*address).is_some());
        let Some(address) = mapped else {
            record_protocol_rejection();
            debug!(target: "ds.iec104", ioa = object.ioa, "command for unknown ioa");
            return vec![asdu.mirror(cause::UNKNOWN_IOA, true)];
        };
        if object.element.is_select() {
            return vec![asdu.mirror(cause::ACTIVATION_CON, false)];
        }
        let Some(value) = command_value(&object.element) else {
            return vec![asdu.mirror(cause::UNKNOWN_TYPE, true)];
        };

        match self.store.write(address, value) {
            Ok(outcome) => {
                record_protocol_write();
                debug!(
                    target: "ds.iec104",
                    ioa = object.ioa,
                    key = %outcome.key,
                    value = %outcome.value,
                    "command executed"
                );
                vec![asdu.mirror(cause::ACTIVATION_CON, false)]
            }
            Err(err) => {
                record_protocol_rejection();
                warn!(target: "ds.iec104", ioa = object.ioa, error = %err, "store rejected command");
                vec![asdu.mirror(cause::ACTIVATION_CON, true)]
            }
        }
    }

    /// 按类型分组、分块生成测量值 ASDU。
    fn measurements(&self, points: &[(u32, Value, DataType)], cause: u8) -> Vec<Asdu> {
        let mut floats = Vec::new();
        let mut scaled = Vec::new();
        for (address, value, data_type) in points {
            let ioa = self.config.ioa_base.saturating_add(*address);
            let (kind, element) = measurement(*value, *data_type);
            if kind == type_id::M_ME_NC_1 {
                floats.push((ioa, element));
            } else {
                scaled.push((ioa, element));
            }
        }

        let mut asdus = Vec::new();
        for (kind, objects) in [(type_id::M_ME_NC_1, floats), (type_id::M_ME_NB_1, scaled)] {
            for chunk in objects.chunks(MAX_OBJECTS_PER_ASDU) {
                let mut asdu = Asdu::new(kind, Cot::new(cause), self.config.common_address);
                for (ioa, element) in chunk {
                    asdu = asdu.with_object(*ioa, element.clone());
                }
                asdus.push(asdu);
            }
        }
        asdus
    }

    fn mark_published(&mut self) {
        self.published = self.store.address_space().into_iter().collect();
    }

    /// 生成自上次上送以来变化点位的突发帧。
    pub fn spontaneous(&mut self) -> Vec<Apdu> {
        if !self.started {
            return Vec::new();
        }
        let changed: Vec<(u32, Value, DataType)> = self
            .store
            .entries()
            .into_iter()
            .filter_map(|entry| {
                let address = entry.address?;
                (self.published.get(&address) != Some(&entry.value))
                    .then_some((address, entry.value, entry.data_type))
            })
            .collect();
        if changed.is_empty() {
            return Vec::new();
        }
        for (address, value, _) in &changed {
            self.published.insert(*address, *value);
        }
        self.measurements(&changed, cause::SPONTANEOUS)
            .into_iter()
            .map(|asdu| self.i_frame(asdu))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (Arc<DataStore>, Session) {
        let store = Arc::new(DataStore::with_default_schema());
        let session = Session::new(store.clone(), Arc::new(Iec104Config::new("127.0.0.1:0")));
        (store, session)
    }

    fn command(ioa: u32, element: Element) -> Apdu {
        Apdu::I {
            send_seq: 0,
            recv_seq: 0,
            asdu: Asdu::new(type_id::C_SE_NC_1, Cot::new(cause::ACTIVATION), 1)
                .with_object(ioa, element),
        }
    }

    fn asdus(frames: Vec<Apdu>) -> Vec<Asdu> {
        frames
            .into_iter()
            .filter_map(|frame| match frame {
                Apdu::I { asdu, .. } => Some(asdu),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn scaled_measurement_flags_overflow() {
        let (_, element) = measurement(Value::Int(40_000), DataType::Int);
        assert_eq!(
            element,
            Element::Scaled {
                value: i16::MAX,
                quality: QDS_OVERFLOW
            }
        );
    }

    #[test]
    fn i_frames_before_startdt_are_dropped() {
        let (store, mut session) = session();
        let frames = session.handle(command(
            1,
            Element::SetpointFloat {
                value: 3.0,
                qos: 0,
            },
        ));
        assert!(frames.is_empty());
        assert_eq!(store.read("temperature"), Value::Float(0.0));
    }

    #[test]
    fn setpoint_writes_store_and_confirms() {
        let (store, mut session) = session();
        session.handle(Apdu::U(UFunction::StartDtAct));
        let replies = asdus(session.handle(command(
            1,
            Element::SetpointFloat {
                value: 21.5,
                qos: 0,
            },
        )));
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].cot.cause, cause::ACTIVATION_CON);
        assert!(!replies[0].cot.negative);
        assert_eq!(store.read("temperature"), Value::Float(21.5));
    }

    #[test]
    fn select_only_does_not_write() {
        let (store, mut session) = session();
        session.handle(Apdu::U(UFunction::StartDtAct));
        session.handle(command(
            1,
            Element::SetpointFloat {
                value: 5.0,
                qos: 0x80,
            },
        ));
        assert_eq!(store.read("temperature"), Value::Float(0.0));
    }

    #[test]
    fn unknown_ioa_and_common_address_are_negative() {
        let (_, mut session) = session();
        session.handle(Apdu::U(UFunction::StartDtAct));
        let replies = asdus(session.handle(command(
            500,
            Element::SetpointFloat {
                value: 1.0,
                qos: 0,
            },
        )));
        assert_eq!(replies[0].cot.cause, cause::UNKNOWN_IOA);
        assert!(replies[0].cot.negative);

        let foreign = Apdu::I {
            send_seq: 1,
            recv_seq: 0,
            asdu: Asdu::new(type_id::C_IC_NA_1, Cot::new(cause::ACTIVATION), 7)
                .with_object(0, Element::Interrogation { qoi: 20 }),
        };
        let replies = asdus(session.handle(foreign));
        assert_eq!(replies[0].cot.cause, cause::UNKNOWN_COMMON_ADDRESS);
    }

    #[test]
    fn s_frame_sent_after_ack_window() {
        let (_, mut session) = session();
        session.handle(Apdu::U(UFunction::StartDtAct));
        let mut acks = Vec::new();
        for seq in 0..8u16 {
            let frames = session.handle(Apdu::I {
                send_seq: seq,
                recv_seq: 0,
                asdu: Asdu::new(type_id::C_CS_NA_1, Cot::new(cause::ACTIVATION), 1)
                    .with_object(0, Element::ClockSync { time: [0; 7] }),
            });
            acks.extend(
                frames
                    .into_iter()
                    .filter(|frame| matches!(frame, Apdu::S { .. })),
            );
        }
        assert_eq!(acks, vec![Apdu::S { recv_seq: 8 }]);
    }

    #[test]
    fn spontaneous_reports_only_changes() {
        let (store, mut session) = session();
        session.handle(Apdu::U(UFunction::StartDtAct));
        assert!(session.spontaneous().is_empty());

        store.write("humidity", Value::Float(40.0)).expect("write");
        let replies = asdus(session.spontaneous());
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].cot.cause, cause::SPONTANEOUS);
        assert_eq!(replies[0].objects[0].ioa, 2);
        assert!(session.spontaneous().is_empty());
    }
}
