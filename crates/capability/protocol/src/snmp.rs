//! SNMP v2c 代理
//!
//! 存储地址 `a` 对应 OID `base.(a+1).0`：int/bool 条目以 INTEGER 暴露，
//! float 条目以十进制文本（OCTET STRING）暴露。
//!
//! 团体名不符或版本不是 v2c 的报文直接丢弃，不回应；无法解码的报文
//! 记录日志后丢弃。

use crate::ber::{Message, Oid, Pdu, PduType, SnmpValue, VERSION_2C, VarBind};
use crate::error::ProtocolError;
use crate::{bind_udp, local_addr_or_unknown};
use domain::{DataType, Shutdown, Value};
use ds_store::{DataStore, EntrySnapshot};
use ds_telemetry::{record_protocol_rejection, record_protocol_write};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// 默认企业子树。
pub const DEFAULT_BASE_OID: &str = "1.3.6.1.4.1.53864.1";
/// GetBulk 单次响应的变量绑定上限。
const MAX_BULK_VARBINDS: usize = 512;
const MAX_DATAGRAM: usize = 65_535;

/// error-status 取值。
pub mod error_status {
    pub const NO_ERROR: i32 = 0;
    pub const WRONG_TYPE: i32 = 7;
    pub const COMMIT_FAILED: i32 = 14;
    pub const NOT_WRITABLE: i32 = 17;
}

/// SNMP 代理配置
#[derive(Debug, Clone)]
pub struct SnmpConfig {
    pub bind_addr: String,
    pub community: String,
    pub base_oid: Oid,
}

impl SnmpConfig {
    pub fn new(bind_addr: impl Into<String>, community: impl Into<String>, base_oid: &str) -> Result<Self, ProtocolError> {
        Ok(Self {
            bind_addr: bind_addr.into(),
            community: community.into(),
            base_oid: base_oid.parse()?,
        })
    }
}

/// SNMP v2c 代理
pub struct SnmpAgent {
    store: Arc<DataStore>,
    config: SnmpConfig,
}

impl SnmpAgent {
    pub fn new(store: Arc<DataStore>, config: SnmpConfig) -> Self {
        Self { store, config }
    }

    /// 存储地址对应的 OID；`u32::MAX` 无法映射为 `a+1`，返回 `None`。
    pub fn oid_for(&self, address: u32) -> Option<Oid> {
        let index = address.checked_add(1)?;
        Some(self.config.base_oid.child(&[index, 0]))
    }

    /// OID 对应的存储地址（必须形如 `base.(a+1).0`）。
    pub fn address_for(&self, oid: &Oid) -> Option<u32> {
        if !oid.starts_with(&self.config.base_oid) {
            return None;
        }
        match &oid.arcs()[self.config.base_oid.arcs().len()..] {
            [index, 0] if *index > 0 => Some(index - 1),
            _ => None,
        }
    }

    fn encode_value(entry: &EntrySnapshot) -> SnmpValue {
        match entry.data_type {
            DataType::Float => SnmpValue::OctetString(entry.value.to_string().into_bytes()),
            DataType::Int | DataType::Bool => SnmpValue::Integer(entry.value.as_i64()),
        }
    }

    fn get(&self, oid: &Oid) -> SnmpValue {
        self.address_for(oid)
            .and_then(|address| self.store.entry_by_address(address))
            .map(|entry| Self::encode_value(&entry))
            .unwrap_or(SnmpValue::NoSuchObject)
    }

    /// 字典序上严格大于 `oid` 的第一个已映射对象的最小地址；超出子树返回 `None`。
    fn first_candidate(&self, oid: &Oid) -> Option<u32> {
        let base = &self.config.base_oid;
        if !oid.starts_with(base) {
            return (oid < base).then_some(0);
        }
        match &oid.arcs()[base.arcs().len()..] {
            [] | [0, ..] => Some(0),
            // base.i 排在 base.i.0 之前
            [index] => Some(index - 1),
            // base.i.x 不小于 base.i.0，只能取后面的地址
            [index, ..] => Some(*index),
        }
    }

    fn get_next(&self, oid: &Oid) -> VarBind {
        let next = self
            .first_candidate(oid)
            .and_then(|min| self.store.next_addressed(min.checked_sub(1)))
            .and_then(|entry| {
                let oid = entry.address.and_then(|address| self.oid_for(address))?;
                Some((oid, entry))
            });
        match next {
            Some((next_oid, entry)) => VarBind::new(next_oid, Self::encode_value(&entry)),
            None => VarBind::new(oid.clone(), SnmpValue::EndOfMibView),
        }
    }

    fn get_bulk(&self, pdu: &Pdu) -> Vec<VarBind> {
        let non_repeaters = usize::try_from(pdu.error_status.max(0)).unwrap_or(0);
        let max_repetitions = usize::try_from(pdu.error_index.max(0)).unwrap_or(0);
        let (fixed, repeaters) = pdu.varbinds.split_at(non_repeaters.min(pdu.varbinds.len()));

        let mut results: Vec<VarBind> = fixed.iter().map(|vb| self.get_next(&vb.oid)).collect();
        let mut cursors: Vec<Oid> = repeaters.iter().map(|vb| vb.oid.clone()).collect();
        for _ in 0..max_repetitions {
            if cursors.is_empty() || results.len() >= MAX_BULK_VARBINDS {
                break;
            }
            let mut all_done = true;
            for cursor in cursors.iter_mut() {
                let next = self.get_next(cursor);
                if next.value != SnmpValue::EndOfMibView {
                    all_done = false;
                }
                *cursor = next.oid.clone();
                results.push(next);
            }
            if all_done {
                break;
            }
        }
        results.truncate(MAX_BULK_VARBINDS);
        results
    }

    /// 校验 Set 的值类型，返回待写入的存储值或 error-status。
    fn set_value<'a>(&self, varbind: &'a VarBind) -> Result<(&'a Oid, u32, Value), i32> {
        let Some((address, entry)) = self
            .address_for(&varbind.oid)
            .and_then(|address| self.store.entry_by_address(address).map(|entry| (address, entry)))
        else {
            return Err(error_status::NOT_WRITABLE);
        };
        let integer = match &varbind.value {
            SnmpValue::Integer(value) => Some(*value),
            SnmpValue::Gauge32(value) | SnmpValue::Counter32(value) => Some(i64::from(*value)),
            _ => None,
        };
        let value = match entry.data_type {
            DataType::Int | DataType::Bool => integer.map(Value::Int),
            DataType::Float => match &varbind.value {
                SnmpValue::OctetString(bytes) => std::str::from_utf8(bytes)
                    .ok()
                    .and_then(|text| text.trim().parse::<f64>().ok())
                    .map(Value::Float),
                SnmpValue::Integer(value) => Some(Value::Float(*value as f64)),
                _ => None,
            },
        };
        value
            .map(|value| (&varbind.oid, address, value))
            .ok_or(error_status::WRONG_TYPE)
    }

    fn set(&self, pdu: &Pdu) -> (i32, i32, Vec<VarBind>) {
        let mut writes = Vec::with_capacity(pdu.varbinds.len());
        for (index, varbind) in pdu.varbinds.iter().enumerate() {
            match self.set_value(varbind) {
                Ok(write) => writes.push(write),
                Err(status) => {
                    record_protocol_rejection();
                    debug!(target: "ds.snmp", oid = %varbind.oid, status, "set rejected");
                    return (status, index as i32 + 1, pdu.varbinds.clone());
                }
            }
        }

        let mut results = Vec::with_capacity(writes.len());
        for (index, (oid, address, value)) in writes.into_iter().enumerate() {
            match self.store.write(address, value) {
                Ok(outcome) => {
                    record_protocol_write();
                    debug!(target: "ds.snmp", key = %outcome.key, value = %outcome.value, "set committed");
                    let value = self.get(oid);
                    results.push(VarBind::new(oid.clone(), value));
                }
                Err(err) => {
                    record_protocol_rejection();
                    warn!(target: "ds.snmp", address, error = %err, "store rejected set");
                    return (error_status::COMMIT_FAILED, index as i32 + 1, pdu.varbinds.clone());
                }
            }
        }
        (error_status::NO_ERROR, 0, results)
    }

    /// 处理一个请求报文，返回应答报文；需要丢弃时返回 `None`。
    pub fn handle(&self, request: &Message) -> Option<Message> {
        if request.version != VERSION_2C {
            debug!(target: "ds.snmp", version = request.version, "dropping non-v2c packet");
            return None;
        }
        if request.community != self.config.community.as_bytes() {
            debug!(target: "ds.snmp", "dropping packet with wrong community");
            return None;
        }

        let pdu = &request.pdu;
        let (error_status, error_index, varbinds) = match pdu.pdu_type {
            PduType::Get => (
                error_status::NO_ERROR,
                0,
                pdu.varbinds
                    .iter()
                    .map(|vb| VarBind::new(vb.oid.clone(), self.get(&vb.oid)))
                    .collect(),
            ),
            PduType::GetNext => (
                error_status::NO_ERROR,
                0,
                pdu.varbinds.iter().map(|vb| self.get_next(&vb.oid)).collect(),
            ),
            PduType::GetBulk => (error_status::NO_ERROR, 0, self.get_bulk(pdu)),
            PduType::Set => self.set(pdu),
            PduType::Response => return None,
        };

        Some(Message {
            version: request.version,
            community: request.community.clone(),
            pdu: Pdu {
                pdu_type: PduType::Response,
                request_id: pdu.request_id,
                error_status,
                error_index,
                varbinds,
            },
        })
    }

    /// 处理原始数据报。
    pub fn handle_datagram(&self, datagram: &[u8]) -> Option<Vec<u8>> {
        match Message::decode(datagram) {
            Ok(request) => self.handle(&request).map(|response| response.encode()),
            Err(err) => {
                debug!(target: "ds.snmp", error = %err, bytes = datagram.len(), "dropping undecodable packet");
                None
            }
        }
    }

    /// 绑定并运行，直到收到关停信号。
    pub async fn run(self, shutdown: Shutdown) -> Result<(), ProtocolError> {
        let socket = bind_udp(&self.config.bind_addr).await?;
        self.serve(socket, shutdown).await
    }

    pub async fn serve(self, socket: UdpSocket, shutdown: Shutdown) -> Result<(), ProtocolError> {
        info!(
            target: "ds.snmp",
            addr = %local_addr_or_unknown(socket.local_addr()),
            base_oid = %self.config.base_oid,
            "snmp agent listening"
        );
        let mut buffer = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                received = socket.recv_from(&mut buffer) => {
                    let (len, peer) = match received {
                        Ok(received) => received,
                        Err(err) => {
                            warn!(target: "ds.snmp", error = %err, "receive failed");
                            continue;
                        }
                    };
                    let Some(response) = self.handle_datagram(&buffer[..len]) else {
                        continue;
                    };
                    if let Err(err) = socket.send_to(&response, peer).await {
                        warn!(target: "ds.snmp", %peer, error = %err, "send failed");
                    }
                }
            }
        }
        info!(target: "ds.snmp", "snmp agent stopped");
        Ok(())
    }
}
