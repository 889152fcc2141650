//! SNMP v2c 报文的 BER 编解码（仅覆盖 SNMP 用到的类型子集）。

use crate::error::ProtocolError;
use std::fmt;
use std::str::FromStr;

pub mod tag {
    pub const INTEGER: u8 = 0x02;
    pub const OCTET_STRING: u8 = 0x04;
    pub const NULL: u8 = 0x05;
    pub const OBJECT_ID: u8 = 0x06;
    pub const SEQUENCE: u8 = 0x30;
    pub const IP_ADDRESS: u8 = 0x40;
    pub const COUNTER32: u8 = 0x41;
    pub const GAUGE32: u8 = 0x42;
    pub const TIME_TICKS: u8 = 0x43;
    pub const COUNTER64: u8 = 0x46;
    pub const NO_SUCH_OBJECT: u8 = 0x80;
    pub const NO_SUCH_INSTANCE: u8 = 0x81;
    pub const END_OF_MIB_VIEW: u8 = 0x82;
    pub const GET_REQUEST: u8 = 0xA0;
    pub const GET_NEXT_REQUEST: u8 = 0xA1;
    pub const RESPONSE: u8 = 0xA2;
    pub const SET_REQUEST: u8 = 0xA3;
    pub const GET_BULK_REQUEST: u8 = 0xA5;
}

/// SNMP 版本字段：v2c 为 1。
pub const VERSION_2C: i64 = 1;

/// 对象标识符。派生的字典序与 OID 的词典序一致。
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Oid(pub Vec<u32>);

impl Oid {
    pub fn arcs(&self) -> &[u32] {
        &self.0
    }

    pub fn starts_with(&self, prefix: &Oid) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// 追加若干弧。
    pub fn child(&self, arcs: &[u32]) -> Oid {
        let mut oid = self.0.clone();
        oid.extend_from_slice(arcs);
        Oid(oid)
    }

    fn encode_content(&self, out: &mut Vec<u8>) {
        let arcs = &self.0;
        let (first, rest) = match arcs.len() {
            0 => (0, &arcs[..]),
            1 => (arcs[0] * 40, &arcs[1..]),
            _ => (arcs[0] * 40 + arcs[1], &arcs[2..]),
        };
        encode_base128(first, out);
        for arc in rest {
            encode_base128(*arc, out);
        }
    }

    fn decode_content(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut arcs = Vec::new();
        let mut current: u32 = 0;
        for (index, byte) in bytes.iter().enumerate() {
            current = current
                .checked_mul(128)
                .and_then(|value| value.checked_add(u32::from(byte & 0x7F)))
                .ok_or_else(|| ProtocolError::decode("oid arc overflow"))?;
            if byte & 0x80 == 0 {
                if arcs.is_empty() {
                    let first = (current / 40).min(2);
                    arcs.push(first);
                    arcs.push(current - first * 40);
                } else {
                    arcs.push(current);
                }
                current = 0;
            } else if index == bytes.len() - 1 {
                return Err(ProtocolError::decode("oid ends inside an arc"));
            }
        }
        Ok(Oid(arcs))
    }
}

fn encode_base128(mut value: u32, out: &mut Vec<u8>) {
    let mut chunk = [0u8; 5];
    let mut len = 0;
    loop {
        chunk[len] = (value & 0x7F) as u8;
        len += 1;
        value >>= 7;
        if value == 0 {
            break;
        }
    }
    for index in (0..len).rev() {
        let more = if index > 0 { 0x80 } else { 0 };
        out.push(chunk[index] | more);
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text: Vec<String> = self.0.iter().map(u32::to_string).collect();
        f.write_str(&text.join("."))
    }
}

impl FromStr for Oid {
    type Err = ProtocolError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        text.trim()
            .trim_start_matches('.')
            .split('.')
            .map(|arc| {
                arc.parse::<u32>()
                    .map_err(|_| ProtocolError::Config(format!("invalid oid {text:?}")))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Oid)
    }
}

/// 变量绑定中的值。
#[derive(Debug, Clone, PartialEq)]
pub enum SnmpValue {
    Integer(i64),
    OctetString(Vec<u8>),
    Null,
    ObjectId(Oid),
    IpAddress([u8; 4]),
    Counter32(u32),
    Gauge32(u32),
    TimeTicks(u32),
    Counter64(u64),
    NoSuchObject,
    NoSuchInstance,
    EndOfMibView,
}

impl SnmpValue {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            SnmpValue::Integer(value) => write_tlv(out, tag::INTEGER, &encode_signed(*value)),
            SnmpValue::OctetString(bytes) => write_tlv(out, tag::OCTET_STRING, bytes),
            SnmpValue::Null => write_tlv(out, tag::NULL, &[]),
            SnmpValue::ObjectId(oid) => {
                let mut content = Vec::new();
                oid.encode_content(&mut content);
                write_tlv(out, tag::OBJECT_ID, &content);
            }
            SnmpValue::IpAddress(octets) => write_tlv(out, tag::IP_ADDRESS, octets),
            SnmpValue::Counter32(value) => {
                write_tlv(out, tag::COUNTER32, &encode_unsigned(u64::from(*value)))
            }
            SnmpValue::Gauge32(value) => {
                write_tlv(out, tag::GAUGE32, &encode_unsigned(u64::from(*value)))
            }
            SnmpValue::TimeTicks(value) => {
                write_tlv(out, tag::TIME_TICKS, &encode_unsigned(u64::from(*value)))
            }
            SnmpValue::Counter64(value) => write_tlv(out, tag::COUNTER64, &encode_unsigned(*value)),
            SnmpValue::NoSuchObject => write_tlv(out, tag::NO_SUCH_OBJECT, &[]),
            SnmpValue::NoSuchInstance => write_tlv(out, tag::NO_SUCH_INSTANCE, &[]),
            SnmpValue::EndOfMibView => write_tlv(out, tag::END_OF_MIB_VIEW, &[]),
        }
    }

    fn decode(tag: u8, content: &[u8]) -> Result<Self, ProtocolError> {
        let value = match tag {
            tag::INTEGER => SnmpValue::Integer(decode_signed(content)?),
            tag::OCTET_STRING => SnmpValue::OctetString(content.to_vec()),
            tag::NULL => SnmpValue::Null,
            tag::OBJECT_ID => SnmpValue::ObjectId(Oid::decode_content(content)?),
            tag::IP_ADDRESS => {
                let octets: [u8; 4] = content
                    .try_into()
                    .map_err(|_| ProtocolError::decode("ip address must be 4 bytes"))?;
                SnmpValue::IpAddress(octets)
            }
            tag::COUNTER32 => SnmpValue::Counter32(decode_unsigned32(content)?),
            tag::GAUGE32 => SnmpValue::Gauge32(decode_unsigned32(content)?),
            tag::TIME_TICKS => SnmpValue::TimeTicks(decode_unsigned32(content)?),
            tag::COUNTER64 => SnmpValue::Counter64(decode_unsigned(content)?),
            tag::NO_SUCH_OBJECT => SnmpValue::NoSuchObject,
            tag::NO_SUCH_INSTANCE => SnmpValue::NoSuchInstance,
            tag::END_OF_MIB_VIEW => SnmpValue::EndOfMibView,
            other => {
                return Err(ProtocolError::decode(format!(
                    "unsupported value tag {other:#04x}"
                )));
            }
        };
        Ok(value)
    }
}

/// 变量绑定。
#[derive(Debug, Clone, PartialEq)]
pub struct VarBind {
    pub oid: Oid,
    pub value: SnmpValue,
}

impl VarBind {
    pub fn new(oid: Oid, value: SnmpValue) -> Self {
        Self { oid, value }
    }
}

/// PDU 类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduType {
    Get,
    GetNext,
    Response,
    Set,
    GetBulk,
}

impl PduType {
    fn tag(self) -> u8 {
        match self {
            PduType::Get => tag::GET_REQUEST,
            PduType::GetNext => tag::GET_NEXT_REQUEST,
            PduType::Response => tag::RESPONSE,
            PduType::Set => tag::SET_REQUEST,
            PduType::GetBulk => tag::GET_BULK_REQUEST,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            tag::GET_REQUEST => Some(PduType::Get),
            tag::GET_NEXT_REQUEST => Some(PduType::GetNext),
            tag::RESPONSE => Some(PduType::Response),
            tag::SET_REQUEST => Some(PduType::Set),
            tag::GET_BULK_REQUEST => Some(PduType::GetBulk),
            _ => None,
        }
    }
}

/// 协议数据单元。
///
/// GetBulk 复用两个整数字段：`error_status` 为 non-repeaters，
/// `error_index` 为 max-repetitions。
#[derive(Debug, Clone, PartialEq)]
pub struct Pdu {
    pub pdu_type: PduType,
    pub request_id: i32,
    pub error_status: i32,
    pub error_index: i32,
    pub varbinds: Vec<VarBind>,
}

/// SNMP 报文。
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub version: i64,
    pub community: Vec<u8>,
    pub pdu: Pdu,
}

impl Message {
    pub fn encode(&self) -> Vec<u8> {
        let mut varbinds = Vec::new();
        for varbind in &self.pdu.varbinds {
            let mut item = Vec::new();
            SnmpValue::ObjectId(varbind.oid.clone()).encode(&mut item);
            varbind.value.encode(&mut item);
            write_tlv(&mut varbinds, tag::SEQUENCE, &item);
        }

        let mut pdu = Vec::new();
        SnmpValue::Integer(i64::from(self.pdu.request_id)).encode(&mut pdu);
        SnmpValue::Integer(i64::from(self.pdu.error_status)).encode(&mut pdu);
        SnmpValue::Integer(i64::from(self.pdu.error_index)).encode(&mut pdu);
        write_tlv(&mut pdu, tag::SEQUENCE, &varbinds);

        let mut body = Vec::new();
        SnmpValue::Integer(self.version).encode(&mut body);
        SnmpValue::OctetString(self.community.clone()).encode(&mut body);
        write_tlv(&mut body, self.pdu.pdu_type.tag(), &pdu);

        let mut out = Vec::with_capacity(body.len() + 4);
        write_tlv(&mut out, tag::SEQUENCE, &body);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut outer = Reader::new(bytes);
        let mut message = Reader::new(outer.expect(tag::SEQUENCE)?);
        let version = decode_signed(message.expect(tag::INTEGER)?)?;
        let community = message.expect(tag::OCTET_STRING)?.to_vec();

        let (pdu_tag, pdu_content) = message.read_tlv()?;
        let pdu_type = PduType::from_tag(pdu_tag)
            .ok_or_else(|| ProtocolError::decode(format!("unsupported pdu {pdu_tag:#04x}")))?;
        let mut pdu = Reader::new(pdu_content);
        let request_id = decode_i32(pdu.expect(tag::INTEGER)?)?;
        let error_status = decode_i32(pdu.expect(tag::INTEGER)?)?;
        let error_index = decode_i32(pdu.expect(tag::INTEGER)?)?;

        let mut list = Reader::new(pdu.expect(tag::SEQUENCE)?);
        let mut varbinds = Vec::new();
        while !list.is_empty() {
            let mut item = Reader::new(list.expect(tag::SEQUENCE)?);
            let oid = Oid::decode_content(item.expect(tag::OBJECT_ID)?)?;
            let (value_tag, value_content) = item.read_tlv()?;
            varbinds.push(VarBind::new(oid, SnmpValue::decode(value_tag, value_content)?));
        }

        Ok(Self {
            version,
            community,
            pdu: Pdu {
                pdu_type,
                request_id,
                error_status,
                error_index,
                varbinds,
            },
        })
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn read_tlv(&mut self) -> Result<(u8, &'a [u8]), ProtocolError> {
        let [tag, first, rest @ ..] = self.bytes else {
            return Err(ProtocolError::decode("tlv header truncated"));
        };
        let (length, rest) = if first & 0x80 == 0 {
            (usize::from(*first), rest)
        } else {
            let count = usize::from(first & 0x7F);
            if count == 0 || count > 4 || rest.len() < count {
                return Err(ProtocolError::decode("invalid length encoding"));
            }
            let length = rest[..count]
                .iter()
                .fold(0usize, |acc, byte| (acc << 8) | usize::from(*byte));
            (length, &rest[count..])
        };
        if rest.len() < length {
            return Err(ProtocolError::decode("tlv content truncated"));
        }
        let (content, remaining) = rest.split_at(length);
        self.bytes = remaining;
        Ok((*tag, content))
    }

    fn expect(&mut self, expected: u8) -> Result<&'a [u8], ProtocolError> {
        let (tag, content) = self.read_tlv()?;
        if tag != expected {
            return Err(ProtocolError::decode(format!(
                "expected tag {expected:#04x}, found {tag:#04x}"
            )));
        }
        Ok(content)
    }
}

fn write_tlv(out: &mut Vec<u8>, tag: u8, content: &[u8]) {
    out.push(tag);
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = (len as u32).to_be_bytes();
        let skip = bytes.iter().take_while(|byte| **byte == 0).count();
        out.push(0x80 | (4 - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
    out.extend_from_slice(content);
}

fn encode_signed(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

fn encode_unsigned(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|byte| **byte == 0).count().min(7);
    let mut out = Vec::with_capacity(9 - skip);
    if bytes[skip] & 0x80 != 0 {
        out.push(0);
    }
    out.extend_from_slice(&bytes[skip..]);
    out
}

fn decode_signed(content: &[u8]) -> Result<i64, ProtocolError> {
    if content.is_empty() || content.len() > 8 {
        return Err(ProtocolError::decode("invalid integer length"));
    }
    let fill = if content[0] & 0x80 != 0 { 0xFF } else { 0x00 };
    let mut bytes = [fill; 8];
    bytes[8 - content.len()..].copy_from_slice(content);
    Ok(i64::from_be_bytes(bytes))
}

fn decode_i32(content: &[u8]) -> Result<i32, ProtocolError> {
    i32::try_from(decode_signed(content)?)
        .map_err(|_| ProtocolError::decode("integer out of 32-bit range"))
}

fn decode_unsigned(content: &[u8]) -> Result<u64, ProtocolError> {
    let content = match content {
        [0, rest @ ..] if !rest.is_empty() => rest,
        other => other,
    };
    if content.is_empty() || content.len() > 8 {
        return Err(ProtocolError::decode("invalid unsigned length"));
    }
    Ok(content
        .iter()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)))
}

fn decode_unsigned32(content: &[u8]) -> Result<u32, ProtocolError> {
    u32::try_from(decode_unsigned(content)?)
        .map_err(|_| ProtocolError::decode("unsigned out of 32-bit range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(text: &str) -> Oid {
        text.parse().expect("oid")
    }

    #[test]
    fn integers_use_minimal_twos_complement() {
        assert_eq!(encode_signed(0), [0x00]);
        assert_eq!(encode_signed(127), [0x7F]);
        assert_eq!(encode_signed(128), [0x00, 0x80]);
        assert_eq!(encode_signed(-1), [0xFF]);
        assert_eq!(encode_signed(-129), [0xFF, 0x7F]);
        assert_eq!(decode_signed(&[0xFF, 0x7F]).expect("decode"), -129);
        assert_eq!(encode_unsigned(0x8000_0000), [0x00, 0x80, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn oid_content_encoding() {
        let mut out = Vec::new();
        oid("1.3.6.1.4.1.53864.1").encode_content(&mut out);
        assert_eq!(out, [0x2B, 0x06, 0x01, 0x04, 0x01, 0x83, 0xA4, 0x68, 0x01]);
        assert_eq!(Oid::decode_content(&out).expect("decode"), oid("1.3.6.1.4.1.53864.1"));
        assert_eq!(oid(".1.3.6").to_string(), "1.3.6");
        assert!("1.x.3".parse::<Oid>().is_err());
    }

    #[test]
    fn oid_order_is_lexicographic() {
        assert!(oid("1.3.6.1.2") < oid("1.3.6.1.10"));
        assert!(oid("1.3.6.1") < oid("1.3.6.1.0"));
    }

    #[test]
    fn decodes_net_snmp_get_request() {
        // snmpget -v2c -c public host 1.3.6.1.2.1.1.1.0
        let packet = [
            0x30, 0x29, 0x02, 0x01, 0x01, 0x04, 0x06, b'p', b'u', b'b', b'l', b'i', b'c', 0xA0,
            0x1C, 0x02, 0x04, 0x12, 0x34, 0x56, 0x78, 0x02, 0x01, 0x00, 0x02, 0x01, 0x00, 0x30,
            0x0E, 0x30, 0x0C, 0x06, 0x08, 0x2B, 0x06, 0x01, 0x02, 0x01, 0x01, 0x01, 0x00, 0x05,
            0x00,
        ];
        let message = Message::decode(&packet).expect("decode");
        assert_eq!(message.version, VERSION_2C);
        assert_eq!(message.community, b"public");
        assert_eq!(message.pdu.pdu_type, PduType::Get);
        assert_eq!(message.pdu.request_id, 0x1234_5678);
        assert_eq!(message.pdu.varbinds[0].oid, oid("1.3.6.1.2.1.1.1.0"));
        assert_eq!(message.pdu.varbinds[0].value, SnmpValue::Null);
        assert_eq!(message.encode(), packet);
    }

    #[test]
    fn long_form_lengths() {
        let message = Message {
            version: VERSION_2C,
            community: b"public".to_vec(),
            pdu: Pdu {
                pdu_type: PduType::Response,
                request_id: 1,
                error_status: 0,
                error_index: 0,
                varbinds: vec![VarBind::new(
                    oid("1.3.6.1.4.1.53864.1.1.0"),
                    SnmpValue::OctetString(vec![b'x'; 300]),
                )],
            },
        };
        let encoded = message.encode();
        assert_eq!(encoded[1], 0x82);
        assert_eq!(Message::decode(&encoded).expect("decode"), message);
    }

    #[test]
    fn truncated_packets_are_errors() {
        assert!(Message::decode(&[0x30, 0x05, 0x02, 0x01]).is_err());
        assert!(Message::decode(&[0x04, 0x00]).is_err());
    }
}
