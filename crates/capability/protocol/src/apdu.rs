//! IEC 60870-5-104 APDU 编解码
//!
//! ```text
//! APCI:  0x68 | 长度 | 控制域 4 字节
//! ASDU:  类型标识 | 可变结构限定词 | 传送原因(2) | 公共地址(2, LE) | 信息对象…
//! 信息对象: IOA(3, LE) | 信息元素
//! ```

use crate::error::ProtocolError;
use tokio::io::{AsyncRead, AsyncReadExt};

/// 启动字符。
pub const START_BYTE: u8 = 0x68;
/// APCI 长度字段允许的最大值（控制域 + ASDU）。
pub const MAX_APDU_LENGTH: usize = 253;
/// 序号模数（15 位）。
pub const SEQUENCE_MODULO: u16 = 1 << 15;

const ASDU_HEADER_LEN: usize = 6;
const IOA_LEN: usize = 3;

/// 类型标识。
pub mod type_id {
    pub const M_SP_NA_1: u8 = 1;
    pub const M_ME_NB_1: u8 = 11;
    pub const M_ME_NC_1: u8 = 13;
    pub const C_SC_NA_1: u8 = 45;
    pub const C_SE_NB_1: u8 = 49;
    pub const C_SE_NC_1: u8 = 50;
    pub const C_IC_NA_1: u8 = 100;
    pub const C_CS_NA_1: u8 = 103;
}

/// 传送原因。
pub mod cause {
    pub const SPONTANEOUS: u8 = 3;
    pub const ACTIVATION: u8 = 6;
    pub const ACTIVATION_CON: u8 = 7;
    pub const DEACTIVATION: u8 = 8;
    pub const DEACTIVATION_CON: u8 = 9;
    pub const ACTIVATION_TERM: u8 = 10;
    pub const INTERROGATED_BY_STATION: u8 = 20;
    pub const UNKNOWN_TYPE: u8 = 44;
    pub const UNKNOWN_CAUSE: u8 = 45;
    pub const UNKNOWN_COMMON_ADDRESS: u8 = 46;
    pub const UNKNOWN_IOA: u8 = 47;
}

/// U 帧功能。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UFunction {
    StartDtAct,
    StartDtCon,
    StopDtAct,
    StopDtCon,
    TestFrAct,
    TestFrCon,
}

impl UFunction {
    pub fn code(self) -> u8 {
        match self {
            UFunction::StartDtAct => 0x07,
            UFunction::StartDtCon => 0x0B,
            UFunction::StopDtAct => 0x13,
            UFunction::StopDtCon => 0x23,
            UFunction::TestFrAct => 0x43,
            UFunction::TestFrCon => 0x83,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x07 => Some(UFunction::StartDtAct),
            0x0B => Some(UFunction::StartDtCon),
            0x13 => Some(UFunction::StopDtAct),
            0x23 => Some(UFunction::StopDtCon),
            0x43 => Some(UFunction::TestFrAct),
            0x83 => Some(UFunction::TestFrCon),
            _ => None,
        }
    }

    /// 激活帧对应的确认帧。
    pub fn confirmation(self) -> Option<Self> {
        match self {
            UFunction::StartDtAct => Some(UFunction::StartDtCon),
            UFunction::StopDtAct => Some(UFunction::StopDtCon),
            UFunction::TestFrAct => Some(UFunction::TestFrCon),
            _ => None,
        }
    }
}

/// 传送原因字段（含 P/N 与试验位，以及源发站地址）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cot {
    pub cause: u8,
    pub negative: bool,
    pub test: bool,
    pub originator: u8,
}

impl Cot {
    pub fn new(cause: u8) -> Self {
        Self {
            cause,
            negative: false,
            test: false,
            originator: 0,
        }
    }

    fn encode(self) -> [u8; 2] {
        let mut first = self.cause & 0x3F;
        if self.negative {
            first |= 0x40;
        }
        if self.test {
            first |= 0x80;
        }
        [first, self.originator]
    }

    fn decode(bytes: [u8; 2]) -> Self {
        Self {
            cause: bytes[0] & 0x3F,
            negative: bytes[0] & 0x40 != 0,
            test: bytes[0] & 0x80 != 0,
            originator: bytes[1],
        }
    }
}

/// 信息元素。
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    /// 单点信息（SIQ）。
    SinglePoint { on: bool, quality: u8 },
    /// 标度化测量值 + QDS。
    Scaled { value: i16, quality: u8 },
    /// 短浮点测量值 + QDS。
    ShortFloat { value: f32, quality: u8 },
    /// 单命令（SCO 原始字节）。
    SingleCommand { sco: u8 },
    /// 标度化设点 + QOS。
    SetpointScaled { value: i16, qos: u8 },
    /// 短浮点设点 + QOS。
    SetpointFloat { value: f32, qos: u8 },
    /// 召唤限定词。
    Interrogation { qoi: u8 },
    /// CP56Time2a 时标。
    ClockSync { time: [u8; 7] },
    /// 未识别类型：保留原始字节以便镜像回送。
    Raw(Vec<u8>),
}

impl Element {
    fn width(type_id: u8) -> Option<usize> {
        use type_id::*;
        match type_id {
            M_SP_NA_1 | C_SC_NA_1 | C_IC_NA_1 => Some(1),
            M_ME_NB_1 | C_SE_NB_1 => Some(3),
            M_ME_NC_1 | C_SE_NC_1 => Some(5),
            C_CS_NA_1 => Some(7),
            _ => None,
        }
    }

    fn decode(type_id: u8, bytes: &[u8]) -> Self {
        use type_id::*;
        match type_id {
            M_SP_NA_1 => Element::SinglePoint {
                on: bytes[0] & 0x01 != 0,
                quality: bytes[0] & 0xF0,
            },
            M_ME_NB_1 => Element::Scaled {
                value: i16::from_le_bytes([bytes[0], bytes[1]]),
                quality: bytes[2],
            },
            M_ME_NC_1 => Element::ShortFloat {
                value: f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
                quality: bytes[4],
            },
            C_SC_NA_1 => Element::SingleCommand { sco: bytes[0] },
            C_SE_NB_1 => Element::SetpointScaled {
                value: i16::from_le_bytes([bytes[0], bytes[1]]),
                qos: bytes[2],
            },
            C_SE_NC_1 => Element::SetpointFloat {
                value: f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
                qos: bytes[4],
            },
            C_IC_NA_1 => Element::Interrogation { qoi: bytes[0] },
            C_CS_NA_1 => {
                let mut time = [0u8; 7];
                time.copy_from_slice(&bytes[..7]);
                Element::ClockSync { time }
            }
            _ => Element::Raw(bytes.to_vec()),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Element::SinglePoint { on, quality } => out.push(u8::from(*on) | (quality & 0xF0)),
            Element::Scaled { value, quality } => {
                out.extend_from_slice(&value.to_le_bytes());
                out.push(*quality);
            }
            Element::ShortFloat { value, quality } => {
                out.extend_from_slice(&value.to_le_bytes());
                out.push(*quality);
            }
            Element::SingleCommand { sco } => out.push(*sco),
            Element::SetpointScaled { value, qos } => {
                out.extend_from_slice(&value.to_le_bytes());
                out.push(*qos);
            }
            Element::SetpointFloat { value, qos } => {
                out.extend_from_slice(&value.to_le_bytes());
                out.push(*qos);
            }
            Element::Interrogation { qoi } => out.push(*qoi),
            Element::ClockSync { time } => out.extend_from_slice(time),
            Element::Raw(bytes) => out.extend_from_slice(bytes),
        }
    }

    /// 命令中的选择位（S/E = 1 表示仅选择，不执行）。
    pub fn is_select(&self) -> bool {
        match self {
            Element::SingleCommand { sco } => sco & 0x80 != 0,
            Element::SetpointScaled { qos, .. } | Element::SetpointFloat { qos, .. } => {
                qos & 0x80 != 0
            }
            _ => false,
        }
    }
}

/// 信息对象。
#[derive(Debug, Clone, PartialEq)]
pub struct InformationObject {
    pub ioa: u32,
    pub element: Element,
}

/// 应用服务数据单元。
#[derive(Debug, Clone, PartialEq)]
pub struct Asdu {
    pub type_id: u8,
    /// SQ 位：信息对象按连续 IOA 排列，仅第一个对象携带地址。
    pub sequence: bool,
    pub cot: Cot,
    pub common_address: u16,
    pub objects: Vec<InformationObject>,
}

impl Asdu {
    pub fn new(type_id: u8, cot: Cot, common_address: u16) -> Self {
        Self {
            type_id,
            sequence: false,
            cot,
            common_address,
            objects: Vec::new(),
        }
    }

    pub fn with_object(mut self, ioa: u32, element: Element) -> Self {
        self.objects.push(InformationObject { ioa, element });
        self
    }

    /// 复制本 ASDU 作为回复，替换传送原因与 P/N 位。
    pub fn mirror(&self, cause: u8, negative: bool) -> Self {
        let mut reply = self.clone();
        reply.cot.cause = cause;
        reply.cot.negative = negative;
        reply
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let count = self.objects.len().min(0x7F) as u8;
        out.push(self.type_id);
        out.push(if self.sequence { count | 0x80 } else { count });
        out.extend_from_slice(&self.cot.encode());
        out.extend_from_slice(&self.common_address.to_le_bytes());
        for (index, object) in self.objects.iter().take(usize::from(count)).enumerate() {
            if !self.sequence || index == 0 {
                out.extend_from_slice(&object.ioa.to_le_bytes()[..IOA_LEN]);
            }
            object.element.encode(out);
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < ASDU_HEADER_LEN {
            return Err(ProtocolError::decode("asdu header truncated"));
        }
        let type_id = bytes[0];
        let sequence = bytes[1] & 0x80 != 0;
        let count = usize::from(bytes[1] & 0x7F);
        let cot = Cot::decode([bytes[2], bytes[3]]);
        let common_address = u16::from_le_bytes([bytes[4], bytes[5]]);
        let mut body = &bytes[ASDU_HEADER_LEN..];

        let mut objects = Vec::with_capacity(count);
        match Element::width(type_id) {
            Some(width) if sequence => {
                let base = take_ioa(&mut body)?;
                for index in 0..count {
                    let element = take(&mut body, width)?;
                    objects.push(InformationObject {
                        ioa: base.wrapping_add(index as u32) & 0x00FF_FFFF,
                        element: Element::decode(type_id, element),
                    });
                }
            }
            Some(width) => {
                for _ in 0..count {
                    let ioa = take_ioa(&mut body)?;
                    let element = take(&mut body, width)?;
                    objects.push(InformationObject {
                        ioa,
                        element: Element::decode(type_id, element),
                    });
                }
            }
            None => {
                let ioa = if body.len() >= IOA_LEN { take_ioa(&mut body)? } else { 0 };
                objects.push(InformationObject {
                    ioa,
                    element: Element::Raw(body.to_vec()),
                });
                body = &[];
            }
        }
        if !body.is_empty() {
            return Err(ProtocolError::decode(format!(
                "{} trailing bytes after {count} objects of type {type_id}",
                body.len()
            )));
        }

        Ok(Self {
            type_id,
            sequence,
            cot,
            common_address,
            objects,
        })
    }
}

fn take<'a>(body: &mut &'a [u8], len: usize) -> Result<&'a [u8], ProtocolError> {
    if body.len() < len {
        return Err(ProtocolError::decode("information object truncated"));
    }
    let (head, rest) = body.split_at(len);
    *body = rest;
    Ok(head)
}

fn take_ioa(body: &mut &[u8]) -> Result<u32, ProtocolError> {
    let bytes = take(body, IOA_LEN)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]))
}

/// 应用协议数据单元。
#[derive(Debug, Clone, PartialEq)]
pub enum Apdu {
    I {
        send_seq: u16,
        recv_seq: u16,
        asdu: Asdu,
    },
    S {
        recv_seq: u16,
    },
    U(UFunction),
}

impl Apdu {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.push(START_BYTE);
        out.push(0);
        match self {
            Apdu::I {
                send_seq,
                recv_seq,
                asdu,
            } => {
                out.extend_from_slice(&(send_seq << 1).to_le_bytes());
                out.extend_from_slice(&(recv_seq << 1).to_le_bytes());
                asdu.encode(&mut out);
            }
            Apdu::S { recv_seq } => {
                out.extend_from_slice(&[0x01, 0x00]);
                out.extend_from_slice(&(recv_seq << 1).to_le_bytes());
            }
            Apdu::U(function) => out.extend_from_slice(&[function.code() | 0x03, 0, 0, 0]),
        }
        out[1] = (out.len() - 2).min(MAX_APDU_LENGTH) as u8;
        out
    }

    /// 解码不含起始字节与长度字段的帧体。
    pub fn decode_body(body: &[u8]) -> Result<Self, ProtocolError> {
        if body.len() < 4 {
            return Err(ProtocolError::decode("control field truncated"));
        }
        let control = [body[0], body[1], body[2], body[3]];
        if control[0] & 0x01 == 0 {
            let asdu = Asdu::decode(&body[4..])?;
            return Ok(Apdu::I {
                send_seq: u16::from_le_bytes([control[0], control[1]]) >> 1,
                recv_seq: u16::from_le_bytes([control[2], control[3]]) >> 1,
                asdu,
            });
        }
        if body.len() != 4 {
            return Err(ProtocolError::decode("S/U frame carries payload"));
        }
        if control[0] & 0x03 == 0x01 {
            return Ok(Apdu::S {
                recv_seq: u16::from_le_bytes([control[2], control[3]]) >> 1,
            });
        }
        UFunction::from_code(control[0] & 0xFC | 0x03)
            .map(Apdu::U)
            .ok_or_else(|| ProtocolError::decode(format!("unknown U frame {:#04x}", control[0])))
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        if frame.len() < 2 || frame[0] != START_BYTE {
            return Err(ProtocolError::decode("missing start byte"));
        }
        let length = usize::from(frame[1]);
        if frame.len() != length + 2 {
            return Err(ProtocolError::decode("length field mismatch"));
        }
        Self::decode_body(&frame[2..])
    }
}

/// 从流中读取一个完整 APDU。
///
/// 对端正常关闭返回 `Ok(None)`；起始字节或长度非法返回解析错误。
pub async fn read_apdu<R>(reader: &mut R) -> Result<Option<Apdu>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    if header[0] != START_BYTE {
        return Err(ProtocolError::decode(format!(
            "unexpected start byte {:#04x}",
            header[0]
        )));
    }
    let length = usize::from(header[1]);
    if !(4..=MAX_APDU_LENGTH).contains(&length) {
        return Err(ProtocolError::decode(format!("invalid apdu length {length}")));
    }
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Apdu::decode_body(&body).map(Some)
}
