//! Modbus TCP 服务端
//!
//! 保持寄存器与输入寄存器共用一张表：寄存器号 `r` 即存储地址 `r`。
//!
//! | 条目类型 | 寄存器编码 |
//! |---------|-----------|
//! | float   | 值 × 10，四舍五入 |
//! | int / bool | 值 × 1 |
//!
//! 寄存器按有符号 16 位解释，超出范围时截断到 `i16::MIN..=i16::MAX`。

use crate::error::ProtocolError;
use crate::{bind_tcp, local_addr_or_unknown};
use domain::{DataType, Shutdown, Value};
use ds_store::DataStore;
use ds_telemetry::{record_protocol_rejection, record_protocol_write};
use std::future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_modbus::prelude::*;
use tokio_modbus::server::tcp::{Server, accept_tcp_connection};
use tracing::{debug, info, warn};

/// 单次读取的最大寄存器数（FC03/FC04）。
pub const MAX_READ_QUANTITY: u16 = 125;
/// 单次写入的最大寄存器数（FC16）。
pub const MAX_WRITE_QUANTITY: u16 = 123;

/// 浮点条目的寄存器缩放系数。
pub const FLOAT_SCALE: f64 = 10.0;

/// Modbus TCP 服务端配置
#[derive(Debug, Clone)]
pub struct ModbusConfig {
    pub bind_addr: String,
}

impl ModbusConfig {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
        }
    }
}

fn scale_for(data_type: DataType) -> f64 {
    match data_type {
        DataType::Float => FLOAT_SCALE,
        DataType::Int | DataType::Bool => 1.0,
    }
}

/// 存储值 → 寄存器字。
pub fn encode_register(value: Value, data_type: DataType) -> u16 {
    let scaled = (value.as_f64() * scale_for(data_type)).round();
    scaled.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16 as u16
}

/// 寄存器字 → 存储值。
pub fn decode_register(raw: u16, data_type: DataType) -> Value {
    let signed = raw as i16;
    match data_type {
        DataType::Float => Value::Float(f64::from(signed) / FLOAT_SCALE),
        DataType::Int | DataType::Bool => Value::Int(i64::from(signed)),
    }
}

/// 寄存器表服务：每个连接持有一份克隆。
#[derive(Clone)]
pub struct RegisterService {
    store: Arc<DataStore>,
}

impl RegisterService {
    pub fn new(store: Arc<DataStore>) -> Self {
        Self { store }
    }

    /// 处理一个请求，返回响应或 Modbus 异常码。
    pub fn handle(&self, request: Request<'_>) -> Result<Response, ExceptionCode> {
        match request {
            Request::ReadHoldingRegisters(start, quantity) => self
                .read_registers(start, quantity)
                .map(Response::ReadHoldingRegisters),
            Request::ReadInputRegisters(start, quantity) => self
                .read_registers(start, quantity)
                .map(Response::ReadInputRegisters),
            Request::WriteSingleRegister(address, word) => self
                .write_registers(address, std::slice::from_ref(&word))
                .map(|()| Response::WriteSingleRegister(address, word)),
            Request::WriteMultipleRegisters(start, words) => {
                let quantity = u16::try_from(words.len()).map_err(|_| ExceptionCode::IllegalDataValue)?;
                if quantity == 0 || quantity > MAX_WRITE_QUANTITY {
                    return Err(ExceptionCode::IllegalDataValue);
                }
                self.write_registers(start, &words)
                    .map(|()| Response::WriteMultipleRegisters(start, quantity))
            }
            other => {
                debug!(target: "ds.modbus", request = ?other, "unsupported function");
                Err(ExceptionCode::IllegalFunction)
            }
        }
    }

    fn read_registers(&self, start: u16, quantity: u16) -> Result<Vec<u16>, ExceptionCode> {
        if quantity == 0 || quantity > MAX_READ_QUANTITY {
            return Err(ExceptionCode::IllegalDataValue);
        }
        if u32::from(start) + u32::from(quantity) > 0x1_0000 {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        let registers = self
            .store
            .typed_window(u32::from(start), u32::from(quantity))
            .into_iter()
            .map(|slot| slot.map_or(0, |(value, data_type)| encode_register(value, data_type)))
            .collect();
        Ok(registers)
    }

    /// 先校验全部寄存器均已映射，再逐个写入。
    fn write_registers(&self, start: u16, words: &[u16]) -> Result<(), ExceptionCode> {
        let count = words.len() as u32;
        if u32::from(start) + count > 0x1_0000 {
            record_protocol_rejection();
            return Err(ExceptionCode::IllegalDataAddress);
        }
        let types = self
            .store
            .typed_window(u32::from(start), count)
            .into_iter()
            .map(|slot| slot.map(|(_, data_type)| data_type))
            .collect::<Option<Vec<_>>>();
        let Some(types) = types else {
            record_protocol_rejection();
            debug!(target: "ds.modbus", start, count, "write to unmapped register");
            return Err(ExceptionCode::IllegalDataAddress);
        };

        for (offset, (word, data_type)) in words.iter().zip(types).enumerate() {
            let address = u32::from(start) + offset as u32;
            let value = decode_register(*word, data_type);
            match self.store.write(address, value) {
                Ok(outcome) => {
                    record_protocol_write();
                    debug!(
                        target: "ds.modbus",
                        address,
                        key = %outcome.key,
                        value = %outcome.value,
                        "register written"
                    );
                }
                Err(err) => {
                    record_protocol_rejection();
                    warn!(target: "ds.modbus", address, error = %err, "store rejected register write");
                    return Err(ExceptionCode::ServerDeviceFailure);
                }
            }
        }
        Ok(())
    }
}

impl tokio_modbus::server::Service for RegisterService {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, request: Self::Request) -> Self::Future {
        future::ready(self.handle(request))
    }
}

/// Modbus TCP 服务端
pub struct ModbusServer {
    store: Arc<DataStore>,
    config: ModbusConfig,
}

impl ModbusServer {
    pub fn new(store: Arc<DataStore>, config: ModbusConfig) -> Self {
        Self { store, config }
    }

    /// 绑定并运行，直到收到关停信号。
    pub async fn run(self, shutdown: Shutdown) -> Result<(), ProtocolError> {
        let listener = bind_tcp(&self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// 在已绑定的监听器上服务。
    pub async fn serve(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), ProtocolError> {
        info!(
            target: "ds.modbus",
            addr = %local_addr_or_unknown(listener.local_addr()),
            "modbus server listening"
        );
        let service = RegisterService::new(self.store);
        let server = Server::new(listener);
        let on_connected = move |stream: TcpStream, peer: SocketAddr| {
            let service = service.clone();
            async move {
                debug!(target: "ds.modbus", %peer, "client connected");
                accept_tcp_connection(stream, peer, move |_| Ok(Some(service.clone())))
            }
        };
        let on_process_error = |err: std::io::Error| {
            warn!(target: "ds.modbus", error = %err, "connection processing failed");
        };

        tokio::select! {
            result = server.serve(&on_connected, on_process_error) => {
                result?;
            }
            _ = shutdown.wait() => {}
        }
        info!(target: "ds.modbus", "modbus server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ds_store::Registration;
    use std::borrow::Cow;

    fn service() -> (Arc<DataStore>, RegisterService) {
        let store = Arc::new(DataStore::with_default_schema());
        (store.clone(), RegisterService::new(store))
    }

    #[test]
    fn float_registers_are_scaled_by_ten() {
        assert_eq!(encode_register(Value::Float(23.5), DataType::Float), 235);
        assert_eq!(encode_register(Value::Float(-1.26), DataType::Float), (-13i16) as u16);
        assert_eq!(decode_register(655, DataType::Float), Value::Float(65.5));
        assert_eq!(decode_register((-5i16) as u16, DataType::Float), Value::Float(-0.5));
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        assert_eq!(encode_register(Value::Float(5000.0), DataType::Float), i16::MAX as u16);
        assert_eq!(encode_register(Value::Int(-100_000), DataType::Int), i16::MIN as u16);
        assert_eq!(encode_register(Value::Int(1), DataType::Bool), 1);
    }

    #[test]
    fn unmapped_registers_read_zero() {
        let (store, service) = service();
        store.write("status", Value::Int(7)).expect("write");
        let response = service
            .handle(Request::ReadHoldingRegisters(2, 4))
            .expect("read");
        assert_eq!(response, Response::ReadHoldingRegisters(vec![0, 7, 0, 0]));
    }

    #[test]
    fn read_quantity_and_range_are_validated() {
        let (_, service) = service();
        assert_eq!(
            service.handle(Request::ReadInputRegisters(0, 0)),
            Err(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(
            service.handle(Request::ReadInputRegisters(0, 126)),
            Err(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(
            service.handle(Request::ReadInputRegisters(65_530, 10)),
            Err(ExceptionCode::IllegalDataAddress)
        );
    }

    #[test]
    fn multi_write_is_all_or_nothing_on_unmapped_address() {
        let (store, service) = service();
        let result = service.handle(Request::WriteMultipleRegisters(
            2,
            Cow::Owned(vec![100, 5, 9]),
        ));
        assert_eq!(result, Err(ExceptionCode::IllegalDataAddress));
        assert_eq!(store.read("pressure"), Value::Float(0.0));
        assert_eq!(store.read("status"), Value::Int(0));
    }

    #[test]
    fn single_write_goes_through_store() {
        let (store, service) = service();
        store
            .register(Registration::new("valve").at(9).with_type(DataType::Bool))
            .expect("register");
        let response = service
            .handle(Request::WriteSingleRegister(0, 215))
            .expect("write");
        assert_eq!(response, Response::WriteSingleRegister(0, 215));
        assert_eq!(store.read("temperature"), Value::Float(21.5));

        service
            .handle(Request::WriteSingleRegister(9, 3))
            .expect("write bool");
        assert_eq!(store.read("valve"), Value::Int(1));
    }

    #[test]
    fn other_functions_are_illegal() {
        let (_, service) = service();
        assert_eq!(
            service.handle(Request::ReadCoils(0, 1)),
            Err(ExceptionCode::IllegalFunction)
        );
    }
}
