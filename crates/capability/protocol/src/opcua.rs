//! OPC UA 服务
//!
//! 每个键对应 `SensorData` 文件夹下的一个变量，节点 ID 为 `ns=<idx>;s=<key>`。
//! 周期刷新变量值，新出现的键在下一个周期补建节点；客户端写入经回调进入存储。
//!
//! 节点命名与值转换总是编译；网络服务由默认开启的 `opcua` 特性提供，
//! 关闭该特性时服务仅记录不可用。

use crate::error::ProtocolError;
use domain::{DataType, Shutdown, Value};
use ds_store::{DataStore, EntrySnapshot, StoreError};
use ds_telemetry::{record_protocol_rejection, record_protocol_write};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// 变量所在文件夹名，同时作为文件夹节点的字符串标识。
pub const FOLDER_NAME: &str = "SensorData";

/// OPC UA 服务配置
#[derive(Debug, Clone)]
pub struct OpcUaConfig {
    pub host: String,
    pub port: u16,
    pub namespace_uri: String,
    pub refresh_interval: Duration,
    /// 证书目录；启动时生成自签名证书。
    pub pki_dir: PathBuf,
}

impl OpcUaConfig {
    pub fn new(host: impl Into<String>, port: u16, namespace_uri: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            namespace_uri: namespace_uri.into(),
            refresh_interval: Duration::from_secs(1),
            pki_dir: PathBuf::from("pki"),
        }
    }
}

/// 变量节点对外暴露的值。
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NodeValue {
    Double(f64),
    Int64(i64),
}

/// 存储值 → 节点值：float 条目为 Double，int/bool 条目为 Int64。
pub fn node_value(value: Value, data_type: DataType) -> NodeValue {
    match data_type {
        DataType::Float => NodeValue::Double(value.as_f64()),
        DataType::Int | DataType::Bool => NodeValue::Int64(value.as_i64()),
    }
}

/// 客户端写入的标量，按类别归并。
#[derive(Debug, Clone, PartialEq)]
pub enum WrittenScalar {
    Boolean(bool),
    Integer(i64),
    Unsigned(u64),
    Float(f64),
    Other(&'static str),
}

/// 写入回调失败原因，对应 OPC UA 状态码。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeWriteError {
    /// BadNodeIdUnknown
    UnknownNode,
    /// BadTypeMismatch
    TypeMismatch,
    /// BadInternalError
    Rejected(String),
}

/// 写入标量 → 存储值；非数值类别返回类型不匹配。
pub fn scalar_to_value(scalar: &WrittenScalar) -> Result<Value, NodeWriteError> {
    match scalar {
        WrittenScalar::Boolean(flag) => Ok(Value::Bool(*flag)),
        WrittenScalar::Integer(value) => Ok(Value::Int(*value)),
        WrittenScalar::Unsigned(value) => i64::try_from(*value)
            .map(Value::Int)
            .map_err(|_| NodeWriteError::TypeMismatch),
        WrittenScalar::Float(value) => Ok(Value::Float(*value)),
        WrittenScalar::Other(_) => Err(NodeWriteError::TypeMismatch),
    }
}

/// 将客户端写入交给存储。
pub fn apply_write(store: &DataStore, key: &str, scalar: &WrittenScalar) -> Result<Value, NodeWriteError> {
    if !store.contains_key(key) {
        record_protocol_rejection();
        return Err(NodeWriteError::UnknownNode);
    }
    let value = scalar_to_value(scalar).inspect_err(|_| {
        record_protocol_rejection();
        debug!(target: "ds.opcua", key, ?scalar, "non-numeric write rejected");
    })?;
    match store.write(key, value) {
        Ok(outcome) => {
            record_protocol_write();
            debug!(target: "ds.opcua", key, value = %outcome.value, "node written");
            Ok(outcome.value)
        }
        Err(StoreError::UnknownKey(_)) => {
            record_protocol_rejection();
            Err(NodeWriteError::UnknownNode)
        }
        Err(err) => {
            record_protocol_rejection();
            warn!(target: "ds.opcua", key, error = %err, "store rejected node write");
            Err(NodeWriteError::Rejected(err.to_string()))
        }
    }
}

/// 已建节点目录：记录哪些键已有变量节点。
#[derive(Debug, Default)]
pub struct NodeCatalog {
    known: BTreeSet<String>,
}

impl NodeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 返回尚未建节点的条目，并将其记为已建。
    pub fn discover(&mut self, entries: &[EntrySnapshot]) -> Vec<EntrySnapshot> {
        entries
            .iter()
            .filter(|entry| self.known.insert(entry.key.clone()))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

/// OPC UA 服务
pub struct OpcUaServer {
    store: Arc<DataStore>,
    config: OpcUaConfig,
}

impl OpcUaServer {
    pub fn new(store: Arc<DataStore>, config: OpcUaConfig) -> Self {
        Self { store, config }
    }

    /// 绑定 `host:port` 并运行，直到收到关停信号。
    #[cfg(feature = "opcua")]
    pub async fn run(self, shutdown: Shutdown) -> Result<(), ProtocolError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = crate::bind_tcp(&addr).await?;
        self.start()?.serve(listener, shutdown).await
    }

    /// 构建服务并建好当前所有变量节点，尚未接受连接。
    #[cfg(feature = "opcua")]
    pub fn start(self) -> Result<server::StartedServer, ProtocolError> {
        server::StartedServer::build(self.store, self.config)
    }

    /// 未编译 `opcua` 特性：记录后立即返回。
    #[cfg(not(feature = "opcua"))]
    pub async fn run(self, _shutdown: Shutdown) -> Result<(), ProtocolError> {
        warn!(
            target: "ds.opcua",
            port = self.config.port,
            keys = self.store.len(),
            "opc ua server unavailable: built without the `opcua` feature"
        );
        Ok(())
    }
}

#[cfg(feature = "opcua")]
pub use server::{NodeReader, StartedServer};

#[cfg(feature = "opcua")]
mod server {
    use super::*;
    use crate::local_addr_or_unknown;
    use opcua::server::address_space::{AccessLevel, NodeType, Variable};
    use opcua::server::diagnostics::NamespaceMetadata;
    use opcua::server::node_manager::memory::{SimpleNodeManager, simple_node_manager};
    use opcua::server::{Server, ServerBuilder, ServerHandle};
    use opcua::types::{
        DataEncoding, DataValue, NodeId, NumericRange, StatusCode, TimestampsToReturn, Variant,
    };
    use tokio::net::TcpListener;
    use tracing::info;

    fn variant(value: NodeValue) -> Variant {
        match value {
            NodeValue::Double(value) => Variant::Double(value),
            NodeValue::Int64(value) => Variant::Int64(value),
        }
    }

    fn scalar(variant: &Variant) -> WrittenScalar {
        match variant {
            Variant::Boolean(flag) => WrittenScalar::Boolean(*flag),
            Variant::SByte(v) => WrittenScalar::Integer(i64::from(*v)),
            Variant::Int16(v) => WrittenScalar::Integer(i64::from(*v)),
            Variant::Int32(v) => WrittenScalar::Integer(i64::from(*v)),
            Variant::Int64(v) => WrittenScalar::Integer(*v),
            Variant::Byte(v) => WrittenScalar::Unsigned(u64::from(*v)),
            Variant::UInt16(v) => WrittenScalar::Unsigned(u64::from(*v)),
            Variant::UInt32(v) => WrittenScalar::Unsigned(u64::from(*v)),
            Variant::UInt64(v) => WrittenScalar::Unsigned(*v),
            Variant::Float(v) => WrittenScalar::Float(f64::from(*v)),
            Variant::Double(v) => WrittenScalar::Float(*v),
            _ => WrittenScalar::Other("non-numeric"),
        }
    }

    fn status(result: Result<Value, NodeWriteError>) -> StatusCode {
        match result {
            Ok(_) => StatusCode::Good,
            Err(NodeWriteError::UnknownNode) => StatusCode::BadNodeIdUnknown,
            Err(NodeWriteError::TypeMismatch) => StatusCode::BadTypeMismatch,
            Err(NodeWriteError::Rejected(_)) => StatusCode::BadInternalError,
        }
    }

    fn add_nodes(
        manager: &SimpleNodeManager,
        store: &Arc<DataStore>,
        namespace: u16,
        folder: &NodeId,
        entries: Vec<EntrySnapshot>,
    ) {
        let mut variables = Vec::with_capacity(entries.len());
        for entry in &entries {
            let node_id = NodeId::new(namespace, entry.key.clone());
            let mut variable = Variable::new(
                &node_id,
                entry.key.as_str(),
                entry.key.as_str(),
                variant(node_value(entry.value, entry.data_type)),
            );
            variable.set_access_level(AccessLevel::CURRENT_READ | AccessLevel::CURRENT_WRITE);
            variable.set_user_access_level(AccessLevel::CURRENT_READ | AccessLevel::CURRENT_WRITE);
            variables.push(variable);

            let store = store.clone();
            let key = entry.key.clone();
            manager
                .inner()
                .add_write_callback(node_id, move |value: DataValue, _range: &NumericRange| {
                    let Some(written) = value.value.as_ref() else {
                        return StatusCode::BadTypeMismatch;
                    };
                    status(apply_write(&store, &key, &scalar(written)))
                });
        }
        manager.address_space().write().add_variables(variables, folder);
        debug!(target: "ds.opcua", added = entries.len(), "variable nodes added");
    }

    /// 从地址空间读取变量节点当前值。
    #[derive(Clone)]
    pub struct NodeReader {
        manager: Arc<SimpleNodeManager>,
        namespace: u16,
    }

    impl NodeReader {
        pub fn namespace(&self) -> u16 {
            self.namespace
        }

        /// 键对应变量的当前值；节点不存在或值类型不是 Double/Int64 时为 `None`。
        pub fn value(&self, key: &str) -> Option<NodeValue> {
            let address_space = self.manager.address_space().read();
            let NodeType::Variable(variable) =
                address_space.find_node(&NodeId::new(self.namespace, key.to_string()))?
            else {
                return None;
            };
            let data = variable.value(
                TimestampsToReturn::Neither,
                &NumericRange::None,
                &DataEncoding::Binary,
                0.0,
            );
            match data.value? {
                Variant::Double(value) => Some(NodeValue::Double(value)),
                Variant::Int64(value) => Some(NodeValue::Int64(value)),
                _ => None,
            }
        }

    }

    /// 已构建、节点已就绪的服务。
    pub struct StartedServer {
        store: Arc<DataStore>,
        config: OpcUaConfig,
        server: Server,
        handle: ServerHandle,
        reader: NodeReader,
        folder: NodeId,
        catalog: NodeCatalog,
    }

    impl StartedServer {
        pub(super) fn build(store: Arc<DataStore>, config: OpcUaConfig) -> Result<Self, ProtocolError> {
            let (server, handle) = ServerBuilder::new_anonymous("DataService Gateway")
                .host(config.host.clone())
                .port(config.port)
                .pki_dir(config.pki_dir.clone())
                .create_sample_keypair(true)
                .with_node_manager(simple_node_manager(
                    NamespaceMetadata {
                        namespace_uri: config.namespace_uri.clone(),
                        ..Default::default()
                    },
                    "dataservice",
                ))
                .build()
                .map_err(ProtocolError::Config)?;

            let manager = handle
                .node_managers()
                .get_of_type::<SimpleNodeManager>()
                .ok_or_else(|| ProtocolError::Config("simple node manager missing".to_string()))?;
            let namespace = handle
                .get_namespace_index(&config.namespace_uri)
                .ok_or_else(|| ProtocolError::Config("namespace not registered".to_string()))?;
            let folder = NodeId::new(namespace, FOLDER_NAME);
            manager.address_space().write().add_folder(
                &folder,
                FOLDER_NAME,
                FOLDER_NAME,
                &NodeId::objects_folder_id(),
            );

            let mut catalog = NodeCatalog::new();
            add_nodes(&manager, &store, namespace, &folder, catalog.discover(&store.entries()));
            Ok(Self {
                store,
                config,
                server,
                handle,
                reader: NodeReader { manager, namespace },
                folder,
                catalog,
            })
        }

        pub fn nodes(&self) -> NodeReader {
            self.reader.clone()
        }

        /// 在给定监听器上接受连接，直到收到关停信号。
        pub async fn serve(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), ProtocolError> {
            let Self {
                store,
                config,
                server,
                handle,
                reader,
                folder,
                mut catalog,
            } = self;
            info!(
                target: "ds.opcua",
                local_addr = %local_addr_or_unknown(listener.local_addr()),
                nodes = catalog.len(),
                "opc ua server listening"
            );

            let subscriptions = handle.subscriptions().clone();
            let refresh_shutdown = shutdown.clone();
            let refresh = tokio::spawn(async move {
                let NodeReader { manager, namespace } = reader;
                let mut ticker = tokio::time::interval(config.refresh_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = refresh_shutdown.wait() => break,
                        _ = ticker.tick() => {
                            let entries = store.entries();
                            let fresh = catalog.discover(&entries);
                            if !fresh.is_empty() {
                                add_nodes(&manager, &store, namespace, &folder, fresh);
                            }
                            let updates: Vec<(NodeId, DataValue)> = entries
                                .iter()
                                .map(|entry| {
                                    (
                                        NodeId::new(namespace, entry.key.clone()),
                                        DataValue::new_now(variant(node_value(entry.value, entry.data_type))),
                                    )
                                })
                                .collect();
                            if let Err(err) = manager.set_values(
                                &subscriptions,
                                updates.iter().map(|(id, value)| (id, None, value.clone())),
                            ) {
                                warn!(target: "ds.opcua", error = %err, "value refresh failed");
                            }
                        }
                    }
                }
            });

            let cancel = handle.clone();
            let watcher = tokio::spawn(async move {
                shutdown.wait().await;
                cancel.cancel();
            });

            let result = server.run_with(listener).await;
            watcher.abort();
            refresh.abort();
            info!(target: "ds.opcua", "opc ua server stopped");
            result.map_err(|err| ProtocolError::Io(std::io::Error::other(err)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ds_store::Registration;

    #[test]
    fn node_values_follow_entry_type() {
        assert_eq!(node_value(Value::Float(1.5), DataType::Float), NodeValue::Double(1.5));
        assert_eq!(node_value(Value::Int(1), DataType::Bool), NodeValue::Int64(1));
        assert_eq!(node_value(Value::Float(2.9), DataType::Int), NodeValue::Int64(2));
    }

    #[test]
    fn non_numeric_writes_are_type_mismatch() {
        assert_eq!(
            scalar_to_value(&WrittenScalar::Other("string")),
            Err(NodeWriteError::TypeMismatch)
        );
        assert_eq!(
            scalar_to_value(&WrittenScalar::Unsigned(u64::MAX)),
            Err(NodeWriteError::TypeMismatch)
        );
        assert_eq!(scalar_to_value(&WrittenScalar::Boolean(true)), Ok(Value::Bool(true)));
    }

    #[test]
    fn writes_go_through_store() {
        let store = DataStore::with_default_schema();
        assert_eq!(
            apply_write(&store, "temperature", &WrittenScalar::Integer(20)),
            Ok(Value::Float(20.0))
        );
        assert_eq!(store.read("temperature"), Value::Float(20.0));
        assert_eq!(
            apply_write(&store, "missing", &WrittenScalar::Float(1.0)),
            Err(NodeWriteError::UnknownNode)
        );
    }

    #[test]
    fn catalog_reports_each_key_once() {
        let store = DataStore::with_default_schema();
        let mut catalog = NodeCatalog::new();
        assert_eq!(catalog.discover(&store.entries()).len(), 4);
        assert!(catalog.discover(&store.entries()).is_empty());

        store.register(Registration::new("line.speed")).expect("register");
        let fresh = catalog.discover(&store.entries());
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].key, "line.speed");
        assert_eq!(catalog.len(), 5);
    }
}
