//! DataStore 内存实现
//!
//! 单把 `RwLock` 保护键表与地址索引：写入串行化，读取共享读锁，
//! 同一键的写入按提交顺序生效。锁中毒时直接恢复内部数据，读取永不失败。
//!
//! 每个点保留最近 [`HISTORY_CAPACITY`] 次写入；值发生变化时通过
//! [`DataStore::subscribe_changes`] 广播 [`ChangeEvent`]。

use crate::error::StoreError;
use domain::{DataType, Quality, Value, WriteTarget, now_epoch_ms};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::RangeInclusive;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

/// 启动时的固定点表：`(key, address, data_type)`，默认值均为 0。
pub const DEFAULT_SCHEMA: [(&str, u32, DataType); 4] = [
    ("temperature", 0, DataType::Float),
    ("humidity", 1, DataType::Float),
    ("pressure", 2, DataType::Float),
    ("status", 3, DataType::Int),
];

/// 单点历史环形缓冲容量。
pub const HISTORY_CAPACITY: usize = 1000;

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// 自动分配地址的区间（按数据类型）。
pub fn allocation_range(data_type: DataType) -> RangeInclusive<u32> {
    match data_type {
        DataType::Float => 40001..=41000,
        DataType::Int => 41001..=42000,
        DataType::Bool => 42001..=43000,
    }
}

/// 注册请求。
#[derive(Debug, Clone)]
pub struct Registration {
    pub key: String,
    pub address: Option<u32>,
    pub default: Value,
    /// 为空时按默认值推断。
    pub data_type: Option<DataType>,
    pub units: String,
    pub allow_address_conflict: bool,
    /// 未指定地址且该键尚无地址时，从类型区间自动分配。
    pub auto_allocate: bool,
}

impl Registration {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            address: None,
            default: Value::Float(0.0),
            data_type: None,
            units: String::new(),
            allow_address_conflict: false,
            auto_allocate: false,
        }
    }

    pub fn at(mut self, address: u32) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = default;
        self
    }

    pub fn with_type(mut self, data_type: DataType) -> Self {
        self.data_type = Some(data_type);
        self
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = units.into();
        self
    }

    pub fn allow_conflict(mut self) -> Self {
        self.allow_address_conflict = true;
        self
    }

    pub fn auto_address(mut self) -> Self {
        self.auto_allocate = true;
        self
    }
}

/// 一次成功写入的结果。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteOutcome {
    pub key: String,
    pub address: Option<u32>,
    /// 清洗并按类型转换后实际存储的值。
    pub value: Value,
    /// 输入被清洗（NaN/Inf → 0）时为 true。
    pub adjusted: bool,
    pub changed: bool,
}

/// 数据点详情。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntrySnapshot {
    pub key: String,
    pub address: Option<u32>,
    pub value: Value,
    pub default: Value,
    pub data_type: DataType,
    pub units: String,
    pub quality: Quality,
    pub updated_at_ms: Option<i64>,
    pub changed_at_ms: Option<i64>,
}

/// 一条历史记录。
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistorySample {
    pub timestamp_ms: i64,
    pub value: Value,
}

/// 值变化通知。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub key: String,
    pub address: Option<u32>,
    pub old: Value,
    pub new: Value,
    pub timestamp_ms: i64,
}

/// 存储统计。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStatistics {
    pub entries: usize,
    pub addressed_entries: usize,
    pub writes: u64,
    pub adjusted_writes: u64,
    pub rejected_writes: u64,
    /// 有历史记录的点数。
    pub history_points: usize,
    pub history_entries: usize,
    pub bad_quality_points: usize,
}

#[derive(Debug, Clone)]
struct Entry {
    address: Option<u32>,
    value: Value,
    default: Value,
    data_type: DataType,
    units: String,
    quality: Quality,
    updated_at_ms: Option<i64>,
    changed_at_ms: Option<i64>,
    history: VecDeque<HistorySample>,
}

impl Entry {
    fn snapshot(&self, key: &str) -> EntrySnapshot {
        EntrySnapshot {
            key: key.to_string(),
            address: self.address,
            value: self.value,
            default: self.default,
            data_type: self.data_type,
            units: self.units.clone(),
            quality: self.quality,
            updated_at_ms: self.updated_at_ms,
            changed_at_ms: self.changed_at_ms,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    addresses: BTreeMap<u32, String>,
    writes: u64,
    adjusted_writes: u64,
    rejected_writes: u64,
}

impl Inner {
    fn register(&mut self, registration: Registration) -> Result<Option<u32>, StoreError> {
        let Registration {
            key,
            address,
            default,
            data_type,
            units,
            allow_address_conflict,
            auto_allocate,
        } = registration;
        if key.trim().is_empty() {
            return Err(StoreError::Invalid("key must not be empty".to_string()));
        }
        let data_type = data_type.unwrap_or_else(|| DataType::infer(&default));
        let default = data_type.coerce(default.sanitize().0);
        let address = match address {
            None if auto_allocate
                && self.entries.get(&key).and_then(|e| e.address).is_none() =>
            {
                Some(self.allocate(data_type)?)
            }
            other => other,
        };

        if let Some(address) = address {
            if let Some(existing_key) = self.addresses.get(&address) {
                if *existing_key != key {
                    if !allow_address_conflict {
                        return Err(StoreError::Conflict {
                            address,
                            existing_key: existing_key.clone(),
                        });
                    }
                    let existing_key = existing_key.clone();
                    if let Some(previous) = self.entries.get_mut(&existing_key) {
                        previous.address = None;
                    }
                    tracing::info!(
                        target: "ds.store",
                        address,
                        previous_key = %existing_key,
                        key = %key,
                        "address reassigned, previous key is now addressless"
                    );
                }
            }
        }

        match self.entries.get_mut(&key) {
            Some(entry) => {
                let address = address.or(entry.address);
                if let Some(old) = entry.address {
                    if Some(old) != address && self.addresses.get(&old) == Some(&key) {
                        self.addresses.remove(&old);
                    }
                }
                entry.address = address;
                entry.default = default;
                entry.data_type = data_type;
                entry.units = units;
                entry.value = if entry.updated_at_ms.is_some() {
                    data_type.coerce(entry.value)
                } else {
                    default
                };
                if let Some(address) = address {
                    self.addresses.insert(address, key);
                }
                Ok(address)
            }
            None => {
                if let Some(address) = address {
                    self.addresses.insert(address, key.clone());
                }
                self.entries.insert(
                    key,
                    Entry {
                        address,
                        value: default,
                        default,
                        data_type,
                        units,
                        quality: Quality::Good,
                        updated_at_ms: None,
                        changed_at_ms: None,
                        history: VecDeque::new(),
                    },
                );
                Ok(address)
            }
        }
    }

    fn allocate(&self, data_type: DataType) -> Result<u32, StoreError> {
        allocation_range(data_type)
            .find(|address| !self.addresses.contains_key(address))
            .ok_or(StoreError::AddressRangeExhausted(data_type.as_str()))
    }

    fn resolve(&self, target: &WriteTarget) -> Result<String, StoreError> {
        match target {
            WriteTarget::Key(key) if key.trim().is_empty() => {
                Err(StoreError::Invalid("key must not be empty".to_string()))
            }
            WriteTarget::Key(key) if self.entries.contains_key(key) => Ok(key.clone()),
            WriteTarget::Key(key) => Err(StoreError::UnknownKey(key.clone())),
            WriteTarget::Address(address) => self
                .addresses
                .get(address)
                .cloned()
                .ok_or(StoreError::UnmappedAddress(*address)),
        }
    }
}

/// 共享数据存储。
///
/// 通过 `Arc<DataStore>` 注入各组件；条目只增不删，进程退出即丢弃。
#[derive(Debug)]
pub struct DataStore {
    inner: RwLock<Inner>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Default for DataStore {
    fn default() -> Self {
        Self::from_inner(Inner::default())
    }
}

impl DataStore {
    /// 创建空存储。
    pub fn new() -> Self {
        Self::default()
    }

    fn from_inner(inner: Inner) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(inner),
            changes,
        }
    }

    /// 订阅值变化。接收端落后超过通道容量时收到 `Lagged`。
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    /// 创建带固定点表的存储。
    pub fn with_default_schema() -> Self {
        let mut inner = Inner::default();
        for (key, address, data_type) in DEFAULT_SCHEMA {
            let registration = Registration::new(key)
                .at(address)
                .with_type(data_type)
                .with_default(Value::Int(0));
            if let Err(err) = inner.register(registration) {
                tracing::error!(target: "ds.store", key, error = %err, "default schema rejected");
            }
        }
        Self::from_inner(inner)
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// 注册（或重新注册）数据点，返回最终绑定的地址。
    ///
    /// 地址被其他键占用时：未允许覆盖返回 `Conflict`；允许覆盖时新键接管地址，
    /// 原键变为无地址条目，但值仍可按键读取。
    /// 重新注册保留当前值（按新类型转换），未提供地址时沿用原地址。
    pub fn register(&self, registration: Registration) -> Result<Option<u32>, StoreError> {
        self.write_guard().register(registration)
    }

    /// 写入单个值。未知键或未映射地址不产生任何修改。
    ///
    /// 非有限值清洗为 0 并将质量置为 `Bad`，其余写入恢复为 `Good`。
    pub fn write(
        &self,
        target: impl Into<WriteTarget>,
        value: Value,
    ) -> Result<WriteOutcome, StoreError> {
        let target = target.into();
        let mut inner = self.write_guard();
        let key = match inner.resolve(&target) {
            Ok(key) => key,
            Err(err) => {
                inner.rejected_writes += 1;
                return Err(err);
            }
        };
        let (sanitized, adjusted) = value.sanitize();
        let now = now_epoch_ms();
        let Some(entry) = inner.entries.get_mut(&key) else {
            return Err(StoreError::UnknownKey(key));
        };
        let stored = entry.data_type.coerce(sanitized);
        let old = entry.value;
        let changed = old != stored;
        entry.value = stored;
        entry.quality = if adjusted { Quality::Bad } else { Quality::Good };
        entry.updated_at_ms = Some(now);
        if changed || entry.changed_at_ms.is_none() {
            entry.changed_at_ms = Some(now);
        }
        if entry.history.len() >= HISTORY_CAPACITY {
            entry.history.pop_front();
        }
        entry.history.push_back(HistorySample {
            timestamp_ms: now,
            value: stored,
        });
        let address = entry.address;
        inner.writes += 1;
        if adjusted {
            inner.adjusted_writes += 1;
        }
        // 持锁发送，保证订阅端看到的顺序与写入顺序一致
        if changed && self.changes.receiver_count() > 0 {
            let _ = self.changes.send(ChangeEvent {
                key: key.clone(),
                address,
                old,
                new: stored,
                timestamp_ms: now,
            });
        }
        Ok(WriteOutcome {
            key,
            address,
            value: stored,
            adjusted,
            changed,
        })
    }

    /// 最近 `limit` 条历史（从旧到新），`limit == 0` 返回全部；未知键为空。
    pub fn history(&self, key: &str, limit: usize) -> Vec<HistorySample> {
        let inner = self.read_guard();
        let Some(entry) = inner.entries.get(key) else {
            return Vec::new();
        };
        let skip = match limit {
            0 => 0,
            limit => entry.history.len().saturating_sub(limit),
        };
        entry.history.iter().skip(skip).copied().collect()
    }

    /// 按键读取；未知键返回 0。
    pub fn read(&self, key: &str) -> Value {
        self.read_guard()
            .entries
            .get(key)
            .map(|entry| entry.value)
            .unwrap_or_default()
    }

    /// 按地址读取；未映射地址返回 0。
    pub fn read_address(&self, address: u32) -> Value {
        let inner = self.read_guard();
        inner
            .addresses
            .get(&address)
            .and_then(|key| inner.entries.get(key))
            .map(|entry| entry.value)
            .unwrap_or_default()
    }

    /// 一致的键值快照（同一把读锁内生成）。
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.read_guard()
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.value))
            .collect()
    }

    /// 地址窗口 `start..start+count`，空洞读为 0。
    pub fn address_window(&self, start: u32, count: u32) -> Vec<Value> {
        let inner = self.read_guard();
        (u64::from(start)..u64::from(start) + u64::from(count))
            .map(|address| {
                u32::try_from(address)
                    .ok()
                    .and_then(|address| inner.addresses.get(&address))
                    .and_then(|key| inner.entries.get(key))
                    .map(|entry| entry.value)
                    .unwrap_or_default()
            })
            .collect()
    }

    /// 带类型的地址窗口，未映射地址为 `None`。
    pub fn typed_window(&self, start: u32, count: u32) -> Vec<Option<(Value, DataType)>> {
        let inner = self.read_guard();
        (u64::from(start)..u64::from(start) + u64::from(count))
            .map(|address| {
                u32::try_from(address)
                    .ok()
                    .and_then(|address| inner.addresses.get(&address))
                    .and_then(|key| inner.entries.get(key))
                    .map(|entry| (entry.value, entry.data_type))
            })
            .collect()
    }

    /// 已映射地址 → 值。
    pub fn address_space(&self) -> BTreeMap<u32, Value> {
        let inner = self.read_guard();
        inner
            .addresses
            .iter()
            .filter_map(|(address, key)| inner.entries.get(key).map(|e| (*address, e.value)))
            .collect()
    }

    pub fn entry(&self, key: &str) -> Option<EntrySnapshot> {
        self.read_guard()
            .entries
            .get(key)
            .map(|entry| entry.snapshot(key))
    }

    pub fn entry_by_address(&self, address: u32) -> Option<EntrySnapshot> {
        let inner = self.read_guard();
        let key = inner.addresses.get(&address)?;
        inner.entries.get(key).map(|entry| entry.snapshot(key))
    }

    /// 地址严格大于 `after` 的第一个已映射条目（`None` 表示从头开始）。
    pub fn next_addressed(&self, after: Option<u32>) -> Option<EntrySnapshot> {
        let inner = self.read_guard();
        let mut range = match after {
            Some(after) => inner.addresses.range(after.checked_add(1)?..),
            None => inner.addresses.range(..),
        };
        let (_, key) = range.next()?;
        inner.entries.get(key).map(|entry| entry.snapshot(key))
    }

    /// 全部条目详情：有地址的按地址排序在前，其余按键名排序。
    pub fn entries(&self) -> Vec<EntrySnapshot> {
        let inner = self.read_guard();
        let mut items: Vec<EntrySnapshot> = inner
            .entries
            .iter()
            .map(|(key, entry)| entry.snapshot(key))
            .collect();
        items.sort_by(|a, b| match (a.address, b.address) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.key.cmp(&b.key),
        });
        items
    }

    pub fn statistics(&self) -> StoreStatistics {
        let inner = self.read_guard();
        StoreStatistics {
            entries: inner.entries.len(),
            addressed_entries: inner.addresses.len(),
            writes: inner.writes,
            adjusted_writes: inner.adjusted_writes,
            rejected_writes: inner.rejected_writes,
            history_points: inner
                .entries
                .values()
                .filter(|entry| !entry.history.is_empty())
                .count(),
            history_entries: inner.entries.values().map(|entry| entry.history.len()).sum(),
            bad_quality_points: inner
                .entries
                .values()
                .filter(|entry| !entry.quality.is_good())
                .count(),
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.read_guard().entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.read_guard().entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.read_guard().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schema_is_registered() {
        let store = DataStore::with_default_schema();
        assert_eq!(store.len(), 4);
        let status = store.entry_by_address(3).expect("status");
        assert_eq!(status.key, "status");
        assert_eq!(status.data_type, DataType::Int);
        assert_eq!(store.read("temperature"), Value::Float(0.0));
        assert_eq!(store.read("status"), Value::Int(0));
    }

    #[test]
    fn rejected_write_does_not_mutate() {
        let store = DataStore::with_default_schema();
        let before = store.snapshot();
        assert_eq!(
            store.write("missing", Value::Float(1.0)),
            Err(StoreError::UnknownKey("missing".to_string()))
        );
        assert_eq!(
            store.write(42u32, Value::Float(1.0)),
            Err(StoreError::UnmappedAddress(42))
        );
        assert!(matches!(
            store.write("", Value::Float(1.0)),
            Err(StoreError::Invalid(_))
        ));
        assert_eq!(store.snapshot(), before);
        assert_eq!(store.statistics().rejected_writes, 3);
    }

    #[test]
    fn next_addressed_walks_in_order() {
        let store = DataStore::with_default_schema();
        store
            .register(Registration::new("flow").at(10))
            .expect("register");
        let keys: Vec<String> = std::iter::successors(store.next_addressed(None), |entry| {
            store.next_addressed(entry.address)
        })
        .map(|entry| entry.key)
        .collect();
        assert_eq!(keys, ["temperature", "humidity", "pressure", "status", "flow"]);
        assert!(store.next_addressed(Some(u32::MAX)).is_none());
    }
}
