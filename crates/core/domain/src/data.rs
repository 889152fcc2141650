use serde::{Deserialize, Serialize};
use std::fmt;

/// 数据点的值。
///
/// JSON 中直接表示为数字或布尔值（`28.7`、`3`、`true`）。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl Value {
    pub fn as_f64(&self) -> f64 {
        match *self {
            Value::Bool(flag) => f64::from(u8::from(flag)),
            Value::Int(value) => value as f64,
            Value::Float(value) => value,
        }
    }

    /// 截断为整数（浮点向零取整，超界饱和）。
    pub fn as_i64(&self) -> i64 {
        match *self {
            Value::Bool(flag) => i64::from(flag),
            Value::Int(value) => value,
            Value::Float(value) => value.trunc() as i64,
        }
    }

    /// 清洗写入值：NaN/±Inf 归零并标记为已调整，布尔值转为 0/1。
    pub fn sanitize(self) -> (Value, bool) {
        match self {
            Value::Float(value) if !value.is_finite() => (Value::Float(0.0), true),
            Value::Bool(flag) => (Value::Int(i64::from(flag)), false),
            other => (other, false),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.as_f64() == 0.0
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Int(0)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(flag) => write!(f, "{}", u8::from(*flag)),
            Value::Int(value) => write!(f, "{value}"),
            Value::Float(value) => write!(f, "{value}"),
        }
    }
}

/// 数据点类型，决定写入时的强制转换规则。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[default]
    Float,
    Int,
    Bool,
}

impl DataType {
    /// 根据默认值推断类型。
    pub fn infer(value: &Value) -> Self {
        match value {
            Value::Bool(_) => DataType::Bool,
            Value::Int(_) => DataType::Int,
            Value::Float(_) => DataType::Float,
        }
    }

    /// 按类型强制转换（布尔类型存储为 0/1）。
    pub fn coerce(self, value: Value) -> Value {
        match self {
            DataType::Float => Value::Float(value.as_f64()),
            DataType::Int => Value::Int(value.as_i64()),
            DataType::Bool => Value::Int(i64::from(!value.is_zero())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Float => "float",
            DataType::Int => "int",
            DataType::Bool => "bool",
        }
    }
}

/// 数据质量。非有限值被清洗后的写入标记为 `Bad`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Quality {
    #[default]
    Good,
    Bad,
}

impl Quality {
    pub fn is_good(self) -> bool {
        self == Quality::Good
    }
}

/// 写入目标：按键名或按寄存器地址。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WriteTarget {
    Key(String),
    Address(u32),
}

impl fmt::Display for WriteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteTarget::Key(key) => write!(f, "key={key}"),
            WriteTarget::Address(address) => write!(f, "address={address}"),
        }
    }
}

impl From<&str> for WriteTarget {
    fn from(key: &str) -> Self {
        WriteTarget::Key(key.to_string())
    }
}

impl From<String> for WriteTarget {
    fn from(key: String) -> Self {
        WriteTarget::Key(key)
    }
}

impl From<u32> for WriteTarget {
    fn from(address: u32) -> Self {
        WriteTarget::Address(address)
    }
}
