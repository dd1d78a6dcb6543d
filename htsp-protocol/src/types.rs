//! Message and value definitions for the HTSP protocol.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::ProtocolError;

/// HTSP protocol version this crate speaks.
pub const HTSP_VERSION: i64 = 25;

/// Maximum frame body size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Size of the big-endian length prefix in front of every frame.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Field name carrying the request method.
pub const FIELD_METHOD: &str = "method";

/// Field name carrying the request/response sequence number.
pub const FIELD_SEQ: &str = "seq";

/// Field name the backend uses for error replies.
pub const FIELD_ERROR: &str = "error";

/// Field type identifiers used in the binary encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    /// Nested message.
    Map = 1,
    /// Signed 64-bit integer, little-endian, minimal length.
    S64 = 2,
    /// UTF-8 string.
    Str = 3,
    /// Raw bytes.
    Bin = 4,
    /// Ordered list of unnamed values.
    List = 5,
    /// IEEE-754 double, little-endian.
    Dbl = 6,
    /// Boolean, single byte.
    Bool = 7,
    /// 16-byte UUID.
    Uuid = 8,
}

impl TryFrom<u8> for FieldType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FieldType::Map),
            2 => Ok(FieldType::S64),
            3 => Ok(FieldType::Str),
            4 => Ok(FieldType::Bin),
            5 => Ok(FieldType::List),
            6 => Ok(FieldType::Dbl),
            7 => Ok(FieldType::Bool),
            8 => Ok(FieldType::Uuid),
            _ => Err(value),
        }
    }
}

impl From<FieldType> for u8 {
    fn from(value: FieldType) -> Self {
        value as u8
    }
}

/// A single field value.
///
/// Booleans decode as [`Value::Int`] and UUIDs as [`Value::Bin`], matching how
/// the backend consumes them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Str(String),
    Bin(Vec<u8>),
    Double(f64),
    List(Vec<Value>),
    Map(Message),
}

impl Value {
    /// Short name of the value kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Int(_) => "an integer",
            Value::Str(_) => "a string",
            Value::Bin(_) => "binary",
            Value::Double(_) => "a double",
            Value::List(_) => "a list",
            Value::Map(_) => "a map",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bin(&self) -> Option<&[u8]> {
        match self {
            Value::Bin(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Message> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bin(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<Message> for Value {
    fn from(v: Message) -> Self {
        Value::Map(v)
    }
}

/// A self-describing HTSP message: a set of uniquely named fields.
///
/// Field order carries no meaning; two messages with the same fields compare
/// equal regardless of the order they were inserted or decoded in.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Message {
    fields: BTreeMap<String, Value>,
}

impl Message {
    /// Create an empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a request for the given method.
    pub fn request(method: &str) -> Self {
        Self::new().with(FIELD_METHOD, method)
    }

    /// Builder-style field insertion.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.put(name, value);
        self
    }

    /// Insert a field, replacing any previous value with the same name.
    pub fn put(&mut self, name: &str, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(name.to_string(), value.into())
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate over `(name, value)` pairs in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The request or push method, if present.
    pub fn method(&self) -> Option<&str> {
        self.opt_str(FIELD_METHOD)
    }

    /// The sequence number, if present and representable.
    pub fn seq(&self) -> Option<u32> {
        self.opt_u32(FIELD_SEQ)
    }

    pub fn set_seq(&mut self, seq: u32) {
        self.put(FIELD_SEQ, seq);
    }

    /// The backend error string, if this is an error reply.
    pub fn error(&self) -> Option<&str> {
        self.opt_str(FIELD_ERROR)
    }

    fn typed<'a, T>(
        &'a self,
        name: &str,
        expected: &'static str,
        pick: impl FnOnce(&'a Value) -> Option<T>,
    ) -> Result<T, ProtocolError> {
        let value = self
            .get(name)
            .ok_or_else(|| ProtocolError::MissingField(name.to_string()))?;
        pick(value).ok_or_else(|| ProtocolError::FieldType {
            field: name.to_string(),
            expected,
        })
    }

    pub fn get_i64(&self, name: &str) -> Result<i64, ProtocolError> {
        self.typed(name, "an integer", Value::as_i64)
    }

    pub fn get_u32(&self, name: &str) -> Result<u32, ProtocolError> {
        self.typed(name, "an unsigned 32-bit integer", |v| {
            v.as_i64().and_then(|i| u32::try_from(i).ok())
        })
    }

    pub fn get_str(&self, name: &str) -> Result<&str, ProtocolError> {
        self.typed(name, "a string", Value::as_str)
    }

    pub fn get_bin(&self, name: &str) -> Result<&[u8], ProtocolError> {
        self.typed(name, "binary", Value::as_bin)
    }

    pub fn get_list(&self, name: &str) -> Result<&[Value], ProtocolError> {
        self.typed(name, "a list", Value::as_list)
    }

    pub fn get_map(&self, name: &str) -> Result<&Message, ProtocolError> {
        self.typed(name, "a map", Value::as_map)
    }

    pub fn opt_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    pub fn opt_u32(&self, name: &str) -> Option<u32> {
        self.opt_i64(name).and_then(|i| u32::try_from(i).ok())
    }

    /// String field, treating an empty string as absent.
    pub fn opt_str(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn opt_bin(&self, name: &str) -> Option<&[u8]> {
        self.get(name).and_then(Value::as_bin)
    }

    /// List field, treating an absent field as an empty list.
    pub fn list_or_empty(&self, name: &str) -> &[Value] {
        self.get(name).and_then(Value::as_list).unwrap_or(&[])
    }

    /// Non-zero integer flag; absent means false.
    pub fn flag(&self, name: &str) -> bool {
        self.opt_i64(name).is_some_and(|v| v != 0)
    }
}

impl FromIterator<(String, Value)> for Message {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}
