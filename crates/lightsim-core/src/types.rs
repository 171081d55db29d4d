/*!
 * Core data types for lightsim.
 *
 * This module defines the dynamic value tree that device attributes are stored
 * in, and the record hooks that let composite values police their own fields.
 */
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// A dynamically typed attribute value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Null value
    #[default]
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value
    Integer(i64),
    /// Floating-point value
    Float(f64),
    /// String value
    String(String),
    /// Ordered sequence of values
    Array(Vec<Value>),
    /// Nested record of named values
    Record(Record),
    /// Binary data
    Binary(Vec<u8>),
    /// Timestamp
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Check if the value is numeric (integer or float)
    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Float(_))
    }

    /// Try to get a boolean value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get an integer value
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Float(f) if *f == (*f as i64) as f64 => Some(*f as i64),
            _ => None,
        }
    }

    /// Try to get a float value
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Try to get a string value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get an array value
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Try to get a record value
    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    /// Try to get a timestamp value
    pub fn as_timestamp(&self) -> Option<&DateTime<Utc>> {
        match self {
            Value::Timestamp(t) => Some(t),
            _ => None,
        }
    }

    /// Short name of the variant, used in diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Record(_) => "record",
            Value::Binary(_) => "binary",
            Value::Timestamp(_) => "timestamp",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Record(r) => write!(f, "{}", r),
            Value::Binary(b) => write!(f, "<{} bytes>", b.len()),
            Value::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
        }
    }
}

macro_rules! value_from_integer {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(i: $ty) -> Self {
                    Value::Integer(i as i64)
                }
            }
        )*
    };
}

value_from_integer!(u8, u16, u32, i32, i64);

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f32> for Value {
    fn from(f: f32) -> Self {
        Value::Float(f as f64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Value::Timestamp(t)
    }
}

impl From<Vec<Value>> for Value {
    fn from(a: Vec<Value>) -> Self {
        Value::Array(a)
    }
}

impl From<Record> for Value {
    fn from(r: Record) -> Self {
        Value::Record(r)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(o: Option<T>) -> Self {
        o.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                let mut record = Record::new();
                for (k, v) in map {
                    record.fields.insert(k, Value::from(v));
                }
                Value::Record(record)
            }
        }
    }
}

/// Hook a record consults instead of assigning fields directly
///
/// Hooks let composite values validate, clamp or reject what is written into
/// them. A rejected assignment leaves the record untouched.
pub trait RecordHook: Send + Sync {
    /// Name used in diagnostics
    fn name(&self) -> &str;

    /// Decide what actually gets stored for `key`
    fn on_change(&self, key: &str, current: Option<&Value>, proposed: Value) -> Result<Value>;

    /// Whether assignments may introduce keys the record does not have yet
    fn allows_new_keys(&self) -> bool {
        false
    }
}

/// A named collection of values, optionally guarded by a [`RecordHook`]
#[derive(Clone, Default)]
pub struct Record {
    fields: BTreeMap<String, Value>,
    hook: Option<Arc<dyn RecordHook>>,
}

impl Record {
    /// Create an empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder style field insertion, bypassing any hook
    pub fn with<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Attach a hook that receives later assignments
    pub fn with_hook(mut self, hook: Arc<dyn RecordHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Get a field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Mutable access to a field, used when walking into nested values
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.fields.get_mut(key)
    }

    /// Iterate over the fields in key order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the record has no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The hook guarding this record, if any
    pub fn hook(&self) -> Option<&Arc<dyn RecordHook>> {
        self.hook.as_ref()
    }

    /// Assign a field, routing through the hook when there is one
    pub fn assign(&mut self, key: &str, value: Value) -> Result<()> {
        let exists = self.fields.contains_key(key);
        let stored = match &self.hook {
            Some(hook) => {
                if !exists && !hook.allows_new_keys() {
                    return Err(Error::attribute(format!(
                        "record guarded by {} has no field {}",
                        hook.name(),
                        key
                    )));
                }
                hook.on_change(key, self.fields.get(key), value)?
            }
            None => {
                if !exists {
                    return Err(Error::attribute(format!("record has no field {}", key)));
                }
                value
            }
        };
        self.fields.insert(key.to_string(), stored);
        Ok(())
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_map();
        s.entries(self.fields.iter());
        s.finish()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", k, v)?;
        }
        write!(f, "}}")
    }
}

/// Sticky numeric ranges: out of range values are rejected and the old value kept
#[derive(Debug, Clone)]
pub struct RangeHook {
    name: String,
    ranges: BTreeMap<String, (f64, f64)>,
}

impl RangeHook {
    /// Create a hook with no ranges
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            ranges: BTreeMap::new(),
        }
    }

    /// Constrain a field to an inclusive range
    pub fn range<S: Into<String>>(mut self, key: S, min: f64, max: f64) -> Self {
        self.ranges.insert(key.into(), (min, max));
        self
    }
}

impl RecordHook for RangeHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_change(&self, key: &str, current: Option<&Value>, proposed: Value) -> Result<Value> {
        let Some((min, max)) = self.ranges.get(key) else {
            return Ok(proposed);
        };
        let number = proposed.as_float().ok_or_else(|| {
            Error::attribute(format!(
                "{}.{} expects a number, got {}",
                self.name,
                key,
                proposed.type_name()
            ))
        })?;
        if number < *min || number > *max {
            return Err(Error::attribute(format!(
                "{}.{} = {} outside {}..={}, keeping {}",
                self.name,
                key,
                number,
                min,
                max,
                current.cloned().unwrap_or_default()
            )));
        }
        Ok(proposed)
    }
}
