//! The canonical value model used at every host/guest crossing.
//!
//! Data variants (`Nil` through `Object`) are plain owned trees. `Function`,
//! `Error`, `Channel` and `Custom` carry shared handles, so cloning a value is
//! always cheap for them and structural for the rest.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{CallError, ConvertError};

/// Field map of an `Object` value. Ordered so that rendering is deterministic.
pub type ObjectMap = BTreeMap<String, ScriptValue>;

/// A value that can cross the host/guest boundary.
#[derive(Clone, Default)]
pub enum ScriptValue {
    #[default]
    Nil,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<ScriptValue>),
    Object(ObjectMap),
    Function(FunctionValue),
    Error(ErrorValue),
    Channel(ChannelHandle),
    Custom(CustomValue),
}

/// Discriminant of a [`ScriptValue`], used in diagnostics and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Nil,
    Bool,
    Number,
    String,
    Array,
    Object,
    Function,
    Error,
    Channel,
    Custom,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Nil => "nil",
            ValueKind::Bool => "bool",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Array => "array",
            ValueKind::Object => "object",
            ValueKind::Function => "function",
            ValueKind::Error => "error",
            ValueKind::Channel => "channel",
            ValueKind::Custom => "custom",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Callables ───────────────────────────────────────────────────────

/// Anything that can be invoked across the boundary.
///
/// There is one implementation per direction: host closures
/// ([`FunctionValue::from_fn`]) and guest functions (provided by the
/// converter crate). `as_any` lets a converter recognise its own wrappers
/// and unwrap them instead of stacking trampolines.
pub trait Callable: Send + Sync + 'static {
    fn call(&self, args: Vec<ScriptValue>) -> Result<ScriptValue, CallError>;

    fn as_any(&self) -> &dyn Any;
}

struct HostFn<F>(F);

impl<F> Callable for HostFn<F>
where
    F: Fn(Vec<ScriptValue>) -> Result<ScriptValue, CallError> + Send + Sync + 'static,
{
    fn call(&self, args: Vec<ScriptValue>) -> Result<ScriptValue, CallError> {
        (self.0)(args)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A named callable.
#[derive(Clone)]
pub struct FunctionValue {
    name: String,
    callable: Arc<dyn Callable>,
}

impl FunctionValue {
    pub fn new(name: impl Into<String>, callable: Arc<dyn Callable>) -> Self {
        Self {
            name: name.into(),
            callable,
        }
    }

    /// Wrap a host closure.
    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<ScriptValue>) -> Result<ScriptValue, CallError> + Send + Sync + 'static,
    {
        Self::new(name, Arc::new(HostFn(f)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn callable(&self) -> &Arc<dyn Callable> {
        &self.callable
    }

    pub fn call(&self, args: Vec<ScriptValue>) -> Result<ScriptValue, CallError> {
        self.callable.call(args)
    }

    /// True when both values share the same underlying callable.
    pub fn ptr_eq(&self, other: &FunctionValue) -> bool {
        Arc::ptr_eq(&self.callable, &other.callable)
    }
}

impl fmt::Debug for FunctionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionValue")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

// ── Errors, channels, custom payloads ───────────────────────────────

/// A failure carried as a value so that guest code can inspect it.
#[derive(Clone)]
pub struct ErrorValue {
    message: String,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl ErrorValue {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn from_error<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn source(&self) -> Option<&(dyn std::error::Error + Send + Sync)> {
        self.source.as_deref()
    }
}

impl fmt::Debug for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorValue")
            .field("message", &self.message)
            .field("has_source", &self.source.is_some())
            .finish()
    }
}

/// An opaque asynchronous handle (a queue, a stream, a promise...).
#[derive(Clone)]
pub struct ChannelHandle {
    id: String,
    handle: Arc<dyn Any + Send + Sync>,
}

impl ChannelHandle {
    pub fn new<T: Any + Send + Sync>(id: impl Into<String>, handle: T) -> Self {
        Self {
            id: id.into(),
            handle: Arc::new(handle),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.handle.downcast_ref::<T>()
    }

    pub fn ptr_eq(&self, other: &ChannelHandle) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// A type-tagged, type-erased payload with no structural mapping.
#[derive(Clone)]
pub struct CustomValue {
    type_tag: String,
    payload: Arc<dyn Any + Send + Sync>,
}

impl CustomValue {
    pub fn new<T: Any + Send + Sync>(type_tag: impl Into<String>, payload: T) -> Self {
        Self::from_arc(type_tag, Arc::new(payload))
    }

    pub fn from_arc(type_tag: impl Into<String>, payload: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            type_tag: type_tag.into(),
            payload,
        }
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn payload(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.payload
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    pub fn ptr_eq(&self, other: &CustomValue) -> bool {
        Arc::ptr_eq(&self.payload, &other.payload)
    }
}

impl fmt::Debug for CustomValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomValue")
            .field("type_tag", &self.type_tag)
            .finish_non_exhaustive()
    }
}

// ── ScriptValue API ─────────────────────────────────────────────────

impl ScriptValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            ScriptValue::Nil => ValueKind::Nil,
            ScriptValue::Bool(_) => ValueKind::Bool,
            ScriptValue::Number(_) => ValueKind::Number,
            ScriptValue::String(_) => ValueKind::String,
            ScriptValue::Array(_) => ValueKind::Array,
            ScriptValue::Object(_) => ValueKind::Object,
            ScriptValue::Function(_) => ValueKind::Function,
            ScriptValue::Error(_) => ValueKind::Error,
            ScriptValue::Channel(_) => ValueKind::Channel,
            ScriptValue::Custom(_) => ValueKind::Custom,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, ScriptValue::Nil)
    }

    pub fn error(message: impl Into<String>) -> Self {
        ScriptValue::Error(ErrorValue::new(message))
    }

    pub fn function<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<ScriptValue>) -> Result<ScriptValue, CallError> + Send + Sync + 'static,
    {
        ScriptValue::Function(FunctionValue::from_fn(name, f))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScriptValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScriptValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[ScriptValue]> {
        match self {
            ScriptValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectMap> {
        match self {
            ScriptValue::Object(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionValue> {
        match self {
            ScriptValue::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Look up a field of an `Object` value.
    pub fn get(&self, key: &str) -> Option<&ScriptValue> {
        self.as_object().and_then(|fields| fields.get(key))
    }

    /// Truthiness with guest semantics: only `Nil` and `false` are false.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, ScriptValue::Nil | ScriptValue::Bool(false))
    }
}

/// Structural equality for data; identity for shared handles.
impl PartialEq for ScriptValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ScriptValue::Nil, ScriptValue::Nil) => true,
            (ScriptValue::Bool(a), ScriptValue::Bool(b)) => a == b,
            (ScriptValue::Number(a), ScriptValue::Number(b)) => a == b,
            (ScriptValue::String(a), ScriptValue::String(b)) => a == b,
            (ScriptValue::Array(a), ScriptValue::Array(b)) => a == b,
            (ScriptValue::Object(a), ScriptValue::Object(b)) => a == b,
            (ScriptValue::Function(a), ScriptValue::Function(b)) => a.ptr_eq(b),
            (ScriptValue::Error(a), ScriptValue::Error(b)) => a.message == b.message,
            (ScriptValue::Channel(a), ScriptValue::Channel(b)) => a.id == b.id && a.ptr_eq(b),
            (ScriptValue::Custom(a), ScriptValue::Custom(b)) => {
                a.type_tag == b.type_tag && a.ptr_eq(b)
            }
            _ => false,
        }
    }
}

impl fmt::Debug for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Nil => f.write_str("Nil"),
            ScriptValue::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            ScriptValue::Number(n) => f.debug_tuple("Number").field(n).finish(),
            ScriptValue::String(s) => f.debug_tuple("String").field(s).finish(),
            ScriptValue::Array(items) => f.debug_tuple("Array").field(items).finish(),
            ScriptValue::Object(fields) => f.debug_tuple("Object").field(fields).finish(),
            ScriptValue::Function(func) => func.fmt(f),
            ScriptValue::Error(err) => err.fmt(f),
            ScriptValue::Channel(ch) => ch.fmt(f),
            ScriptValue::Custom(custom) => custom.fmt(f),
        }
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Nil => f.write_str("nil"),
            ScriptValue::Bool(b) => write!(f, "{b}"),
            ScriptValue::Number(n) => write!(f, "{n}"),
            ScriptValue::String(s) => f.write_str(s),
            ScriptValue::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            ScriptValue::Object(fields) => {
                f.write_str("{")?;
                for (i, (key, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                f.write_str("}")
            }
            ScriptValue::Function(func) => write!(f, "function: {}", func.name),
            ScriptValue::Error(err) => write!(f, "error: {}", err.message),
            ScriptValue::Channel(ch) => write!(f, "channel: {}", ch.id),
            ScriptValue::Custom(custom) => write!(f, "custom: {}", custom.type_tag),
        }
    }
}

// ── Conversions from Rust values ────────────────────────────────────

impl From<bool> for ScriptValue {
    fn from(v: bool) -> Self {
        ScriptValue::Bool(v)
    }
}

impl From<f64> for ScriptValue {
    fn from(v: f64) -> Self {
        ScriptValue::Number(v)
    }
}

impl From<i64> for ScriptValue {
    fn from(v: i64) -> Self {
        ScriptValue::Number(v as f64)
    }
}

impl From<i32> for ScriptValue {
    fn from(v: i32) -> Self {
        ScriptValue::Number(f64::from(v))
    }
}

impl From<&str> for ScriptValue {
    fn from(v: &str) -> Self {
        ScriptValue::String(v.to_string())
    }
}

impl From<String> for ScriptValue {
    fn from(v: String) -> Self {
        ScriptValue::String(v)
    }
}

impl From<Vec<ScriptValue>> for ScriptValue {
    fn from(v: Vec<ScriptValue>) -> Self {
        ScriptValue::Array(v)
    }
}

impl From<ObjectMap> for ScriptValue {
    fn from(v: ObjectMap) -> Self {
        ScriptValue::Object(v)
    }
}

impl From<FunctionValue> for ScriptValue {
    fn from(v: FunctionValue) -> Self {
        ScriptValue::Function(v)
    }
}

impl<T: Into<ScriptValue>> From<Option<T>> for ScriptValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(ScriptValue::Nil, Into::into)
    }
}

impl FromIterator<ScriptValue> for ScriptValue {
    fn from_iter<I: IntoIterator<Item = ScriptValue>>(iter: I) -> Self {
        ScriptValue::Array(iter.into_iter().collect())
    }
}

impl<K: Into<String>> FromIterator<(K, ScriptValue)> for ScriptValue {
    fn from_iter<I: IntoIterator<Item = (K, ScriptValue)>>(iter: I) -> Self {
        ScriptValue::Object(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

// ── JSON interop ────────────────────────────────────────────────────

impl From<serde_json::Value> for ScriptValue {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => ScriptValue::Nil,
            serde_json::Value::Bool(b) => ScriptValue::Bool(b),
            serde_json::Value::Number(n) => ScriptValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => ScriptValue::String(s),
            serde_json::Value::Array(items) => {
                ScriptValue::Array(items.into_iter().map(ScriptValue::from).collect())
            }
            serde_json::Value::Object(fields) => ScriptValue::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, ScriptValue::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Data variants map onto JSON; `Error` becomes `{"error": message}`.
/// Functions, channels and custom payloads have no JSON form.
impl TryFrom<&ScriptValue> for serde_json::Value {
    type Error = ConvertError;

    fn try_from(v: &ScriptValue) -> Result<Self, Self::Error> {
        Ok(match v {
            ScriptValue::Nil => serde_json::Value::Null,
            ScriptValue::Bool(b) => serde_json::Value::Bool(*b),
            ScriptValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
                    serde_json::Value::from(*n as i64)
                } else {
                    serde_json::Number::from_f64(*n)
                        .map(serde_json::Value::Number)
                        .ok_or_else(|| {
                            ConvertError::UnsupportedType(format!("non-finite number {n}"))
                        })?
                }
            }
            ScriptValue::String(s) => serde_json::Value::String(s.clone()),
            ScriptValue::Array(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(serde_json::Value::try_from)
                    .collect::<Result<_, _>>()?,
            ),
            ScriptValue::Object(fields) => {
                let mut map = serde_json::Map::with_capacity(fields.len());
                for (key, value) in fields {
                    map.insert(key.clone(), serde_json::Value::try_from(value)?);
                }
                serde_json::Value::Object(map)
            }
            ScriptValue::Error(err) => serde_json::json!({ "error": err.message }),
            other => return Err(ConvertError::UnsupportedType(other.kind().to_string())),
        })
    }
}
