//! Lua value <-> ScriptValue conversion.
//!
//! Conversion walks guest tables recursively with an identity-keyed visited
//! set that is marked on descent and unmarked on exit, so shared subtables
//! (DAGs) convert fine while true cycles fail with `CircularReference`.
//! Each level runs through `stacker::maybe_grow`, so a deep but legal value
//! never overflows the caller's thread stack.

use std::collections::HashSet;
use std::sync::Arc;

use mlua::{Lua, Table, Value};
use spellpool_core::{
    ConvertError, ConvertResult, CustomValue, ErrorValue, KeyKind, ObjectMap, ScriptValue, Shape,
    classify_keys,
};

use crate::bridge::{self, GuestFunction, GuestRef};
use crate::codec::{CodecRegistry, CustomCodec};
use crate::opaque::OpaqueValue;
use crate::GuestResultExt;

pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Metatable field that marks an empty table as an array.
pub(crate) const SHAPE_FIELD: &str = "__shape";
const ARRAY_MARKER_KEY: &str = "spellpool.array_marker";

const STACK_RED_ZONE: usize = 128 * 1024;
const STACK_GROW_SIZE: usize = 4 * 1024 * 1024;

/// Reentrant converter. The only per-call state is the visited set of the
/// top-level call; the codec registry is shared between clones.
#[derive(Debug, Clone)]
pub struct Converter {
    max_depth: usize,
    codecs: Arc<CodecRegistry>,
}

impl Default for Converter {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            codecs: Arc::default(),
        }
    }
}

impl Converter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_depth(max_depth: usize) -> Self {
        Self {
            max_depth,
            ..Self::default()
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Route custom values tagged `tag` through `codec` in both directions.
    ///
    /// Fails with `DuplicateCustomType` if `tag` already has a codec.
    pub fn register_custom_type(
        &mut self,
        tag: impl Into<String>,
        codec: impl CustomCodec,
    ) -> ConvertResult<()> {
        Arc::make_mut(&mut self.codecs).register(tag, Arc::new(codec))
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    /// Convert a guest value into the canonical model.
    pub fn to_canonical(&self, lua: &Lua, value: &Value) -> ConvertResult<ScriptValue> {
        let mut visited = HashSet::new();
        self.guest_to_canonical(lua, value, 0, &mut visited)
    }

    /// Convert a canonical value into a guest value owned by `lua`.
    pub fn from_canonical(&self, lua: &Lua, value: &ScriptValue) -> ConvertResult<Value> {
        self.canonical_to_guest(lua, value, 0)
    }

    fn guest_to_canonical(
        &self,
        lua: &Lua,
        value: &Value,
        level: usize,
        visited: &mut HashSet<usize>,
    ) -> ConvertResult<ScriptValue> {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || {
            self.guest_to_canonical_inner(lua, value, level, visited)
        })
    }

    fn guest_to_canonical_inner(
        &self,
        lua: &Lua,
        value: &Value,
        level: usize,
        visited: &mut HashSet<usize>,
    ) -> ConvertResult<ScriptValue> {
        Ok(match value {
            Value::Nil => ScriptValue::Nil,
            Value::Boolean(b) => ScriptValue::Bool(*b),
            Value::Integer(i) => ScriptValue::Number(*i as f64),
            Value::Number(n) => ScriptValue::Number(*n),
            Value::String(s) => match s.to_str() {
                Ok(text) => ScriptValue::String(text.to_string()),
                Err(_) => ScriptValue::Custom(CustomValue::new("bytes", s.as_bytes().to_vec())),
            },
            Value::Table(table) => match self.codecs.decode(lua, value)? {
                Some(custom) => ScriptValue::Custom(custom),
                None => return self.table_to_canonical(lua, table, level + 1, visited),
            },
            Value::Function(function) => {
                ScriptValue::Function(GuestFunction::wrap(lua, function.clone(), self.clone()))
            }
            Value::UserData(ud) => match ud.borrow::<OpaqueValue>() {
                Ok(opaque) => opaque.value().clone(),
                Err(_) => match self.codecs.decode(lua, value)? {
                    Some(custom) => ScriptValue::Custom(custom),
                    None => GuestRef::custom(lua, "userdata", value.clone()),
                },
            },
            Value::Thread(_) => GuestRef::custom(lua, "thread", value.clone()),
            Value::LightUserData(_) => GuestRef::custom(lua, "lightuserdata", value.clone()),
            Value::Error(err) => ScriptValue::Error(ErrorValue::new(err.to_string())),
            #[allow(unreachable_patterns)]
            other => return Err(ConvertError::UnsupportedType(other.type_name().to_string())),
        })
    }

    fn table_to_canonical(
        &self,
        lua: &Lua,
        table: &Table,
        depth: usize,
        visited: &mut HashSet<usize>,
    ) -> ConvertResult<ScriptValue> {
        let id = table.to_pointer() as usize;
        if visited.contains(&id) {
            return Err(ConvertError::CircularReference);
        }
        if depth > self.max_depth {
            return Err(ConvertError::MaxDepthExceeded {
                max_depth: self.max_depth,
            });
        }

        let mut entries = Vec::new();
        for pair in table.pairs::<Value, Value>() {
            entries.push(pair.guest()?);
        }

        if entries.is_empty() {
            return Ok(if has_array_marker(table)? {
                ScriptValue::Array(Vec::new())
            } else {
                ScriptValue::Object(ObjectMap::new())
            });
        }

        visited.insert(id);
        let result = self.entries_to_canonical(lua, entries, depth, visited);
        visited.remove(&id);
        result
    }

    fn entries_to_canonical(
        &self,
        lua: &Lua,
        entries: Vec<(Value, Value)>,
        depth: usize,
        visited: &mut HashSet<usize>,
    ) -> ConvertResult<ScriptValue> {
        match classify_keys(entries.iter().map(|(k, _)| key_kind(k))) {
            Shape::Array(len) => {
                let mut items = vec![ScriptValue::Nil; len];
                for (key, value) in &entries {
                    if let KeyKind::Index(i) = key_kind(key) {
                        items[(i - 1) as usize] = self.guest_to_canonical(lua, value, depth, visited)?;
                    }
                }
                Ok(ScriptValue::Array(items))
            }
            Shape::Object => {
                let mut fields = ObjectMap::new();
                for (key, value) in &entries {
                    // `1` and `"1"` are distinct Lua keys but share a name.
                    let name = object_key(key)?;
                    if fields.contains_key(&name) {
                        return Err(ConvertError::UnsupportedType(format!(
                            "duplicate object key \"{name}\""
                        )));
                    }
                    let converted = self.guest_to_canonical(lua, value, depth, visited)?;
                    fields.insert(name, converted);
                }
                Ok(ScriptValue::Object(fields))
            }
        }
    }

    fn canonical_to_guest(&self, lua: &Lua, value: &ScriptValue, level: usize) -> ConvertResult<Value> {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || {
            self.canonical_to_guest_inner(lua, value, level)
        })
    }

    fn canonical_to_guest_inner(
        &self,
        lua: &Lua,
        value: &ScriptValue,
        level: usize,
    ) -> ConvertResult<Value> {
        Ok(match value {
            ScriptValue::Nil => Value::Nil,
            ScriptValue::Bool(b) => Value::Boolean(*b),
            ScriptValue::Number(n) => number_to_guest(*n),
            ScriptValue::String(s) => Value::String(lua.create_string(s).guest()?),
            ScriptValue::Array(items) => {
                let depth = self.enter(level)?;
                let table = lua.create_table_with_capacity(items.len(), 0).guest()?;
                for (i, item) in items.iter().enumerate() {
                    table
                        .raw_set(i + 1, self.canonical_to_guest(lua, item, depth)?)
                        .guest()?;
                }
                if items.is_empty() {
                    table.set_metatable(Some(array_marker(lua)?));
                }
                Value::Table(table)
            }
            ScriptValue::Object(fields) => {
                let depth = self.enter(level)?;
                let table = lua.create_table_with_capacity(0, fields.len()).guest()?;
                for (key, item) in fields {
                    table
                        .raw_set(key.as_str(), self.canonical_to_guest(lua, item, depth)?)
                        .guest()?;
                }
                Value::Table(table)
            }
            ScriptValue::Function(function) => {
                bridge::function_to_guest(lua, function, self.clone())?
            }
            ScriptValue::Custom(custom) => {
                if let Some(bytes) = custom.downcast_ref::<Vec<u8>>() {
                    Value::String(lua.create_string(bytes).guest()?)
                } else if let Some(value) = GuestRef::resolve(lua, custom) {
                    value
                } else if let Some(value) = self.codecs.encode(lua, custom)? {
                    value
                } else {
                    OpaqueValue::to_guest(lua, value)?
                }
            }
            ScriptValue::Error(_) | ScriptValue::Channel(_) => OpaqueValue::to_guest(lua, value)?,
        })
    }

    fn enter(&self, level: usize) -> ConvertResult<usize> {
        let depth = level + 1;
        if depth > self.max_depth {
            return Err(ConvertError::MaxDepthExceeded {
                max_depth: self.max_depth,
            });
        }
        Ok(depth)
    }
}

fn number_to_guest(n: f64) -> Value {
    // 2^63 is exactly representable; anything at or above it is out of range.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if n.fract() == 0.0 && (-LIMIT..LIMIT).contains(&n) {
        Value::Integer(n as i64)
    } else {
        Value::Number(n)
    }
}

fn key_kind(key: &Value) -> KeyKind {
    match key {
        Value::Integer(i) => KeyKind::Index(*i),
        Value::Number(n) if n.fract() == 0.0 && n.abs() < 9.0e15 => KeyKind::Index(*n as i64),
        _ => KeyKind::Name,
    }
}

fn object_key(key: &Value) -> ConvertResult<String> {
    match key {
        Value::String(s) => Ok(String::from_utf8_lossy(&s.as_bytes()).into_owned()),
        Value::Integer(i) => Ok(i.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Boolean(b) => Ok(b.to_string()),
        other => Err(ConvertError::UnsupportedType(format!(
            "{} as object key",
            other.type_name()
        ))),
    }
}

fn has_array_marker(table: &Table) -> ConvertResult<bool> {
    let Some(meta) = table.metatable() else {
        return Ok(false);
    };
    let shape: Option<String> = meta.raw_get(SHAPE_FIELD).guest()?;
    Ok(shape.as_deref() == Some("array"))
}

/// Shared per-state metatable used to tag empty arrays.
fn array_marker(lua: &Lua) -> ConvertResult<Table> {
    if let Some(marker) = lua
        .named_registry_value::<Option<Table>>(ARRAY_MARKER_KEY)
        .guest()?
    {
        return Ok(marker);
    }
    let marker = lua.create_table().guest()?;
    marker.raw_set(SHAPE_FIELD, "array").guest()?;
    lua.set_named_registry_value(ARRAY_MARKER_KEY, &marker)
        .guest()?;
    Ok(marker)
}
