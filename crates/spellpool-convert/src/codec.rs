//! Per-type conversion hooks for `ScriptValue::Custom` payloads.
//!
//! A codec owns one type tag. Host to guest, a custom value whose tag has a
//! codec is handed to [`CustomCodec::to_guest`] instead of being wrapped as
//! an opaque userdata. Guest to host, every table and foreign userdata is
//! offered to the registered codecs (in tag order) before structural
//! conversion; the first codec that claims it wins.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;
use std::sync::Arc;

use mlua::{Lua, Value};
use spellpool_core::{ConvertError, ConvertResult, CustomValue};

/// Converts one custom host type to and from its guest form.
pub trait CustomCodec: Send + Sync + 'static {
    /// Build the guest representation of `value`.
    fn to_guest(&self, lua: &Lua, value: &CustomValue) -> ConvertResult<Value>;

    /// Claim a guest table or userdata. `None` leaves it to normal conversion.
    fn from_guest(&self, lua: &Lua, value: &Value) -> ConvertResult<Option<CustomValue>>;
}

/// Codecs keyed by type tag.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: BTreeMap<String, Arc<dyn CustomCodec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `codec` for `tag`. A tag can be registered once.
    pub fn register(&mut self, tag: impl Into<String>, codec: Arc<dyn CustomCodec>) -> ConvertResult<()> {
        match self.codecs.entry(tag.into()) {
            Entry::Occupied(entry) => Err(ConvertError::DuplicateCustomType(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(codec);
                Ok(())
            }
        }
    }

    /// The codec registered for `tag`.
    pub fn get(&self, tag: &str) -> Option<&Arc<dyn CustomCodec>> {
        self.codecs.get(tag)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.codecs.contains_key(tag)
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }

    /// Registered tags in the order codecs are consulted.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.codecs.keys().map(String::as_str)
    }

    pub(crate) fn encode(&self, lua: &Lua, value: &CustomValue) -> ConvertResult<Option<Value>> {
        match self.codecs.get(value.type_tag()) {
            Some(codec) => codec.to_guest(lua, value).map(Some),
            None => Ok(None),
        }
    }

    /// Offer `value` to each codec. A claimed value is re-tagged with the
    /// claiming codec's tag.
    pub(crate) fn decode(&self, lua: &Lua, value: &Value) -> ConvertResult<Option<CustomValue>> {
        for (tag, codec) in &self.codecs {
            if let Some(custom) = codec.from_guest(lua, value)? {
                return Ok(Some(if custom.type_tag() == tag {
                    custom
                } else {
                    CustomValue::from_arc(tag.clone(), Arc::clone(custom.payload()))
                }));
            }
        }
        Ok(None)
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.codecs.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;

    impl CustomCodec for Nothing {
        fn to_guest(&self, _lua: &Lua, _value: &CustomValue) -> ConvertResult<Value> {
            Ok(Value::Nil)
        }

        fn from_guest(&self, _lua: &Lua, _value: &Value) -> ConvertResult<Option<CustomValue>> {
            Ok(None)
        }
    }

    #[test]
    fn duplicate_tag_is_rejected() {
        let mut registry = CodecRegistry::new();
        registry.register("point", Arc::new(Nothing)).unwrap();
        let err = registry.register("point", Arc::new(Nothing)).unwrap_err();
        assert_eq!(err, ConvertError::DuplicateCustomType("point".into()));
        assert_eq!(registry.tags().collect::<Vec<_>>(), vec!["point"]);
    }

    #[test]
    fn unknown_tag_is_not_encoded() {
        let lua = Lua::new();
        let registry = CodecRegistry::new();
        let custom = CustomValue::new("point", ());
        assert!(registry.encode(&lua, &custom).unwrap().is_none());
        assert!(registry.decode(&lua, &Value::Nil).unwrap().is_none());
    }
}
