//! Userdata carrier for canonical values that Lua cannot represent
//! structurally (errors, channels, foreign custom payloads).

use mlua::{Lua, MetaMethod, UserData, UserDataFields, UserDataMethods, Value};
use spellpool_core::{ConvertResult, ScriptValue};

use crate::GuestResultExt;

pub struct OpaqueValue(ScriptValue);

impl OpaqueValue {
    pub(crate) fn to_guest(lua: &Lua, value: &ScriptValue) -> ConvertResult<Value> {
        let ud = lua.create_userdata(OpaqueValue(value.clone())).guest()?;
        Ok(Value::UserData(ud))
    }

    pub fn value(&self) -> &ScriptValue {
        &self.0
    }
}

impl UserData for OpaqueValue {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("kind", |_, this| Ok(this.0.kind().as_str()));
        fields.add_field_method_get("message", |_, this| {
            Ok(match &this.0 {
                ScriptValue::Error(err) => Some(err.message().to_string()),
                _ => None,
            })
        });
        fields.add_field_method_get("tag", |_, this| {
            Ok(match &this.0 {
                ScriptValue::Channel(ch) => Some(ch.id().to_string()),
                ScriptValue::Custom(custom) => Some(custom.type_tag().to_string()),
                _ => None,
            })
        });
    }

    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(this.0.to_string()));
    }
}
