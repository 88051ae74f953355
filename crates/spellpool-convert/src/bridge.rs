//! Function bridging in both directions, plus pass-through of guest values
//! that have no structural mapping.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use mlua::{Lua, MultiValue, Value};
use spellpool_core::{
    CallError, Callable, ConvertResult, CustomValue, ErrorValue, FunctionValue, ScriptValue,
};
use tracing::warn;

use crate::GuestResultExt;
use crate::converter::Converter;

static NEXT_STATE_TOKEN: AtomicU64 = AtomicU64::new(1);

struct StateToken(u64);

/// Process-unique token identifying a Lua state, assigned lazily.
pub fn state_token(lua: &Lua) -> u64 {
    if let Some(token) = lua.app_data_ref::<StateToken>().map(|t| t.0) {
        return token;
    }
    let token = NEXT_STATE_TOKEN.fetch_add(1, Ordering::Relaxed);
    lua.set_app_data(StateToken(token));
    token
}

/// Generation counter for the functions handed out by one state.
struct ScopeEpoch(Arc<AtomicU64>);

fn scope_epoch(lua: &Lua) -> Arc<AtomicU64> {
    if let Some(epoch) = lua.app_data_ref::<ScopeEpoch>().map(|e| Arc::clone(&e.0)) {
        return epoch;
    }
    let epoch = Arc::new(AtomicU64::new(0));
    lua.set_app_data(ScopeEpoch(Arc::clone(&epoch)));
    epoch
}

/// Invalidate every [`GuestFunction`] wrapped from `lua` so far. Called when
/// a pooled state changes hands; later calls fail instead of running inside
/// the next borrower's state.
pub fn end_scope(lua: &Lua) {
    scope_epoch(lua).fetch_add(1, Ordering::AcqRel);
}

// ── Guest -> host ───────────────────────────────────────────────────

/// A Lua function seen from the host side.
///
/// Callable only until [`end_scope`] runs on its state.
pub struct GuestFunction {
    lua: Lua,
    function: mlua::Function,
    converter: Converter,
    state: u64,
    epoch: Arc<AtomicU64>,
    issued: u64,
}

impl GuestFunction {
    pub(crate) fn wrap(lua: &Lua, function: mlua::Function, converter: Converter) -> FunctionValue {
        let name = function
            .info()
            .name
            .unwrap_or_else(|| "anonymous".to_string());
        let epoch = scope_epoch(lua);
        let issued = epoch.load(Ordering::Acquire);
        let guest = GuestFunction {
            lua: lua.clone(),
            function,
            converter,
            state: state_token(lua),
            epoch,
            issued,
        };
        FunctionValue::new(name, Arc::new(guest))
    }

    pub fn function(&self) -> &mlua::Function {
        &self.function
    }

    /// False once the owning state has been handed to someone else.
    pub fn is_live(&self) -> bool {
        self.epoch.load(Ordering::Acquire) == self.issued
    }
}

impl Callable for GuestFunction {
    fn call(&self, args: Vec<ScriptValue>) -> Result<ScriptValue, CallError> {
        if !self.is_live() {
            return Err(CallError::failed("interpreter returned to pool"));
        }
        let lua_args = args
            .iter()
            .map(|arg| self.converter.from_canonical(&self.lua, arg))
            .collect::<ConvertResult<Vec<_>>>()?;
        match self.function.call::<MultiValue>(MultiValue::from_vec(lua_args)) {
            Ok(results) => {
                let first = results.into_iter().next().unwrap_or(Value::Nil);
                Ok(self.converter.to_canonical(&self.lua, &first)?)
            }
            Err(err) => Ok(ScriptValue::Error(ErrorValue::new(err.to_string()))),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ── Host -> guest ───────────────────────────────────────────────────

/// Turn a canonical function into something Lua can call.
///
/// A live `GuestFunction` that came from this very state unwraps to the
/// original Lua function. Anything else gets a trampoline that reports
/// failures as `nil, message`.
pub(crate) fn function_to_guest(
    lua: &Lua,
    function: &FunctionValue,
    converter: Converter,
) -> ConvertResult<Value> {
    if let Some(guest) = function.callable().as_any().downcast_ref::<GuestFunction>() {
        if guest.state == state_token(lua) && guest.is_live() {
            return Ok(Value::Function(guest.function.clone()));
        }
    }

    let function = function.clone();
    let trampoline = lua
        .create_function(move |lua, args: MultiValue| {
            let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<ScriptValue, CallError> {
                let args = args
                    .iter()
                    .map(|arg| converter.to_canonical(lua, arg))
                    .collect::<ConvertResult<Vec<_>>>()?;
                function.call(args)
            }));

            let failure = match outcome {
                Ok(Ok(ScriptValue::Error(err))) => err.message().to_string(),
                Ok(Ok(value)) => match converter.from_canonical(lua, &value) {
                    Ok(result) => return Ok(MultiValue::from_vec(vec![result])),
                    Err(err) => err.to_string(),
                },
                Ok(Err(err)) => err.to_string(),
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    warn!(function = %function.name(), %message, "host function panicked");
                    message
                }
            };
            Ok(MultiValue::from_vec(vec![
                Value::Nil,
                Value::String(lua.create_string(&failure)?),
            ]))
        })
        .guest()?;
    Ok(Value::Function(trampoline))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("host function panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("host function panicked: {s}")
    } else {
        "host function panicked".to_string()
    }
}

// ── Opaque guest values ─────────────────────────────────────────────

/// A guest value with no structural mapping (thread, light userdata,
/// foreign userdata), carried inside `ScriptValue::Custom`.
pub struct GuestRef {
    state: u64,
    value: Value,
}

impl GuestRef {
    pub(crate) fn custom(lua: &Lua, tag: &str, value: Value) -> ScriptValue {
        ScriptValue::Custom(CustomValue::new(
            tag,
            GuestRef {
                state: state_token(lua),
                value,
            },
        ))
    }

    /// The original guest value, when `custom` came from this state.
    pub(crate) fn resolve(lua: &Lua, custom: &CustomValue) -> Option<Value> {
        let guest = custom.downcast_ref::<GuestRef>()?;
        (guest.state == state_token(lua)).then(|| guest.value.clone())
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}
