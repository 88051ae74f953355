//! Bidirectional value bridge between Lua (via `mlua`) and [`ScriptValue`].
//!
//! [`Converter`] is the entry point. Functions cross in both directions
//! through the single [`spellpool_core::Callable`] trait; values with no
//! structural mapping pass through opaquely and come back unchanged, unless
//! a [`CustomCodec`] is registered for their type tag.
//!
//! [`ScriptValue`]: spellpool_core::ScriptValue

pub mod bridge;
pub mod codec;
pub mod converter;
pub mod opaque;

pub use bridge::{GuestFunction, GuestRef, end_scope, state_token};
pub use codec::{CodecRegistry, CustomCodec};
pub use converter::{Converter, DEFAULT_MAX_DEPTH};
pub use opaque::OpaqueValue;

use spellpool_core::{ConvertError, ConvertResult};

/// Map guest runtime failures into [`ConvertError::Guest`].
pub trait GuestResultExt<T> {
    fn guest(self) -> ConvertResult<T>;
}

impl<T> GuestResultExt<T> for mlua::Result<T> {
    fn guest(self) -> ConvertResult<T> {
        self.map_err(|err| ConvertError::Guest(err.to_string()))
    }
}
