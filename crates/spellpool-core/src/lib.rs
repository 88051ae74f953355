pub mod config;
pub mod error;
pub mod shape;
pub mod value;

pub use config::{LoadProfile, PoolConfig, ResourceLimits, ScalingTunables, SecurityLevel};
pub use error::{CallError, ConvertError, ConvertResult};
pub use shape::{KeyKind, Shape, classify_keys};
pub use value::{
    Callable, ChannelHandle, CustomValue, ErrorValue, FunctionValue, ObjectMap, ScriptValue,
    ValueKind,
};
