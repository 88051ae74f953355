//! spellpool-runtime — pooled Lua interpreters.
//!
//! The runtime manages:
//!
//! - **Interpreter creation**: sandboxed Lua 5.4 states with a security
//!   level, a memory cap and an instruction/time budget
//! - **Pooling**: borrow/return with reset, lazy growth to `max_size`,
//!   bounded waits and cancellation
//! - **Predictive scaling**: a background task that grows or shrinks the
//!   idle set ahead of demand
//! - **Pre-warming** and **least-loaded selection** of idle interpreters
//! - **Memory blocks**: a free list of fixed-size scratch buffers
//!
//! # Architecture
//!
//! ```text
//! ScriptRuntime
//!   ├── Converter (ScriptValue <-> Lua)
//!   └── InterpreterPool
//!       ├── InterpreterFactory (LuaFactory by default)
//!       ├── VecDeque<Interpreter> + Semaphore (idle set)
//!       ├── LoadTracker, MemoryBlockPool
//!       └── PredictiveScaler task, pre-warm JoinSet
//! ```

pub mod balancer;
pub mod error;
pub mod instance;
pub mod limiter;
pub mod memory;
pub mod pool;
mod prewarm;

use std::time::Duration;

use spellpool_convert::Converter;
use spellpool_core::{PoolConfig, ScriptValue};
use tracing::debug;

pub use balancer::{LoadTracker, StateLoadInfo};
pub use error::{ExecError, InterpreterError, PoolError, PoolResult};
pub use instance::{Interpreter, InterpreterFactory, LuaFactory};
pub use limiter::ExecutionBudget;
pub use memory::{MemoryBlockPool, MemoryPoolStats};
pub use pool::{InterpreterPool, PoolMetrics, PooledInterpreter};

/// Runs scripts on pooled interpreters, exchanging values as
/// [`ScriptValue`].
///
/// A function returned by a script is only callable until its interpreter
/// goes back to the pool, which happens before `execute` returns. Calling it
/// later fails with `CallError::Failed("interpreter returned to pool")`.
pub struct ScriptRuntime {
    pool: InterpreterPool,
    converter: Converter,
}

impl ScriptRuntime {
    pub async fn new(config: PoolConfig) -> PoolResult<Self> {
        Ok(Self::with_pool(InterpreterPool::new(config).await?))
    }

    pub fn with_pool(pool: InterpreterPool) -> Self {
        Self {
            pool,
            converter: Converter::new(),
        }
    }

    pub fn with_converter(mut self, converter: Converter) -> Self {
        self.converter = converter;
        self
    }

    pub fn pool(&self) -> &InterpreterPool {
        &self.pool
    }

    /// Borrow an interpreter, bind `globals`, run `script` and convert its
    /// first result.
    pub async fn execute(
        &self,
        script: impl Into<String>,
        globals: Vec<(String, ScriptValue)>,
    ) -> Result<ScriptValue, ExecError> {
        let lease = self.pool.get().await?;
        let converter = self.converter.clone();
        let script = script.into();

        let task = tokio::task::spawn_blocking(move || -> Result<ScriptValue, ExecError> {
            let mut lease = lease;
            for (name, value) in &globals {
                let guest = converter.from_canonical(lease.lua(), value)?;
                lease.set_global(name, guest)?;
            }
            let result = lease.eval(&script)?;
            let value = converter.to_canonical(lease.lua(), &result)?;
            debug!(id = lease.id(), kind = %value.kind(), "script executed");
            Ok(value)
        });
        task.await.map_err(|e| ExecError::Join(e.to_string()))?
    }

    pub fn metrics(&self) -> PoolMetrics {
        self.pool.metrics()
    }

    /// Scratch buffers for callers; the runtime itself does not draw on them.
    pub fn memory_blocks(&self) -> &MemoryBlockPool {
        self.pool.memory_blocks()
    }

    pub async fn wait_for_prewarm(&self) {
        self.pool.wait_for_prewarm().await;
    }

    pub async fn shutdown(&self, timeout: Duration) -> PoolResult<()> {
        self.pool.shutdown(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spellpool_core::{CallError, ObjectMap};

    fn small() -> PoolConfig {
        PoolConfig {
            min_size: 1,
            max_size: 2,
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn execute_converts_result() {
        let rt = ScriptRuntime::new(small()).await.unwrap();
        let value = rt
            .execute("return { name = 'bolt', power = 3, tags = {'a', 'b'} }", vec![])
            .await
            .unwrap();

        let mut expected = ObjectMap::new();
        expected.insert("name".into(), "bolt".into());
        expected.insert("power".into(), 3.into());
        expected.insert(
            "tags".into(),
            ScriptValue::Array(vec!["a".into(), "b".into()]),
        );
        assert_eq!(value, ScriptValue::Object(expected));
    }

    #[tokio::test]
    async fn globals_are_bound_and_cleared() {
        let rt = ScriptRuntime::new(small()).await.unwrap();
        let value = rt
            .execute("return x * 2", vec![("x".into(), 21.into())])
            .await
            .unwrap();
        assert_eq!(value, ScriptValue::Number(42.0));

        let value = rt.execute("return x", vec![]).await.unwrap();
        assert!(value.is_nil());
    }

    #[tokio::test]
    async fn host_function_is_callable_from_script() {
        let rt = ScriptRuntime::new(small()).await.unwrap();
        let add = ScriptValue::function("add", |args| {
            let sum: f64 = args.iter().filter_map(ScriptValue::as_f64).sum();
            Ok(ScriptValue::Number(sum))
        });
        let value = rt
            .execute("return add(1, 2, 3)", vec![("add".into(), add)])
            .await
            .unwrap();
        assert_eq!(value, ScriptValue::Number(6.0));
    }

    #[tokio::test]
    async fn host_failure_reaches_script_as_nil_and_message() {
        let rt = ScriptRuntime::new(small()).await.unwrap();
        let fail = ScriptValue::function("fail", |_| Err(CallError::failed("no mana")));
        let value = rt
            .execute(
                "local v, err = fail() return { ok = v == nil, err = err }",
                vec![("fail".into(), fail)],
            )
            .await
            .unwrap();
        assert_eq!(value.get("ok"), Some(&ScriptValue::Bool(true)));
        assert!(value.get("err").and_then(ScriptValue::as_str).unwrap().contains("no mana"));
    }

    #[tokio::test]
    async fn script_error_is_returned() {
        let rt = ScriptRuntime::new(small()).await.unwrap();
        let err = rt.execute("error('fizzle')", vec![]).await.unwrap_err();
        assert!(matches!(err, ExecError::Interpreter(InterpreterError::Script(_))));
        assert_eq!(rt.metrics().in_use, 0);
    }

    #[tokio::test]
    async fn returned_function_dies_with_its_lease() {
        let rt = ScriptRuntime::new(PoolConfig {
            min_size: 1,
            max_size: 1,
            ..PoolConfig::default()
        })
        .await
        .unwrap();
        let leaked = rt
            .execute("return function() leaked = 1 end", vec![])
            .await
            .unwrap();
        let err = leaked.as_function().unwrap().call(vec![]).unwrap_err();
        assert_eq!(err, CallError::failed("interpreter returned to pool"));

        let value = rt.execute("return leaked", vec![]).await.unwrap();
        assert!(value.is_nil());
    }

    #[tokio::test]
    async fn function_called_inside_the_script_still_works() {
        let rt = ScriptRuntime::new(small()).await.unwrap();
        let value = rt
            .execute("local f = function(x) return x + 1 end; return f(41)", vec![])
            .await
            .unwrap();
        assert_eq!(value, ScriptValue::Number(42.0));
    }

    #[tokio::test]
    async fn execute_after_shutdown_fails() {
        let rt = ScriptRuntime::new(small()).await.unwrap();
        rt.shutdown(Duration::from_millis(100)).await.unwrap();
        let err = rt.execute("return 1", vec![]).await.unwrap_err();
        assert!(matches!(err, ExecError::Pool(PoolError::Closed)));
    }
}
