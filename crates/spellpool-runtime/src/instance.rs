//! One isolated Lua state owned by the pool.
//!
//! Wraps an `mlua::Lua` with its execution budget and a baseline captured
//! at construction, so that a used state can be returned to a clean slate
//! before the next borrower sees it. The baseline covers the globals table,
//! one level of every library table reachable from it, their metatables and
//! the shared string metatable.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mlua::{FromLuaMulti, Lua, LuaOptions, MultiValue, StdLib, Table, Value};
use tracing::debug;

use spellpool_core::{ResourceLimits, SecurityLevel};

use crate::error::InterpreterError;
use crate::limiter::ExecutionBudget;

/// `os` functions removed at the `standard` security level.
const UNSAFE_OS_FUNCTIONS: &[&str] = &[
    "execute", "exit", "remove", "rename", "setenv", "tmpname", "getenv",
];

/// Uses after which an interpreter counts as worn.
const WEAR_USES: f64 = 1000.0;

/// A table as it looked when the interpreter was created.
struct TableSnapshot {
    table: Table,
    fields: Table,
    metatable: Option<Table>,
}

impl TableSnapshot {
    fn capture(lua: &Lua, table: &Table) -> mlua::Result<Self> {
        let fields = lua.create_table()?;
        for pair in table.pairs::<Value, Value>() {
            let (key, value) = pair?;
            fields.raw_set(key, value)?;
        }
        Ok(Self {
            table: table.clone(),
            fields,
            metatable: table.metatable(),
        })
    }

    /// Put the metatable and every field back. Returns `(removed, restored)`.
    fn restore(&self) -> mlua::Result<(usize, usize)> {
        if self.table.metatable() != self.metatable {
            self.table.set_metatable(self.metatable.clone());
        }

        let mut stale = Vec::new();
        for pair in self.table.pairs::<Value, Value>() {
            let (key, _) = pair?;
            if self.fields.raw_get::<Value>(key.clone())?.is_nil() {
                stale.push(key);
            }
        }
        let removed = stale.len();
        for key in stale {
            self.table.raw_set(key, Value::Nil)?;
        }

        let mut restored = 0;
        for pair in self.fields.pairs::<Value, Value>() {
            let (key, value) = pair?;
            let current: Value = self.table.raw_get(key.clone())?;
            if current != value {
                self.table.raw_set(key, value)?;
                restored += 1;
            }
        }
        Ok((removed, restored))
    }
}

/// The globals table first, then each distinct table it reaches in one step,
/// then the string metatable.
fn snapshot_baseline(lua: &Lua) -> mlua::Result<Vec<TableSnapshot>> {
    let globals = lua.globals();
    let mut seen = HashSet::new();
    seen.insert(globals.to_pointer() as usize);
    let mut snapshots = vec![TableSnapshot::capture(lua, &globals)?];

    for pair in globals.pairs::<Value, Value>() {
        if let (_, Value::Table(table)) = pair?
            && seen.insert(table.to_pointer() as usize)
        {
            snapshots.push(TableSnapshot::capture(lua, &table)?);
        }
    }

    let string_meta: Option<Table> = lua
        .load("local gm = getmetatable; return gm and gm('')")
        .set_name("=baseline")
        .eval()?;
    if let Some(meta) = string_meta
        && seen.insert(meta.to_pointer() as usize)
    {
        snapshots.push(TableSnapshot::capture(lua, &meta)?);
    }
    Ok(snapshots)
}

pub struct Interpreter {
    id: u64,
    lua: Lua,
    created_at: Instant,
    last_reset: Instant,
    last_used: Instant,
    executing: AtomicBool,
    use_count: u64,
    budget: Arc<ExecutionBudget>,
    baseline: Vec<TableSnapshot>,
    tainted: Option<String>,
}

impl Interpreter {
    /// Wrap a configured Lua state. Its current globals and library tables
    /// become the baseline.
    pub fn new(id: u64, lua: Lua, budget: Arc<ExecutionBudget>) -> Result<Self, InterpreterError> {
        let baseline = snapshot_baseline(&lua).map_err(|e| InterpreterError::Create(e.to_string()))?;
        let now = Instant::now();
        Ok(Self {
            id,
            lua,
            created_at: now,
            last_reset: now,
            last_used: now,
            executing: AtomicBool::new(false),
            use_count: 0,
            budget,
            baseline,
            tainted: None,
        })
    }

    /// Pool-unique id, assigned at creation.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The underlying Lua state.
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    /// When the factory finished building this interpreter.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the last successful [`reset`](Self::reset) finished.
    pub fn last_reset(&self) -> Instant {
        self.last_reset
    }

    /// When the interpreter was last handed back, or its creation time if it
    /// has never been borrowed.
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// True only while a chunk runs inside [`run`](Self::run).
    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::Acquire)
    }

    /// How many times this interpreter has been borrowed.
    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    /// Score in `[0, 1]` that drops as the interpreter wears out with use
    /// and as it sits idle.
    pub fn health(&self, now: Instant) -> f64 {
        let mut health = 1.0;
        let wear = self.use_count as f64 / WEAR_USES;
        if wear > 0.5 {
            health -= 0.3;
        } else if wear > 0.2 {
            health -= 0.1;
        }
        let idle = now.saturating_duration_since(self.last_used);
        if idle > Duration::from_secs(30 * 60) {
            health -= 0.2;
        } else if idle > Duration::from_secs(10 * 60) {
            health -= 0.1;
        }
        f64::max(health, 0.0)
    }

    pub(crate) fn mark_borrowed(&mut self) {
        self.use_count += 1;
    }

    pub(crate) fn mark_returned(&mut self, now: Instant) {
        self.last_used = now;
    }

    #[cfg(test)]
    pub(crate) fn set_last_used(&mut self, at: Instant) {
        self.last_used = at;
    }

    /// Set when a run was aborted by a resource limit; such a state is not
    /// reused.
    pub fn tainted(&self) -> Option<&str> {
        self.tainted.as_deref()
    }

    /// Run a chunk for its side effects.
    pub fn exec(&mut self, script: &str) -> Result<(), InterpreterError> {
        self.run(|lua| lua.load(script).set_name("=script").exec())
    }

    /// Run a chunk and return its first result (`nil` if none).
    pub fn eval(&mut self, script: &str) -> Result<Value, InterpreterError> {
        let results: MultiValue = self.eval_multi(script)?;
        Ok(results.into_iter().next().unwrap_or(Value::Nil))
    }

    /// Run a chunk and convert all of its results.
    pub fn eval_multi<R: FromLuaMulti>(&mut self, script: &str) -> Result<R, InterpreterError> {
        self.run(|lua| lua.load(script).set_name("=script").eval::<R>())
    }

    /// Set a global without metamethods getting in the way.
    pub fn set_global(&self, name: &str, value: Value) -> Result<(), InterpreterError> {
        self.lua
            .globals()
            .set(name, value)
            .map_err(|e| InterpreterError::Script(e.to_string()))
    }

    /// Read a global, `nil` when unset.
    pub fn get_global(&self, name: &str) -> Result<Value, InterpreterError> {
        self.lua
            .globals()
            .get(name)
            .map_err(|e| InterpreterError::Script(e.to_string()))
    }

    /// Run `f` under the execution budget with the executing flag held.
    pub fn run<R>(&mut self, f: impl FnOnce(&Lua) -> mlua::Result<R>) -> Result<R, InterpreterError> {
        self.executing.store(true, Ordering::Release);
        self.budget.arm();
        let result = f(&self.lua);
        self.budget.disarm();
        self.executing.store(false, Ordering::Release);

        result.map_err(|err| {
            if self.budget.tripped() || matches!(err, mlua::Error::MemoryError(_)) {
                self.tainted = Some(err.to_string());
            }
            InterpreterError::Script(err.to_string())
        })
    }

    /// Return the state to its baseline and run a full collection.
    ///
    /// New globals and library fields are removed, overwritten ones are put
    /// back, replaced metatables are restored, and guest functions handed
    /// out during the previous borrow stop working.
    pub fn reset(&mut self) -> Result<(), InterpreterError> {
        spellpool_convert::end_scope(&self.lua);
        if let Some(reason) = &self.tainted {
            return Err(InterpreterError::Reset(format!(
                "interpreter {} aborted by resource limit: {reason}",
                self.id
            )));
        }
        let reset_err = |e: mlua::Error| InterpreterError::Reset(e.to_string());

        let (mut removed, mut restored) = (0, 0);
        for snapshot in &self.baseline {
            let (r, s) = snapshot.restore().map_err(reset_err)?;
            removed += r;
            restored += s;
        }

        self.lua.gc_collect().map_err(reset_err)?;
        self.lua.expire_registry_values();
        self.last_reset = Instant::now();
        debug!(id = self.id, removed, restored, "interpreter reset");
        Ok(())
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        spellpool_convert::end_scope(&self.lua);
    }
}

/// Builds interpreters for the pool. Implementations are called from
/// blocking threads, so they may take a while.
pub trait InterpreterFactory: Send + Sync + 'static {
    /// Build a ready-to-borrow interpreter carrying `id`.
    fn create(&self, id: u64) -> Result<Interpreter, InterpreterError>;
}

/// The standard factory: a sandboxed Lua 5.4 state with resource limits.
#[derive(Debug, Clone)]
pub struct LuaFactory {
    limits: ResourceLimits,
}

impl LuaFactory {
    pub fn new(limits: ResourceLimits) -> Self {
        Self { limits }
    }

    /// Limits applied to every interpreter this factory builds.
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    fn std_libs(level: SecurityLevel) -> StdLib {
        let core = StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::COROUTINE | StdLib::UTF8;
        match level {
            SecurityLevel::Minimal => StdLib::ALL_SAFE,
            SecurityLevel::Standard => core | StdLib::OS | StdLib::PACKAGE,
            SecurityLevel::Strict => core,
        }
    }

    fn sanitize(lua: &Lua, level: SecurityLevel) -> mlua::Result<()> {
        if level != SecurityLevel::Standard {
            return Ok(());
        }
        if let Some(os) = lua.globals().get::<Option<Table>>("os")? {
            for name in UNSAFE_OS_FUNCTIONS {
                os.raw_set(*name, Value::Nil)?;
            }
        }
        Ok(())
    }
}

impl InterpreterFactory for LuaFactory {
    fn create(&self, id: u64) -> Result<Interpreter, InterpreterError> {
        let create_err = |e: mlua::Error| InterpreterError::Create(e.to_string());
        let level = self.limits.security;

        let lua = Lua::new_with(Self::std_libs(level), LuaOptions::new()).map_err(create_err)?;
        Self::sanitize(&lua, level).map_err(create_err)?;
        if self.limits.memory_limit > 0 {
            lua.set_memory_limit(self.limits.memory_limit)
                .map_err(create_err)?;
        }

        let budget = Arc::new(ExecutionBudget::from_limits(&self.limits));
        budget.install(&lua);

        if let Some(init) = &self.limits.init_script {
            budget.arm();
            let result = lua.load(init.as_str()).set_name("=init").exec();
            budget.disarm();
            result.map_err(create_err)?;
        }

        let interpreter = Interpreter::new(id, lua, budget)?;
        debug!(id, security = ?level, "interpreter created");
        Ok(interpreter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory(security: SecurityLevel) -> LuaFactory {
        LuaFactory::new(ResourceLimits {
            security,
            ..ResourceLimits::default()
        })
    }

    #[test]
    fn eval_returns_first_result() {
        let mut interp = factory(SecurityLevel::Standard).create(1).unwrap();
        let v = interp.eval("return 40 + 2, 'second'").unwrap();
        assert_eq!(v, Value::Integer(42));
        assert!(interp.eval("x = 1").unwrap().is_nil());
        assert!(!interp.is_executing());
    }

    #[test]
    fn script_error_is_reported() {
        let mut interp = factory(SecurityLevel::Standard).create(1).unwrap();
        let err = interp.exec("error('broken')").unwrap_err();
        assert!(matches!(err, InterpreterError::Script(ref m) if m.contains("broken")));
        assert!(interp.tainted().is_none());
    }

    #[test]
    fn reset_removes_new_globals_and_restores_overwritten() {
        let mut interp = factory(SecurityLevel::Standard).create(7).unwrap();
        interp
            .exec("leaked = 'secret'; print = nil; string = 'clobbered'")
            .unwrap();
        interp.reset().unwrap();

        assert!(interp.get_global("leaked").unwrap().is_nil());
        assert!(matches!(interp.get_global("print").unwrap(), Value::Function(_)));
        assert!(matches!(interp.get_global("string").unwrap(), Value::Table(_)));
        let up: String = interp.eval_multi("return string.upper('ok')").unwrap();
        assert_eq!(up, "OK");
    }

    #[test]
    fn reset_restores_library_tables_and_metatables() {
        let mut interp = factory(SecurityLevel::Standard).create(7).unwrap();
        interp
            .exec(
                "string.upper = function() return 'pwned' end \
                 string.extra = true \
                 math.pi = 3 \
                 setmetatable(_G, {__index = function() return 'ghost' end}) \
                 getmetatable('').__index = {len = function() return -1 end}",
            )
            .unwrap();
        interp.reset().unwrap();

        let up: String = interp.eval_multi("return string.upper('ok')").unwrap();
        assert_eq!(up, "OK");
        assert!(interp.eval("return string.extra").unwrap().is_nil());
        assert!(interp.eval("return undefined_name").unwrap().is_nil());
        let (pi, len): (f64, i64) = interp.eval_multi("return math.pi, ('abc'):len()").unwrap();
        assert_eq!(pi, std::f64::consts::PI);
        assert_eq!(len, 3);
        assert!(interp.eval("return getmetatable(_G)").unwrap().is_nil());
    }

    #[test]
    fn health_drops_with_wear_and_idleness() {
        let mut interp = factory(SecurityLevel::Standard).create(1).unwrap();
        let now = Instant::now();
        assert_eq!(interp.health(now), 1.0);

        for _ in 0..600 {
            interp.mark_borrowed();
        }
        assert!((interp.health(now) - 0.7).abs() < 1e-9);
        assert!((interp.health(now + Duration::from_secs(11 * 60)) - 0.6).abs() < 1e-9);
        assert!((interp.health(now + Duration::from_secs(31 * 60)) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn security_levels_gate_libraries() {
        let mut minimal = factory(SecurityLevel::Minimal).create(1).unwrap();
        assert!(matches!(minimal.eval("return io").unwrap(), Value::Table(_)));
        assert!(matches!(minimal.eval("return os.getenv").unwrap(), Value::Function(_)));

        let mut standard = factory(SecurityLevel::Standard).create(2).unwrap();
        assert!(standard.eval("return io").unwrap().is_nil());
        assert!(standard.eval("return os.execute").unwrap().is_nil());
        assert!(standard.eval("return os.getenv").unwrap().is_nil());
        assert!(matches!(standard.eval("return os.time").unwrap(), Value::Function(_)));

        let mut strict = factory(SecurityLevel::Strict).create(3).unwrap();
        assert!(strict.eval("return os").unwrap().is_nil());
        assert!(strict.eval("return require").unwrap().is_nil());
        assert!(matches!(strict.eval("return math.floor").unwrap(), Value::Function(_)));
    }

    #[test]
    fn init_script_becomes_baseline() {
        let f = LuaFactory::new(ResourceLimits {
            init_script: Some("greeting = 'hello'".into()),
            ..ResourceLimits::default()
        });
        let mut interp = f.create(1).unwrap();
        interp.exec("greeting = 'changed'; extra = 1").unwrap();
        interp.reset().unwrap();
        let greeting: String = interp.eval_multi("return greeting").unwrap();
        assert_eq!(greeting, "hello");
    }

    #[test]
    fn broken_init_script_fails_creation() {
        let f = LuaFactory::new(ResourceLimits {
            init_script: Some("this is not lua".into()),
            ..ResourceLimits::default()
        });
        assert!(matches!(f.create(1), Err(InterpreterError::Create(_))));
    }

    #[test]
    fn limit_abort_taints_and_blocks_reset() {
        let f = LuaFactory::new(ResourceLimits {
            instruction_limit: 50_000,
            hook_interval: 100,
            ..ResourceLimits::default()
        });
        let mut interp = f.create(1).unwrap();
        assert!(interp.exec("while true do end").is_err());
        assert!(interp.tainted().is_some());
        assert!(matches!(interp.reset(), Err(InterpreterError::Reset(_))));
    }

    #[test]
    fn memory_limit_is_enforced() {
        let f = LuaFactory::new(ResourceLimits {
            memory_limit: 2 * 1024 * 1024,
            ..ResourceLimits::default()
        });
        let mut interp = f.create(1).unwrap();
        let err = interp
            .exec("local t = {} for i = 1, 1e7 do t[i] = ('x'):rep(64) .. i end")
            .unwrap_err();
        assert!(matches!(err, InterpreterError::Script(_)));
    }
}
