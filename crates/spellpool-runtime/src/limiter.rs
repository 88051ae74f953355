//! Per-execution instruction and wall-clock limits.
//!
//! Installed as a Lua VM hook that fires every `hook_interval` instructions.
//! When a budget is exceeded the hook raises a runtime error, which unwinds
//! the running chunk, and the budget records that it tripped.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mlua::{HookTriggers, Lua, VmState};
use spellpool_core::ResourceLimits;

/// Per-interpreter execution budget.
#[derive(Debug)]
pub struct ExecutionBudget {
    instruction_limit: u64,
    hook_interval: u32,
    max_duration: Option<Duration>,
    /// Instructions executed since the budget was armed (hook granularity).
    executed: AtomicU64,
    deadline: Mutex<Option<Instant>>,
    armed: AtomicBool,
    tripped: AtomicBool,
}

impl ExecutionBudget {
    pub fn new(instruction_limit: u64, hook_interval: u32, max_duration: Option<Duration>) -> Self {
        Self {
            instruction_limit,
            hook_interval: hook_interval.max(1),
            max_duration,
            executed: AtomicU64::new(0),
            deadline: Mutex::new(None),
            armed: AtomicBool::new(false),
            tripped: AtomicBool::new(false),
        }
    }

    pub fn from_limits(limits: &ResourceLimits) -> Self {
        Self::new(limits.instruction_limit, limits.hook_interval, limits.max_duration)
    }

    /// True when there is anything to enforce.
    pub fn is_limited(&self) -> bool {
        self.instruction_limit > 0 || self.max_duration.is_some()
    }

    /// Install the hook on `lua`. No-op for an unlimited budget.
    pub fn install(self: &Arc<Self>, lua: &Lua) {
        if !self.is_limited() {
            return;
        }
        let budget = Arc::clone(self);
        let triggers = HookTriggers::new().every_nth_instruction(self.hook_interval);
        lua.set_hook(triggers, move |_lua, _debug| match budget.charge() {
            Some(reason) => Err(mlua::Error::RuntimeError(reason)),
            None => Ok(VmState::Continue),
        });
    }

    /// Start a fresh budget for one execution.
    pub fn arm(&self) {
        self.executed.store(0, Ordering::Relaxed);
        *self.deadline.lock().expect("budget deadline lock") =
            self.max_duration.map(|d| Instant::now() + d);
        self.tripped.store(false, Ordering::Relaxed);
        self.armed.store(true, Ordering::Release);
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    /// Did the last armed execution run out of budget?
    pub fn tripped(&self) -> bool {
        self.tripped.load(Ordering::Relaxed)
    }

    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    /// Account one hook interval. Returns the abort reason when exhausted.
    fn charge(&self) -> Option<String> {
        if !self.armed.load(Ordering::Acquire) {
            return None;
        }
        let executed =
            self.executed.fetch_add(u64::from(self.hook_interval), Ordering::Relaxed)
                + u64::from(self.hook_interval);
        if self.instruction_limit > 0 && executed > self.instruction_limit {
            self.tripped.store(true, Ordering::Relaxed);
            return Some(format!(
                "instruction limit of {} exceeded",
                self.instruction_limit
            ));
        }
        let deadline = *self.deadline.lock().expect("budget deadline lock");
        if let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            self.tripped.store(true, Ordering::Relaxed);
            return Some(format!(
                "execution time limit of {:?} exceeded",
                self.max_duration.unwrap_or_default()
            ));
        }
        None
    }
}
