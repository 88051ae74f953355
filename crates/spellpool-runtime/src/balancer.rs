//! Least-loaded interpreter selection.
//!
//! Tracks per-interpreter execution counts and durations, and picks the
//! least used of a small sample of idle candidates.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

/// How many idle candidates are inspected per selection.
pub const SAMPLE_SIZE: usize = 3;

/// Load statistics for one interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StateLoadInfo {
    pub execution_count: u64,
    pub total_duration: Duration,
    #[serde(skip)]
    pub last_execution_start: Option<Instant>,
    pub avg_duration: Duration,
}

impl Default for StateLoadInfo {
    fn default() -> Self {
        Self {
            execution_count: 0,
            total_duration: Duration::ZERO,
            last_execution_start: None,
            avg_duration: Duration::ZERO,
        }
    }
}

/// Per-interpreter load bookkeeping, keyed by interpreter id.
#[derive(Debug, Default)]
pub struct LoadTracker {
    loads: Mutex<HashMap<u64, StateLoadInfo>>,
}

impl LoadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a borrow. The entry is created on first use.
    pub fn begin(&self, id: u64, now: Instant) {
        let mut loads = self.loads.lock().expect("load tracker lock");
        let info = loads.entry(id).or_default();
        info.execution_count += 1;
        info.last_execution_start = Some(now);
    }

    /// Record a return.
    pub fn end(&self, id: u64, now: Instant) {
        let mut loads = self.loads.lock().expect("load tracker lock");
        let Some(info) = loads.get_mut(&id) else {
            return;
        };
        if let Some(start) = info.last_execution_start.take() {
            info.total_duration += now.saturating_duration_since(start);
        }
        if info.execution_count > 0 {
            let count = u32::try_from(info.execution_count).unwrap_or(u32::MAX);
            info.avg_duration = info.total_duration / count;
        }
    }

    pub fn remove(&self, id: u64) {
        self.loads.lock().expect("load tracker lock").remove(&id);
    }

    /// Execution count for `id`; unseen ids count as 0.
    pub fn execution_count(&self, id: u64) -> u64 {
        self.loads
            .lock()
            .expect("load tracker lock")
            .get(&id)
            .map_or(0, |info| info.execution_count)
    }

    pub fn get(&self, id: u64) -> Option<StateLoadInfo> {
        self.loads.lock().expect("load tracker lock").get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.loads.lock().expect("load tracker lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of the least-loaded id among the first `SAMPLE_SIZE`
    /// candidates. Ties keep the earliest candidate.
    ///
    /// Returns `None` if `candidates` is empty.
    pub fn select_least_loaded(&self, candidates: &[u64]) -> Option<usize> {
        let loads = self.loads.lock().expect("load tracker lock");
        let count = |id: &u64| loads.get(id).map_or(0, |info| info.execution_count);
        candidates
            .iter()
            .take(SAMPLE_SIZE)
            .enumerate()
            .min_by_key(|&(idx, id)| (count(id), idx))
            .map(|(idx, _)| idx)
    }
}
