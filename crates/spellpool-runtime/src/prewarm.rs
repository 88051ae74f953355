//! Start-up pre-warming.
//!
//! Borrows `pre_warm_on_init` interpreters concurrently, optionally runs the
//! warm-up script on each, and returns them. Failures are logged and do not
//! fail pool construction.

use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::pool::InterpreterPool;

pub(crate) fn spawn_batch(pool: &InterpreterPool) -> JoinSet<()> {
    let config = pool.config();
    let timeout = config.pre_warm_timeout;
    let mut batch = JoinSet::new();
    for _ in 0..config.pre_warm_on_init {
        let pool = pool.clone();
        let script = config.pre_warm_script.clone();
        batch.spawn(async move { warm_one(pool, timeout, script).await });
    }
    debug!(count = config.pre_warm_on_init, "pre-warm batch started");
    batch
}

async fn warm_one(pool: InterpreterPool, timeout: Duration, script: Option<String>) {
    let lease = match pool.get_timeout(timeout).await {
        Ok(lease) => lease,
        Err(err) => {
            warn!(error = %err, "pre-warm acquire failed");
            return;
        }
    };
    let id = lease.id();

    let Some(script) = script else {
        pool.record_prewarmed();
        return;
    };

    // The lease travels with the blocking task. If the deadline passes first
    // the task is detached and the lease comes back when the script ends.
    let run = tokio::task::spawn_blocking(move || {
        let mut lease = lease;
        let result = lease.exec(&script);
        (lease, result)
    });
    match tokio::time::timeout(timeout, run).await {
        Ok(Ok((_lease, Ok(())))) => {
            pool.record_prewarmed();
            debug!(id, "interpreter pre-warmed");
        }
        Ok(Ok((_lease, Err(err)))) => warn!(id, error = %err, "pre-warm script failed"),
        Ok(Err(err)) => warn!(id, error = %err, "pre-warm task failed"),
        Err(_) => warn!(id, timeout = ?timeout, "pre-warm script timed out"),
    }
}
