use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use spellpool_core::{PoolConfig, ScriptValue};
use spellpool_runtime::ScriptRuntime;
use tokio::task::JoinSet;
use tracing::{info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RunOptions {
    pub concurrency: usize,
    pub iterations: usize,
    pub arg: Option<String>,
}

pub async fn run(script_path: &Path, config: PoolConfig, options: RunOptions) -> anyhow::Result<()> {
    let script = std::fs::read_to_string(script_path)
        .with_context(|| format!("Failed to read {}", script_path.display()))?;
    let globals = parse_globals(options.arg.as_deref())?;

    let runtime = Arc::new(ScriptRuntime::new(config).await?);
    runtime.wait_for_prewarm().await;

    let workers = options.concurrency.max(1);
    let iterations = options.iterations.max(1);
    info!(script = %script_path.display(), workers, iterations, "running script");

    let started = Instant::now();
    let mut set = JoinSet::new();
    for _ in 0..workers {
        let runtime = Arc::clone(&runtime);
        let script = script.clone();
        let globals = globals.clone();
        set.spawn(async move {
            let mut last = None;
            let mut failures = 0u64;
            for _ in 0..iterations {
                match runtime.execute(script.as_str(), globals.clone()).await {
                    Ok(value) => last = Some(value),
                    Err(err) => {
                        warn!(error = %err, "execution failed");
                        failures += 1;
                    }
                }
            }
            (last, failures)
        });
    }

    let mut last = None;
    let mut failures = 0u64;
    while let Some(joined) = set.join_next().await {
        let (value, failed) = joined?;
        failures += failed;
        if value.is_some() {
            last = value;
        }
    }
    let elapsed = started.elapsed();

    let report = serde_json::json!({
        "result": last.as_ref().map(result_json),
        "executions": (workers * iterations) as u64,
        "failures": failures,
        "elapsed_ms": elapsed.as_millis() as u64,
        "metrics": runtime.metrics(),
        "memory": runtime.memory_blocks().stats(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    runtime.shutdown(SHUTDOWN_TIMEOUT).await?;
    if failures > 0 {
        anyhow::bail!("{failures} execution(s) failed");
    }
    Ok(())
}

/// An object binds each key as a global; anything else binds as `arg`.
fn parse_globals(arg: Option<&str>) -> anyhow::Result<Vec<(String, ScriptValue)>> {
    let Some(raw) = arg else {
        return Ok(Vec::new());
    };
    let json: serde_json::Value = serde_json::from_str(raw).context("--arg is not valid JSON")?;
    Ok(match ScriptValue::from(json) {
        ScriptValue::Object(map) => map.into_iter().collect(),
        other => vec![("arg".to_string(), other)],
    })
}

/// Data values render as JSON; functions and handles as their display form.
fn result_json(value: &ScriptValue) -> serde_json::Value {
    serde_json::Value::try_from(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()))
}
