use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "spellpool",
    about = "spellpool — pooled Lua interpreters",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script through the pool and print the result and pool metrics.
    Run {
        /// Lua script to execute
        script: PathBuf,
        /// Pool configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Load profile: burst, steady, periodic, memory_intensive
        #[arg(short, long)]
        profile: Option<String>,
        /// Number of concurrent workers
        #[arg(long, default_value = "1")]
        concurrency: usize,
        /// Executions per worker
        #[arg(long, default_value = "1")]
        iterations: usize,
        /// JSON value bound as globals (object keys) or as `arg`
        #[arg(long)]
        arg: Option<String>,
    },
    /// Print the effective configuration as TOML.
    Config {
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(short, long)]
        profile: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,spellpool=debug".parse().unwrap());
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Run {
            script,
            config,
            profile,
            concurrency,
            iterations,
            arg,
        } => {
            let pool_config = commands::load_config(config.as_deref(), profile.as_deref())?;
            let options = commands::run::RunOptions {
                concurrency,
                iterations,
                arg,
            };
            commands::run::run(&script, pool_config, options).await
        }
        Commands::Config { config, profile } => {
            let pool_config = commands::load_config(config.as_deref(), profile.as_deref())?;
            commands::config::print(&pool_config)
        }
    }
}
