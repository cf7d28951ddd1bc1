mod run_cmd;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use swarm_core::SwarmConfig;

#[derive(Parser)]
#[command(name = "swarm", about = "Local control plane for parallel autonomous coding agents")]
struct Cli {
    /// Config file path (defaults to ./swarm.toml, then ~/.config/swarm/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter swarm.toml in the current directory
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run a build request against the configured repository
    Run {
        /// The natural-language build request
        request: String,
        /// Override the dispatch concurrency cap
        #[arg(long)]
        max_workers: Option<usize>,
        /// Override the per-task timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Print the final metrics snapshot as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => init_config(force),
        Commands::Run {
            request,
            max_workers,
            timeout,
            json,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(max_workers) = max_workers {
                config.max_workers = max_workers;
            }
            if let Some(timeout) = timeout {
                config.worker_timeout_secs = timeout;
            }
            let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
            runtime.block_on(run_cmd::run(config, &request, json))
        }
    }
}

/// Resolve the config file: explicit flag, then ./swarm.toml, then the
/// user config directory.
fn load_config(explicit: Option<&std::path::Path>) -> Result<SwarmConfig> {
    if let Some(path) = explicit {
        return SwarmConfig::load(path);
    }
    let local = PathBuf::from("swarm.toml");
    if local.exists() {
        return SwarmConfig::load(&local);
    }
    let user = user_config_path();
    if user.exists() {
        return SwarmConfig::load(&user);
    }
    bail!(
        "no config file found: pass --config, or run `swarm init` to create ./swarm.toml \
         (also looked at {})",
        user.display()
    );
}

fn user_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("swarm")
        .join("config.toml")
}

fn init_config(force: bool) -> Result<()> {
    let path = PathBuf::from("swarm.toml");
    if path.exists() && !force {
        bail!("swarm.toml already exists (use --force to overwrite)");
    }
    let template = toml::to_string_pretty(&SwarmConfig::default())
        .context("failed to serialize default config")?;
    std::fs::write(&path, template).context("failed to write swarm.toml")?;
    println!("Wrote swarm.toml -- fill in llm.endpoints and git.repo_url before running.");
    Ok(())
}
