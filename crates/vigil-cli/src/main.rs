mod config;
mod run_cmd;

#[cfg(test)]
mod test_util;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use vigil_core::{PreflightFailure, TaskKind};

use config::{CliOverrides, VigilConfig};
use run_cmd::RunOptions;

#[derive(Parser)]
#[command(name = "vigil", about = "Fail-closed supervisor for coding agent CLIs")]
struct Cli {
    /// Registered harness to use (default: claude-code)
    #[arg(long, global = true)]
    harness: Option<String>,

    /// Agent binary (overrides VIGIL_AGENT_BINARY env var)
    #[arg(long, global = true)]
    binary: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a vigil config file with every setting at its default
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run one task under supervision and report whether it did the work
    Run {
        /// Prompt handed to the agent
        prompt: String,
        /// Working directory for the agent (default: current directory)
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Task kind: modify, analyze, review or question
        #[arg(long, default_value = "modify")]
        kind: TaskKind,
        /// Model passed to the agent (overrides VIGIL_MODEL env var)
        #[arg(long)]
        model: Option<String>,
        /// Overall wall-clock bound in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Disable the overall wall-clock bound
        #[arg(long, conflicts_with = "timeout")]
        no_timeout: bool,
        /// Push the overall deadline back whenever output arrives
        #[arg(long)]
        progress_aware: bool,
        /// Skip the version and auth probes
        #[arg(long)]
        skip_preflight: bool,
        /// Print the result as JSON on stdout (agent output goes to stderr)
        #[arg(long)]
        json: bool,
    },
    /// Run the version and auth probes only
    Preflight,
    /// Show the environment the agent would receive
    Env,
}

/// Execute the `vigil init` command: write config file.
fn cmd_init(force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile::with_defaults();
    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  agent.harness = {}", config::DEFAULT_HARNESS);
    println!("  agent.binary  = {}", config::DEFAULT_BINARY);
    println!(
        "  supervisor.overall_timeout = {}s",
        cfg.supervisor.overall_timeout.as_secs()
    );

    Ok(())
}

/// Execute the `vigil preflight` command. Returns the process exit code.
async fn cmd_preflight(config: &VigilConfig) -> anyhow::Result<i32> {
    let harness = run_cmd::resolve_harness(config)?;
    println!("Checking {} ({})...", harness.name(), harness.binary());

    match harness.preflight(&config.supervisor).await {
        Ok(report) => {
            println!("  version: {}", report.version);
            println!(
                "  auth:    ok ({:.1}s)",
                report.auth_probe_duration.as_secs_f64()
            );
            Ok(0)
        }
        Err(failure) => {
            println!("  {}: {failure}", failure.blocked_reason());
            if let PreflightFailure::AuthFailed { retryable: true, .. } = failure {
                println!("  (the probe was killed; retrying may succeed)");
            }
            Ok(1)
        }
    }
}

/// Execute the `vigil env` command.
fn cmd_env() {
    for (key, value) in vigil_core::env::sanitized_env() {
        println!("{key}={value}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_env("VIGIL_LOG")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut overrides = CliOverrides {
        harness: cli.harness,
        binary: cli.binary,
        model: None,
    };

    match cli.command {
        Commands::Init { force } => {
            cmd_init(force)?;
        }
        Commands::Run {
            prompt,
            dir,
            kind,
            model,
            timeout,
            no_timeout,
            progress_aware,
            skip_preflight,
            json,
        } => {
            overrides.model = model;
            let resolved = VigilConfig::resolve(&overrides)?;
            let opts = RunOptions {
                prompt,
                dir,
                kind,
                timeout_secs: timeout,
                no_timeout,
                progress_aware,
                skip_preflight,
                json,
            };
            let code = run_cmd::run_task(resolved, opts).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Preflight => {
            let resolved = VigilConfig::resolve(&overrides)?;
            let code = cmd_preflight(&resolved).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Env => {
            cmd_env();
        }
    }

    Ok(())
}
