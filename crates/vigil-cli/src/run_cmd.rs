//! `vigil run` command: supervise one agent task and report the verdict.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use vigil_core::broadcast::{OutputChunk, StreamKind, Subscriber};
use vigil_core::{
    ExecutionResult, Harness, HarnessRegistry, OutputBroadcaster, ProcessSupervisor, Status, Task,
    TaskKind,
};

use crate::config::VigilConfig;

/// Flags of `vigil run` that shape the task and its timers.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub prompt: String,
    pub dir: Option<PathBuf>,
    pub kind: TaskKind,
    pub timeout_secs: Option<u64>,
    pub no_timeout: bool,
    pub progress_aware: bool,
    pub skip_preflight: bool,
    pub json: bool,
}

/// Look up the configured harness, listing the registered names on a miss.
pub fn resolve_harness(config: &VigilConfig) -> Result<Arc<dyn Harness>> {
    let registry = HarnessRegistry::with_builtin(config.binary.clone());
    registry.get(&config.harness).with_context(|| {
        format!(
            "unknown harness {:?} (available: {})",
            config.harness,
            registry.list().join(", ")
        )
    })
}

/// Process exit code for a terminal status. Only COMPLETE is success.
pub fn exit_code_for(status: Status) -> i32 {
    match status {
        Status::Complete => 0,
        Status::Error => 1,
        Status::Incomplete => 2,
        Status::NoEvidence => 3,
        Status::Blocked => 4,
    }
}

/// Prints live chunks. Agent output goes to stdout unless stdout is
/// reserved for the JSON result; supervisor notes always go to stderr.
struct ChunkPrinter {
    json: bool,
}

impl Subscriber for ChunkPrinter {
    fn on_chunk(&self, chunk: &OutputChunk) -> Result<()> {
        match chunk.stream {
            StreamKind::Stdout if !self.json => {
                let mut out = std::io::stdout().lock();
                out.write_all(chunk.text.as_bytes())?;
                out.flush()?;
            }
            stream if stream.is_process_output() => {
                let mut err = std::io::stderr().lock();
                err.write_all(chunk.text.as_bytes())?;
                err.flush()?;
            }
            stream => {
                let mut err = std::io::stderr().lock();
                writeln!(err, "[vigil:{stream}] {}", chunk.text.trim_end())?;
            }
        }
        Ok(())
    }
}

fn print_summary(result: &ExecutionResult) {
    println!();
    println!("Status:   {}", result.status);
    if let Some(reason) = result.blocked_reason {
        println!("Blocked:  {reason}");
    }
    println!("Duration: {:.1}s", result.duration_ms as f64 / 1000.0);
    if let Some(code) = result.exit_code {
        println!("Exit:     {code}");
    }
    if !result.verified_files.is_empty() {
        println!("Verified files:");
        for file in &result.verified_files {
            match file.size {
                Some(size) => println!("  {} ({size} bytes)", file.path),
                None => println!("  {}", file.path),
            }
        }
    }
    if !result.unverified_files.is_empty() {
        println!("Claimed but missing:");
        for path in &result.unverified_files {
            println!("  {path}");
        }
    }
    if let Some(err) = &result.error_text {
        println!();
        println!("{err}");
    }
}

/// Run the `vigil run` command. Returns the process exit code.
pub async fn run_task(config: VigilConfig, opts: RunOptions) -> Result<i32> {
    let dir = match opts.dir {
        Some(d) => d,
        None => std::env::current_dir().context("failed to read current directory")?,
    };
    // A missing directory is reported by the supervisor as an ERROR result.
    let working_directory = std::fs::canonicalize(&dir).unwrap_or(dir);

    let mut task = Task::new(opts.prompt, working_directory, opts.kind);
    if let Some(model) = &config.model {
        task = task.with_model(model.clone());
    }

    let mut supervisor_config = config.supervisor.clone();
    if let Some(secs) = opts.timeout_secs {
        supervisor_config.overall_timeout = Duration::from_secs(secs);
    }
    if opts.no_timeout {
        supervisor_config.disable_overall_timeout = true;
    }
    if opts.progress_aware {
        supervisor_config.progress_aware_timeout = true;
    }
    if opts.skip_preflight {
        supervisor_config.preflight = false;
    }

    let harness = resolve_harness(&config)?;
    let broadcaster = OutputBroadcaster::new(config.broadcast.clone());
    let subscription = broadcaster.subscribe(ChunkPrinter { json: opts.json });

    tracing::info!(
        task_id = %task.id,
        harness = harness.name(),
        kind = %task.kind,
        "starting supervised task"
    );

    let supervisor = ProcessSupervisor::new(harness, broadcaster, supervisor_config);

    // Ctrl+C abandons the task; dropping the execution future kills the child.
    let result = tokio::select! {
        result = supervisor.execute(&task) => result,
        _ = wait_for_interrupt() => {
            subscription.unsubscribe();
            eprintln!("\nInterrupted; agent process terminated.");
            return Ok(130);
        }
    };
    subscription.unsubscribe();

    if opts.json {
        let json = serde_json::to_string_pretty(&result).context("failed to serialize result")?;
        println!("{json}");
    } else {
        print_summary(&result);
    }

    Ok(exit_code_for(result.status))
}

async fn wait_for_interrupt() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No handler could be installed: never resolve.
        std::future::pending::<()>().await;
    }
}
