//! Preflight probes run before a task is spawned.
//!
//! Both probes use the same sanitized environment as the real run and are
//! bounded by their own timeouts. A preflight problem is always reported as
//! an error with a preflight reason, never as a block or a task timeout.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::env::{sanitized_command, sanitized_env};
use crate::error::PreflightFailure;
use crate::harness::Harness;
use crate::supervisor::signal::{SIGKILL, signal_group};

/// Exit code of a process killed with SIGKILL (128 + 9).
pub const KILLED_EXIT_CODE: i32 = 137;

const EXCERPT_CHARS: usize = 300;

/// Successful preflight details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightReport {
    /// First line of the version probe's output.
    pub version: String,
    pub auth_probe_duration: Duration,
}

/// Result of running one probe command.
#[derive(Debug)]
pub(crate) enum ProbeOutcome {
    Exited {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    TimedOut,
    SpawnFailed(std::io::Error),
}

/// Run `binary args` with `env`, collecting output, bounded by `timeout`.
pub(crate) async fn run_probe(
    binary: &str,
    args: &[String],
    env: &BTreeMap<String, String>,
    timeout: Duration,
) -> ProbeOutcome {
    let mut child = match sanitized_command(binary, args, env).spawn() {
        Ok(child) => child,
        Err(e) => return ProbeOutcome::SpawnFailed(e),
    };
    let pid = child.id();

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let read_stdout = async {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stdout_pipe {
            pipe.read_to_end(&mut buf).await.ok();
        }
        String::from_utf8_lossy(&buf).into_owned()
    };

    let read_stderr = async {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stderr_pipe {
            pipe.read_to_end(&mut buf).await.ok();
        }
        String::from_utf8_lossy(&buf).into_owned()
    };

    match tokio::time::timeout(timeout, async {
        tokio::join!(child.wait(), read_stdout, read_stderr)
    })
    .await
    {
        Ok((Ok(status), stdout, stderr)) => ProbeOutcome::Exited {
            code: exit_code(&status),
            stdout,
            stderr,
        },
        Ok((Err(e), _, _)) => ProbeOutcome::SpawnFailed(e),
        Err(_) => {
            if let Some(pid) = pid {
                signal_group(pid, SIGKILL);
            }
            let _ = child.kill().await;
            ProbeOutcome::TimedOut
        }
    }
}

/// Exit code, mapping death-by-signal to the shell convention `128 + n`.
pub(crate) fn exit_code(status: &std::process::ExitStatus) -> Option<i32> {
    if let Some(code) = status.code() {
        return Some(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Some(128 + signal);
        }
    }
    None
}

fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    let mut out: String = trimmed.chars().take(EXCERPT_CHARS).collect();
    if trimmed.chars().count() > EXCERPT_CHARS {
        out.push_str("...");
    }
    out
}

/// Run the version probe, then the auth probe.
pub async fn run_preflight<H>(harness: &H, config: &SupervisorConfig) -> Result<PreflightReport, PreflightFailure>
where
    H: Harness + ?Sized,
{
    let env = sanitized_env();
    let version = check_version(harness, &env, config.version_probe_timeout).await?;
    let auth_probe_duration = check_auth(harness, &env, config.auth_probe_timeout).await?;
    info!(harness = harness.name(), %version, "preflight passed");
    Ok(PreflightReport {
        version,
        auth_probe_duration,
    })
}

/// Confirm the binary runs and answers `--version` in time.
pub async fn check_version<H>(
    harness: &H,
    env: &BTreeMap<String, String>,
    timeout: Duration,
) -> Result<String, PreflightFailure>
where
    H: Harness + ?Sized,
{
    let binary = harness.binary();
    debug!(binary, "running version probe");

    match run_probe(binary, &harness.version_args(), env, timeout).await {
        ProbeOutcome::SpawnFailed(e) => Err(PreflightFailure::CliNotAvailable(format!(
            "failed to launch {binary}: {e}"
        ))),
        ProbeOutcome::TimedOut => Err(PreflightFailure::CliNotAvailable(format!(
            "{binary} did not answer the version probe within {}s",
            timeout.as_secs()
        ))),
        ProbeOutcome::Exited {
            code: Some(0),
            stdout,
            stderr,
        } => {
            let text = if stdout.trim().is_empty() { stderr } else { stdout };
            Ok(text.lines().next().unwrap_or_default().trim().to_string())
        }
        ProbeOutcome::Exited { code, stderr, .. } => Err(PreflightFailure::CliNotAvailable(format!(
            "{binary} version probe exited with {}: {}",
            code.map_or_else(|| "no code".to_string(), |c| c.to_string()),
            excerpt(&stderr)
        ))),
    }
}

/// Confirm the CLI is authenticated with a minimal invocation.
pub async fn check_auth<H>(
    harness: &H,
    env: &BTreeMap<String, String>,
    timeout: Duration,
) -> Result<Duration, PreflightFailure>
where
    H: Harness + ?Sized,
{
    let binary = harness.binary();
    let recovery = harness.recovery_instructions();
    let start = Instant::now();
    debug!(binary, "running auth probe");

    let failed = |reason: String, retryable: bool| {
        warn!(binary, %reason, retryable, "auth probe failed");
        PreflightFailure::AuthFailed {
            message: format!("{reason}. {recovery}"),
            retryable,
        }
    };

    match run_probe(binary, &harness.auth_probe_args(), env, timeout).await {
        ProbeOutcome::SpawnFailed(e) => Err(failed(format!("auth probe could not run: {e}"), false)),
        ProbeOutcome::TimedOut => Err(failed(
            format!("auth probe did not finish within {}s", timeout.as_secs()),
            false,
        )),
        ProbeOutcome::Exited {
            code: Some(KILLED_EXIT_CODE),
            ..
        } => Err(failed("auth probe was killed (exit 137)".to_string(), true)),
        ProbeOutcome::Exited { code, stdout, stderr } => {
            let combined = format!("{stdout}\n{stderr}");
            let lowered = combined.to_lowercase();
            if let Some(pattern) = harness
                .auth_failure_patterns()
                .iter()
                .find(|p| lowered.contains(&p.to_lowercase()))
            {
                return Err(failed(
                    format!("auth probe reported {pattern:?}: {}", excerpt(&combined)),
                    false,
                ));
            }
            if code != Some(0) {
                return Err(failed(
                    format!(
                        "auth probe exited with {}: {}",
                        code.map_or_else(|| "no code".to_string(), |c| c.to_string()),
                        excerpt(&combined)
                    ),
                    false,
                ));
            }
            Ok(start.elapsed())
        }
    }
}
