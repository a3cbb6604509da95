//! End-to-end tests for the `vigil` binary against fake agent scripts.
//!
//! Each test points `XDG_CONFIG_HOME` at a fresh temp dir so no user config
//! leaks in.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

use vigil_test_utils::FakeAgent;

struct Sandbox {
    config_home: TempDir,
    bin_dir: TempDir,
    work_dir: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        Self {
            config_home: TempDir::new().unwrap(),
            bin_dir: TempDir::new().unwrap(),
            work_dir: TempDir::new().unwrap(),
        }
    }

    fn install(&self, agent: &FakeAgent) -> PathBuf {
        agent.install(self.bin_dir.path()).unwrap()
    }

    fn vigil(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_vigil"));
        cmd.env("XDG_CONFIG_HOME", self.config_home.path())
            .env("VIGIL_LOG", "warn")
            .env_remove("VIGIL_AGENT_BINARY")
            .env_remove("VIGIL_MODEL");
        cmd
    }

    fn run_json(&self, agent: &FakeAgent, prompt: &str) -> (Output, serde_json::Value) {
        let binary = self.install(agent);
        let output = self
            .vigil()
            .args(["--binary", path_str(&binary), "run", prompt, "--json", "--dir"])
            .arg(self.work_dir.path())
            .output()
            .unwrap();
        let json = serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
            panic!(
                "stdout is not JSON ({e}): {}\nstderr: {}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            )
        });
        (output, json)
    }
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn run_with_written_file_exits_zero() {
    let sb = Sandbox::new();
    let agent = FakeAgent::new().run("printf 'done' > out.txt; echo 'Created out.txt'");

    let (output, json) = sb.run_json(&agent, "write out.txt");

    assert_eq!(output.status.code(), Some(0));
    assert_eq!(json["status"], "COMPLETE");
    assert_eq!(json["verified_files"][0]["path"], "out.txt");
    assert_eq!(json["verified_files"][0]["size"], 4);
}

#[test]
fn run_with_only_claims_exits_nonzero() {
    let sb = Sandbox::new();
    let agent = FakeAgent::new().run("echo 'I created report.md with everything.'");

    let (output, json) = sb.run_json(&agent, "write a report");

    assert_eq!(output.status.code(), Some(3));
    assert_eq!(json["status"], "NO_EVIDENCE");
    assert_eq!(json["unverified_files"][0], "report.md");
}

#[test]
fn json_mode_keeps_agent_output_off_stdout() {
    let sb = Sandbox::new();
    let agent = FakeAgent::new().run("echo 'agent chatter'; echo x > a.txt");

    let (output, json) = sb.run_json(&agent, "go");

    assert_eq!(json["status"], "COMPLETE");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("agent chatter"), "stderr: {stderr}");
}

#[test]
fn plain_mode_routes_agent_stderr_to_stderr() {
    let sb = Sandbox::new();
    let binary = sb.install(&FakeAgent::new().run("echo 'to stdout'; echo 'to stderr' >&2; echo x > a.txt"));

    let output = sb
        .vigil()
        .args(["--binary", path_str(&binary), "run", "go", "--dir"])
        .arg(sb.work_dir.path())
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stdout.contains("to stdout"), "stdout: {stdout}");
    assert!(!stdout.contains("to stderr"), "stdout: {stdout}");
    assert!(stderr.contains("to stderr"), "stderr: {stderr}");
    assert!(stderr.contains("[vigil:spawn]"), "stderr: {stderr}");
}

#[test]
fn failed_auth_stops_the_run() {
    let sb = Sandbox::new();
    let agent = FakeAgent::new()
        .auth("echo 'Invalid API key. Please run /login' >&2; exit 1")
        .run("echo x > never.txt");

    let (output, json) = sb.run_json(&agent, "go");

    assert_eq!(output.status.code(), Some(1));
    assert_eq!(json["status"], "ERROR");
    assert_eq!(json["blocked_reason"], "PREFLIGHT_AUTH_FAILED");
    assert!(!sb.work_dir.path().join("never.txt").exists());
}

#[test]
fn preflight_command_reports_version() {
    let sb = Sandbox::new();
    let binary = sb.install(&FakeAgent::new());

    let output = sb
        .vigil()
        .args(["--binary", path_str(&binary), "preflight"])
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("fake-agent 1.0.0"), "stdout: {stdout}");
}

#[test]
fn preflight_command_fails_for_missing_binary() {
    let sb = Sandbox::new();
    let missing = sb.bin_dir.path().join("no-such-agent");

    let output = sb
        .vigil()
        .args(["--binary", path_str(&missing), "preflight"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("PREFLIGHT_CLI_NOT_AVAILABLE"), "stdout: {stdout}");
}

#[test]
fn unknown_harness_is_rejected() {
    let sb = Sandbox::new();

    let output = sb
        .vigil()
        .args(["--harness", "nope", "run", "go", "--skip-preflight"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown harness"), "stderr: {stderr}");
}

#[test]
fn init_refuses_to_overwrite_without_force() {
    let sb = Sandbox::new();

    let first = sb.vigil().arg("init").output().unwrap();
    assert!(first.status.success());
    let path = sb.config_home.path().join("vigil/config.toml");
    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("[supervisor]"));
    assert!(contents.contains("harness = \"claude-code\""));

    let second = sb.vigil().arg("init").output().unwrap();
    assert!(!second.status.success());
    assert!(String::from_utf8_lossy(&second.stderr).contains("--force"));

    let forced = sb.vigil().args(["init", "--force"]).output().unwrap();
    assert!(forced.status.success());
}

#[test]
fn config_file_binary_is_used() {
    let sb = Sandbox::new();
    let binary = sb.install(&FakeAgent::new().run("echo x > from-config.txt"));
    let dir = sb.config_home.path().join("vigil");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("config.toml"),
        format!("[agent]\nbinary = \"{}\"\n", binary.display()),
    )
    .unwrap();

    let output = sb
        .vigil()
        .args(["run", "go", "--json", "--dir"])
        .arg(sb.work_dir.path())
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(0));
    assert!(sb.work_dir.path().join("from-config.txt").exists());
}

#[test]
fn env_command_strips_secrets() {
    let sb = Sandbox::new();

    let output = sb
        .vigil()
        .arg("env")
        .env("ANTHROPIC_API_KEY", "sk-test-secret")
        .env("AWS_SECRET_ACCESS_KEY", "also-secret")
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!stdout.contains("sk-test-secret"));
    assert!(!stdout.contains("AWS_SECRET_ACCESS_KEY"));
    assert!(stdout.contains("CI=true"));
    assert!(stdout.contains("NO_COLOR=1"));
}
