//! Evidence artifact for read-only tasks.
//!
//! A read-only task (analyze, review, question) legitimately changes no
//! files. To still satisfy "COMPLETE means a verified file exists", the
//! supervisor records the agent's answer as a markdown file under
//! `.vigil/evidence/` and verifies that file like any other.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{debug, warn};

use super::verify_candidates;
use crate::task::{Task, VerifiedFile};

/// Artifact directory, relative to the task's working directory.
pub const EVIDENCE_DIR: &str = ".vigil/evidence";

/// Output beyond this many characters is cut from the artifact.
pub const MAX_ARTIFACT_OUTPUT_CHARS: usize = 10_000;

/// Relative path of the artifact for `task`.
pub fn artifact_rel_path(task: &Task) -> String {
    format!("{EVIDENCE_DIR}/{}.md", task.id)
}

fn render(task: &Task, output: &str, duration: Duration) -> String {
    let total_chars = output.chars().count();
    let body: String = output.chars().take(MAX_ARTIFACT_OUTPUT_CHARS).collect();

    let mut doc = String::new();
    doc.push_str("# Task evidence\n\n");
    doc.push_str(&format!("- Task: {}\n", task.id));
    doc.push_str(&format!("- Kind: {}\n", task.kind));
    doc.push_str(&format!("- Recorded: {}\n", Utc::now().to_rfc3339()));
    doc.push_str(&format!("- Duration: {} ms\n", duration.as_millis()));
    doc.push_str("\n## Output\n\n```\n");
    doc.push_str(&body);
    if !body.ends_with('\n') {
        doc.push('\n');
    }
    doc.push_str("```\n");
    if total_chars > MAX_ARTIFACT_OUTPUT_CHARS {
        doc.push_str(&format!(
            "\n_Output truncated: showing {MAX_ARTIFACT_OUTPUT_CHARS} of {total_chars} characters._\n"
        ));
    }
    doc
}

/// Write the evidence artifact for `task` and verify it on disk.
///
/// The file is written to a temporary sibling and renamed into place, so
/// a reader never sees a half-written artifact. On any failure the temp
/// file is removed and an error is returned.
pub fn write_evidence_artifact(task: &Task, output: &str, duration: Duration) -> Result<VerifiedFile> {
    let root = &task.working_directory;
    let rel = artifact_rel_path(task);
    let final_path = root.join(&rel);
    let tmp_path = final_path.with_extension("md.tmp");

    if let Err(e) = write_atomically(root, &final_path, &tmp_path, &render(task, output, duration)) {
        if tmp_path.exists() {
            if let Err(rm) = std::fs::remove_file(&tmp_path) {
                warn!(path = %tmp_path.display(), error = %rm, "failed to remove partial evidence file");
            }
        }
        return Err(e);
    }

    let (mut verified, _) = verify_candidates(root, [rel.as_str()]);
    match verified.pop() {
        Some(file) if file.exists => {
            debug!(task_id = %task.id, path = %rel, "evidence artifact written");
            Ok(file)
        }
        _ => bail!("evidence artifact {} not found after write", final_path.display()),
    }
}

fn write_atomically(root: &Path, final_path: &Path, tmp_path: &Path, contents: &str) -> Result<()> {
    let dir = root.join(EVIDENCE_DIR);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create evidence directory {}", dir.display()))?;
    std::fs::write(tmp_path, contents)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    std::fs::rename(tmp_path, final_path)
        .with_context(|| format!("failed to move evidence into {}", final_path.display()))?;
    Ok(())
}
