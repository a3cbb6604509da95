//! File-system evidence of what an agent actually changed.
//!
//! Nothing the child prints is trusted as proof. Output text only nominates
//! candidates; whether a file exists is decided here by reading the disk.
//!
//! The check is two-pass: a before/after snapshot diff finds changed files,
//! then every candidate is independently re-checked on disk. The diff can
//! race with the filesystem flushing the child's last writes, so the second
//! pass is the authority for "this file exists".

pub mod artifact;

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::{Component, Path};
use std::sync::LazyLock;
use std::time::SystemTime;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, error};
use walkdir::{DirEntry, WalkDir};

use crate::task::VerifiedFile;

pub use artifact::{EVIDENCE_DIR, write_evidence_artifact};

/// Directory names never descended into when snapshotting.
pub const SKIPPED_DIRS: &[&str] = &[
    "node_modules",
    "target",
    "dist",
    "build",
    "out",
    "coverage",
    "__pycache__",
    "venv",
];

const PREVIEW_CHARS: usize = 200;
const PREVIEW_READ_BYTES: u64 = 4096;

/// Metadata recorded per file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub mtime: Option<SystemTime>,
    pub size: u64,
}

/// Relative path (always `/`-separated) to [`FileStat`] for one directory tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    files: BTreeMap<String, FileStat>,
}

impl Snapshot {
    /// Walk `root` recursively, skipping hidden entries and build-artifact
    /// directories.
    pub fn capture(root: &Path) -> Result<Self> {
        let mut files = BTreeMap::new();

        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_skipped(e));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    // Entries can vanish mid-walk while the agent is still writing.
                    debug!(root = %root.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(rel) = relative_key(root, entry.path()) else {
                continue;
            };
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    debug!(path = %rel, error = %e, "skipping file without metadata");
                    continue;
                }
            };
            files.insert(
                rel,
                FileStat {
                    mtime: meta.modified().ok(),
                    size: meta.len(),
                },
            );
        }

        if files.is_empty() && !root.is_dir() {
            anyhow::bail!("working directory {} does not exist", root.display());
        }

        Ok(Self { files })
    }

    /// Build a snapshot from explicit entries.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, FileStat)>,
        S: Into<String>,
    {
        Self {
            files: entries.into_iter().map(|(p, s)| (p.into(), s)).collect(),
        }
    }

    pub fn get(&self, path: &str) -> Option<&FileStat> {
        self.files.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }
}

fn is_skipped(entry: &DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    if name.starts_with('.') {
        return true;
    }
    entry.file_type().is_dir() && SKIPPED_DIRS.contains(&name.as_ref())
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Paths that are new in `after` or whose mtime or size changed.
pub fn diff_snapshots(before: &Snapshot, after: &Snapshot) -> Vec<String> {
    after
        .files
        .iter()
        .filter(|(path, stat)| match before.files.get(*path) {
            None => true,
            Some(old) => old.mtime != stat.mtime || old.size != stat.size,
        })
        .map(|(path, _)| path.clone())
        .collect()
}

/// Paths present in `after` but absent from `before`.
pub fn new_files(before: &Snapshot, after: &Snapshot) -> Vec<String> {
    after
        .files
        .keys()
        .filter(|p| !before.files.contains_key(*p))
        .cloned()
        .collect()
}

/// A write verb followed by a path-like token. The extension must start
/// with a letter, so version strings such as `1.2.3` are not claims.
const CLAIM_PATTERN: &str = r#"(?i)\b(?:created|wrote|written|writing|modified|updated|saved|edited)\s+(?:to\s+)?(?:the\s+)?(?:new\s+)?(?:file\s+)?[`'"]?([A-Za-z0-9_./\-]+\.[A-Za-z][A-Za-z0-9]*)\b"#;

static CLAIM_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(CLAIM_PATTERN)
        .map_err(|e| error!(error = %e, "invalid claim pattern"))
        .ok()
});

/// File paths the output text says were written. These are claims only.
pub fn claimed_paths(output: &str) -> Vec<String> {
    let Some(re) = CLAIM_RE.as_ref() else {
        return Vec::new();
    };
    let mut seen = BTreeSet::new();
    re.captures_iter(output)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim_end_matches('.').to_string())
        .filter(|p| seen.insert(p.clone()))
        .collect()
}

/// Normalize a claimed path to a key relative to `root`.
///
/// Returns `None` for paths that escape the working directory; such claims
/// can never be verified.
fn normalize_claim(root: &Path, claim: &str) -> Option<String> {
    let path = Path::new(claim);
    let rel = if path.is_absolute() {
        path.strip_prefix(root).ok()?
    } else {
        path
    };

    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// A path in `snapshot` that ends with `/<claim>`, if any.
fn find_by_suffix<'a>(snapshot: &'a Snapshot, claim: &str) -> Option<&'a str> {
    let suffix = format!("/{claim}");
    snapshot.paths().find(|p| p.ends_with(&suffix))
}

/// Check each candidate on disk. Existing regular files become
/// [`VerifiedFile`]s; everything else is returned as unverified.
pub fn verify_candidates<I, S>(root: &Path, candidates: I) -> (Vec<VerifiedFile>, Vec<String>)
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut verified = Vec::new();
    let mut unverified = Vec::new();
    let mut seen = BTreeSet::new();

    for candidate in candidates {
        let candidate = candidate.as_ref();
        if !seen.insert(candidate.to_string()) {
            continue;
        }
        let Some(rel) = normalize_claim(root, candidate) else {
            unverified.push(candidate.to_string());
            continue;
        };
        let full = root.join(&rel);
        match std::fs::metadata(&full) {
            Ok(meta) if meta.is_file() => verified.push(VerifiedFile {
                path: rel,
                exists: true,
                size: Some(meta.len()),
                preview: read_preview(&full),
            }),
            _ => unverified.push(rel),
        }
    }

    (verified, unverified)
}

fn read_preview(path: &Path) -> Option<String> {
    let file = std::fs::File::open(path).ok()?;
    let mut buf = Vec::new();
    file.take(PREVIEW_READ_BYTES).read_to_end(&mut buf).ok()?;
    let text = match std::str::from_utf8(&buf) {
        Ok(text) => text,
        Err(e) if e.error_len().is_none() => {
            // Cut mid-character at the read boundary; keep the valid prefix.
            std::str::from_utf8(&buf[..e.valid_up_to()]).ok()?
        }
        Err(_) => return None,
    };
    Some(text.chars().take(PREVIEW_CHARS).collect())
}

/// Outcome of the evidence check for one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceReport {
    pub modified_files: Vec<String>,
    pub verified_files: Vec<VerifiedFile>,
    pub unverified_files: Vec<String>,
}

impl EvidenceReport {
    pub fn has_verified(&self) -> bool {
        self.verified_files.iter().any(|f| f.exists)
    }

    pub fn has_unverified(&self) -> bool {
        !self.unverified_files.is_empty()
    }
}

/// Run the full evidence check for a finished execution.
///
/// 1. Diff the snapshots; new or changed files are modified.
/// 2. Claimed paths that are not already known files become candidates too.
/// 3. Every candidate is verified on disk.
/// 4. A late re-scan adds files that appeared after the `after` snapshot.
pub fn collect_evidence(
    root: &Path,
    before: &Snapshot,
    after: &Snapshot,
    output: &str,
) -> Result<EvidenceReport> {
    let mut modified = diff_snapshots(before, after);
    for path in new_files(before, after) {
        if !modified.contains(&path) {
            modified.push(path);
        }
    }

    let mut candidates = modified.clone();
    for claim in claimed_paths(output) {
        let Some(rel) = normalize_claim(root, &claim) else {
            candidates.push(claim);
            continue;
        };
        if candidates.contains(&rel) {
            continue;
        }
        if after.contains(&rel) {
            // Present and unchanged: the claim adds nothing to verify.
            debug!(path = %rel, "claimed file exists but was not modified");
            continue;
        }
        if let Some(found) = find_by_suffix(after, &rel) {
            // "modified main.rs" naming `src/main.rs`.
            debug!(claim = %rel, path = %found, "claim resolved by path suffix");
            continue;
        }
        candidates.push(rel);
    }

    let (mut verified, mut unverified) = verify_candidates(root, &candidates);

    let late = Snapshot::capture(root).context("failed to re-scan working directory")?;
    let late_new: Vec<String> = new_files(before, &late)
        .into_iter()
        .filter(|p| !verified.iter().any(|v| &v.path == p))
        .collect();
    if !late_new.is_empty() {
        let (extra, _) = verify_candidates(root, &late_new);
        for file in extra {
            if !modified.contains(&file.path) {
                modified.push(file.path.clone());
            }
            unverified.retain(|u| u != &file.path);
            verified.push(file);
        }
    }

    modified.sort();
    verified.sort_by(|a, b| a.path.cmp(&b.path));
    unverified.sort();

    Ok(EvidenceReport {
        modified_files: modified,
        verified_files: verified,
        unverified_files: unverified,
    })
}
