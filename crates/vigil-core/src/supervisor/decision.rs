//! Status derivation for a run that exited on its own.
//!
//! Rules are evaluated top to bottom; the first match decides. Only facts
//! read from the disk (verified / unverified files) and the exit code feed
//! the table. Output text is consulted last and can never produce COMPLETE.

use std::sync::LazyLock;

use regex::Regex;
use tracing::error;

/// Facts known once the child has exited and evidence has been collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionInput {
    pub exit_ok: bool,
    pub has_unverified: bool,
    pub has_verified: bool,
    pub read_only: bool,
}

/// What the supervisor should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Error,
    NoEvidence,
    Complete,
    /// Write the evidence artifact; COMPLETE if it verifies, else NO_EVIDENCE.
    WriteArtifact,
    /// No evidence either way: INCOMPLETE if the output sounds finished,
    /// otherwise NO_EVIDENCE.
    JudgeOutput,
}

struct Rule {
    name: &'static str,
    when: fn(&DecisionInput) -> bool,
    then: Decision,
}

fn exit_failed(i: &DecisionInput) -> bool {
    !i.exit_ok
}

fn has_unverified(i: &DecisionInput) -> bool {
    i.has_unverified
}

fn has_verified(i: &DecisionInput) -> bool {
    i.has_verified
}

fn read_only(i: &DecisionInput) -> bool {
    i.read_only
}

fn always(_: &DecisionInput) -> bool {
    true
}

const RULES: &[Rule] = &[
    Rule {
        name: "non-zero exit",
        when: exit_failed,
        then: Decision::Error,
    },
    Rule {
        name: "unverified files",
        when: has_unverified,
        then: Decision::NoEvidence,
    },
    Rule {
        name: "verified files",
        when: has_verified,
        then: Decision::Complete,
    },
    Rule {
        name: "read-only task",
        when: read_only,
        then: Decision::WriteArtifact,
    },
    Rule {
        name: "fallback",
        when: always,
        then: Decision::JudgeOutput,
    },
];

/// Apply the rule table, returning the decision and the name of the rule
/// that produced it.
pub fn decide(input: &DecisionInput) -> (Decision, &'static str) {
    RULES
        .iter()
        .find(|rule| (rule.when)(input))
        .map(|rule| (rule.then, rule.name))
        .unwrap_or((Decision::JudgeOutput, "fallback"))
}

const SUCCESS_PATTERN: &str =
    r"(?i)\b(?:done|completed?|finished|successfully|implemented|fixed|created|updated|all set|task complete)\b";

static SUCCESS_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(SUCCESS_PATTERN)
        .map_err(|e| error!(error = %e, "invalid success pattern"))
        .ok()
});

/// Whether `output` claims the work is finished.
pub fn sounds_successful(output: &str) -> bool {
    SUCCESS_RE.as_ref().is_some_and(|re| re.is_match(output))
}
