//! Detection of interactive prompts in agent output.
//!
//! The agent runs with stdin closed, so any prompt it prints will never be
//! answered. A match means the child is blocked and must be terminated.

use std::sync::LazyLock;

use regex::RegexSet;
use tracing::error;

/// Patterns that indicate the child is waiting for keyboard input.
///
/// The trailing-question-mark pattern only matches when the question is the
/// last thing in the chunk with no newline after it, which is how a prompt
/// waiting on a read looks. Questions inside ordinary prose end in a newline.
const PROMPT_PATTERNS: &[&str] = &[
    r"(?i)[\[(]\s*y(es)?\s*/\s*n(o)?\s*[\])]",
    r"(?i)\byes\s*/\s*no\b",
    r"(?i)\bpress\s+(enter|return|any\s+key)\b",
    r"(?i)\b(provide|enter|paste|input|type)\s+(your|the|an?)\s+(api\s+)?key\b",
    r"(?i)\bwhich\s+option\b",
    r"(?i)\b(choose|select)\s+(an?\s+)?(option|one)\b",
    r"(?i)\bdo\s+you\s+want\s+to\s+(proceed|continue)\b",
    r"(?i)\bare\s+you\s+sure\b",
    r"(?i)\bwaiting\s+for\s+(your\s+)?(input|response|confirmation)\b",
    r"\?[ \t]*$",
];

static PROMPT_SET: LazyLock<Option<RegexSet>> = LazyLock::new(|| {
    RegexSet::new(PROMPT_PATTERNS)
        .map_err(|e| error!(error = %e, "invalid prompt pattern"))
        .ok()
});

/// Returns the matched pattern if `text` looks like an interactive prompt.
pub fn detect_prompt(text: &str) -> Option<&'static str> {
    PROMPT_SET
        .as_ref()?
        .matches(text)
        .iter()
        .next()
        .map(|idx| PROMPT_PATTERNS[idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patterns_compile() {
        let set = PROMPT_SET.as_ref().unwrap();
        assert_eq!(set.len(), PROMPT_PATTERNS.len());
    }

    fn is_interactive_prompt(text: &str) -> bool {
        detect_prompt(text).is_some()
    }

    #[test]
    fn detects_yes_no_confirmations() {
        assert!(is_interactive_prompt("Overwrite file? (y/n)\n"));
        assert!(is_interactive_prompt("Continue [Y/n]\n"));
        assert!(is_interactive_prompt("Apply changes (yes/no)\n"));
    }

    #[test]
    fn detects_press_enter_and_key_requests() {
        assert!(is_interactive_prompt("Press Enter to continue\n"));
        assert!(is_interactive_prompt("press any key\n"));
        assert!(is_interactive_prompt("Please provide your API key:\n"));
        assert!(is_interactive_prompt("Enter the key below\n"));
    }

    #[test]
    fn detects_option_selection() {
        assert!(is_interactive_prompt("Which option would you like:\n"));
        assert!(is_interactive_prompt("Please select an option\n"));
        assert!(is_interactive_prompt("Do you want to proceed\n"));
    }

    #[test]
    fn detects_unterminated_question() {
        assert!(is_interactive_prompt("Should I also update the tests? "));
        assert!(is_interactive_prompt("Proceed?"));
    }

    #[test]
    fn ignores_questions_in_finished_lines() {
        assert!(!is_interactive_prompt("Why does this fail? Because the cache is stale.\n"));
        assert!(!is_interactive_prompt("What does parse() do?\nIt tokenizes input.\n"));
    }

    #[test]
    fn ignores_ordinary_output() {
        assert!(!is_interactive_prompt("Updated src/main.rs\n"));
        assert!(!is_interactive_prompt("Running cargo test...\n"));
        assert!(!is_interactive_prompt("Analysis complete. The module has 3 functions.\n"));
    }

    #[test]
    fn detect_prompt_names_the_pattern() {
        let pattern = detect_prompt("Press enter to continue\n").unwrap();
        assert!(pattern.contains("press"));
        assert!(detect_prompt("all good\n").is_none());
    }
}
