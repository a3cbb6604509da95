//! Environment sanitization for spawned agents.
//!
//! The child receives only the variables named in [`ALLOWED_ENV_VARS`] plus
//! [`FORCED_ENV_OVERRIDES`]. Nothing else from the parent environment is
//! passed through, so a secret-bearing variable added later cannot leak.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::process::Stdio;

use tokio::process::Command;

/// Variables copied from the parent environment when present.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LOGNAME",
    "SHELL",
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "TERM",
    "TMPDIR",
    "TMP",
    "TEMP",
    "VIGIL_DEBUG",
];

/// Always set on the child, replacing any inherited value.
pub const FORCED_ENV_OVERRIDES: &[(&str, &str)] = &[("CI", "true"), ("NO_COLOR", "1")];

/// Build the child environment from an arbitrary set of parent variables.
pub fn sanitized_env_from<I, K, V>(vars: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    let mut env: BTreeMap<String, String> = vars
        .into_iter()
        .filter(|(k, _)| ALLOWED_ENV_VARS.contains(&k.as_ref()))
        .map(|(k, v)| (k.as_ref().to_string(), v.into()))
        .collect();

    for (key, value) in FORCED_ENV_OVERRIDES {
        env.insert((*key).to_string(), (*value).to_string());
    }

    env
}

/// Build the child environment from the current process environment.
///
/// Variables whose name or value is not valid UTF-8 are dropped.
pub fn sanitized_env() -> BTreeMap<String, String> {
    sanitized_env_from(
        std::env::vars_os().filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?))),
    )
}

/// A command for `binary` that sees exactly `env`, with piped output, no
/// stdin, and its own process group.
pub(crate) fn sanitized_command<I, S>(binary: &str, args: I, env: &BTreeMap<String, String>) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(binary);
    cmd.args(args)
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

/// Whether `key` may ever appear in a sanitized environment.
pub fn is_permitted(key: &str) -> bool {
    ALLOWED_ENV_VARS.contains(&key) || FORCED_ENV_OVERRIDES.iter().any(|(k, _)| *k == key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent() -> Vec<(&'static str, &'static str)> {
        vec![
            ("PATH", "/usr/bin:/bin"),
            ("HOME", "/home/dev"),
            ("LANG", "en_US.UTF-8"),
            ("ANTHROPIC_API_KEY", "sk-ant-secret"),
            ("OPENAI_API_KEY", "sk-secret"),
            ("AWS_SECRET_ACCESS_KEY", "aws"),
            ("GITHUB_TOKEN", "ghp_x"),
            ("DATABASE_URL", "postgres://u:p@h/db"),
            ("CI", "false"),
            ("NO_COLOR", "0"),
            ("FORCE_COLOR", "3"),
        ]
    }

    #[test]
    fn keeps_only_allow_listed_keys() {
        let env = sanitized_env_from(parent());
        for key in env.keys() {
            assert!(is_permitted(key), "unexpected key in sanitized env: {key}");
        }
        assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin:/bin"));
        assert_eq!(env.get("HOME").map(String::as_str), Some("/home/dev"));
    }

    #[test]
    fn secret_shaped_variables_never_pass() {
        let env = sanitized_env_from(parent());
        for key in env.keys() {
            let upper = key.to_ascii_uppercase();
            assert!(
                !(upper.contains("KEY") || upper.contains("TOKEN") || upper.contains("SECRET")),
                "secret-shaped key leaked: {key}"
            );
        }
        assert!(!env.contains_key("DATABASE_URL"));
        assert!(!env.contains_key("FORCE_COLOR"));
    }

    #[test]
    fn forced_overrides_replace_inherited_values() {
        let env = sanitized_env_from(parent());
        assert_eq!(env.get("CI").map(String::as_str), Some("true"));
        assert_eq!(env.get("NO_COLOR").map(String::as_str), Some("1"));
    }

    #[test]
    fn forced_overrides_present_with_empty_parent() {
        let env = sanitized_env_from(Vec::<(String, String)>::new());
        assert_eq!(env.len(), FORCED_ENV_OVERRIDES.len());
    }

    #[test]
    fn current_process_env_is_sanitized() {
        let env = sanitized_env();
        assert!(env.keys().all(|k| is_permitted(k)));
    }
}
