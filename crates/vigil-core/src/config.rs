//! Tunables for the supervisor and the broadcaster.
//!
//! Both structs deserialize with per-field defaults so a config file only
//! needs to name the values it overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing and invocation settings for [`crate::supervisor::ProcessSupervisor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Informational threshold; crossing it is logged once.
    #[serde(with = "secs")]
    pub soft_timeout: Duration,
    /// How often the silence check runs.
    #[serde(with = "secs")]
    pub silence_check_interval: Duration,
    /// Minimum silence before a check logs anything.
    #[serde(with = "secs")]
    pub silence_log_after: Duration,
    /// The only limit that terminates a healthy-looking child.
    #[serde(with = "secs")]
    pub overall_timeout: Duration,
    /// Skip the overall timeout entirely (very large tasks).
    pub disable_overall_timeout: bool,
    /// Push the overall deadline forward on every output event.
    pub progress_aware_timeout: bool,
    /// Wait between SIGTERM and SIGKILL.
    #[serde(with = "millis")]
    pub termination_grace: Duration,
    #[serde(with = "secs")]
    pub version_probe_timeout: Duration,
    #[serde(with = "secs")]
    pub auth_probe_timeout: Duration,
    /// Run the version and auth probes before spawning.
    pub preflight: bool,
    /// How long to keep draining output after the child has exited.
    #[serde(with = "millis")]
    pub output_drain_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            soft_timeout: Duration::from_secs(5 * 60),
            silence_check_interval: Duration::from_secs(30),
            silence_log_after: Duration::from_secs(60),
            overall_timeout: Duration::from_secs(10 * 60),
            disable_overall_timeout: false,
            progress_aware_timeout: false,
            termination_grace: Duration::from_secs(5),
            version_probe_timeout: Duration::from_secs(5),
            auth_probe_timeout: Duration::from_secs(15),
            preflight: true,
            output_drain_timeout: Duration::from_secs(2),
        }
    }
}

/// Retention bounds for [`crate::broadcast::OutputBroadcaster`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub max_buffer_size: usize,
    #[serde(with = "secs")]
    pub max_age: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 1000,
            max_age: Duration::from_secs(60 * 60),
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
