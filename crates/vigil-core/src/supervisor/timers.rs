//! The three timers of one execution.
//!
//! - **soft**: fires once after `soft_timeout`; informational only.
//! - **silence**: checks every `silence_check_interval` and reports when no
//!   output arrived for at least `silence_log_after`; never terminates.
//! - **overall**: the only timer whose event ends the run. Its deadline sits
//!   in a `watch` channel so progress-aware mode can replace it on output.
//!
//! Each timer runs as its own task under a child [`CancellationToken`];
//! [`TimerSet::disarm`] cancels them all.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::SupervisorConfig;

const MIN_SILENCE_INTERVAL: Duration = Duration::from_millis(10);

/// Something a timer noticed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    SoftTimeout { elapsed: Duration },
    Silence { silent_for: Duration },
    OverallTimeout { elapsed: Duration },
}

/// The armed timers of one execution.
#[derive(Debug)]
pub struct TimerSet {
    root: CancellationToken,
    started: Instant,
    last_output: watch::Sender<Instant>,
    deadline: Option<watch::Sender<Instant>>,
    overall_timeout: Duration,
    progress_aware: bool,
    disarmed: bool,
    handles: Vec<JoinHandle<()>>,
}

impl TimerSet {
    /// Arm all timers now. Events are delivered on `events`.
    pub fn arm(config: &SupervisorConfig, events: mpsc::UnboundedSender<TimerEvent>) -> Self {
        let root = CancellationToken::new();
        let started = Instant::now();
        let (last_output, last_output_rx) = watch::channel(started);
        let mut handles = Vec::with_capacity(3);

        handles.push(tokio::spawn(soft_timer(
            root.child_token(),
            started,
            config.soft_timeout,
            events.clone(),
        )));

        handles.push(tokio::spawn(silence_timer(
            root.child_token(),
            config.silence_check_interval.max(MIN_SILENCE_INTERVAL),
            config.silence_log_after,
            last_output_rx,
            events.clone(),
        )));

        let deadline = if config.disable_overall_timeout {
            None
        } else {
            let (tx, rx) = watch::channel(started + config.overall_timeout);
            handles.push(tokio::spawn(overall_timer(root.child_token(), started, rx, events)));
            Some(tx)
        };

        Self {
            root,
            started,
            last_output,
            deadline,
            overall_timeout: config.overall_timeout,
            progress_aware: config.progress_aware_timeout,
            disarmed: false,
            handles,
        }
    }

    /// Note that the child produced output.
    ///
    /// In progress-aware mode this replaces the overall deadline with
    /// `now + overall_timeout`; otherwise the deadline is untouched.
    pub fn record_output(&self) {
        let now = Instant::now();
        self.last_output.send_replace(now);
        if self.progress_aware {
            if let Some(deadline) = &self.deadline {
                deadline.send_replace(now + self.overall_timeout);
            }
        }
    }

    /// Current overall deadline, if the overall timer is enabled.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.as_ref().map(|d| *d.borrow())
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_disarmed(&self) -> bool {
        self.disarmed
    }

    /// Cancel every timer. Returns `true` only for the first call.
    pub fn disarm(&mut self) -> bool {
        if self.disarmed {
            return false;
        }
        self.disarmed = true;
        self.root.cancel();
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        true
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.disarm();
    }
}

async fn soft_timer(
    cancel: CancellationToken,
    started: Instant,
    after: Duration,
    events: mpsc::UnboundedSender<TimerEvent>,
) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep_until(started + after) => {
            let _ = events.send(TimerEvent::SoftTimeout { elapsed: started.elapsed() });
        }
    }
}

async fn silence_timer(
    cancel: CancellationToken,
    every: Duration,
    log_after: Duration,
    last_output: watch::Receiver<Instant>,
    events: mpsc::UnboundedSender<TimerEvent>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let silent_for = last_output.borrow().elapsed();
                if silent_for >= log_after
                    && events.send(TimerEvent::Silence { silent_for }).is_err()
                {
                    return;
                }
            }
        }
    }
}

async fn overall_timer(
    cancel: CancellationToken,
    started: Instant,
    mut deadline: watch::Receiver<Instant>,
    events: mpsc::UnboundedSender<TimerEvent>,
) {
    loop {
        let current = *deadline.borrow_and_update();
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = deadline.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = tokio::time::sleep_until(current) => {
                // A reset may have landed between the wake-up and now.
                if *deadline.borrow() > Instant::now() {
                    continue;
                }
                let _ = events.send(TimerEvent::OverallTimeout { elapsed: started.elapsed() });
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(overall_secs: u64, progress_aware: bool) -> SupervisorConfig {
        SupervisorConfig {
            overall_timeout: Duration::from_secs(overall_secs),
            progress_aware_timeout: progress_aware,
            ..SupervisorConfig::default()
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TimerEvent>) -> Vec<TimerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn has_overall(events: &[TimerEvent]) -> bool {
        events
            .iter()
            .any(|e| matches!(e, TimerEvent::OverallTimeout { .. }))
    }

    #[tokio::test(start_paused = true)]
    async fn silence_does_not_terminate_before_fixed_deadline() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _timers = TimerSet::arm(&config(600, false), tx);

        tokio::time::sleep(Duration::from_secs(400)).await;
        let events = drain(&mut rx);
        assert!(!has_overall(&events));
        assert!(
            events
                .iter()
                .any(|e| matches!(e, TimerEvent::Silence { silent_for } if *silent_for >= Duration::from_secs(60)))
        );
        assert!(events.iter().any(|e| matches!(e, TimerEvent::SoftTimeout { .. })));

        tokio::time::sleep(Duration::from_secs(201)).await;
        assert!(has_overall(&drain(&mut rx)));
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_deadline_ignores_output() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timers = TimerSet::arm(&config(600, false), tx);
        let initial = timers.deadline().unwrap();

        tokio::time::sleep(Duration::from_secs(400)).await;
        timers.record_output();
        assert_eq!(timers.deadline().unwrap(), initial);

        tokio::time::sleep(Duration::from_secs(201)).await;
        assert!(has_overall(&drain(&mut rx)));
    }

    #[tokio::test(start_paused = true)]
    async fn progress_aware_output_pushes_deadline() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timers = TimerSet::arm(&config(600, true), tx);

        tokio::time::sleep(Duration::from_secs(400)).await;
        timers.record_output();

        tokio::time::sleep(Duration::from_secs(400)).await;
        assert!(!has_overall(&drain(&mut rx)));

        tokio::time::sleep(Duration::from_secs(201)).await;
        assert!(has_overall(&drain(&mut rx)));
    }

    #[tokio::test(start_paused = true)]
    async fn output_resets_silence() {
        let cfg = SupervisorConfig {
            silence_check_interval: Duration::from_secs(10),
            silence_log_after: Duration::from_secs(25),
            ..SupervisorConfig::default()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timers = TimerSet::arm(&cfg, tx);

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(9)).await;
            timers.record_output();
        }
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_overall_never_fires() {
        let cfg = SupervisorConfig {
            disable_overall_timeout: true,
            ..SupervisorConfig::default()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timers = TimerSet::arm(&cfg, tx);
        assert!(timers.deadline().is_none());

        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        assert!(!has_overall(&drain(&mut rx)));
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_is_idempotent_and_silences_timers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerSet::arm(&config(10, false), tx);

        assert!(timers.disarm());
        assert!(!timers.disarm());
        assert!(timers.is_disarmed());

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(drain(&mut rx).is_empty());
    }
}
