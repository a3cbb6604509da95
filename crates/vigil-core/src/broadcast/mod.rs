//! Real-time output broadcaster.
//!
//! Every execution emits its output here. The broadcaster keeps a bounded,
//! time-windowed buffer for late joiners and "since sequence N" queries, and
//! fans each chunk out to live subscribers as it is emitted.
//!
//! ```text
//! ProcessSupervisor --emit()--> OutputBroadcaster --on_chunk()--> Subscriber A
//!        (task 1)                    |  buffer      \-----------> Subscriber B
//! ProcessSupervisor --emit()-------->|  seq 1..N     \----------> channel C
//!        (task 2)
//! ```
//!
//! The broadcaster is an ordinary value: construct one at the application
//! root and hand clones to every supervisor that should share it.

pub mod chunk;
pub mod stale;
pub mod subscriber;

use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::BroadcastConfig;

pub use chunk::{ActiveTaskInfo, EndStatus, OutputChunk, StreamKind};
pub use stale::{StaleContext, is_stale};
pub use subscriber::{Subscriber, Subscription};

use subscriber::Unsubscribe;

/// Shared, cloneable handle to one output buffer and its subscribers.
#[derive(Clone)]
pub struct OutputBroadcaster {
    inner: Arc<Inner>,
}

struct Inner {
    config: BroadcastConfig,
    /// Held for the whole emit (append + notify) so subscribers observe
    /// chunks in sequence order.
    dispatch: Mutex<()>,
    state: Mutex<BufferState>,
    subscribers: Mutex<Vec<(u64, Arc<dyn Subscriber>)>>,
    next_subscriber_id: AtomicU64,
}

struct BufferState {
    chunks: VecDeque<OutputChunk>,
    last_sequence: u64,
    session_id: String,
    active: HashMap<Uuid, ActiveTaskInfo>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl std::fmt::Debug for OutputBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputBroadcaster")
            .field("config", &self.inner.config)
            .finish()
    }
}

impl OutputBroadcaster {
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                dispatch: Mutex::new(()),
                state: Mutex::new(BufferState {
                    chunks: VecDeque::new(),
                    last_sequence: 0,
                    session_id: Uuid::new_v4().to_string(),
                    active: HashMap::new(),
                }),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.inner.config
    }

    /// Append a chunk, update task bookkeeping, trim, and notify subscribers.
    pub fn emit(
        &self,
        task_id: Uuid,
        stream: StreamKind,
        text: impl Into<String>,
        project_id: Option<&str>,
    ) -> OutputChunk {
        let _dispatch = lock(&self.inner.dispatch);

        let chunk = {
            let mut state = lock(&self.inner.state);
            let now = Utc::now();
            state.last_sequence += 1;
            let chunk = OutputChunk {
                timestamp: now,
                task_id,
                session_id: Some(state.session_id.clone()),
                project_id: project_id.map(str::to_string),
                stream,
                text: text.into(),
                sequence: state.last_sequence,
            };

            state
                .active
                .entry(task_id)
                .and_modify(|info| info.last_output_time = now)
                .or_insert(ActiveTaskInfo {
                    task_id,
                    start_time: now,
                    last_output_time: now,
                });

            state.chunks.push_back(chunk.clone());
            trim(&mut state, &self.inner.config, now);
            chunk
        };

        self.notify(&chunk);
        chunk
    }

    fn notify(&self, chunk: &OutputChunk) {
        let subscribers = lock(&self.inner.subscribers).clone();
        for (id, subscriber) in subscribers {
            match catch_unwind(AssertUnwindSafe(|| subscriber.on_chunk(chunk))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        subscriber = id,
                        sequence = chunk.sequence,
                        error = %e,
                        "subscriber failed to handle chunk"
                    );
                }
                Err(_) => {
                    warn!(
                        subscriber = id,
                        sequence = chunk.sequence,
                        "subscriber panicked while handling chunk"
                    );
                }
            }
        }
    }

    /// Register a subscriber; it sees every chunk emitted from now on.
    pub fn subscribe(&self, subscriber: impl Subscriber + 'static) -> Subscription {
        self.subscribe_arc(Arc::new(subscriber))
    }

    pub fn subscribe_arc(&self, subscriber: Arc<dyn Subscriber>) -> Subscription {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.subscribers).push((id, subscriber));
        debug!(subscriber = id, "subscriber registered");

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let owner: Weak<dyn Unsubscribe> = weak;
        Subscription::new(id, owner)
    }

    /// Subscribe through an unbounded channel instead of a callback.
    pub fn subscribe_channel(&self) -> (Subscription, mpsc::UnboundedReceiver<OutputChunk>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |chunk: &OutputChunk| {
            tx.send(chunk.clone())
                .map_err(|_| anyhow!("channel subscriber receiver was dropped"))
        });
        (subscription, rx)
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }

    // -- task bookkeeping --------------------------------------------------

    /// Record the start of a task for active-task summaries.
    pub fn start_task(&self, task_id: Uuid) {
        let now = Utc::now();
        lock(&self.inner.state).active.insert(
            task_id,
            ActiveTaskInfo {
                task_id,
                start_time: now,
                last_output_time: now,
            },
        );
    }

    /// Write one synthetic status chunk for the task, then forget it.
    pub fn end_task(&self, task_id: Uuid, status: EndStatus) -> OutputChunk {
        let chunk = self.emit(task_id, StreamKind::State, status.as_str(), None);
        lock(&self.inner.state).active.remove(&task_id);
        chunk
    }

    pub fn active_tasks(&self) -> Vec<ActiveTaskInfo> {
        let mut tasks: Vec<ActiveTaskInfo> =
            lock(&self.inner.state).active.values().cloned().collect();
        tasks.sort_by_key(|t| t.start_time);
        tasks
    }

    pub fn is_active(&self, task_id: Uuid) -> bool {
        lock(&self.inner.state).active.contains_key(&task_id)
    }

    // -- sessions ----------------------------------------------------------

    /// The session tag attached to chunks emitted right now.
    pub fn session_id(&self) -> String {
        lock(&self.inner.state).session_id.clone()
    }

    /// Start a new session; chunks emitted before this call become stale
    /// for viewers that adopt the new tag.
    pub fn new_session(&self) -> String {
        let session = Uuid::new_v4().to_string();
        lock(&self.inner.state).session_id = session.clone();
        session
    }

    // -- queries -----------------------------------------------------------

    pub fn get_all(&self) -> Vec<OutputChunk> {
        lock(&self.inner.state).chunks.iter().cloned().collect()
    }

    pub fn get_by_task_id(&self, task_id: Uuid) -> Vec<OutputChunk> {
        lock(&self.inner.state)
            .chunks
            .iter()
            .filter(|c| c.task_id == task_id)
            .cloned()
            .collect()
    }

    /// Chunks with a sequence strictly greater than `sequence`.
    pub fn get_since(&self, sequence: u64) -> Vec<OutputChunk> {
        lock(&self.inner.state)
            .chunks
            .iter()
            .filter(|c| c.sequence > sequence)
            .cloned()
            .collect()
    }

    /// The last `limit` chunks for a task, oldest first.
    pub fn get_recent_for_task(&self, task_id: Uuid, limit: usize) -> Vec<OutputChunk> {
        let state = lock(&self.inner.state);
        let mut recent: Vec<OutputChunk> = state
            .chunks
            .iter()
            .rev()
            .filter(|c| c.task_id == task_id)
            .take(limit)
            .cloned()
            .collect();
        recent.reverse();
        recent
    }

    /// Visible chunks for a viewer in `context`, per [`is_stale`].
    pub fn get_fresh(&self, context: &StaleContext) -> Vec<OutputChunk> {
        lock(&self.inner.state)
            .chunks
            .iter()
            .filter(|c| !is_stale(c, Some(context)))
            .cloned()
            .collect()
    }

    pub fn last_sequence(&self) -> u64 {
        lock(&self.inner.state).last_sequence
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.state).chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all buffered chunks. Sequence numbering continues.
    pub fn clear(&self) {
        lock(&self.inner.state).chunks.clear();
    }
}

impl Default for OutputBroadcaster {
    fn default() -> Self {
        Self::new(BroadcastConfig::default())
    }
}

impl Unsubscribe for Inner {
    fn remove_subscriber(&self, id: u64) {
        lock(&self.subscribers).retain(|(sid, _)| *sid != id);
        debug!(subscriber = id, "subscriber removed");
    }
}

fn trim(state: &mut BufferState, config: &BroadcastConfig, now: DateTime<Utc>) {
    while state.chunks.len() > config.max_buffer_size {
        state.chunks.pop_front();
    }

    let Ok(max_age) = chrono::Duration::from_std(config.max_age) else {
        return;
    };
    while let Some(front) = state.chunks.front() {
        if now - front.timestamp > max_age {
            state.chunks.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    fn small(max_buffer_size: usize) -> OutputBroadcaster {
        OutputBroadcaster::new(BroadcastConfig {
            max_buffer_size,
            max_age: Duration::from_secs(3600),
        })
    }

    #[test]
    fn emit_assigns_increasing_sequence_and_session() {
        let b = OutputBroadcaster::default();
        let task = Uuid::new_v4();
        let a = b.emit(task, StreamKind::Stdout, "one", None);
        let c = b.emit(task, StreamKind::Stderr, "two", Some("proj"));
        assert_eq!(a.sequence, 1);
        assert_eq!(c.sequence, 2);
        assert_eq!(a.session_id.as_deref(), Some(b.session_id().as_str()));
        assert_eq!(c.project_id.as_deref(), Some("proj"));
        assert_eq!(b.last_sequence(), 2);
    }

    #[test]
    fn trim_keeps_most_recent_by_count() {
        let b = small(5);
        let task = Uuid::new_v4();
        for i in 0..12 {
            b.emit(task, StreamKind::Stdout, format!("line {i}"), None);
        }
        let all = b.get_all();
        assert_eq!(all.len(), 5);
        let seqs: Vec<u64> = all.iter().map(|c| c.sequence).collect();
        assert_eq!(seqs, vec![8, 9, 10, 11, 12]);
    }

    #[test]
    fn trim_drops_chunks_older_than_max_age() {
        let b = OutputBroadcaster::new(BroadcastConfig {
            max_buffer_size: 100,
            max_age: Duration::from_millis(50),
        });
        let task = Uuid::new_v4();
        b.emit(task, StreamKind::Stdout, "old", None);
        std::thread::sleep(Duration::from_millis(120));
        b.emit(task, StreamKind::Stdout, "new", None);
        let all = b.get_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].text, "new");
    }

    #[test]
    fn subscribers_see_chunks_after_subscribing() {
        let b = OutputBroadcaster::default();
        let task = Uuid::new_v4();
        b.emit(task, StreamKind::Stdout, "before", None);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = b.subscribe(move |c: &OutputChunk| -> anyhow::Result<()> {
            sink.lock().unwrap().push(c.text.clone());
            Ok(())
        });

        b.emit(task, StreamKind::Stdout, "after", None);
        assert_eq!(*seen.lock().unwrap(), vec!["after".to_string()]);
    }

    #[test]
    fn faulty_subscribers_do_not_block_others() {
        let b = OutputBroadcaster::default();
        let delivered = Arc::new(AtomicUsize::new(0));

        let _failing = b.subscribe(|_: &OutputChunk| -> anyhow::Result<()> { Err(anyhow!("boom")) });
        let _panicking = b.subscribe(|_: &OutputChunk| -> anyhow::Result<()> {
            panic!("subscriber bug")
        });
        let counter = Arc::clone(&delivered);
        let _healthy = b.subscribe(move |_: &OutputChunk| -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let task = Uuid::new_v4();
        b.emit(task, StreamKind::Stdout, "a", None);
        b.emit(task, StreamKind::Stdout, "b", None);
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn subscriber_may_query_broadcaster_during_delivery() {
        let b = OutputBroadcaster::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let inner = b.clone();
        let counter = Arc::clone(&seen);
        let _querying = b.subscribe(move |chunk: &OutputChunk| -> anyhow::Result<()> {
            // The chunk is already buffered when subscribers run. Panics are
            // caught by the broadcaster, so record the check instead.
            let buffered = inner.get_all().iter().any(|c| c.sequence == chunk.sequence);
            if buffered && inner.subscriber_count() == 1 {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        });

        let task = Uuid::new_v4();
        b.emit(task, StreamKind::Stdout, "a", None);
        b.end_task(task, EndStatus::Complete);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let b = OutputBroadcaster::default();
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        let sub = b.subscribe(move |_: &OutputChunk| -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let task = Uuid::new_v4();
        b.emit(task, StreamKind::Stdout, "a", None);
        assert_eq!(b.subscriber_count(), 1);
        sub.unsubscribe();
        assert_eq!(b.subscriber_count(), 0);
        b.emit(task, StreamKind::Stdout, "b", None);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_after_broadcaster_dropped_is_noop() {
        let b = OutputBroadcaster::default();
        let sub = b.subscribe(|_: &OutputChunk| -> anyhow::Result<()> { Ok(()) });
        drop(b);
        sub.unsubscribe();
    }

    #[test]
    fn queries_filter_by_task_and_sequence() {
        let b = OutputBroadcaster::default();
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        for i in 0..4 {
            b.emit(t1, StreamKind::Stdout, format!("t1-{i}"), None);
            b.emit(t2, StreamKind::Stdout, format!("t2-{i}"), None);
        }

        assert_eq!(b.get_by_task_id(t1).len(), 4);
        assert!(b.get_by_task_id(t2).iter().all(|c| c.task_id == t2));

        let since = b.get_since(5);
        assert_eq!(since.first().map(|c| c.sequence), Some(6));
        assert_eq!(since.len(), 3);

        let recent: Vec<String> = b
            .get_recent_for_task(t1, 2)
            .into_iter()
            .map(|c| c.text)
            .collect();
        assert_eq!(recent, vec!["t1-2".to_string(), "t1-3".to_string()]);
    }

    #[test]
    fn end_task_writes_state_chunk_and_removes_task() {
        let b = OutputBroadcaster::default();
        let task = Uuid::new_v4();
        b.start_task(task);
        assert!(b.is_active(task));
        b.emit(task, StreamKind::Stdout, "work", None);

        let end = b.end_task(task, EndStatus::AwaitingResponse);
        assert_eq!(end.stream, StreamKind::State);
        assert_eq!(end.text, "AWAITING_RESPONSE");
        assert!(!b.is_active(task));

        let states: Vec<_> = b
            .get_by_task_id(task)
            .into_iter()
            .filter(|c| c.stream == StreamKind::State)
            .collect();
        assert_eq!(states.len(), 1);
    }

    #[test]
    fn emit_updates_last_output_time() {
        let b = OutputBroadcaster::default();
        let task = Uuid::new_v4();
        b.start_task(task);
        let before = b.active_tasks()[0].clone();
        std::thread::sleep(Duration::from_millis(5));
        b.emit(task, StreamKind::Stdout, "x", None);
        let after = b.active_tasks()[0].clone();
        assert_eq!(after.start_time, before.start_time);
        assert!(after.last_output_time > before.last_output_time);
    }

    #[test]
    fn new_session_makes_old_chunks_stale() {
        let b = OutputBroadcaster::default();
        let task = Uuid::new_v4();
        let created = Utc::now() - chrono::Duration::seconds(1);
        b.emit(task, StreamKind::Stdout, "old session", None);
        let session = b.new_session();
        b.emit(task, StreamKind::Stdout, "new session", None);

        let ctx = StaleContext {
            task_id: task,
            session_id: session,
            task_created_at: created,
        };
        let fresh: Vec<String> = b.get_fresh(&ctx).into_iter().map(|c| c.text).collect();
        assert_eq!(fresh, vec!["new session".to_string()]);
    }

    #[test]
    fn sequences_are_unique_and_monotonic_across_threads() {
        let b = OutputBroadcaster::new(BroadcastConfig {
            max_buffer_size: 10_000,
            max_age: Duration::from_secs(3600),
        });
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let b = b.clone();
                std::thread::spawn(move || {
                    let task = Uuid::new_v4();
                    (0..500)
                        .map(|i| b.emit(task, StreamKind::Stdout, i.to_string(), None).sequence)
                        .collect::<Vec<u64>>()
                })
            })
            .collect();

        let mut all = Vec::new();
        for h in handles {
            let seqs = h.join().unwrap();
            assert!(seqs.windows(2).all(|w| w[0] < w[1]));
            all.extend(seqs);
        }
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1000);

        let buffered: Vec<u64> = b.get_all().iter().map(|c| c.sequence).collect();
        assert!(buffered.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn channel_subscription_receives_in_order() {
        let b = OutputBroadcaster::default();
        let (sub, mut rx) = b.subscribe_channel();
        let task = Uuid::new_v4();
        b.emit(task, StreamKind::Stdout, "1", None);
        b.emit(task, StreamKind::Stderr, "2", None);

        assert_eq!(rx.recv().await.unwrap().text, "1");
        assert_eq!(rx.recv().await.unwrap().text, "2");
        sub.unsubscribe();
    }
}
