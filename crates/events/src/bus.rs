//! Event bus with per-run ordered buffers

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::types::{EventKind, EventSource, ProgressEvent};

/// Events kept per run for late subscribers.
const DEFAULT_BUFFER: usize = 256;
/// Capacity of each live broadcast channel.
const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// A finite, ordered stream of one run's events.
pub type EventStream = BoxStream<'static, ProgressEvent>;

struct ChannelState {
    next_sequence: u64,
    history: VecDeque<ProgressEvent>,
    terminal: bool,
}

struct RunChannel {
    state: Mutex<ChannelState>,
    sender: broadcast::Sender<ProgressEvent>,
}

impl RunChannel {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            state: Mutex::new(ChannelState {
                next_sequence: 1,
                history: VecDeque::with_capacity(32),
                terminal: false,
            }),
            sender,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Decouples run drivers from whoever is watching them.
///
/// Every run gets its own sequence counter, a bounded history buffer and a
/// broadcast channel. Sequence numbers are assigned under the run's lock,
/// so events of one run are totally ordered no matter how many tasks
/// publish. When the buffer is full the oldest event is evicted and new
/// subscribers receive a `dropped` marker in its place.
#[derive(Clone)]
pub struct EventBus {
    runs: Arc<RwLock<HashMap<Uuid, Arc<RunChannel>>>>,
    global: broadcast::Sender<ProgressEvent>,
    buffer: usize,
    channel_capacity: usize,
    event_count: Arc<AtomicUsize>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER, DEFAULT_CHANNEL_CAPACITY)
    }

    /// `buffer` bounds the per-run history, `channel_capacity` bounds how far
    /// a live subscriber may fall behind before it is told about a gap.
    pub fn with_capacity(buffer: usize, channel_capacity: usize) -> Self {
        let channel_capacity = channel_capacity.max(1);
        let (global, _) = broadcast::channel(channel_capacity);
        Self {
            runs: Arc::new(RwLock::new(HashMap::new())),
            global,
            buffer: buffer.max(1),
            channel_capacity,
            event_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn channel(&self, run_id: Uuid) -> Option<Arc<RunChannel>> {
        self.runs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&run_id)
            .cloned()
    }

    fn channel_or_create(&self, run_id: Uuid) -> Arc<RunChannel> {
        if let Some(channel) = self.channel(run_id) {
            return channel;
        }
        let mut runs = self
            .runs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            runs.entry(run_id)
                .or_insert_with(|| Arc::new(RunChannel::new(self.channel_capacity))),
        )
    }

    /// Register a run so it can be subscribed to before its first event.
    pub fn open(&self, run_id: Uuid) {
        self.channel_or_create(run_id);
    }

    /// Publish an event for a run and return it with its sequence number.
    ///
    /// Returns `None` once the run has published its terminal event; nothing
    /// may follow it.
    pub fn publish(
        &self,
        run_id: Uuid,
        source: EventSource,
        kind: EventKind,
        message: Option<String>,
    ) -> Option<ProgressEvent> {
        let channel = self.channel_or_create(run_id);
        let mut state = channel.lock();
        if state.terminal {
            tracing::debug!(run_id = %run_id, kind = kind.as_str(), "Event after terminal ignored");
            return None;
        }

        let mut event = ProgressEvent::new(run_id, state.next_sequence, source, kind);
        event.message = message;
        state.next_sequence += 1;
        state.terminal = event.is_terminal();

        state.history.push_back(event.clone());
        while state.history.len() > self.buffer {
            state.history.pop_front();
        }

        // Sent while the lock is held so channel order equals sequence order.
        let _ = channel.sender.send(event.clone());
        let _ = self.global.send(event.clone());
        self.event_count.fetch_add(1, Ordering::Relaxed);
        Some(event)
    }

    /// Subscribe to one run: buffered history first, then live events, ending
    /// after the terminal event. Returns `None` for an unknown run.
    pub fn subscribe(&self, run_id: Uuid) -> Option<EventStream> {
        let channel = self.channel(run_id)?;
        let state = channel.lock();

        let mut backlog = Vec::with_capacity(state.history.len() + 1);
        if let Some(first) = state.history.front() {
            if first.sequence > 1 {
                let missed = first.sequence - 1;
                backlog.push(ProgressEvent::dropped(run_id, missed, missed));
            }
        }
        backlog.extend(state.history.iter().cloned());
        let last_sequence = state.next_sequence - 1;

        if state.terminal {
            return Some(stream::iter(backlog).boxed());
        }

        let receiver = channel.sender.subscribe();
        drop(state);

        let live = live_stream(run_id, receiver, last_sequence);
        Some(stream::iter(backlog).chain(live).boxed())
    }

    /// Every event of every run, live only.
    pub fn subscribe_all(&self) -> BoxStream<'static, ProgressEvent> {
        BroadcastStream::new(self.global.subscribe())
            .filter_map(|res| async move { res.ok() })
            .boxed()
    }

    /// Events currently buffered for a run.
    pub fn history(&self, run_id: Uuid) -> Vec<ProgressEvent> {
        let Some(channel) = self.channel(run_id) else {
            return Vec::new();
        };
        let state = channel.lock();
        let history: Vec<ProgressEvent> = state.history.iter().cloned().collect();
        history
    }

    pub fn last_sequence(&self, run_id: Uuid) -> Option<u64> {
        let channel = self.channel(run_id)?;
        let last = channel.lock().next_sequence - 1;
        Some(last)
    }

    /// Drop a run's buffer. Live subscribers see their stream end.
    pub fn remove_run(&self, run_id: Uuid) -> bool {
        self.runs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&run_id)
            .is_some()
    }

    pub fn run_count(&self) -> usize {
        self.runs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn subscriber_count(&self, run_id: Uuid) -> usize {
        self.channel(run_id)
            .map(|channel| channel.sender.receiver_count())
            .unwrap_or(0)
    }

    /// Total number of events published (for monitoring)
    pub fn event_count(&self) -> usize {
        self.event_count.load(Ordering::Relaxed)
    }
}

struct LiveState {
    run_id: Uuid,
    receiver: broadcast::Receiver<ProgressEvent>,
    last_sequence: u64,
    done: bool,
}

fn live_stream(
    run_id: Uuid,
    receiver: broadcast::Receiver<ProgressEvent>,
    last_sequence: u64,
) -> impl futures::Stream<Item = ProgressEvent> + Send + 'static {
    let state = LiveState {
        run_id,
        receiver,
        last_sequence,
        done: false,
    };
    stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        loop {
            match state.receiver.recv().await {
                Ok(event) => {
                    if event.sequence <= state.last_sequence {
                        continue;
                    }
                    state.last_sequence = event.sequence;
                    state.done = event.is_terminal();
                    return Some((event, state));
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(run_id = %state.run_id, missed, "Subscriber lagged behind");
                    state.last_sequence += missed;
                    let marker =
                        ProgressEvent::dropped(state.run_id, state.last_sequence, missed);
                    return Some((marker, state));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("runs", &self.run_count())
            .field("event_count", &self.event_count())
            .finish()
    }
}
