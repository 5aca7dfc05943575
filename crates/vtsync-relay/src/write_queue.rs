//! Flow-controlled write queue
//!
//! Serializes outbound writes (e.g. snapshot blobs to a socket) through one
//! worker task, FIFO. Queued bytes drive a high/low watermark state machine:
//! crossing the high watermark pauses the queue and emits
//! [`QueueEvent::Pause`] so producers can throttle; falling to the low
//! watermark emits [`QueueEvent::Resume`]. While paused, a queue that already
//! holds `max_operations` entries rejects new writes.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;

use crate::config::{ConfigError, QueueConfig};

type WriteFn = Box<dyn FnOnce(Vec<u8>) -> BoxFuture<'static, io::Result<()>> + Send>;

const EVENT_CAPACITY: usize = 64;

/// Queue state transitions and faults
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    /// Queued bytes reached the high watermark
    Pause { queued_bytes: usize },
    /// Queued bytes fell to the low watermark
    Resume { queued_bytes: usize },
    /// A write was rejected while paused and full
    Drop { bytes: usize },
    /// The queue became empty with no write in flight
    Drain,
    /// A write failed; the queue keeps going
    Error { message: String },
}

/// Counters exposed for observability
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueMetrics {
    pub queued_bytes: usize,
    pub queued_operations: usize,
    pub paused: bool,
    pub enqueued_operations: u64,
    pub written_operations: u64,
    pub written_bytes: u64,
    pub dropped_operations: u64,
    pub dropped_bytes: u64,
    pub write_errors: u64,
    pub pause_count: u64,
}

struct Entry {
    data: Vec<u8>,
    write: WriteFn,
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<Entry>,
    metrics: QueueMetrics,
}

struct Shared {
    config: QueueConfig,
    state: Mutex<QueueState>,
    wake: Notify,
    events: broadcast::Sender<QueueEvent>,
    idle: watch::Sender<bool>,
}

impl Shared {
    fn emit(&self, event: QueueEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }
}

/// Ordered, backpressured writer
pub struct FlowControlledQueue {
    shared: Arc<Shared>,
    worker: JoinHandle<()>,
}

impl FlowControlledQueue {
    /// Start a queue and its worker task
    ///
    /// Fails unless `low_watermark < high_watermark`.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(config: QueueConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (idle, _) = watch::channel(true);
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            events,
            idle,
        });
        let worker = tokio::spawn(process(Arc::clone(&shared)));

        Ok(Self { shared, worker })
    }

    /// Queue `data` to be written by `write`
    ///
    /// Returns `false` when the write was dropped because the queue is
    /// paused and already holds `max_operations` entries.
    pub fn enqueue<F, Fut>(&self, data: Vec<u8>, write: F) -> bool
    where
        F: FnOnce(Vec<u8>) -> Fut + Send + 'static,
        Fut: Future<Output = io::Result<()>> + Send + 'static,
    {
        let size = data.len();
        let mut state = self.shared.state.lock();

        if state.metrics.paused && state.entries.len() >= self.shared.config.max_operations {
            state.metrics.dropped_operations += 1;
            state.metrics.dropped_bytes += size as u64;
            log::debug!("Write queue full, dropped {} bytes", size);
            self.shared.emit(QueueEvent::Drop { bytes: size });
            return false;
        }

        state.entries.push_back(Entry {
            data,
            write: Box::new(move |data| write(data).boxed()),
        });
        state.metrics.queued_bytes += size;
        state.metrics.queued_operations = state.entries.len();
        state.metrics.enqueued_operations += 1;

        if !state.metrics.paused && state.metrics.queued_bytes >= self.shared.config.high_watermark {
            state.metrics.paused = true;
            state.metrics.pause_count += 1;
            log::debug!("Write queue paused at {} bytes", state.metrics.queued_bytes);
            self.shared.emit(QueueEvent::Pause {
                queued_bytes: state.metrics.queued_bytes,
            });
        }
        // Under the lock so the worker cannot mark idle in between
        self.shared.idle.send_replace(false);
        drop(state);

        self.shared.wake.notify_one();
        true
    }

    /// Wait until every queued write has completed
    pub async fn drain(&self) {
        let mut idle = self.shared.idle.subscribe();
        // The sender lives as long as `self`
        let _ = idle.wait_for(|idle| *idle).await;
    }

    pub fn metrics(&self) -> QueueMetrics {
        self.shared.state.lock().metrics.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.shared.state.lock().metrics.paused
    }

    /// Receive pause, resume, drop, drain and error events
    pub fn subscribe_events(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.events.subscribe()
    }
}

impl Drop for FlowControlledQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn process(shared: Arc<Shared>) {
    loop {
        let entry = shared.state.lock().entries.pop_front();
        let Some(Entry { data, write }) = entry else {
            shared.wake.notified().await;
            continue;
        };

        let size = data.len();
        let result = write(data).await;

        let mut state = shared.state.lock();
        let metrics = &mut state.metrics;
        metrics.queued_bytes -= size;
        match result {
            Ok(()) => {
                metrics.written_operations += 1;
                metrics.written_bytes += size as u64;
            }
            Err(e) => {
                metrics.write_errors += 1;
                log::error!("Queued write of {} bytes failed: {}", size, e);
                shared.emit(QueueEvent::Error {
                    message: e.to_string(),
                });
            }
        }

        if metrics.paused && metrics.queued_bytes <= shared.config.low_watermark {
            metrics.paused = false;
            log::debug!("Write queue resumed at {} bytes", metrics.queued_bytes);
            shared.emit(QueueEvent::Resume {
                queued_bytes: metrics.queued_bytes,
            });
        }

        state.metrics.queued_operations = state.entries.len();
        if state.entries.is_empty() {
            shared.emit(QueueEvent::Drain);
            shared.idle.send_replace(true);
        }
    }
}
