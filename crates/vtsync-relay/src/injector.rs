//! Stream-safe injector
//!
//! Queues escape sequences (window titles) and splices them into live PTY
//! output only at byte offsets where the [`StreamAnalyzer`] reports that no
//! escape sequence or UTF-8 character is in progress. When the stream goes
//! quiet without offering a safe point, pending payloads are written to an
//! [`OutputSink`] once the idle threshold has passed.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use vtsync_core::StreamAnalyzer;

use crate::config::InjectorConfig;

/// Destination for payloads flushed outside of an output chunk
pub trait OutputSink: Send + Sync {
    fn write_output(&self, data: &[u8]);
}

/// Build the OSC 2 sequence that sets the window title
///
/// Control characters are stripped so the title cannot terminate the
/// sequence early or smuggle in a sequence of its own.
pub fn title_sequence(title: &str) -> Vec<u8> {
    let clean: String = title.chars().filter(|c| !c.is_control()).collect();
    format!("\x1b]2;{}\x07", clean).into_bytes()
}

struct InjectorState {
    analyzer: StreamAnalyzer,
    pending: VecDeque<Vec<u8>>,
    idle_timer: Option<JoinHandle<()>>,
    /// Bumped on every (re)arm so a superseded timer can tell it lost
    timer_generation: u64,
    detached: bool,
}

struct Shared {
    state: Mutex<InjectorState>,
    sink: Arc<dyn OutputSink>,
    idle_threshold: Duration,
    runtime: Handle,
}

/// Injects queued payloads into one session's output stream
pub struct StreamInjector {
    shared: Arc<Shared>,
}

impl StreamInjector {
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(sink: Arc<dyn OutputSink>, config: &InjectorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(InjectorState {
                    analyzer: StreamAnalyzer::new(),
                    pending: VecDeque::new(),
                    idle_timer: None,
                    timer_generation: 0,
                    detached: false,
                }),
                sink,
                idle_threshold: config.idle_threshold(),
                runtime: Handle::current(),
            }),
        }
    }

    /// Queue a window title change
    pub fn queue_title(&self, title: &str) {
        let mut state = self.shared.state.lock();
        if state.detached {
            return;
        }
        state.pending.push_back(title_sequence(title));
        arm_idle_timer(&self.shared, &mut state);
    }

    /// Number of payloads waiting for a safe point
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Pass an output chunk through, splicing in pending payloads
    ///
    /// Each safe point takes at most one payload, earliest point first.
    /// Payloads left over stay queued for later chunks or the idle flush.
    pub fn process_output(&self, data: &[u8]) -> Vec<u8> {
        let mut state = self.shared.state.lock();
        if state.detached {
            return data.to_vec();
        }

        let points = state.analyzer.process(data);
        if state.pending.is_empty() {
            return data.to_vec();
        }

        let extra: usize = state
            .pending
            .iter()
            .take(points.len())
            .map(Vec::len)
            .sum();
        let mut out = Vec::with_capacity(data.len() + extra);
        let mut last = 0;
        for point in &points {
            let Some(payload) = state.pending.pop_front() else {
                break;
            };
            out.extend_from_slice(&data[last..point.position]);
            out.extend_from_slice(&payload);
            last = point.position;
            log::debug!(
                "Injected {} bytes at offset {} ({:?})",
                payload.len(),
                point.position,
                point.reason
            );
        }
        out.extend_from_slice(&data[last..]);

        if state.pending.is_empty() {
            cancel_idle_timer(&mut state);
        } else {
            arm_idle_timer(&self.shared, &mut state);
        }
        out
    }

    /// Write every pending payload to the sink now, ignoring stream state
    ///
    /// This can land in the middle of an escape sequence and corrupt the
    /// display. Only use it when the session is going away.
    pub fn force_inject(&self) {
        let payload = {
            let mut state = self.shared.state.lock();
            cancel_idle_timer(&mut state);
            take_pending(&mut state)
        };
        if !payload.is_empty() {
            log::warn!("Forcing injection of {} bytes", payload.len());
            self.shared.sink.write_output(&payload);
        }
    }

    /// Discard pending payloads and cancel the idle timer
    pub fn clear_pending(&self) {
        let mut state = self.shared.state.lock();
        cancel_idle_timer(&mut state);
        state.pending.clear();
    }

    /// Stop injecting for good; later output passes through untouched
    pub fn detach(&self) {
        let mut state = self.shared.state.lock();
        cancel_idle_timer(&mut state);
        state.pending.clear();
        state.detached = true;
    }
}

impl Drop for StreamInjector {
    fn drop(&mut self) {
        self.detach();
    }
}

fn take_pending(state: &mut InjectorState) -> Vec<u8> {
    state.pending.drain(..).flatten().collect()
}

fn cancel_idle_timer(state: &mut InjectorState) {
    state.timer_generation += 1;
    if let Some(timer) = state.idle_timer.take() {
        timer.abort();
    }
}

fn arm_idle_timer(shared: &Arc<Shared>, state: &mut InjectorState) {
    cancel_idle_timer(state);
    let generation = state.timer_generation;
    let weak = Arc::downgrade(shared);
    let delay = shared.idle_threshold;
    state.idle_timer = Some(shared.runtime.spawn(async move {
        tokio::time::sleep(delay).await;
        flush_idle(weak, generation);
    }));
}

fn flush_idle(shared: Weak<Shared>, generation: u64) {
    let Some(shared) = shared.upgrade() else {
        return;
    };

    let payload = {
        let mut state = shared.state.lock();
        if state.detached || state.timer_generation != generation {
            return;
        }
        // Our own handle; dropping it does not cancel us
        state.idle_timer = None;

        if state.analyzer.in_sequence() {
            log::debug!("Stream idle inside a sequence, delaying injection");
            arm_idle_timer(&shared, &mut state);
            return;
        }
        take_pending(&mut state)
    };

    if !payload.is_empty() {
        log::debug!("Stream idle, writing {} pending bytes", payload.len());
        shared.sink.write_output(&payload);
    }
}
