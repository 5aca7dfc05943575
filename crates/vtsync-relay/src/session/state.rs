//! Per-session buffer state

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use vtsync_core::{Snapshot, TerminalBuffer};

use crate::source::{CallbackHandle, SessionHandle};

/// A session's emulated screen plus the bookkeeping the manager needs
pub struct SessionBuffer {
    /// Session ID
    pub id: String,

    /// Emulated screen fed with the session's output
    buffer: TerminalBuffer,

    /// Upstream session
    session: Arc<dyn SessionHandle>,

    /// Last snapshot handed to subscribers
    last_delivered: Mutex<Option<Arc<Snapshot>>>,

    /// Direct output registration, absent when tailing the stream log
    callback: Mutex<Option<CallbackHandle>>,

    /// Pending debounced notification
    timer: Mutex<Option<JoinHandle<()>>>,

    /// Liveness monitor, stream-log poller and callback deliveries; `None`
    /// once stopped
    tasks: Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl SessionBuffer {
    pub fn new(session: Arc<dyn SessionHandle>) -> Self {
        let (cols, rows) = session.dimensions();
        Self {
            id: session.id().to_string(),
            buffer: TerminalBuffer::new(cols, rows),
            session,
            last_delivered: Mutex::new(None),
            callback: Mutex::new(None),
            timer: Mutex::new(None),
            tasks: Mutex::new(Some(Vec::new())),
        }
    }

    /// Feed output into the emulator
    pub fn write(&self, data: &[u8]) {
        self.buffer.write(data);
    }

    pub fn resize(&self, cols: usize, rows: usize) {
        self.buffer.resize(cols, rows);
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.buffer.get_snapshot()
    }

    pub fn full_snapshot(&self) -> Arc<Snapshot> {
        self.buffer.get_full_snapshot()
    }

    pub fn buffer(&self) -> &TerminalBuffer {
        &self.buffer
    }

    pub fn session(&self) -> &Arc<dyn SessionHandle> {
        &self.session
    }

    pub fn is_alive(&self) -> bool {
        self.session.is_alive()
    }

    /// Record `snapshot` as delivered unless it carries nothing new
    ///
    /// Returns `false` when subscribers already saw this sequence ID, or when
    /// the snapshot has neither change flags nor changed rows.
    pub(crate) fn mark_delivered(&self, snapshot: &Arc<Snapshot>) -> bool {
        let mut last = self.last_delivered.lock();
        if let Some(prev) = last.as_ref() {
            if snapshot.sequence_id <= prev.sequence_id {
                return false;
            }
        }
        if snapshot.change_flags.is_empty() && snapshot.dirty_rows.is_empty() {
            return false;
        }
        *last = Some(Arc::clone(snapshot));
        true
    }

    pub(crate) fn set_callback(&self, handle: CallbackHandle) {
        *self.callback.lock() = Some(handle);
    }

    pub(crate) fn take_callback(&self) -> Option<CallbackHandle> {
        self.callback.lock().take()
    }

    /// Replace the pending notification, cancelling the previous one
    pub(crate) fn replace_timer(&self, timer: JoinHandle<()>) {
        if let Some(old) = self.timer.lock().replace(timer) {
            old.abort();
        }
    }

    /// Track a background task, aborting it if the buffer is already stopped
    pub(crate) fn add_task(&self, task: JoinHandle<()>) {
        match self.tasks.lock().as_mut() {
            Some(tasks) => {
                tasks.retain(|t| !t.is_finished());
                tasks.push(task);
            }
            None => {
                log::trace!("Buffer {} already stopped, aborting new task", self.id);
                task.abort();
            }
        }
    }

    /// Cancel the pending notification and hand back background tasks
    ///
    /// Tasks added afterwards are aborted on arrival.
    pub(crate) fn stop(&self) -> Vec<JoinHandle<()>> {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
        self.tasks.lock().take().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{DirectOutputHub, OutputSource};

    fn buffer() -> SessionBuffer {
        let hub = DirectOutputHub::new();
        hub.add_session("s1", 20, 4);
        SessionBuffer::new(hub.get_session("s1").unwrap())
    }

    #[test]
    fn test_sized_from_session() {
        let state = buffer();
        assert_eq!(state.id, "s1");
        assert_eq!(state.buffer().size(), (20, 4));
    }

    #[test]
    fn test_mark_delivered_dedups() {
        let state = buffer();
        state.write(b"hello");

        let first = state.snapshot();
        assert!(state.mark_delivered(&first));
        assert!(!state.mark_delivered(&first));

        // Cached snapshot, same sequence
        assert!(!state.mark_delivered(&state.snapshot()));

        state.write(b"!");
        assert!(state.mark_delivered(&state.snapshot()));
    }

    #[tokio::test]
    async fn test_task_added_after_stop_is_aborted() {
        let state = buffer();
        state.add_task(tokio::spawn(async {}));
        assert_eq!(state.stop().len(), 1);

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        state.add_task(tokio::spawn(async move {
            let _tx = tx;
            std::future::pending::<()>().await;
        }));
        // Aborting drops the task and with it the sender
        assert!(rx.await.is_err());
        assert!(state.stop().is_empty());
    }

    #[test]
    fn test_mark_delivered_skips_clean_first_snapshot() {
        let state = buffer();
        let clean = state.snapshot();
        assert!(clean.change_flags.is_empty());
        assert!(!state.mark_delivered(&clean));
    }
}
