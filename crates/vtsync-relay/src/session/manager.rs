//! Session buffer manager
//!
//! Owns one [`SessionBuffer`] per session, feeds it from the session's PTY
//! output and fans debounced snapshots out to subscribers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use vtsync_core::Snapshot;

use crate::config::{BufferConfig, ConfigError};
use crate::error::{RelayError, Result};
use crate::session::SessionBuffer;
use crate::source::{OutputCallback, OutputSource};
use crate::stream_log::{StreamEvent, StreamLogReader};

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Arc<Snapshot>>,
}

struct Inner {
    config: BufferConfig,
    source: Arc<dyn OutputSource>,
    runtime: Handle,
    buffers: RwLock<HashMap<String, Arc<SessionBuffer>>>,
    /// Guarded separately from the buffers so fan-out never blocks writers
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    /// Held while a buffer is created or removed, never while output flows
    lifecycle: Mutex<()>,
    shutdown: AtomicBool,
    next_subscriber: AtomicU64,
}

/// Thread-safe manager for session buffers
///
/// Cloning is cheap; clones share the same sessions.
#[derive(Clone)]
pub struct BufferManager {
    inner: Arc<Inner>,
}

impl BufferManager {
    /// Create a manager reading output from `source`
    ///
    /// Fails when `config` has a zero capacity or interval.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(source: Arc<dyn OutputSource>, config: BufferConfig) -> std::result::Result<Self, ConfigError> {
        Self::with_runtime(source, config, Handle::current())
    }

    /// Create a manager that spawns its timers and monitors on `runtime`
    pub fn with_runtime(
        source: Arc<dyn OutputSource>,
        config: BufferConfig,
        runtime: Handle,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                source,
                runtime,
                buffers: RwLock::new(HashMap::new()),
                subscribers: RwLock::new(HashMap::new()),
                lifecycle: Mutex::new(()),
                shutdown: AtomicBool::new(false),
                next_subscriber: AtomicU64::new(1),
            }),
        })
    }

    /// Get the buffer of a session, creating and attaching it on first use
    pub fn get_or_create_buffer(&self, session_id: &str) -> Result<Arc<SessionBuffer>> {
        self.inner.get_or_create(session_id)
    }

    /// Pull the session's current snapshot
    pub fn get_buffer_snapshot(&self, session_id: &str) -> Result<Arc<Snapshot>> {
        Ok(self.inner.get_or_create(session_id)?.snapshot())
    }

    /// Pull a snapshot carrying every row, for consumers resyncing after a gap
    pub fn get_full_snapshot(&self, session_id: &str) -> Result<Arc<Snapshot>> {
        Ok(self.inner.get_or_create(session_id)?.full_snapshot())
    }

    /// Resize a session's buffer and notify subscribers
    pub fn resize(&self, session_id: &str, cols: usize, rows: usize) -> Result<()> {
        let state = self.inner.get_or_create(session_id)?;
        state.resize(cols, rows);
        self.inner.schedule_notification(&state);
        Ok(())
    }

    /// Subscribe to debounced snapshots of a session
    ///
    /// Each subscriber gets a bounded channel. When it is full the update is
    /// dropped for that subscriber only, so a lagging consumer sees a gap in
    /// sequence IDs and should call [`get_full_snapshot`](Self::get_full_snapshot).
    pub fn subscribe(&self, session_id: &str) -> Result<BufferSubscription> {
        self.subscribe_to(session_id).map(|(_, subscription)| subscription)
    }

    fn subscribe_to(&self, session_id: &str) -> Result<(Arc<SessionBuffer>, BufferSubscription)> {
        let state = self.inner.get_or_create(session_id)?;

        let (tx, receiver) = mpsc::channel(self.inner.config.subscriber_capacity);
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        {
            let mut subscribers = self.inner.subscribers.write();
            // Teardown removes the buffer before its subscribers
            if self.inner.buffer(session_id).is_none() {
                return Err(if self.is_shut_down() {
                    RelayError::ShutDown
                } else {
                    RelayError::SessionNotFound(session_id.to_string())
                });
            }
            subscribers
                .entry(session_id.to_string())
                .or_default()
                .push(Subscriber { id, tx });
        }
        log::debug!("Subscriber {} attached to session {}", id, session_id);

        let subscription = BufferSubscription {
            session_id: session_id.to_string(),
            id,
            receiver,
            manager: Arc::downgrade(&self.inner),
        };
        Ok((state, subscription))
    }

    /// Call `callback` with every snapshot delivered for a session
    ///
    /// The callback runs on a spawned task owned by the session, so
    /// [`shutdown`](Self::shutdown) waits for a running callback to return.
    /// Dropping the returned handle leaves the subscription in place; call
    /// [`Unsubscribe::unsubscribe`].
    pub fn subscribe_with_callback<F>(&self, session_id: &str, callback: F) -> Result<Unsubscribe>
    where
        F: Fn(&str, Arc<Snapshot>) + Send + Sync + 'static,
    {
        let (state, mut subscription) = self.subscribe_to(session_id)?;
        let id = subscription.id;

        let task = self.inner.runtime.spawn(async move {
            while let Some(snapshot) = subscription.recv().await {
                callback(&subscription.session_id, snapshot);
            }
        });
        let abort = task.abort_handle();
        state.add_task(task);

        Ok(Unsubscribe {
            manager: Arc::downgrade(&self.inner),
            session_id: session_id.to_string(),
            id,
            task: Mutex::new(Some(abort)),
        })
    }

    /// Tear down a session's buffer
    ///
    /// Unregisters the output callback, cancels timers and monitors, and
    /// closes every subscriber channel. Unknown sessions are ignored.
    pub fn teardown(&self, session_id: &str) {
        for task in self.inner.teardown(session_id) {
            task.abort();
        }
    }

    /// Session IDs with a live buffer
    pub fn session_ids(&self) -> Vec<String> {
        self.inner.buffers.read().keys().cloned().collect()
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.inner
            .subscribers
            .read()
            .get(session_id)
            .map_or(0, |subs| subs.len())
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Tear down every session and wait for background tasks to exit
    ///
    /// Later calls return immediately. New buffers cannot be created
    /// afterwards.
    pub async fn shutdown(&self) {
        let drained = {
            let _lifecycle = self.inner.lifecycle.lock();
            if self.inner.shutdown.swap(true, Ordering::SeqCst) {
                return;
            }
            std::mem::take(&mut *self.inner.buffers.write())
        };

        let count = drained.len();
        let mut tasks = Vec::new();
        for (id, state) in drained {
            tasks.extend(self.inner.release(&id, &state));
        }
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            // Cancellation is the expected outcome
            let _ = task.await;
        }

        log::info!("Buffer manager shut down ({} sessions)", count);
    }
}

impl Inner {
    fn buffer(&self, session_id: &str) -> Option<Arc<SessionBuffer>> {
        self.buffers.read().get(session_id).cloned()
    }

    fn get_or_create(self: &Arc<Self>, session_id: &str) -> Result<Arc<SessionBuffer>> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(RelayError::ShutDown);
        }
        if let Some(state) = self.buffer(session_id) {
            return Ok(state);
        }

        // Shutdown and teardown wait until the buffer is fully attached
        let _lifecycle = self.lifecycle.lock();
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(RelayError::ShutDown);
        }
        if let Some(state) = self.buffer(session_id) {
            return Ok(state);
        }

        let session = self
            .source
            .get_session(session_id)
            .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))?;

        let state = Arc::new(SessionBuffer::new(session));
        self.buffers
            .write()
            .insert(session_id.to_string(), Arc::clone(&state));

        if let Err(e) = self.attach(&state) {
            self.buffers.write().remove(session_id);
            return Err(e);
        }

        let weak = Arc::downgrade(self);
        let interval = self.config.liveness_interval();
        state.add_task(
            self.runtime
                .spawn(monitor_liveness(weak, session_id.to_string(), interval)),
        );

        let (cols, rows) = state.buffer().size();
        log::info!("Created buffer for session {} ({}x{})", session_id, cols, rows);
        Ok(state)
    }

    /// Hook the buffer up to live output, falling back to the stream log
    fn attach(self: &Arc<Self>, state: &Arc<SessionBuffer>) -> Result<()> {
        let weak = Arc::downgrade(self);
        let callback: OutputCallback = Arc::new(move |session_id, data| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_output(session_id, data);
            }
        });

        match self.source.register_output_callback(&state.id, callback) {
            Ok(handle) => {
                state.set_callback(handle);
                Ok(())
            }
            Err(RelayError::DirectOutputUnsupported(_)) => {
                let path = state
                    .session()
                    .stream_log_path()
                    .ok_or_else(|| RelayError::NoStreamLog(state.id.clone()))?;
                log::info!(
                    "Session {} has no direct output, tailing {}",
                    state.id,
                    path.display()
                );
                let task = poll_stream_log(
                    Arc::downgrade(self),
                    state.id.clone(),
                    path,
                    self.config.poll_interval(),
                );
                state.add_task(self.runtime.spawn(task));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn handle_output(self: &Arc<Self>, session_id: &str, data: &[u8]) {
        if let Some(state) = self.buffer(session_id) {
            state.write(data);
            self.schedule_notification(&state);
        }
    }

    /// (Re)arm the session's debounce timer
    fn schedule_notification(self: &Arc<Self>, state: &Arc<SessionBuffer>) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }

        let weak = Arc::downgrade(self);
        let session_id = state.id.clone();
        let delay = self.config.debounce();
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.notify(&session_id);
            }
        });
        state.replace_timer(timer);
    }

    fn notify(&self, session_id: &str) {
        let Some(state) = self.buffer(session_id) else {
            return;
        };

        let snapshot = state.snapshot();
        if !state.mark_delivered(&snapshot) {
            log::trace!(
                "Suppressed notification for {} (sequence {})",
                session_id,
                snapshot.sequence_id
            );
            return;
        }

        let mut closed = Vec::new();
        if let Some(subs) = self.subscribers.read().get(session_id) {
            for sub in subs {
                match sub.tx.try_send(Arc::clone(&snapshot)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => log::debug!(
                        "Subscriber {} of {} is lagging, dropped sequence {}",
                        sub.id,
                        session_id,
                        snapshot.sequence_id
                    ),
                    Err(TrySendError::Closed(_)) => closed.push(sub.id),
                }
            }
        }

        for id in closed {
            self.unsubscribe(session_id, id);
        }
    }

    fn unsubscribe(&self, session_id: &str, id: u64) {
        let mut subscribers = self.subscribers.write();
        if let Some(subs) = subscribers.get_mut(session_id) {
            let before = subs.len();
            subs.retain(|sub| sub.id != id);
            if subs.len() != before {
                log::debug!("Subscriber {} detached from session {}", id, session_id);
            }
            if subs.is_empty() {
                subscribers.remove(session_id);
            }
        }
    }

    /// Remove a session's buffer, returning its background tasks
    fn teardown(&self, session_id: &str) -> Vec<JoinHandle<()>> {
        let removed = {
            let _lifecycle = self.lifecycle.lock();
            self.buffers.write().remove(session_id)
        };
        match removed {
            Some(state) => self.release(session_id, &state),
            None => Vec::new(),
        }
    }

    /// Detach a removed buffer from its session and subscribers
    fn release(&self, session_id: &str, state: &SessionBuffer) -> Vec<JoinHandle<()>> {
        if let Some(handle) = state.take_callback() {
            self.source.unregister_output_callback(session_id, handle);
        }
        let tasks = state.stop();

        // Dropping the senders closes every subscriber channel
        let subscribers = self.subscribers.write().remove(session_id);
        let count = subscribers.map_or(0, |subs| subs.len());

        log::info!(
            "Tore down buffer for session {} ({} subscribers)",
            session_id,
            count
        );
        tasks
    }
}

async fn monitor_liveness(manager: Weak<Inner>, session_id: String, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = manager.upgrade() else {
            break;
        };
        let Some(state) = inner.buffer(&session_id) else {
            break;
        };
        if !state.is_alive() {
            log::info!("Session {} exited", session_id);
            // Includes this task's own handle; the abort lands after we return
            for task in inner.teardown(&session_id) {
                task.abort();
            }
            break;
        }
    }
}

async fn poll_stream_log(manager: Weak<Inner>, session_id: String, path: PathBuf, period: Duration) {
    let mut reader = StreamLogReader::new(path);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let events = match reader.read_new().await {
            Ok(events) => events,
            Err(e) => {
                log::warn!("Failed to read stream log of {}: {}", session_id, e);
                continue;
            }
        };

        let Some(inner) = manager.upgrade() else {
            break;
        };
        let Some(state) = inner.buffer(&session_id) else {
            break;
        };
        if events.is_empty() {
            continue;
        }

        for event in events {
            match event {
                StreamEvent::Output(data) => state.write(&data),
                StreamEvent::Resize { cols, rows } => state.resize(cols, rows),
            }
        }
        inner.schedule_notification(&state);
    }
}

/// Receiving end of a [`BufferManager::subscribe`] call
///
/// Snapshots arrive in increasing sequence order. The channel closes when
/// the session is torn down. Dropping the subscription unsubscribes.
pub struct BufferSubscription {
    session_id: String,
    id: u64,
    receiver: mpsc::Receiver<Arc<Snapshot>>,
    manager: Weak<Inner>,
}

impl BufferSubscription {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Wait for the next snapshot, `None` once the channel is closed
    pub async fn recv(&mut self) -> Option<Arc<Snapshot>> {
        self.receiver.recv().await
    }

    /// Take a pending snapshot without waiting
    pub fn try_recv(&mut self) -> Option<Arc<Snapshot>> {
        self.receiver.try_recv().ok()
    }

    /// Stop delivery. Calling this more than once is a no-op.
    pub fn unsubscribe(&mut self) {
        if let Some(inner) = std::mem::take(&mut self.manager).upgrade() {
            inner.unsubscribe(&self.session_id, self.id);
        }
        self.receiver.close();
    }
}

impl Drop for BufferSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Handle returned by [`BufferManager::subscribe_with_callback`]
pub struct Unsubscribe {
    manager: Weak<Inner>,
    session_id: String,
    id: u64,
    task: Mutex<Option<AbortHandle>>,
}

impl Unsubscribe {
    /// Stop delivery to the callback. Idempotent.
    pub fn unsubscribe(&self) {
        let Some(task) = self.task.lock().take() else {
            return;
        };
        task.abort();
        if let Some(inner) = self.manager.upgrade() {
            inner.unsubscribe(&self.session_id, self.id);
        }
    }
}
