//! Upstream interfaces: where PTY output and session state come from
//!
//! The relay never spawns processes itself. It consumes an [`OutputSource`]
//! that hands out [`SessionHandle`]s and calls registered callbacks with each
//! output chunk. [`DirectOutputHub`] is an in-process implementation that a
//! PTY reader pushes bytes into.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{RelayError, Result};
use crate::injector::OutputSink;

/// Callback receiving `(session_id, chunk)` for every output chunk
pub type OutputCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Identifies a registered output callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle(u64);

/// A live terminal session owned by someone else
pub trait SessionHandle: Send + Sync {
    /// Session ID
    fn id(&self) -> &str;

    /// Whether the session's process is still running
    fn is_alive(&self) -> bool;

    /// Current terminal size as (cols, rows)
    fn dimensions(&self) -> (usize, usize);

    /// Newline-delimited JSON event log of the session's output, if kept
    fn stream_log_path(&self) -> Option<PathBuf> {
        None
    }
}

/// Provider of sessions and their live output
pub trait OutputSource: Send + Sync {
    /// Look up a session
    fn get_session(&self, session_id: &str) -> Option<Arc<dyn SessionHandle>>;

    /// Call `callback` with every output chunk of the session
    ///
    /// Returns [`RelayError::DirectOutputUnsupported`] when the session can
    /// only be followed through its stream log.
    fn register_output_callback(
        &self,
        session_id: &str,
        callback: OutputCallback,
    ) -> Result<CallbackHandle>;

    /// Remove a callback. Unknown handles are ignored.
    fn unregister_output_callback(&self, session_id: &str, handle: CallbackHandle);
}

/// Session registered with a [`DirectOutputHub`]
#[derive(Debug)]
pub struct HubSession {
    id: String,
    alive: AtomicBool,
    size: Mutex<(usize, usize)>,
    stream_log: Option<PathBuf>,
}

impl HubSession {
    /// Mark the session's process as exited
    pub fn exit(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Record a new terminal size
    pub fn set_dimensions(&self, cols: usize, rows: usize) {
        *self.size.lock() = (cols, rows);
    }
}

impl SessionHandle for HubSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn dimensions(&self) -> (usize, usize) {
        *self.size.lock()
    }

    fn stream_log_path(&self) -> Option<PathBuf> {
        self.stream_log.clone()
    }
}

/// In-process [`OutputSource`]
///
/// Sessions added with [`add_logged_session`](Self::add_logged_session) do
/// not accept direct callbacks, which forces consumers onto the stream log.
#[derive(Default)]
pub struct DirectOutputHub {
    sessions: RwLock<HashMap<String, Arc<HubSession>>>,
    callbacks: RwLock<HashMap<String, Vec<(CallbackHandle, OutputCallback)>>>,
    next_handle: AtomicU64,
}

impl DirectOutputHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session that streams output through callbacks
    pub fn add_session(&self, id: &str, cols: usize, rows: usize) -> Arc<HubSession> {
        self.insert(id, cols, rows, None)
    }

    /// Register a session that is only observable through its stream log
    pub fn add_logged_session(
        &self,
        id: &str,
        cols: usize,
        rows: usize,
        stream_log: PathBuf,
    ) -> Arc<HubSession> {
        self.insert(id, cols, rows, Some(stream_log))
    }

    fn insert(
        &self,
        id: &str,
        cols: usize,
        rows: usize,
        stream_log: Option<PathBuf>,
    ) -> Arc<HubSession> {
        let session = Arc::new(HubSession {
            id: id.to_string(),
            alive: AtomicBool::new(true),
            size: Mutex::new((cols, rows)),
            stream_log,
        });
        self.sessions
            .write()
            .insert(id.to_string(), Arc::clone(&session));
        session
    }

    /// Forget a session and its callbacks
    pub fn remove_session(&self, id: &str) {
        self.sessions.write().remove(id);
        self.callbacks.write().remove(id);
    }

    /// Deliver an output chunk to every callback of the session
    ///
    /// Callbacks run on the caller's thread, in registration order.
    pub fn notify_output(&self, session_id: &str, data: &[u8]) {
        let callbacks: Vec<OutputCallback> = match self.callbacks.read().get(session_id) {
            Some(list) => list.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            None => return,
        };

        for callback in callbacks {
            callback(session_id, data);
        }
    }

    /// Number of callbacks registered for a session
    pub fn callback_count(&self, session_id: &str) -> usize {
        self.callbacks
            .read()
            .get(session_id)
            .map_or(0, |list| list.len())
    }

    /// Sink that feeds written bytes back in as output of `session_id`
    pub fn sink(self: &Arc<Self>, session_id: &str) -> Arc<dyn OutputSink> {
        Arc::new(HubSink {
            hub: Arc::clone(self),
            session_id: session_id.to_string(),
        })
    }
}

impl OutputSource for DirectOutputHub {
    fn get_session(&self, session_id: &str) -> Option<Arc<dyn SessionHandle>> {
        self.sessions
            .read()
            .get(session_id)
            .map(|s| Arc::clone(s) as Arc<dyn SessionHandle>)
    }

    fn register_output_callback(
        &self,
        session_id: &str,
        callback: OutputCallback,
    ) -> Result<CallbackHandle> {
        match self.sessions.read().get(session_id) {
            None => return Err(RelayError::SessionNotFound(session_id.to_string())),
            Some(session) if session.stream_log.is_some() => {
                return Err(RelayError::DirectOutputUnsupported(session_id.to_string()))
            }
            Some(_) => {}
        }

        let handle = CallbackHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.callbacks
            .write()
            .entry(session_id.to_string())
            .or_default()
            .push((handle, callback));
        log::debug!("Registered output callback {:?} for {}", handle, session_id);
        Ok(handle)
    }

    fn unregister_output_callback(&self, session_id: &str, handle: CallbackHandle) {
        let mut callbacks = self.callbacks.write();
        if let Some(list) = callbacks.get_mut(session_id) {
            list.retain(|(h, _)| *h != handle);
            if list.is_empty() {
                callbacks.remove(session_id);
            }
        }
    }
}

struct HubSink {
    hub: Arc<DirectOutputHub>,
    session_id: String,
}

impl OutputSink for HubSink {
    fn write_output(&self, data: &[u8]) {
        self.hub.notify_output(&self.session_id, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callbacks_receive_output() {
        let hub = DirectOutputHub::new();
        hub.add_session("s1", 80, 24);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = hub
            .register_output_callback(
                "s1",
                Arc::new(move |id, data| sink.lock().push((id.to_string(), data.to_vec()))),
            )
            .unwrap();

        hub.notify_output("s1", b"abc");
        hub.notify_output("other", b"ignored");
        assert_eq!(*seen.lock(), vec![("s1".to_string(), b"abc".to_vec())]);

        hub.unregister_output_callback("s1", handle);
        hub.unregister_output_callback("s1", handle);
        hub.notify_output("s1", b"def");
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(hub.callback_count("s1"), 0);
    }

    #[test]
    fn test_register_errors() {
        let hub = DirectOutputHub::new();
        hub.add_logged_session("logged", 80, 24, PathBuf::from("/tmp/none.cast"));

        let noop: OutputCallback = Arc::new(|_, _| {});
        assert!(matches!(
            hub.register_output_callback("missing", Arc::clone(&noop)),
            Err(RelayError::SessionNotFound(_))
        ));
        assert!(matches!(
            hub.register_output_callback("logged", noop),
            Err(RelayError::DirectOutputUnsupported(_))
        ));
    }

    #[test]
    fn test_session_handle() {
        let hub = DirectOutputHub::new();
        let session = hub.add_session("s1", 100, 30);

        let handle = hub.get_session("s1").unwrap();
        assert_eq!(handle.id(), "s1");
        assert_eq!(handle.dimensions(), (100, 30));
        assert!(handle.is_alive());
        assert!(handle.stream_log_path().is_none());

        session.set_dimensions(120, 40);
        session.exit();
        assert_eq!(handle.dimensions(), (120, 40));
        assert!(!handle.is_alive());
    }
}
