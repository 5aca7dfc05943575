//! vtsync-relay: keeps emulated session buffers in sync with live PTY output
//!
//! - [`BufferManager`] owns one buffer per session, fed by an [`OutputSource`]
//!   (or a session's stream log) and pushes debounced snapshots to subscribers
//! - [`FlowControlledQueue`] serializes outbound writes with watermark
//!   backpressure
//! - [`StreamInjector`] splices title changes into output at safe offsets

pub mod config;
pub mod error;
pub mod injector;
pub mod session;
pub mod source;
pub mod stream_log;
pub mod write_queue;

pub use config::{BufferConfig, ConfigError, InjectorConfig, QueueConfig, RelayConfig};
pub use error::{RelayError, Result};
pub use injector::{OutputSink, StreamInjector};
pub use session::{BufferManager, BufferSubscription, SessionBuffer, Unsubscribe};
pub use source::{CallbackHandle, DirectOutputHub, OutputCallback, OutputSource, SessionHandle};
pub use stream_log::{StreamEvent, StreamLogReader};
pub use write_queue::{FlowControlledQueue, QueueEvent, QueueMetrics};
