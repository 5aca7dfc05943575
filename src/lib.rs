//! vtsync - terminal I/O synchronization
//!
//! Emulates each session's screen from its PTY output and keeps remote
//! renderers current with compact binary snapshots.
//!
//! - [`vtsync_core`]: the buffer emulator, snapshots, the wire format and the
//!   stream analyzer
//! - [`vtsync_relay`]: session buffer management, the write queue and the
//!   stream-safe injector

pub use vtsync_core;
pub use vtsync_relay;

pub use vtsync_core::wire;
pub use vtsync_core::{ChangeFlags, Snapshot, StreamAnalyzer, TerminalBuffer};
pub use vtsync_relay::{
    BufferManager, DirectOutputHub, FlowControlledQueue, RelayConfig, RelayError, StreamInjector,
};
