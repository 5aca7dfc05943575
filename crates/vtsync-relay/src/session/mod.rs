//! Session buffer management

mod manager;
mod state;

pub use manager::{BufferManager, BufferSubscription, Unsubscribe};
pub use state::SessionBuffer;
