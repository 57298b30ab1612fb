//! Server state, hands out message ids
use std::sync::atomic::{AtomicU64, Ordering};

/// Represents the current Server state
#[derive(Debug, Default)]
pub struct State {
    /// id to assign incoming messages
    next_id: AtomicU64,
}

impl State {
    /// Create new state
    pub fn new() -> State {
        State::default()
    }

    /// Increment the context id
    #[inline]
    pub fn inc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}
