//! Lifecycle states shared by listeners and channels.
//!
//! ```text
//! Created ──open──► Opening ──► Opened ──close──► Closing ──► Closed
//!    │                 │           │                 │
//!    └─────────────────┴───abort───┴─────────────────┴──► Aborted
//!                                  │
//!                                  └──unrecoverable broker error──► Faulted
//! ```

use std::fmt;

/// Lifecycle state of a listener or channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommunicationState {
    /// Constructed, not yet opened.
    Created,
    /// `open` in progress.
    Opening,
    /// Accepting work.
    Opened,
    /// Graceful close in progress.
    Closing,
    /// Closed gracefully.
    Closed,
    /// Torn down without graceful steps.
    Aborted,
    /// Stopped by an unrecoverable error.
    Faulted,
}

impl CommunicationState {
    /// Whether no further transitions are possible.
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommunicationState::Closed | CommunicationState::Aborted | CommunicationState::Faulted
        )
    }

    /// Whether the object is past `Opened`.
    pub const fn is_shutting_down(&self) -> bool {
        matches!(self, CommunicationState::Closing) || self.is_terminal()
    }
}

impl fmt::Display for CommunicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommunicationState::Created => "created",
            CommunicationState::Opening => "opening",
            CommunicationState::Opened => "opened",
            CommunicationState::Closing => "closing",
            CommunicationState::Closed => "closed",
            CommunicationState::Aborted => "aborted",
            CommunicationState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}
