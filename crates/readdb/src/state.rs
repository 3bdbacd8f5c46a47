//! ReadDB's lifecycle state machine (§4.2):
//! `Stopped → Initializing → Catching-Up → Tailing → (Stopped | Resetting → Initializing)`.

use std::fmt;

/// The lifecycle phase one ReadDB instance is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDbState {
    /// `Run` has not been called, or has returned.
    Stopped,
    /// Determining the stored position and deciding between catch-up and
    /// a full reset.
    Initializing,
    /// Replaying a checkpoint and/or trailing segments to reach the
    /// current committed position.
    CatchingUp,
    /// Caught up; applying newly committed entries as they arrive.
    Tailing,
    /// A position gap beyond the safety window (or a schema version
    /// change) was detected; clearing local state before re-initializing.
    Resetting,
}

impl fmt::Display for ReadDbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReadDbState::Stopped => "stopped",
            ReadDbState::Initializing => "initializing",
            ReadDbState::CatchingUp => "catching-up",
            ReadDbState::Tailing => "tailing",
            ReadDbState::Resetting => "resetting",
        };
        f.write_str(s)
    }
}
