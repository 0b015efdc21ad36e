//! Session lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one debug session.
///
/// `Idle` means no session exists. `Finished`, `Crashed` and `Terminated`
/// are terminal; the next `start` allocates a fresh session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No session exists.
    Idle,
    /// Runner spawned, first `evt.stopped` not yet seen.
    Starting,
    /// Paused; the stack is valid.
    Stopped,
    /// Executing between stops.
    Running,
    /// The script ran to completion.
    Finished,
    /// The runner died, disconnected or timed out.
    Crashed,
    /// Stopped at the user's request.
    Terminated,
}

impl SessionState {
    /// Whether the session has ended.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Crashed | Self::Terminated)
    }

    /// Whether a runner is live and can take commands.
    pub fn accepts_commands(self) -> bool {
        matches!(self, Self::Stopped | Self::Running)
    }

    /// Lowercase name, as serialized.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Crashed => "crashed",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
