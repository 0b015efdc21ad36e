//! Wire messages exchanged with the debug runner.
//!
//! The payload of every frame is a JSON object `{"kind": .., "body": ..}`.
//! Decoding is a closed match over the known kinds; anything else is a
//! `ProtocolDesync`.

use crate::error::{CoreError, CoreResult};
use crate::stack::StackFrame;
use serde::{Deserialize, Serialize};

/// A breakpoint location as sent to the runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointLocation {
    /// Script label as the runner reports it.
    pub file: String,
    /// 1-based.
    pub line: u32,
}

/// Granularity of a `cmd.step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepMode {
    /// Run the current line, stepping over calls.
    Over,
    /// Stop at the first line inside a call.
    In,
    /// Run until the current function returns.
    Out,
}

/// Why the runner stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    /// First statement of the script; the runner is ready for commands.
    Entry,
    /// Hit an enabled breakpoint.
    Breakpoint,
    /// Finished a step.
    Step,
}

/// The unit of the framed protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body")]
pub enum ChannelMessage {
    /// Replace the runner's breakpoint set.
    #[serde(rename = "cmd.setBreakpoints")]
    SetBreakpoints { breakpoints: Vec<BreakpointLocation> },
    /// Execute one step.
    #[serde(rename = "cmd.step")]
    Step { mode: StepMode },
    /// Resume until a breakpoint or the end.
    #[serde(rename = "cmd.continue")]
    Continue,
    /// Ask the runner to exit.
    #[serde(rename = "cmd.stop")]
    Stop,
    /// The runner paused. `frames` is innermost first.
    #[serde(rename = "evt.stopped")]
    Stopped {
        file: String,
        line: u32,
        reason: StopReason,
        #[serde(default)]
        frames: Vec<StackFrame>,
    },
    /// The script finished with an exit code.
    #[serde(rename = "evt.exited")]
    Exited { code: i32 },
    /// The user program raised an error.
    #[serde(rename = "evt.error")]
    Error { message: String },
}

impl ChannelMessage {
    /// The wire `kind` tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SetBreakpoints { .. } => "cmd.setBreakpoints",
            Self::Step { .. } => "cmd.step",
            Self::Continue => "cmd.continue",
            Self::Stop => "cmd.stop",
            Self::Stopped { .. } => "evt.stopped",
            Self::Exited { .. } => "evt.exited",
            Self::Error { .. } => "evt.error",
        }
    }

    /// Commands flow editor -> runner, events flow runner -> editor.
    pub fn is_command(&self) -> bool {
        self.kind().starts_with("cmd.")
    }

    /// Serialize to a frame payload.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CoreError::ProtocolDesync(format!("Failed to encode {}: {}", self.kind(), e)))
    }

    /// Decode a frame payload. Invalid UTF-8, malformed JSON and unknown
    /// kinds all fail the same way.
    pub fn decode(payload: &[u8]) -> CoreResult<Self> {
        serde_json::from_slice(payload).map_err(|e| CoreError::ProtocolDesync(format!("Undecodable payload: {}", e)))
    }
}
