//! The event feed exposed to external collaborators.

use crate::device::DeviceInfo;
use crate::session::SessionState;
use crate::stack::StackFrame;
use crate::telemetry::TelemetrySample;
use std::fmt;

/// Identifies one debug session. Allocated fresh for every `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Everything the core tells the interface, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A port appeared in the listing.
    DeviceAttached(DeviceInfo),
    /// A port without an open connection left the listing.
    DeviceDetached { identifier: String },
    /// A device disappeared while a connection to it was open.
    DeviceLost { identifier: String },
    /// A connection was opened.
    DeviceOpened { identifier: String, baud_rate: u32 },
    /// A connection was closed on request.
    DeviceClosed { identifier: String },
    /// An open connection failed while its port is still listed.
    ConnectionError { identifier: String, message: String },
    /// Plain REPL text from a device.
    ReplOutput { identifier: String, text: String },
    /// A sample parsed out of device output.
    TelemetrySample { identifier: String, sample: TelemetrySample },
    /// More samples arrived in one second than the plotter can take.
    DataFlood { identifier: String },

    /// The session moved to `state`.
    SessionStateChanged { session: SessionId, state: SessionState },
    /// The stack was replaced after a stop.
    StackUpdated { session: SessionId, frames: Vec<StackFrame> },
    /// The runner stopped at a breakpoint.
    BreakpointHit { session: SessionId, file: String, line: u32 },
    /// Output the user program wrote to stdout or stderr.
    RunnerOutput { session: SessionId, text: String },
    /// The runner reported an error in the user program.
    RunnerError { session: SessionId, message: String },
    /// The session ended abnormally. Published once per session.
    RunnerCrashed { session: SessionId, reason: String },
    /// The debug channel closed. `reason` is set when it closed on an error.
    ChannelClosed { session: SessionId, reason: Option<String> },
}

impl Event {
    /// Stable tag, handy for logging and for tests.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::DeviceAttached(_) => "DeviceAttached",
            Self::DeviceDetached { .. } => "DeviceDetached",
            Self::DeviceLost { .. } => "DeviceLost",
            Self::DeviceOpened { .. } => "DeviceOpened",
            Self::DeviceClosed { .. } => "DeviceClosed",
            Self::ConnectionError { .. } => "ConnectionError",
            Self::ReplOutput { .. } => "ReplOutput",
            Self::TelemetrySample { .. } => "TelemetrySample",
            Self::DataFlood { .. } => "DataFlood",
            Self::SessionStateChanged { .. } => "SessionStateChanged",
            Self::StackUpdated { .. } => "StackUpdated",
            Self::BreakpointHit { .. } => "BreakpointHit",
            Self::RunnerOutput { .. } => "RunnerOutput",
            Self::RunnerError { .. } => "RunnerError",
            Self::RunnerCrashed { .. } => "RunnerCrashed",
            Self::ChannelClosed { .. } => "ChannelClosed",
        }
    }
}
