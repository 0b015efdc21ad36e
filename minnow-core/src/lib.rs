//! Minnow Core - device and debugger communication for the Minnow editor.
//!
//! This crate talks to MicroPython boards over serial, extracts telemetry
//! from their output, and drives a debug runner process over a framed local
//! channel. Everything reaches the interface thread as ordered [`Event`]s.

#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::derive_partial_eq_without_eq)]
#![allow(clippy::significant_drop_tightening)]

pub mod channel;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod runner;
pub mod serial;
pub mod session;
pub mod stack;
pub mod telemetry;
pub mod workbench;

// Re-export commonly used types
pub use channel::{ChannelMessage, FramedChannel};
pub use config::{CoreConfig, TelemetryConfig};
pub use device::{DeviceInfo, DeviceManager, MockBackend, PortInfo, SerialBackend};
#[cfg(feature = "hardware")]
pub use device::NativeBackend;
pub use dispatch::{Dispatcher, EventSink};
pub use error::{CoreError, CoreResult};
pub use event::{Event, SessionId};
pub use session::{DebugController, RunnerLaunch, SessionState};
pub use stack::{StackFrame, Variable};
pub use telemetry::{TelemetryParser, TelemetrySample};
pub use workbench::Workbench;
