//! The command surface and event feed, in one handle owned by the
//! interface thread.

use crate::channel::BreakpointLocation;
use crate::config::CoreConfig;
use crate::device::{DeviceInfo, DeviceManager, HotplugWatcher, MockBackend, SerialBackend};
use crate::dispatch::{Dispatcher, EventSink, Notice};
use crate::error::{CoreError, CoreResult};
use crate::event::{Event, SessionId};
use crate::session::{BreakpointManager, DebugController, RunnerLaunch, SessionState};
use crate::stack::StackFrame;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;

/// Entry point for the editor: owns the dispatcher, the debug controller and
/// the device manager.
pub struct Workbench {
    config: CoreConfig,
    dispatcher: Dispatcher,
    controller: DebugController,
    devices: DeviceManager,
    hotplug: Option<HotplugWatcher>,
}

impl Workbench {
    /// Validate `config` and build the core over `backend`.
    pub fn new(config: CoreConfig, backend: Arc<dyn SerialBackend>) -> CoreResult<Self> {
        config.validate()?;
        let dispatcher = Dispatcher::new();
        let controller = DebugController::new(&config, dispatcher.sink());
        let devices = DeviceManager::new(backend, &config, dispatcher.sink());
        Ok(Self { config, dispatcher, controller, devices, hotplug: None })
    }

    /// Workbench over the operating system's serial ports.
    #[cfg(feature = "hardware")]
    pub fn native(config: CoreConfig) -> CoreResult<Self> {
        Self::new(config, Arc::new(crate::device::NativeBackend::new()))
    }

    /// Workbench over an in-memory backend, returned alongside so devices can
    /// be plugged in.
    pub fn mock(config: CoreConfig) -> CoreResult<(Self, Arc<MockBackend>)> {
        let backend = Arc::new(MockBackend::new());
        let workbench = Self::new(config, backend.clone())?;
        Ok((workbench, backend))
    }

    /// The validated configuration.
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Producer handle for collaborators that publish their own events.
    pub fn sink(&self) -> EventSink {
        self.dispatcher.sink()
    }

    // Event feed

    /// Call `subscriber` for every event, on the thread that pumps.
    pub fn subscribe<F: FnMut(&Event) + 'static>(&mut self, subscriber: F) {
        self.dispatcher.subscribe(subscriber);
    }

    /// A broadcast receiver of the same feed.
    pub fn subscribe_async(&self) -> broadcast::Receiver<Event> {
        self.dispatcher.subscribe_async()
    }

    /// Deliver everything queued so far and advance the session and device
    /// timers. Never blocks; call it from the interface loop.
    pub fn pump_events(&mut self) -> usize {
        let controller = &mut self.controller;
        let devices = &mut self.devices;
        let handled = self.dispatcher.drain_with(|notice| match notice {
            Notice::Channel { .. } | Notice::RunnerConnected { .. } | Notice::RunnerConnectFailed { .. } => {
                controller.route(notice)
            }
            other => devices.route(other),
        });
        let now = Instant::now();
        let mut due = self.controller.tick(now);
        due.extend(self.devices.tick(now));
        for event in &due {
            self.dispatcher.deliver(event);
        }
        handled
    }

    // Devices

    /// Start polling for attached devices in the background.
    pub fn start_hotplug(&mut self) -> CoreResult<()> {
        if self.hotplug.is_none() {
            let watcher = HotplugWatcher::spawn(self.devices.backend(), self.config.hotplug_interval(), self.sink())
                .map_err(|e| CoreError::ConnectionError { identifier: "hotplug".to_string(), message: e.to_string() })?;
            self.hotplug = Some(watcher);
        }
        Ok(())
    }

    /// Stop the hot-plug watcher, if running.
    pub fn stop_hotplug(&mut self) {
        if let Some(mut watcher) = self.hotplug.take() {
            watcher.stop();
        }
    }

    /// List ports now and deliver the resulting attach/detach events.
    pub fn rescan_devices(&mut self) -> CoreResult<()> {
        for event in self.devices.scan_now()? {
            self.dispatcher.deliver(&event);
        }
        Ok(())
    }

    /// Ports seen by the last scan.
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.devices()
    }

    /// Whether `identifier` has an open connection.
    pub fn is_device_open(&self, identifier: &str) -> bool {
        self.devices.is_open(identifier)
    }

    /// Open a device, at the configured default baud rate if none is given.
    pub fn open_device(&mut self, identifier: &str, baud_rate: Option<u32>) -> CoreResult<()> {
        let baud_rate = baud_rate.unwrap_or(self.config.default_baud_rate);
        self.devices.open(identifier, baud_rate)
    }

    /// Close a connection. No-op if it is not open.
    pub fn close_device(&mut self, identifier: &str) {
        self.devices.close(identifier);
    }

    /// Write raw bytes to an open device.
    pub fn send_input(&self, identifier: &str, bytes: &[u8]) -> CoreResult<()> {
        self.devices.send_input(identifier, bytes)
    }

    /// Send Ctrl-C to the REPL.
    pub fn interrupt(&self, identifier: &str) -> CoreResult<()> {
        self.devices.interrupt(identifier)
    }

    /// Run `source` on the board through the REPL's paste mode.
    pub fn paste_script(&self, identifier: &str, source: &str) -> CoreResult<()> {
        self.devices.paste_script(identifier, source)
    }

    // Debugging

    /// Launch a runner. `breakpoints` are added to the toggled set.
    pub fn start_session(&mut self, launch: &RunnerLaunch, breakpoints: &[BreakpointLocation]) -> CoreResult<SessionId> {
        self.controller.start(launch, breakpoints)
    }

    /// State of the current or most recent session.
    pub fn session_state(&self) -> SessionState {
        self.controller.state()
    }

    /// Id of the current or most recent session.
    pub fn session_id(&self) -> Option<SessionId> {
        self.controller.session_id()
    }

    /// Pid of the live runner, if any.
    pub fn runner_pid(&self) -> Option<u32> {
        self.controller.runner_pid()
    }

    /// Stack of the last stop, innermost first.
    pub fn frames(&self) -> &[StackFrame] {
        self.controller.frames()
    }

    /// Toggled breakpoints, kept across sessions.
    pub fn breakpoints(&self) -> &BreakpointManager {
        self.controller.breakpoints()
    }

    /// Returns whether a breakpoint now exists at the location.
    pub fn toggle_breakpoint(&mut self, file: &str, line: u32) -> bool {
        self.controller.toggle_breakpoint(file, line)
    }

    /// Returns false if no breakpoint exists there.
    pub fn set_breakpoint_enabled(&mut self, file: &str, line: u32, enabled: bool) -> bool {
        self.controller.set_breakpoint_enabled(file, line, enabled)
    }

    /// Step over the current line. Only valid while `Stopped`.
    pub fn step_over(&mut self) -> CoreResult<()> {
        self.controller.step_over()
    }

    /// Step into a call. Only valid while `Stopped`.
    pub fn step_in(&mut self) -> CoreResult<()> {
        self.controller.step_in()
    }

    /// Run until the current function returns. Only valid while `Stopped`.
    pub fn step_out(&mut self) -> CoreResult<()> {
        self.controller.step_out()
    }

    /// Resume until the next breakpoint or the end of the script.
    pub fn continue_execution(&mut self) -> CoreResult<()> {
        self.controller.continue_execution()
    }

    /// Terminate the session. State becomes `Terminated` at once.
    pub fn stop_session(&mut self) -> CoreResult<()> {
        self.controller.stop()
    }

    /// Stop the session, close every device and stop the watcher, then
    /// deliver the resulting events.
    pub fn shutdown(&mut self) {
        if self.controller.is_active() {
            if let Err(e) = self.controller.stop() {
                log::debug!("Session stop on shutdown failed: {}", e);
            }
        }
        self.devices.close_all();
        self.stop_hotplug();
        self.pump_events();
    }
}
