//! Debug session controller.
//!
//! Owns at most one [`DebugSession`] at a time and drives it through
//! [`SessionState`]. User commands arrive on the interface thread and are
//! translated into channel messages; runner events come back through the
//! dispatcher as [`Notice`]s and are turned into public [`Event`]s.

pub mod breakpoint;
pub mod process;
pub mod state;

pub use breakpoint::{Breakpoint, BreakpointManager};
pub use process::{RunnerLaunch, RunnerProcess, DEBUG_ADDR_ENV};
pub use state::SessionState;

use crate::channel::{BreakpointLocation, ChannelMessage, ChannelNotice, FramedChannel, StepMode, StopReason};
use crate::config::CoreConfig;
use crate::dispatch::{EventSink, Notice};
use crate::error::{CoreError, CoreResult};
use crate::event::{Event, SessionId};
use crate::stack::StackFrame;
use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// One runner process and everything known about it.
struct DebugSession {
    id: SessionId,
    state: SessionState,
    script: PathBuf,
    frames: Vec<StackFrame>,
    runner: Option<RunnerProcess>,
    channel: Option<FramedChannel>,
    accept_cancel: Arc<AtomicBool>,
    /// Set by the first `evt.stopped`.
    ready: bool,
    /// When the runner's connection was accepted. It must report ready
    /// within the grace period from then.
    connected_at: Option<Instant>,
    /// When the process was first seen exited without `evt.exited`.
    exited_at: Option<Instant>,
}

impl DebugSession {
    fn new(id: SessionId, script: PathBuf, runner: Option<RunnerProcess>) -> Self {
        Self {
            id,
            state: SessionState::Starting,
            script,
            frames: Vec::new(),
            runner,
            channel: None,
            accept_cancel: Arc::new(AtomicBool::new(false)),
            ready: false,
            connected_at: None,
            exited_at: None,
        }
    }
}

/// A runner that no longer belongs to the live session. Killed if it is still
/// alive when the deadline passes.
struct RetiredRunner {
    session: SessionId,
    runner: Option<RunnerProcess>,
    _channel: Option<FramedChannel>,
    deadline: Instant,
}

/// State machine for the debug session.
pub struct DebugController {
    config: CoreConfig,
    sink: EventSink,
    breakpoints: BreakpointManager,
    session: Option<DebugSession>,
    retired: Vec<RetiredRunner>,
    next_id: u64,
}

impl DebugController {
    /// An idle controller.
    pub fn new(config: &CoreConfig, sink: EventSink) -> Self {
        Self {
            config: config.clone(),
            sink,
            breakpoints: BreakpointManager::new(),
            session: None,
            retired: Vec::new(),
            next_id: 1,
        }
    }

    /// State of the current session, `Idle` if none was ever started.
    pub fn state(&self) -> SessionState {
        self.session.as_ref().map_or(SessionState::Idle, |s| s.state)
    }

    /// Id of the current or most recent session.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    /// Whether a session exists that has not reached a terminal state.
    pub fn is_active(&self) -> bool {
        let state = self.state();
        state != SessionState::Idle && !state.is_terminal()
    }

    /// Script of the current or most recent session.
    pub fn script(&self) -> Option<&Path> {
        self.session.as_ref().map(|s| s.script.as_path())
    }

    /// Stack from the last stop, innermost frame first.
    pub fn frames(&self) -> &[StackFrame] {
        self.session.as_ref().map_or(&[], |s| s.frames.as_slice())
    }

    /// Toggled breakpoints, kept across sessions.
    pub fn breakpoints(&self) -> &BreakpointManager {
        &self.breakpoints
    }

    /// OS process id of the live session's runner.
    pub fn runner_pid(&self) -> Option<u32> {
        self.session.as_ref().and_then(|s| s.runner.as_ref()).map(RunnerProcess::id)
    }

    /// Spawn a runner and begin a session. Returns as soon as the process is
    /// spawned; the session reports `Stopped` once the runner is ready.
    pub fn start(&mut self, launch: &RunnerLaunch, breakpoints: &[BreakpointLocation]) -> CoreResult<SessionId> {
        if self.is_active() {
            return Err(CoreError::SessionAlreadyActive);
        }
        for location in breakpoints {
            self.breakpoints.set_breakpoint(&location.file, location.line);
        }

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .map_err(|e| CoreError::LaunchFailed(format!("cannot listen for the runner: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| CoreError::LaunchFailed(format!("cannot listen for the runner: {e}")))?;

        let id = self.allocate_id();
        let runner = RunnerProcess::spawn(launch, addr, id, &self.sink)
            .map_err(|e| CoreError::LaunchFailed(format!("{}: {}", launch.program.display(), e)))?;
        let session = DebugSession::new(id, launch.script.clone(), Some(runner));
        spawn_acceptor(listener, id, self.config.grace_period(), session.accept_cancel.clone(), self.sink.clone())
            .map_err(|e| CoreError::LaunchFailed(format!("cannot accept the runner: {e}")))?;

        self.retire_current(false);
        self.session = Some(session);
        log::info!("{} starting {} (runner on {})", id, launch.script.display(), addr);
        self.sink.publish(Event::SessionStateChanged { session: id, state: SessionState::Starting });
        Ok(id)
    }

    /// Toggle a breakpoint. A live runner is updated immediately; otherwise
    /// the change is sent on the next start. Returns true if it is now set.
    pub fn toggle_breakpoint(&mut self, file: &str, line: u32) -> bool {
        let set = self.breakpoints.toggle_breakpoint(file, line);
        self.sync_breakpoints();
        set
    }

    /// Returns false if no breakpoint exists at that location.
    pub fn set_breakpoint_enabled(&mut self, file: &str, line: u32, enabled: bool) -> bool {
        let found = self.breakpoints.set_enabled(file, line, enabled);
        if found {
            self.sync_breakpoints();
        }
        found
    }

    /// Only valid while `Stopped`.
    pub fn step_over(&mut self) -> CoreResult<()> {
        self.resume("stepOver", ChannelMessage::Step { mode: StepMode::Over })
    }

    /// Step into a call. Only valid while `Stopped`.
    pub fn step_in(&mut self) -> CoreResult<()> {
        self.resume("stepIn", ChannelMessage::Step { mode: StepMode::In })
    }

    /// Run until the current function returns. Only valid while `Stopped`.
    pub fn step_out(&mut self) -> CoreResult<()> {
        self.resume("stepOut", ChannelMessage::Step { mode: StepMode::Out })
    }

    /// Resume until the next breakpoint or the end of the script.
    pub fn continue_execution(&mut self) -> CoreResult<()> {
        self.resume("continue", ChannelMessage::Continue)
    }

    /// Ask the runner to stop and end the session. The runner is killed if it
    /// is still alive after the grace period.
    pub fn stop(&mut self) -> CoreResult<()> {
        let state = self.state();
        if !self.is_active() {
            return Err(CoreError::InvalidSessionState { command: "stop", state });
        }
        if let Err(e) = self.send(ChannelMessage::Stop) {
            log::debug!("cmd.stop not sent: {}", e);
        }
        if let Some(event) = self.transition(SessionState::Terminated) {
            self.sink.publish(event);
        }
        self.retire_current(false);
        Ok(())
    }

    /// Handle a notice from one of this controller's background contexts.
    pub(crate) fn route(&mut self, notice: Notice) -> Vec<Event> {
        let id = match &notice {
            Notice::Channel { session, .. }
            | Notice::RunnerConnected { session, .. }
            | Notice::RunnerConnectFailed { session, .. } => *session,
            other => {
                log::debug!("Debug controller ignores {:?}", other);
                return Vec::new();
            }
        };
        let live = self.session.as_ref().is_some_and(|s| s.id == id && !s.state.is_terminal());
        if !live {
            log::trace!("Notice for retired {} discarded", id);
            return Vec::new();
        }

        match notice {
            Notice::RunnerConnected { stream, .. } => self.on_connected(stream),
            Notice::RunnerConnectFailed { reason, .. } => self.crash(reason, true),
            Notice::Channel { notice: ChannelNotice::Message(message), .. } => self.on_message(message),
            Notice::Channel { notice: ChannelNotice::Closed(reason), .. } => self.on_closed(reason),
            _ => Vec::new(),
        }
    }

    /// Time-driven checks: a runner that exited without reporting, a
    /// connected runner that never became ready, and retired runners past
    /// their deadline.
    pub fn tick(&mut self, now: Instant) -> Vec<Event> {
        let grace = self.config.grace_period();
        let mut events = Vec::new();

        let mut failure = None;
        if let Some(session) = self.session.as_mut().filter(|s| !s.state.is_terminal()) {
            if let Some(status) = session.runner.as_mut().and_then(RunnerProcess::try_wait) {
                let exited_at = *session.exited_at.get_or_insert(now);
                if now.saturating_duration_since(exited_at) >= grace {
                    failure = Some(format!("runner exited ({status}) without reporting"));
                }
            } else if let Some(connected_at) = session.connected_at.filter(|_| !session.ready) {
                if now.saturating_duration_since(connected_at) >= grace {
                    failure = Some(format!("runner connected but did not report ready within {grace:?}"));
                }
            }
        }
        if let Some(reason) = failure {
            events.extend(self.crash(reason, true));
        }

        self.retired.retain_mut(|retired| {
            let Some(runner) = retired.runner.as_mut() else { return false };
            if runner.try_wait().is_some() {
                return false;
            }
            if now >= retired.deadline {
                log::warn!("Runner of {} did not exit within {:?}", retired.session, grace);
                runner.kill();
                return false;
            }
            true
        });
        events
    }

    fn allocate_id(&mut self) -> SessionId {
        let id = SessionId(self.next_id);
        self.next_id += 1;
        id
    }

    fn resume(&mut self, command: &'static str, message: ChannelMessage) -> CoreResult<()> {
        let state = self.state();
        if state != SessionState::Stopped {
            return Err(CoreError::InvalidSessionState { command, state });
        }
        self.send(message)?;
        if let Some(event) = self.transition(SessionState::Running) {
            self.sink.publish(event);
        }
        Ok(())
    }

    fn send(&self, message: ChannelMessage) -> CoreResult<()> {
        let channel = self.session.as_ref().and_then(|s| s.channel.as_ref()).ok_or_else(|| {
            CoreError::ConnectionError { identifier: "debug channel".to_string(), message: "not connected".to_string() }
        })?;
        channel.send(message)
    }

    fn sync_breakpoints(&self) {
        if !self.state().accepts_commands() {
            return;
        }
        let breakpoints = self.breakpoints.enabled_locations();
        log::debug!("Sending {} breakpoints", breakpoints.len());
        if let Err(e) = self.send(ChannelMessage::SetBreakpoints { breakpoints }) {
            // The channel's own close notice reports the failure.
            log::debug!("cmd.setBreakpoints not sent: {}", e);
        }
    }

    fn transition(&mut self, state: SessionState) -> Option<Event> {
        let session = self.session.as_mut()?;
        log::info!("{}: {} -> {}", session.id, session.state, state);
        session.state = state;
        Some(Event::SessionStateChanged { session: session.id, state })
    }

    /// Move the current runner and channel to the retired list.
    fn retire_current(&mut self, kill_now: bool) {
        let deadline = Instant::now() + self.config.grace_period();
        let Some(session) = self.session.as_mut() else { return };
        session.accept_cancel.store(true, Ordering::SeqCst);
        let mut runner = session.runner.take();
        let channel = session.channel.take();
        if kill_now {
            if let Some(runner) = runner.as_mut() {
                runner.kill();
            }
        }
        if runner.is_some() || channel.is_some() {
            self.retired.push(RetiredRunner { session: session.id, runner, _channel: channel, deadline });
        }
    }

    fn crash(&mut self, reason: String, kill_now: bool) -> Vec<Event> {
        let Some(id) = self.session_id() else { return Vec::new() };
        log::warn!("{} crashed: {}", id, reason);
        let mut events: Vec<Event> = self.transition(SessionState::Crashed).into_iter().collect();
        events.push(Event::RunnerCrashed { session: id, reason });
        self.retire_current(kill_now);
        events
    }

    fn on_connected(&mut self, stream: TcpStream) -> Vec<Event> {
        let Some(session) = self.session.as_mut() else { return Vec::new() };
        if session.state != SessionState::Starting || session.channel.is_some() {
            log::warn!("{}: unexpected second runner connection dropped", session.id);
            return Vec::new();
        }
        let id = session.id;
        let sink = self.sink.clone();
        let name = format!("debug-{}", id.0);
        match FramedChannel::over_tcp(&name, stream, self.config.max_frame_len, move |notice| {
            sink.push(Notice::Channel { session: id, notice });
        }) {
            Ok(channel) => {
                log::info!("{}: runner connected", id);
                session.channel = Some(channel);
                session.connected_at = Some(Instant::now());
                Vec::new()
            }
            Err(e) => self.crash(format!("channel setup failed: {e}"), true),
        }
    }

    fn on_message(&mut self, message: ChannelMessage) -> Vec<Event> {
        let Some(session) = self.session.as_mut() else { return Vec::new() };
        let id = session.id;
        match message {
            ChannelMessage::Stopped { file, line, reason, frames } => {
                log::debug!("{} stopped at {}:{} ({:?})", id, file, line, reason);
                session.frames.clone_from(&frames);
                let first = !session.ready;
                session.ready = true;

                let mut events: Vec<Event> = self.transition(SessionState::Stopped).into_iter().collect();
                events.push(Event::StackUpdated { session: id, frames });
                if reason == StopReason::Breakpoint {
                    events.push(Event::BreakpointHit { session: id, file, line });
                }
                if first {
                    self.sync_breakpoints();
                }
                events
            }
            ChannelMessage::Exited { code } => {
                log::info!("{} runner exited with code {}", id, code);
                let events = self.transition(SessionState::Finished).into_iter().collect();
                self.retire_current(false);
                events
            }
            ChannelMessage::Error { message } => vec![Event::RunnerError { session: id, message }],
            command => {
                log::warn!("{}: runner sent {}, ignored", id, command.kind());
                Vec::new()
            }
        }
    }

    fn on_closed(&mut self, reason: Option<CoreError>) -> Vec<Event> {
        let Some(id) = self.session_id() else { return Vec::new() };
        let reason = reason.map(|e| e.to_string());
        let mut events = vec![Event::ChannelClosed { session: id, reason: reason.clone() }];
        events.extend(self.crash(reason.unwrap_or_else(|| "debug channel closed unexpectedly".to_string()), false));
        events
    }

    /// Adopt an already connected runner without spawning a process.
    #[cfg(test)]
    pub(crate) fn attach(&mut self, stream: TcpStream) -> CoreResult<SessionId> {
        if self.is_active() {
            return Err(CoreError::SessionAlreadyActive);
        }
        let id = self.allocate_id();
        self.retire_current(false);
        self.session = Some(DebugSession::new(id, PathBuf::from("test.mw"), None));
        self.sink.publish(Event::SessionStateChanged { session: id, state: SessionState::Starting });
        let events = self.route(Notice::RunnerConnected { session: id, stream });
        debug_assert!(events.is_empty());
        Ok(id)
    }
}

fn spawn_acceptor(
    listener: TcpListener,
    session: SessionId,
    grace: Duration,
    cancel: Arc<AtomicBool>,
    sink: EventSink,
) -> io::Result<()> {
    listener.set_nonblocking(true)?;
    thread::Builder::new().name(format!("accept-{}", session.0)).spawn(move || {
        let deadline = Instant::now() + grace;
        let failed = |reason: String| sink.push(Notice::RunnerConnectFailed { session, reason });
        loop {
            if cancel.load(Ordering::SeqCst) {
                return;
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    log::debug!("Runner for {} connected from {}", session, peer);
                    match stream.set_nonblocking(false) {
                        Ok(()) => sink.push(Notice::RunnerConnected { session, stream }),
                        Err(e) => failed(format!("runner connection unusable: {e}")),
                    }
                    return;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        failed(format!("runner did not connect within {grace:?}"));
                        return;
                    }
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    failed(format!("accepting the runner failed: {e}"));
                    return;
                }
            }
        }
    })?;
    Ok(())
}
