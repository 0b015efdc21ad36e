//! Script execution under debugger control.
//!
//! The interpreter checks in with the controller before every statement: it
//! stops at the first statement, on breakpoints, and wherever the current
//! step mode says so. While stopped it blocks on the command queue; while
//! running it drains the queue without blocking.

pub mod script;

pub use script::{Script, ScriptError, Value};

use crate::channel::{BreakpointLocation, ChannelMessage, ChannelNotice, StepMode, StopReason};
use crate::stack::{StackFrame, Variable};
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use script::{Expr, Stmt, StmtKind};
use std::collections::HashSet;
use std::fmt::Display;
use std::path::Path;
use std::time::{Duration, Instant};

const MAX_DEPTH: usize = 64;
const MODULE_FRAME: &str = "<module>";

/// Why execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Ran to completion, or hit `exit` or `fail`. `evt.exited` was sent.
    Exited(i32),
    /// The controller sent `cmd.stop`.
    Stopped,
    /// The command channel closed.
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pace {
    Run,
    StepIn,
    /// Stop at the next statement at this depth or shallower.
    StepOver(usize),
    /// Stop at the next statement shallower than this depth.
    StepOut(usize),
}

struct Frame {
    function: String,
    line: u32,
    locals: Vec<(String, Value)>,
}

impl Frame {
    fn get(&self, name: &str) -> Option<&Value> {
        self.locals.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

/// Interpreter for one script run.
pub struct Runner<'a, S, O>
where
    S: FnMut(ChannelMessage),
    O: FnMut(&str),
{
    script: &'a Script,
    file: String,
    commands: Receiver<ChannelNotice>,
    send: S,
    output: O,
    breakpoints: HashSet<u32>,
    pace: Pace,
    frames: Vec<Frame>,
    started: bool,
}

impl<'a, S, O> Runner<'a, S, O>
where
    S: FnMut(ChannelMessage),
    O: FnMut(&str),
{
    /// `file` is the name stop locations are reported under. `send` delivers
    /// events to the controller, `output` receives printed lines.
    pub fn new(script: &'a Script, file: &str, commands: Receiver<ChannelNotice>, send: S, output: O) -> Self {
        Self {
            script,
            file: file.to_string(),
            commands,
            send,
            output,
            breakpoints: HashSet::new(),
            pace: Pace::Run,
            frames: Vec::new(),
            started: false,
        }
    }

    /// Execute the script to completion or until stopped.
    pub fn run(mut self) -> Outcome {
        let script = self.script;
        self.frames.push(Frame {
            function: MODULE_FRAME.to_string(),
            line: script.first_line().unwrap_or(1),
            locals: Vec::new(),
        });
        let outcome = match self.exec_block(&script.body) {
            Ok(()) => Outcome::Exited(0),
            Err(outcome) => outcome,
        };
        log::debug!("Script {} ended: {:?}", self.file, outcome);
        if let Outcome::Exited(code) = outcome {
            (self.send)(ChannelMessage::Exited { code });
        }
        outcome
    }

    fn exec_block(&mut self, body: &'a [Stmt]) -> Result<(), Outcome> {
        for stmt in body {
            self.checkpoint(stmt.line)?;
            self.exec(stmt)?;
        }
        Ok(())
    }

    fn exec(&mut self, stmt: &'a Stmt) -> Result<(), Outcome> {
        match &stmt.kind {
            StmtKind::Print(template) => {
                let text = self.interpolate(template);
                (self.output)(&text);
            }
            StmtKind::Let { name, value } => {
                let value = self.eval(value).map_err(|message| self.runtime_error(stmt.line, message))?;
                self.assign(name, value);
            }
            StmtKind::Call(name) => {
                let script = self.script;
                let Some(function) = script.functions.get(name) else {
                    return Err(self.runtime_error(stmt.line, format!("unknown function `{name}`")));
                };
                if self.frames.len() >= MAX_DEPTH {
                    return Err(self.runtime_error(stmt.line, "call stack too deep"));
                }
                self.frames.push(Frame { function: name.clone(), line: function.line, locals: Vec::new() });
                let result = self.exec_block(&function.body);
                self.frames.pop();
                result?;
            }
            StmtKind::Sleep(ms) => self.sleep(Duration::from_millis(*ms))?,
            StmtKind::Fail(message) => return Err(self.runtime_error(stmt.line, message)),
            StmtKind::Exit(code) => return Err(Outcome::Exited(*code)),
        }
        Ok(())
    }

    /// Called before every statement.
    fn checkpoint(&mut self, line: u32) -> Result<(), Outcome> {
        if let Some(frame) = self.frames.last_mut() {
            frame.line = line;
        }
        self.poll()?;

        let depth = self.frames.len();
        let reason = if !self.started {
            self.started = true;
            Some(StopReason::Entry)
        } else if self.breakpoints.contains(&line) {
            Some(StopReason::Breakpoint)
        } else {
            match self.pace {
                Pace::StepIn => Some(StopReason::Step),
                Pace::StepOver(d) if depth <= d => Some(StopReason::Step),
                Pace::StepOut(d) if depth < d => Some(StopReason::Step),
                _ => None,
            }
        };
        match reason {
            Some(reason) => self.pause(line, reason),
            None => Ok(()),
        }
    }

    /// Report a stop and block until resumed.
    fn pause(&mut self, line: u32, reason: StopReason) -> Result<(), Outcome> {
        let frames = self.snapshot();
        let file = self.file.clone();
        (self.send)(ChannelMessage::Stopped { file, line, reason, frames });
        loop {
            let notice = self.commands.recv().map_err(|_| Outcome::Disconnected)?;
            match notice {
                ChannelNotice::Message(ChannelMessage::Continue) => {
                    self.pace = Pace::Run;
                    return Ok(());
                }
                ChannelNotice::Message(ChannelMessage::Step { mode }) => {
                    let depth = self.frames.len();
                    self.pace = match mode {
                        StepMode::In => Pace::StepIn,
                        StepMode::Over => Pace::StepOver(depth),
                        StepMode::Out => Pace::StepOut(depth),
                    };
                    return Ok(());
                }
                other => self.handle(other)?,
            }
        }
    }

    /// Drain queued commands without blocking.
    fn poll(&mut self) -> Result<(), Outcome> {
        loop {
            match self.commands.try_recv() {
                Ok(notice) => self.handle(notice)?,
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => return Err(Outcome::Disconnected),
            }
        }
    }

    fn sleep(&mut self, duration: Duration) -> Result<(), Outcome> {
        let deadline = Instant::now() + duration;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            match self.commands.recv_timeout(remaining) {
                Ok(notice) => self.handle(notice)?,
                Err(RecvTimeoutError::Timeout) => return Ok(()),
                Err(RecvTimeoutError::Disconnected) => return Err(Outcome::Disconnected),
            }
        }
    }

    /// Commands valid at any time. Resume commands while running are ignored.
    fn handle(&mut self, notice: ChannelNotice) -> Result<(), Outcome> {
        match notice {
            ChannelNotice::Message(ChannelMessage::SetBreakpoints { breakpoints }) => {
                self.set_breakpoints(&breakpoints);
                Ok(())
            }
            ChannelNotice::Message(ChannelMessage::Stop) => Err(Outcome::Stopped),
            ChannelNotice::Message(other) => {
                log::debug!("Ignoring {} while running", other.kind());
                Ok(())
            }
            ChannelNotice::Closed(reason) => {
                log::debug!("Debugger channel closed: {:?}", reason);
                Err(Outcome::Disconnected)
            }
        }
    }

    fn set_breakpoints(&mut self, locations: &[BreakpointLocation]) {
        let ours = Path::new(&self.file);
        self.breakpoints = locations
            .iter()
            .filter(|l| l.file == self.file || Path::new(&l.file).file_name() == ours.file_name())
            .map(|l| l.line)
            .collect();
        log::debug!("Breakpoints now {:?}", self.breakpoints);
    }

    fn runtime_error(&mut self, line: u32, message: impl Display) -> Outcome {
        (self.send)(ChannelMessage::Error { message: format!("line {line}: {message}") });
        Outcome::Exited(1)
    }

    /// Innermost frame first, then module globals.
    fn lookup(&self, name: &str) -> Option<&Value> {
        let local = self.frames.last().and_then(|f| f.get(name));
        local.or_else(|| self.frames.first().and_then(|f| f.get(name)))
    }

    fn eval(&self, expr: &Expr) -> Result<Value, String> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Var(name) => self.lookup(name).cloned().ok_or_else(|| format!("`{name}` is not defined")),
        }
    }

    fn assign(&mut self, name: &str, value: Value) {
        let Some(frame) = self.frames.last_mut() else { return };
        match frame.locals.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => *slot = value,
            None => frame.locals.push((name.to_string(), value)),
        }
    }

    /// Replace `{name}` with the variable's value. Unknown names stay as written.
    fn interpolate(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else {
                out.push_str(&rest[open..]);
                return out;
            };
            let name = &after[..close];
            match self.lookup(name) {
                Some(value) => out.push_str(&value.to_string()),
                None => {
                    out.push('{');
                    out.push_str(name);
                    out.push('}');
                }
            }
            rest = &after[close + 1..];
        }
        out.push_str(rest);
        out
    }

    /// The stack as the debugger sees it, innermost frame first.
    fn snapshot(&self) -> Vec<StackFrame> {
        self.frames
            .iter()
            .rev()
            .map(|frame| StackFrame {
                file: self.file.clone(),
                line: frame.line,
                function: frame.function.clone(),
                variables: frame
                    .locals
                    .iter()
                    .map(|(name, value)| Variable::new(name.as_str(), value.type_label(), value.repr()))
                    .collect(),
            })
            .collect()
    }
}
