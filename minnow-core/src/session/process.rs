//! Runner child process.

use crate::dispatch::EventSink;
use crate::event::{Event, SessionId};
use std::io::{self, BufRead, BufReader, Read};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;

/// Environment variable carrying the controller's listening address.
pub const DEBUG_ADDR_ENV: &str = "MINNOW_DEBUG_ADDR";

/// How to launch the runner. Supplied by the launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerLaunch {
    /// Interpreter or runner binary.
    pub program: PathBuf,
    /// Extra arguments placed before the script path.
    pub args: Vec<String>,
    /// Working directory of the child. Inherited when `None`.
    pub working_dir: Option<PathBuf>,
    /// User script, passed as the last argument.
    pub script: PathBuf,
}

impl RunnerLaunch {
    /// Launch `program` with `script` as its only argument.
    pub fn new(program: impl Into<PathBuf>, script: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), args: Vec::new(), working_dir: None, script: script.into() }
    }

    /// Append arguments placed before the script.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run the child in `dir`.
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// The file name breakpoints and stop locations refer to.
    pub fn script_label(&self) -> String {
        self.script.display().to_string()
    }
}

/// A spawned runner whose output is forwarded as `RunnerOutput` events.
pub struct RunnerProcess {
    child: Child,
    exit: Option<ExitStatus>,
}

impl RunnerProcess {
    /// Spawn the runner with piped output. Output lines are posted from reader threads.
    pub fn spawn(launch: &RunnerLaunch, debug_addr: SocketAddr, session: SessionId, sink: &EventSink) -> io::Result<Self> {
        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .arg(&launch.script)
            .env(DEBUG_ADDR_ENV, debug_addr.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &launch.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;
        log::info!("Runner for {} started (pid {})", session, child.id());
        if let Some(stdout) = child.stdout.take() {
            forward_output("stdout", stdout, session, sink.clone())?;
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output("stderr", stderr, session, sink.clone())?;
        }
        Ok(Self { child, exit: None })
    }

    /// OS process id.
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Exit status, if the process has exited.
    pub fn try_wait(&mut self) -> Option<ExitStatus> {
        if self.exit.is_none() {
            match self.child.try_wait() {
                Ok(status) => self.exit = status,
                Err(e) => log::warn!("Waiting on runner {} failed: {}", self.child.id(), e),
            }
        }
        self.exit
    }

    /// Kill and reap. Errors from an already exited child are ignored.
    pub fn kill(&mut self) {
        if self.try_wait().is_some() {
            return;
        }
        log::warn!("Killing runner {}", self.child.id());
        if let Err(e) = self.child.kill() {
            log::warn!("Kill of runner {} failed: {}", self.child.id(), e);
        }
        match self.child.wait() {
            Ok(status) => self.exit = Some(status),
            Err(e) => log::warn!("Reaping runner {} failed: {}", self.child.id(), e),
        }
    }
}

impl Drop for RunnerProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

fn forward_output<R: Read + Send + 'static>(stream: &str, pipe: R, session: SessionId, sink: EventSink) -> io::Result<()> {
    thread::Builder::new().name(format!("runner-{stream}")).spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line).into_owned();
                    sink.publish(Event::RunnerOutput { session, text });
                }
                Err(e) => {
                    log::debug!("Runner output pipe closed: {}", e);
                    break;
                }
            }
        }
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_builder() {
        let launch = RunnerLaunch::new("minnow-runner", "demo/blink.mw").with_args(["--quiet"]).in_dir("/tmp");
        assert_eq!(launch.args, vec!["--quiet".to_string()]);
        assert_eq!(launch.working_dir, Some(PathBuf::from("/tmp")));
        assert_eq!(launch.script_label(), "demo/blink.mw");
    }

    #[test]
    fn test_missing_program_fails_to_spawn() {
        let sink = crate::dispatch::Dispatcher::new().sink();
        let launch = RunnerLaunch::new("/nonexistent/minnow-runner", "x.mw");
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert!(RunnerProcess::spawn(&launch, addr, SessionId(1), &sink).is_err());
    }
}
