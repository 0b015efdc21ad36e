#![allow(clippy::unreadable_literal)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::significant_drop_tightening)]

use minnow_core::channel::BreakpointLocation;
use minnow_core::{CoreConfig, CoreError, Event, RunnerLaunch, SessionState, Workbench};
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

const DEMO: &str = "\
# blink demo
let x = 1
fn bump
  let y = 2
  print bumped {y}
end
call bump
print done {x}
";

struct Scenario {
    workbench: Workbench,
    events: Rc<RefCell<Vec<Event>>>,
    script: NamedTempFile,
}

impl Scenario {
    fn new(source: &str) -> Self {
        let config = CoreConfig { grace_period_ms: 2_000, ..CoreConfig::default() };
        let (mut workbench, _backend) = Workbench::mock(config).expect("Mock workbench");
        let events = Rc::new(RefCell::new(Vec::new()));
        let seen = events.clone();
        workbench.subscribe(move |event| seen.borrow_mut().push(event.clone()));

        let mut script = NamedTempFile::new().expect("Temp script");
        script.write_all(source.as_bytes()).expect("Write script");
        Self { workbench, events, script }
    }

    fn launch(&self) -> RunnerLaunch {
        RunnerLaunch::new(env!("CARGO_BIN_EXE_minnow-runner"), self.script.path())
    }

    fn file(&self) -> String {
        self.launch().script_label()
    }

    fn wait_for(&mut self, what: &str, done: impl Fn(&[Event]) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            self.workbench.pump_events();
            if done(&self.events.borrow()) {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("Timeout waiting for {}; events: {:?}", what, self.events.borrow());
    }

    fn wait_for_state(&mut self, wanted: SessionState, occurrences: usize) {
        self.wait_for(&format!("{wanted}"), |events| {
            events
                .iter()
                .filter(|e| matches!(e, Event::SessionStateChanged { state, .. } if *state == wanted))
                .count()
                >= occurrences
        });
    }

    fn count(&self, tag: &str) -> usize {
        self.events.borrow().iter().filter(|e| e.tag() == tag).count()
    }

    fn output(&self) -> String {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| if let Event::RunnerOutput { text, .. } = e { Some(text.as_str()) } else { None })
            .collect()
    }
}

#[test]
fn test_scenario_breakpoint_and_finish() {
    let mut s = Scenario::new(DEMO);
    let breakpoints = [BreakpointLocation { file: s.file(), line: 5 }];
    let launch = s.launch();
    s.workbench.start_session(&launch, &breakpoints).expect("Session starts");
    assert_eq!(s.workbench.session_state(), SessionState::Starting);
    assert_eq!(s.workbench.start_session(&launch, &[]), Err(CoreError::SessionAlreadyActive));

    // Ready: stopped at the first statement.
    s.wait_for_state(SessionState::Stopped, 1);
    assert_eq!(s.workbench.frames()[0].line, 2);

    s.workbench.continue_execution().expect("First continue");
    let second = s.workbench.continue_execution();
    assert!(matches!(
        second,
        Err(CoreError::InvalidSessionState { command: "continue", state: SessionState::Running })
    ));

    s.wait_for("breakpoint", |events| events.iter().any(|e| matches!(e, Event::BreakpointHit { line: 5, .. })));
    let frames = s.workbench.frames().to_vec();
    assert_eq!(frames[0].function, "bump");
    assert_eq!(frames[0].variable("y").map(|v| v.value.as_str()), Some("2"));
    assert_eq!(frames[1].function, "<module>");
    assert_eq!(frames[1].line, 7);

    s.workbench.continue_execution().expect("Resume from breakpoint");
    s.wait_for_state(SessionState::Finished, 1);
    s.wait_for("output", |events| {
        events.iter().filter(|e| matches!(e, Event::RunnerOutput { .. })).count() >= 2
    });
    assert!(s.output().contains("bumped 2"));
    assert!(s.output().contains("done 1"));
    assert_eq!(s.count("RunnerCrashed"), 0);
}

#[test]
fn test_scenario_step_through_function() {
    let mut s = Scenario::new(DEMO);
    let launch = s.launch();
    s.workbench.start_session(&launch, &[]).expect("Session starts");
    s.wait_for_state(SessionState::Stopped, 1);

    s.workbench.step_over().expect("Step over");
    s.wait_for_state(SessionState::Stopped, 2);
    assert_eq!(s.workbench.frames()[0].line, 7);

    s.workbench.step_in().expect("Step in");
    s.wait_for_state(SessionState::Stopped, 3);
    assert_eq!(s.workbench.frames()[0].function, "bump");

    s.workbench.step_out().expect("Step out");
    s.wait_for_state(SessionState::Stopped, 4);
    assert_eq!(s.workbench.frames().len(), 1);
    assert_eq!(s.workbench.frames()[0].line, 8);

    s.workbench.stop_session().expect("Stop");
    assert_eq!(s.workbench.session_state(), SessionState::Terminated);
    s.wait_for_state(SessionState::Terminated, 1);
    assert!(s.workbench.step_over().is_err());
}

#[test]
fn test_scenario_script_error_reported() {
    let mut s = Scenario::new("let a = 1\nfrobnicate\n");
    let launch = s.launch();
    s.workbench.start_session(&launch, &[]).expect("Session starts");
    s.wait_for_state(SessionState::Finished, 1);
    let message = s
        .events
        .borrow()
        .iter()
        .find_map(|e| if let Event::RunnerError { message, .. } = e { Some(message.clone()) } else { None })
        .expect("RunnerError event");
    assert!(message.contains("unknown statement `frobnicate`"), "{message}");
}

#[test]
fn test_scenario_breakpoints_toggled_while_idle() {
    let mut s = Scenario::new(DEMO);
    let file = s.file();
    assert!(s.workbench.toggle_breakpoint(&file, 8));
    assert!(s.workbench.toggle_breakpoint(&file, 5));
    assert!(!s.workbench.toggle_breakpoint(&file, 5));
    assert_eq!(s.workbench.breakpoints().len(), 1);

    let launch = s.launch();
    s.workbench.start_session(&launch, &[]).expect("Session starts");
    s.wait_for_state(SessionState::Stopped, 1);
    s.workbench.continue_execution().expect("Continue");
    s.wait_for("breakpoint", |events| events.iter().any(|e| matches!(e, Event::BreakpointHit { line: 8, .. })));
    s.workbench.continue_execution().expect("Continue");
    s.wait_for_state(SessionState::Finished, 1);
}

#[cfg(unix)]
#[test]
fn test_scenario_killed_runner_crashes_once() {
    let mut s = Scenario::new("print waiting\nsleep 60000\nprint never\n");
    let launch = s.launch();
    s.workbench.start_session(&launch, &[]).expect("Session starts");
    s.wait_for_state(SessionState::Stopped, 1);
    s.workbench.continue_execution().expect("Continue");
    s.wait_for("output", |events| events.iter().any(|e| matches!(e, Event::RunnerOutput { .. })));

    let pid = s.workbench.runner_pid().expect("Runner pid");
    let status = std::process::Command::new("kill").args(["-9", &pid.to_string()]).status().expect("kill");
    assert!(status.success());

    s.wait_for_state(SessionState::Crashed, 1);
    // Let the channel close and the grace period pass; still only one crash.
    let settle = Instant::now() + Duration::from_millis(2_500);
    while Instant::now() < settle {
        s.workbench.pump_events();
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(s.count("RunnerCrashed"), 1);
    assert_eq!(s.workbench.session_state(), SessionState::Crashed);

    // A fresh session can start after the crash.
    let launch = s.launch();
    assert!(s.workbench.start_session(&launch, &[]).is_ok());
    s.workbench.shutdown();
}
