//! Minnow command line: serial monitor, port listing and a console debugger.

#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::derive_partial_eq_without_eq)]
#![allow(clippy::significant_drop_tightening)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{Receiver, TryRecvError};
use log::info;
use minnow_core::channel::BreakpointLocation;
use minnow_core::{CoreConfig, Event, MockBackend, RunnerLaunch, SessionState, Workbench};
use std::cell::Cell;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const LOOP_INTERVAL: Duration = Duration::from_millis(10);
const MOCK_PORT: &str = "/dev/ttyMOCK0";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run against a simulated board (no hardware required)
    #[arg(long)]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List attached serial devices
    Ports,
    /// Open a REPL on a device. `!int` sends Ctrl-C, `!paste FILE` pastes a script
    Monitor {
        port: String,
        #[arg(short, long)]
        baud: Option<u32>,
    },
    /// Debug a script: n(ext), s(tep in), o(ut), c(ontinue), b LINE, q(uit)
    Debug {
        script: PathBuf,
        /// Runner executable (default: minnow-runner next to this program)
        #[arg(long)]
        runner: Option<PathBuf>,
        /// Breakpoint line, may be repeated
        #[arg(short = 'b', long = "break")]
        breakpoints: Vec<u32>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => CoreConfig::load(path)?,
        None => CoreConfig::default(),
    };
    let mut workbench = if cli.mock {
        info!("Starting in MOCK mode. No hardware will be accessed.");
        let (workbench, backend) = Workbench::mock(config)?;
        simulate_board(&backend);
        workbench
    } else {
        native_workbench(config)?
    };

    let result = match cli.command {
        Commands::Ports => list_ports(&mut workbench),
        Commands::Monitor { port, baud } => monitor(&mut workbench, &port, baud),
        Commands::Debug { script, runner, breakpoints } => debug(&mut workbench, &script, runner, &breakpoints),
    };
    workbench.shutdown();
    result
}

#[cfg(feature = "hardware")]
fn native_workbench(config: CoreConfig) -> Result<Workbench> {
    Ok(Workbench::native(config)?)
}

#[cfg(not(feature = "hardware"))]
fn native_workbench(_config: CoreConfig) -> Result<Workbench> {
    bail!("Built without hardware support; use --mock")
}

/// A fake board that prints a banner, echoes input and emits a telemetry
/// tuple twice a second.
fn simulate_board(backend: &Arc<MockBackend>) {
    let device = backend.plug(MOCK_PORT, Some((0x2886, 0x802D)));
    thread::spawn(move || {
        device.inject(b"MicroPython v1.22.0 on mock board\r\n>>> ");
        let mut echoed = 0;
        let mut tick = 0u32;
        loop {
            thread::sleep(Duration::from_millis(50));
            let written = device.written();
            if written.len() > echoed {
                device.inject(&written[echoed..]);
                echoed = written.len();
            }
            tick = tick.wrapping_add(1);
            if tick % 10 == 0 {
                let t = f64::from(tick) / 40.0;
                device.inject(format!("({:.3}, {:.3})\r\n", t.sin(), t.cos()).as_bytes());
            }
        }
    });
}

/// Lines typed on stdin, read on a background thread.
fn stdin_lines() -> Receiver<String> {
    let (tx, rx) = crossbeam_channel::unbounded();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn list_ports(workbench: &mut Workbench) -> Result<()> {
    workbench.rescan_devices()?;
    let devices = workbench.devices();
    if devices.is_empty() {
        println!("No serial devices found.");
    }
    for device in devices {
        match &device.board {
            Some(board) => println!("{}  [{} ({:?})]", device.port.name(), board.name, board.mode),
            None => println!("{}", device.port.name()),
        }
    }
    Ok(())
}

fn monitor(workbench: &mut Workbench, port: &str, baud: Option<u32>) -> Result<()> {
    let done = Rc::new(Cell::new(false));
    let finished = done.clone();
    workbench.subscribe(move |event| {
        let mut stdout = io::stdout().lock();
        match event {
            Event::ReplOutput { text, .. } => {
                let _ = write!(stdout, "{text}");
            }
            Event::TelemetrySample { sample, .. } => {
                let _ = writeln!(stdout, "[sample #{}] {:?}", sample.sequence, sample.values);
            }
            Event::DataFlood { identifier } => eprintln!("warning: {identifier} is sending data faster than it can be plotted"),
            Event::DeviceOpened { identifier, baud_rate } => eprintln!("Connected to {identifier} at {baud_rate} baud"),
            Event::DeviceLost { identifier } => {
                eprintln!("Device {identifier} was unplugged");
                finished.set(true);
            }
            Event::ConnectionError { identifier, message } => {
                eprintln!("Connection to {identifier} failed: {message}");
                finished.set(true);
            }
            _ => {}
        }
        let _ = stdout.flush();
    });

    workbench.rescan_devices()?;
    workbench.open_device(port, baud).with_context(|| format!("Failed to open {port}"))?;
    workbench.start_hotplug()?;

    let input = stdin_lines();
    while !done.get() {
        workbench.pump_events();
        match input.try_recv() {
            Ok(line) => {
                let result = if line == "!int" {
                    workbench.interrupt(port)
                } else if let Some(file) = line.strip_prefix("!paste ") {
                    match std::fs::read_to_string(file.trim()) {
                        Ok(source) => workbench.paste_script(port, &source),
                        Err(e) => {
                            eprintln!("Cannot read {}: {}", file.trim(), e);
                            Ok(())
                        }
                    }
                } else {
                    workbench.send_input(port, format!("{line}\r").as_bytes())
                };
                if let Err(e) = result {
                    eprintln!("error: {e}");
                }
            }
            Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => thread::sleep(LOOP_INTERVAL),
        }
    }
    workbench.close_device(port);
    Ok(())
}

fn default_runner() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Cannot locate this executable")?;
    let dir = exe.parent().context("Executable has no parent directory")?;
    Ok(dir.join(format!("minnow-runner{}", std::env::consts::EXE_SUFFIX)))
}

fn debug(workbench: &mut Workbench, script: &Path, runner: Option<PathBuf>, lines: &[u32]) -> Result<()> {
    let runner = match runner {
        Some(path) => path,
        None => default_runner()?,
    };
    let launch = RunnerLaunch::new(runner, script);
    let file = launch.script_label();
    let breakpoints: Vec<_> = lines.iter().map(|&line| BreakpointLocation { file: file.clone(), line }).collect();

    workbench.subscribe(|event| match event {
        Event::SessionStateChanged { state, .. } => eprintln!("-- {state}"),
        Event::StackUpdated { frames, .. } => {
            for (i, frame) in frames.iter().enumerate() {
                eprintln!("#{i}: {frame}");
                for variable in &frame.variables {
                    eprintln!("      {}: {} = {}", variable.name, variable.type_label, variable.value);
                }
            }
        }
        Event::BreakpointHit { file, line, .. } => eprintln!("Breakpoint hit at {file}:{line}"),
        Event::RunnerOutput { text, .. } => print!("{text}"),
        Event::RunnerError { message, .. } => eprintln!("error: {message}"),
        Event::RunnerCrashed { reason, .. } => eprintln!("Runner crashed: {reason}"),
        _ => {}
    });

    workbench.start_session(&launch, &breakpoints)?;
    let input = stdin_lines();
    loop {
        workbench.pump_events();
        if workbench.session_state().is_terminal() {
            break;
        }
        match input.try_recv() {
            Ok(line) => {
                if let Err(e) = debug_command(workbench, &file, line.trim()) {
                    eprintln!("error: {e:#}");
                }
            }
            Err(TryRecvError::Disconnected) => {
                workbench.stop_session()?;
            }
            Err(TryRecvError::Empty) => thread::sleep(LOOP_INTERVAL),
        }
    }
    // Let trailing runner output through.
    thread::sleep(Duration::from_millis(50));
    workbench.pump_events();

    if workbench.session_state() == SessionState::Crashed {
        bail!("Debug session crashed");
    }
    Ok(())
}

fn debug_command(workbench: &mut Workbench, file: &str, command: &str) -> Result<()> {
    match command.split_whitespace().collect::<Vec<_>>().as_slice() {
        [] => {}
        ["n"] => workbench.step_over()?,
        ["s"] => workbench.step_in()?,
        ["o"] => workbench.step_out()?,
        ["c"] => workbench.continue_execution()?,
        ["q"] => workbench.stop_session()?,
        ["b", line] => {
            let line: u32 = line.parse().with_context(|| format!("`{line}` is not a line number"))?;
            let set = workbench.toggle_breakpoint(file, line);
            eprintln!("Breakpoint {} at {file}:{line}", if set { "set" } else { "cleared" });
        }
        _ => bail!("Unknown command `{command}` (n, s, o, c, b LINE, q)"),
    }
    Ok(())
}
