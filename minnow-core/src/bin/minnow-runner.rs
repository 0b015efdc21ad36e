//! Debug runner: executes a script under the control of the editor's debugger.

#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::derive_partial_eq_without_eq)]
#![allow(clippy::significant_drop_tightening)]

use anyhow::{Context, Result};
use clap::Parser;
use minnow_core::channel::{encode_message, ChannelMessage, ChannelNotice, MessageStream};
use minnow_core::runner::{Outcome, Runner, Script};
use minnow_core::session::DEBUG_ADDR_ENV;
use minnow_core::CoreConfig;
use std::io::{self, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::thread;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Debugger address (default: $MINNOW_DEBUG_ADDR)
    #[arg(long)]
    connect: Option<String>,

    /// Script to run
    script: PathBuf,
}

/// Writing half of the debugger connection. Frames are written synchronously
/// so nothing is lost when the process exits right after.
struct Link {
    stream: TcpStream,
}

impl Link {
    fn send(&mut self, message: &ChannelMessage) {
        let result = encode_message(message)
            .map_err(anyhow::Error::from)
            .and_then(|frame| self.stream.write_all(&frame).map_err(anyhow::Error::from));
        if let Err(e) = result {
            log::debug!("Failed to send {}: {:#}", message.kind(), e);
        }
    }
}

fn load(path: &Path) -> Result<Script> {
    let source = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Script::parse(&source).with_context(|| format!("Failed to parse {}", path.display()))
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let addr = match args.connect {
        Some(addr) => addr,
        None => std::env::var(DEBUG_ADDR_ENV).with_context(|| format!("{DEBUG_ADDR_ENV} is not set"))?,
    };
    let stream = TcpStream::connect(&addr).with_context(|| format!("Failed to connect to debugger at {addr}"))?;
    stream.set_nodelay(true).context("Failed to configure debugger connection")?;
    let reader = stream.try_clone().context("Failed to clone debugger connection")?;
    log::info!("Connected to debugger at {}", addr);

    let max_frame_len = CoreConfig::default().max_frame_len;
    let (tx, commands) = crossbeam_channel::unbounded();
    thread::Builder::new()
        .name("runner-reader".to_string())
        .spawn(move || {
            for item in MessageStream::new(reader, max_frame_len) {
                let notice = match item {
                    Ok(message) => ChannelNotice::Message(message),
                    Err(e) => ChannelNotice::Closed(Some(e)),
                };
                if tx.send(notice).is_err() {
                    return;
                }
            }
            let _ = tx.send(ChannelNotice::Closed(None));
        })
        .context("Failed to start reader thread")?;

    let mut link = Link { stream };
    let label = args.script.display().to_string();
    let code = match load(&args.script) {
        Ok(script) => {
            let runner = Runner::new(
                &script,
                &label,
                commands,
                |message| link.send(&message),
                |text: &str| {
                    let mut stdout = io::stdout().lock();
                    let _ = writeln!(stdout, "{text}");
                    let _ = stdout.flush();
                },
            );
            match runner.run() {
                Outcome::Exited(code) => code,
                Outcome::Stopped => 0,
                Outcome::Disconnected => {
                    log::warn!("Debugger went away");
                    1
                }
            }
        }
        Err(e) => {
            log::error!("{:#}", e);
            link.send(&ChannelMessage::Error { message: format!("{e:#}") });
            link.send(&ChannelMessage::Exited { code: 2 });
            2
        }
    };

    std::process::exit(code);
}
