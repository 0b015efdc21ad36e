//! Serial I/O pump.
//!
//! One background context per open device connection. Each iteration writes
//! whatever the interface queued (coalesced into one write), then performs a
//! read bounded by the port's read timeout and feeds the telemetry parser.
//! Reads and writes never interleave because one context owns the port.

pub mod utf8;

pub use utf8::LossyUtf8Decoder;

use crate::config::CoreConfig;
use crate::device::{SerialBackend, SerialIo};
use crate::dispatch::{EventSink, Notice};
use crate::error::{CoreError, CoreResult};
use crate::telemetry::{Parsed, TelemetryParser, TelemetrySample};
use crossbeam_channel::{Receiver, Sender};
use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const READ_BUFFER: usize = 1024;
const FLOOD_WINDOW: Duration = Duration::from_secs(1);

/// What a pump reports about its connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PumpNotice {
    Output(String),
    Sample(TelemetrySample),
    Flood,
    /// The loop ended on an I/O failure. `vanished` is true when the device
    /// was also missing from the port list at that moment.
    Failed { message: String, vanished: bool },
}

/// Handle to a running pump.
pub struct SerialPump {
    identifier: String,
    outbound: Sender<Vec<u8>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SerialPump {
    /// Start a pump thread that owns `port`. Notices carry `generation`.
    pub fn spawn(
        identifier: &str,
        generation: u64,
        port: Box<dyn SerialIo>,
        backend: Arc<dyn SerialBackend>,
        config: &CoreConfig,
        sink: EventSink,
    ) -> io::Result<Self> {
        let (outbound, outbound_rx) = crossbeam_channel::unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let worker = PumpWorker {
            identifier: identifier.to_string(),
            generation,
            port,
            backend,
            outbound: outbound_rx,
            stop: stop.clone(),
            parser: TelemetryParser::new(&config.telemetry),
            decoder: LossyUtf8Decoder::new(),
            flood: FloodMonitor::new(config.telemetry.flood_threshold),
            sink,
        };
        let handle = thread::Builder::new()
            .name(format!("pump-{identifier}"))
            .spawn(move || worker.run())?;
        log::info!("Serial pump started for {}", identifier);
        Ok(Self { identifier: identifier.to_string(), outbound, stop, handle: Some(handle) })
    }

    /// Queue bytes for the device.
    pub fn write(&self, bytes: Vec<u8>) -> CoreResult<()> {
        self.outbound.send(bytes).map_err(|_| CoreError::ConnectionError {
            identifier: self.identifier.clone(),
            message: "pump has stopped".to_string(),
        })
    }

    /// Whether the pump thread is still alive.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Ask the pump to exit. It notices within one read timeout and reports
    /// nothing further.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Stop and wait up to `grace` for the context to exit.
    pub fn stop_and_join(&mut self, grace: Duration) -> bool {
        self.stop();
        let deadline = Instant::now() + grace;
        while self.is_running() {
            if Instant::now() >= deadline {
                log::warn!("Serial pump for {} did not exit within {:?}", self.identifier, grace);
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        true
    }
}

impl Drop for SerialPump {
    fn drop(&mut self) {
        self.stop();
    }
}

struct FloodMonitor {
    threshold: u32,
    window_start: Instant,
    count: u32,
    tripped: bool,
}

impl FloodMonitor {
    fn new(threshold: u32) -> Self {
        Self { threshold, window_start: Instant::now(), count: 0, tripped: false }
    }

    /// Count one sample; true exactly once per window that goes over.
    fn record(&mut self, now: Instant) -> bool {
        if now.duration_since(self.window_start) >= FLOOD_WINDOW {
            self.window_start = now;
            self.count = 0;
            self.tripped = false;
        }
        self.count += 1;
        if self.count > self.threshold && !self.tripped {
            self.tripped = true;
            return true;
        }
        false
    }
}

struct PumpWorker {
    identifier: String,
    generation: u64,
    port: Box<dyn SerialIo>,
    backend: Arc<dyn SerialBackend>,
    outbound: Receiver<Vec<u8>>,
    stop: Arc<AtomicBool>,
    parser: TelemetryParser,
    decoder: LossyUtf8Decoder,
    flood: FloodMonitor,
    sink: EventSink,
}

impl PumpWorker {
    fn run(mut self) {
        let mut buffer = vec![0u8; READ_BUFFER];
        while !self.stopped() {
            // 1. Outbound, coalesced
            let batch: Vec<u8> = self.outbound.try_iter().flatten().collect();
            if !batch.is_empty() {
                log::trace!("{} write {} bytes", self.identifier, batch.len());
                if let Err(e) = self.port.write_all(&batch).and_then(|()| self.port.flush()) {
                    self.fail(&e);
                    return;
                }
            }

            // 2. Inbound, bounded by the read timeout
            match self.port.read(&mut buffer) {
                Ok(0) => {}
                Ok(n) => {
                    let (chunk, _) = buffer.split_at(n);
                    let parsed = self.parser.feed(chunk);
                    self.forward(parsed);
                }
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
                Err(e) => {
                    self.fail(&e);
                    return;
                }
            }
        }
        log::debug!("Serial pump for {} stopped", self.identifier);
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn forward(&mut self, parsed: Vec<Parsed>) {
        for item in parsed {
            match item {
                Parsed::Text(bytes) => {
                    let text = self.decoder.decode(&bytes);
                    if !text.is_empty() {
                        self.notify(PumpNotice::Output(text));
                    }
                }
                Parsed::Sample(sample) => {
                    let flooded = self.flood.record(Instant::now());
                    self.notify(PumpNotice::Sample(sample));
                    if flooded {
                        log::warn!("Data flood on {}", self.identifier);
                        self.notify(PumpNotice::Flood);
                    }
                }
            }
        }
    }

    fn fail(&mut self, error: &io::Error) {
        if self.stopped() {
            return;
        }
        // Flush what was already received so no output is lost.
        let rest = self.parser.finish();
        self.forward(rest);
        let tail = self.decoder.finish();
        if !tail.is_empty() {
            self.notify(PumpNotice::Output(tail));
        }

        let vanished = match self.backend.list_ports() {
            Ok(ports) => !ports.iter().any(|p| p.identifier == self.identifier),
            Err(e) => {
                log::debug!("Port listing after failure on {} failed: {}", self.identifier, e);
                false
            }
        };
        log::warn!("Serial pump for {} failed: {} (vanished: {})", self.identifier, error, vanished);
        self.notify(PumpNotice::Failed { message: error.to_string(), vanished });
    }

    fn notify(&self, notice: PumpNotice) {
        self.sink.push(Notice::Pump { identifier: self.identifier.clone(), generation: self.generation, notice });
    }
}
