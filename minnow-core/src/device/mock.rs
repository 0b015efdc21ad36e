//! In-memory serial backend.
//!
//! Used by the tests and by the CLI's `--mock` mode. Devices can be plugged
//! and unplugged at will; an unplugged device fails its pending reads the way
//! a real port does when the cable is pulled.

use super::backend::{PortInfo, SerialBackend, SerialIo};
use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::BTreeMap;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Test-side handle to one plugged device.
#[derive(Debug, Clone)]
pub struct MockDevice {
    inbound_tx: Sender<Vec<u8>>,
    inbound_rx: Receiver<Vec<u8>>,
    written: Arc<Mutex<Vec<u8>>>,
    present: Arc<AtomicBool>,
    fail_reads: Arc<AtomicBool>,
    /// Held by the one open stream, as the OS holds an exclusive port.
    in_use: Arc<AtomicBool>,
}

impl MockDevice {
    fn new() -> Self {
        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
        Self {
            inbound_tx,
            inbound_rx,
            written: Arc::new(Mutex::new(Vec::new())),
            present: Arc::new(AtomicBool::new(true)),
            fail_reads: Arc::new(AtomicBool::new(false)),
            in_use: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make the device "print" bytes.
    pub fn inject(&self, bytes: &[u8]) {
        let _ = self.inbound_tx.send(bytes.to_vec());
    }

    /// Everything the host wrote to the device so far.
    pub fn written(&self) -> Vec<u8> {
        lock(&self.written).clone()
    }

    /// Make reads fail while the device stays listed.
    pub fn break_link(&self) {
        self.fail_reads.store(true, Ordering::SeqCst);
    }

    /// Whether a stream to the device is currently open.
    pub fn is_open(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }

    fn stream(&self, read_timeout: Duration) -> Option<MockStream> {
        if self.in_use.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(MockStream {
            inbound: self.inbound_rx.clone(),
            pending: Vec::new(),
            written: self.written.clone(),
            present: self.present.clone(),
            fail_reads: self.fail_reads.clone(),
            in_use: self.in_use.clone(),
            read_timeout,
        })
    }
}

struct MockStream {
    inbound: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    written: Arc<Mutex<Vec<u8>>>,
    present: Arc<AtomicBool>,
    fail_reads: Arc<AtomicBool>,
    in_use: Arc<AtomicBool>,
    read_timeout: Duration,
}

impl Drop for MockStream {
    fn drop(&mut self) {
        self.in_use.store(false, Ordering::SeqCst);
    }
}

impl MockStream {
    fn check_link(&self) -> io::Result<()> {
        if !self.present.load(Ordering::SeqCst) {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "device unplugged"));
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(io::Error::new(ErrorKind::Other, "link failure"));
        }
        Ok(())
    }
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_link()?;
        if self.pending.is_empty() {
            match self.inbound.recv_timeout(self.read_timeout) {
                Ok(bytes) => self.pending = bytes,
                Err(RecvTimeoutError::Timeout) => {
                    self.check_link()?;
                    return Err(io::Error::new(ErrorKind::TimedOut, "read timed out"));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::new(ErrorKind::BrokenPipe, "device gone"));
                }
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.present.load(Ordering::SeqCst) {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "device unplugged"));
        }
        lock(&self.written).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct MockPort {
    info: PortInfo,
    device: MockDevice,
}

/// Backend whose ports exist only in memory.
#[derive(Default)]
pub struct MockBackend {
    ports: Mutex<BTreeMap<String, MockPort>>,
}

impl MockBackend {
    /// An empty backend; `plug` adds ports.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device. Re-plugging an identifier creates a fresh device.
    pub fn plug(&self, identifier: &str, usb: Option<(u16, u16)>) -> MockDevice {
        let info = match usb {
            Some((vid, pid)) => PortInfo::usb(identifier, vid, pid),
            None => PortInfo::plain(identifier),
        };
        let device = MockDevice::new();
        let previous = lock(&self.ports).insert(identifier.to_string(), MockPort { info, device: device.clone() });
        if let Some(old) = previous {
            old.device.present.store(false, Ordering::SeqCst);
        }
        device
    }

    /// Detach a device; open streams fail from now on.
    pub fn unplug(&self, identifier: &str) {
        if let Some(port) = lock(&self.ports).remove(identifier) {
            port.device.present.store(false, Ordering::SeqCst);
        }
    }

    /// Handle to a plugged port.
    pub fn device(&self, identifier: &str) -> Option<MockDevice> {
        lock(&self.ports).get(identifier).map(|p| p.device.clone())
    }
}

impl SerialBackend for MockBackend {
    fn list_ports(&self) -> Result<Vec<PortInfo>> {
        Ok(lock(&self.ports).values().map(|p| p.info.clone()).collect())
    }

    fn open(&self, identifier: &str, _baud_rate: u32, read_timeout: Duration) -> Result<Box<dyn SerialIo>> {
        let ports = lock(&self.ports);
        let port = ports.get(identifier).ok_or_else(|| anyhow!("No such port: {}", identifier))?;
        let stream = port.device.stream(read_timeout).ok_or_else(|| anyhow!("Port {} is busy", identifier))?;
        Ok(Box::new(stream))
    }
}
