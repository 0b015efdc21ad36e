//! Device connection manager.
//!
//! Tracks attached serial devices from hot-plug snapshots and owns every open
//! [`DeviceConnection`]. All of its state is touched on the interface thread
//! only; background contexts (the hot-plug watcher and the pumps) reach it
//! through the dispatcher queue.

pub mod backend;
pub mod board;
pub mod mock;

pub use backend::{PortInfo, SerialBackend, SerialIo};
#[cfg(feature = "hardware")]
pub use backend::NativeBackend;
pub use board::{BoardCatalog, BoardMatch, BoardMode, BoardProfile};
pub use mock::{MockBackend, MockDevice};

use crate::config::CoreConfig;
use crate::dispatch::{EventSink, Notice};
use crate::error::{CoreError, CoreResult};
use crate::event::Event;
use crate::serial::{PumpNotice, SerialPump};
use crossbeam_channel::{RecvTimeoutError, Sender};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// MicroPython REPL control characters.
const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;
const CTRL_E: u8 = 0x05;

/// An attached device, with its board if the catalog knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// The port as listed by the backend.
    pub port: PortInfo,
    /// Catalog match for USB ports with a known id.
    pub board: Option<BoardMatch>,
}

impl DeviceInfo {
    /// Port identifier.
    pub fn identifier(&self) -> &str {
        &self.port.identifier
    }
}

/// Lifecycle of a `DeviceConnection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The pump is running.
    Open,
    /// Closed by request or after a failure.
    Closed,
}

/// One open byte-stream connection to a device.
pub struct DeviceConnection {
    identifier: String,
    baud_rate: u32,
    state: ConnectionState,
    /// Distinguishes this connection's pump notices from those of an
    /// earlier connection to the same identifier.
    generation: u64,
    pump: SerialPump,
}

impl DeviceConnection {
    /// Port identifier.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Baud rate the port was opened at.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Stop the pump and wait up to `grace` for it to release the port. A
    /// pump still blocked after that is abandoned.
    fn close(&mut self, grace: Duration) {
        if !self.pump.stop_and_join(grace) {
            log::warn!("Abandoning the pump of {}", self.identifier);
        }
        self.state = ConnectionState::Closed;
    }
}

/// A connection whose link failed while the port was still listed. The OS
/// often drops a pulled device from enumeration only after the read fails,
/// so the outcome is decided once `deadline` passes or a snapshot shows the
/// port gone.
struct PendingFailure {
    message: String,
    deadline: Instant,
}

/// Owner of device discovery and connections.
pub struct DeviceManager {
    backend: Arc<dyn SerialBackend>,
    catalog: BoardCatalog,
    config: CoreConfig,
    sink: EventSink,
    known: BTreeMap<String, DeviceInfo>,
    connections: HashMap<String, DeviceConnection>,
    pending: HashMap<String, PendingFailure>,
    next_generation: u64,
}

impl DeviceManager {
    /// A manager with no known devices. Events go to `sink`.
    pub fn new(backend: Arc<dyn SerialBackend>, config: &CoreConfig, sink: EventSink) -> Self {
        Self {
            backend,
            catalog: BoardCatalog::new(config.boards.clone()),
            config: config.clone(),
            sink,
            known: BTreeMap::new(),
            connections: HashMap::new(),
            pending: HashMap::new(),
            next_generation: 1,
        }
    }

    /// Shared handle to the serial backend.
    pub fn backend(&self) -> Arc<dyn SerialBackend> {
        self.backend.clone()
    }

    /// Devices attached as of the last snapshot.
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.known.values().cloned().collect()
    }

    /// Whether `identifier` has an open connection.
    pub fn is_open(&self, identifier: &str) -> bool {
        self.connections.contains_key(identifier)
    }

    /// The open connection to `identifier`.
    pub fn connection(&self, identifier: &str) -> Option<&DeviceConnection> {
        self.connections.get(identifier)
    }

    /// List ports right now and apply the snapshot. Blocks on the backend;
    /// the interface normally relies on the hot-plug watcher instead.
    pub fn scan_now(&mut self) -> CoreResult<Vec<Event>> {
        let ports = self.backend.list_ports().map_err(|e| CoreError::ConnectionError {
            identifier: "port enumeration".to_string(),
            message: format!("{:#}", e),
        })?;
        Ok(self.apply_snapshot(ports))
    }

    /// Open a connection and start its pump.
    pub fn open(&mut self, identifier: &str, baud_rate: u32) -> CoreResult<()> {
        if self.connections.contains_key(identifier) {
            return Err(CoreError::DeviceBusy(identifier.to_string()));
        }
        if !self.known.contains_key(identifier) {
            return Err(CoreError::DeviceUnavailable(identifier.to_string()));
        }
        // Reopening settles an undecided failure of the previous connection.
        if let Some(failure) = self.pending.remove(identifier) {
            self.sink.publish(Event::ConnectionError { identifier: identifier.to_string(), message: failure.message });
        }
        let port = self
            .backend
            .open(identifier, baud_rate, self.config.serial_read_timeout())
            .map_err(|e| {
                log::warn!("Open {} failed: {:#}", identifier, e);
                CoreError::DeviceUnavailable(identifier.to_string())
            })?;

        let generation = self.next_generation;
        self.next_generation += 1;
        let pump = SerialPump::spawn(identifier, generation, port, self.backend.clone(), &self.config, self.sink.clone())
            .map_err(|e| CoreError::ConnectionError { identifier: identifier.to_string(), message: e.to_string() })?;

        self.connections.insert(
            identifier.to_string(),
            DeviceConnection {
                identifier: identifier.to_string(),
                baud_rate,
                state: ConnectionState::Open,
                generation,
                pump,
            },
        );
        log::info!("Opened {} at {} baud", identifier, baud_rate);
        self.sink.publish(Event::DeviceOpened { identifier: identifier.to_string(), baud_rate });
        Ok(())
    }

    /// Close a connection. Closing a device that is not open does nothing.
    pub fn close(&mut self, identifier: &str) {
        if let Some(mut connection) = self.connections.remove(identifier) {
            connection.close(self.config.grace_period());
            log::info!("Closed {}", identifier);
            self.sink.publish(Event::DeviceClosed { identifier: identifier.to_string() });
        }
    }

    /// Close every open connection, publishing `DeviceClosed` for each.
    pub fn close_all(&mut self) {
        let open: Vec<String> = self.connections.keys().cloned().collect();
        for identifier in open {
            self.close(&identifier);
        }
    }

    /// Queue REPL input for the device.
    pub fn send_input(&self, identifier: &str, bytes: &[u8]) -> CoreResult<()> {
        let connection =
            self.connections.get(identifier).ok_or_else(|| CoreError::DeviceNotOpen(identifier.to_string()))?;
        connection.pump.write(bytes.to_vec())
    }

    /// Interrupt whatever the board is running (Ctrl-C).
    pub fn interrupt(&self, identifier: &str) -> CoreResult<()> {
        self.send_input(identifier, &[CTRL_C])
    }

    /// Send a script through the REPL's paste mode so it runs as one unit.
    pub fn paste_script(&self, identifier: &str, source: &str) -> CoreResult<()> {
        let mut bytes = Vec::with_capacity(source.len() + 2);
        bytes.push(CTRL_E);
        bytes.extend_from_slice(source.replace("\r\n", "\n").as_bytes());
        bytes.push(CTRL_D);
        self.send_input(identifier, &bytes)
    }

    pub(crate) fn route(&mut self, notice: Notice) -> Vec<Event> {
        match notice {
            Notice::PortsScanned(ports) => self.apply_snapshot(ports),
            Notice::Pump { identifier, generation, notice } => self.handle_pump(&identifier, generation, notice),
            other => {
                log::debug!("Device manager ignores {:?}", other);
                Vec::new()
            }
        }
    }

    /// Diff a port snapshot against the known devices.
    fn apply_snapshot(&mut self, ports: Vec<PortInfo>) -> Vec<Event> {
        let mut events = Vec::new();
        let current: BTreeMap<String, PortInfo> = ports.into_iter().map(|p| (p.identifier.clone(), p)).collect();

        let gone: Vec<String> = self.known.keys().filter(|id| !current.contains_key(*id)).cloned().collect();
        for identifier in gone {
            self.known.remove(&identifier);
            if let Some(mut connection) = self.connections.remove(&identifier) {
                connection.close(self.config.grace_period());
                log::warn!("Device {} lost while open", identifier);
                events.push(Event::DeviceLost { identifier });
            } else if self.pending.remove(&identifier).is_some() {
                log::warn!("Device {} lost after its link failed", identifier);
                events.push(Event::DeviceLost { identifier });
            } else {
                log::info!("Device {} detached", identifier);
                events.push(Event::DeviceDetached { identifier });
            }
        }

        for (identifier, port) in current {
            if self.known.contains_key(&identifier) {
                continue;
            }
            let board = match (port.vid, port.pid) {
                (Some(vid), Some(pid)) => self.catalog.identify(vid, pid),
                _ => None,
            };
            let info = DeviceInfo { port, board };
            log::info!("Device {} attached ({:?})", identifier, info.board);
            self.known.insert(identifier, info.clone());
            events.push(Event::DeviceAttached(info));
        }
        events
    }

    fn handle_pump(&mut self, identifier: &str, generation: u64, notice: PumpNotice) -> Vec<Event> {
        let current = self.connections.get(identifier).map(|c| c.generation);
        if current != Some(generation) {
            log::trace!("Stale pump notice for {} discarded", identifier);
            return Vec::new();
        }
        let identifier = identifier.to_string();
        let event = match notice {
            PumpNotice::Output(text) => Event::ReplOutput { identifier, text },
            PumpNotice::Sample(sample) => Event::TelemetrySample { identifier, sample },
            PumpNotice::Flood => Event::DataFlood { identifier },
            PumpNotice::Failed { message, vanished } => {
                if let Some(mut connection) = self.connections.remove(&identifier) {
                    connection.close(self.config.grace_period());
                }
                if !vanished {
                    let deadline = Instant::now() + self.failure_settle();
                    log::debug!("Link to {} failed ({}); waiting for the port list to settle", identifier, message);
                    self.pending.insert(identifier, PendingFailure { message, deadline });
                    return Vec::new();
                }
                // The next snapshot must not report it again as detached.
                self.known.remove(&identifier);
                Event::DeviceLost { identifier }
            }
        };
        vec![event]
    }

    /// How long a failed link waits for the port list before it counts as a
    /// connection error: one hot-plug interval, capped by the grace period.
    fn failure_settle(&self) -> Duration {
        self.config.hotplug_interval().min(self.config.grace_period())
    }

    /// Decide link failures whose settle time has passed. A port still listed
    /// gives `ConnectionError`; a port gone gives `DeviceLost`.
    pub fn tick(&mut self, now: Instant) -> Vec<Event> {
        let due: Vec<String> =
            self.pending.iter().filter(|(_, f)| now >= f.deadline).map(|(id, _)| id.clone()).collect();
        if due.is_empty() {
            return Vec::new();
        }
        let listed = match self.backend.list_ports() {
            Ok(ports) => Some(ports),
            Err(e) => {
                log::debug!("Port listing for failed links failed: {:#}", e);
                None
            }
        };
        let mut events = Vec::new();
        for identifier in due {
            let Some(failure) = self.pending.remove(&identifier) else { continue };
            let present = listed.as_ref().map_or(true, |ports| ports.iter().any(|p| p.identifier == identifier));
            if present {
                log::warn!("Connection to {} failed: {}", identifier, failure.message);
                events.push(Event::ConnectionError { identifier, message: failure.message });
            } else {
                log::warn!("Device {} lost after its link failed", identifier);
                self.known.remove(&identifier);
                events.push(Event::DeviceLost { identifier });
            }
        }
        events
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        let grace = self.config.grace_period();
        for connection in self.connections.values_mut() {
            connection.close(grace);
        }
    }
}

/// Background poller feeding port snapshots to the dispatcher.
pub struct HotplugWatcher {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl HotplugWatcher {
    /// Start listing ports every `interval` on a background thread.
    pub fn spawn(backend: Arc<dyn SerialBackend>, interval: Duration, sink: EventSink) -> io::Result<Self> {
        let (stop, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let handle = thread::Builder::new().name("hotplug".to_string()).spawn(move || loop {
            match backend.list_ports() {
                Ok(ports) => sink.push(Notice::PortsScanned(ports)),
                Err(e) => log::debug!("Port listing failed: {:#}", e),
            }
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => break,
            }
        })?;
        Ok(Self { stop: Some(stop), handle: Some(handle) })
    }

    /// Stop the watcher and join its thread.
    pub fn stop(&mut self) {
        // Dropping the sender wakes the poller immediately.
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HotplugWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;

    fn manager(backend: &Arc<MockBackend>, dispatcher: &Dispatcher) -> DeviceManager {
        DeviceManager::new(backend.clone(), &CoreConfig::default(), dispatcher.sink())
    }

    #[test]
    fn test_snapshot_diff_emits_attach_and_detach() {
        let backend = Arc::new(MockBackend::new());
        let dispatcher = Dispatcher::new();
        let mut devices = manager(&backend, &dispatcher);

        backend.plug("/dev/ttyACM0", Some((0x2886, 0x802D)));
        backend.plug("/dev/ttyUSB0", None);
        let events = devices.scan_now().unwrap();
        assert_eq!(events.len(), 2);
        match &events[0] {
            Event::DeviceAttached(info) => {
                assert_eq!(info.identifier(), "/dev/ttyACM0");
                assert_eq!(info.board.as_ref().map(|b| b.name.as_str()), Some("Wio Terminal"));
            }
            other => panic!("Expected DeviceAttached, got {:?}", other),
        }

        assert!(devices.scan_now().unwrap().is_empty());

        backend.unplug("/dev/ttyUSB0");
        assert_eq!(devices.scan_now().unwrap(), vec![Event::DeviceDetached { identifier: "/dev/ttyUSB0".into() }]);
        assert_eq!(devices.devices().len(), 1);
    }

    #[test]
    fn test_open_errors() {
        let backend = Arc::new(MockBackend::new());
        let dispatcher = Dispatcher::new();
        let mut devices = manager(&backend, &dispatcher);

        assert_eq!(devices.open("/dev/ttyACM0", 115_200), Err(CoreError::DeviceUnavailable("/dev/ttyACM0".into())));

        backend.plug("/dev/ttyACM0", None);
        devices.scan_now().unwrap();
        devices.open("/dev/ttyACM0", 115_200).unwrap();
        assert_eq!(devices.open("/dev/ttyACM0", 115_200), Err(CoreError::DeviceBusy("/dev/ttyACM0".into())));
        assert_eq!(devices.connection("/dev/ttyACM0").map(DeviceConnection::baud_rate), Some(115_200));

        // Vanished between detection and open.
        backend.plug("/dev/ttyACM1", None);
        devices.scan_now().unwrap();
        backend.unplug("/dev/ttyACM1");
        assert_eq!(devices.open("/dev/ttyACM1", 9600), Err(CoreError::DeviceUnavailable("/dev/ttyACM1".into())));
    }

    #[test]
    fn test_close_is_idempotent() {
        let backend = Arc::new(MockBackend::new());
        let mut dispatcher = Dispatcher::new();
        let mut devices = manager(&backend, &dispatcher);
        backend.plug("mock", None);
        devices.scan_now().unwrap();
        devices.open("mock", 9600).unwrap();

        devices.close("mock");
        devices.close("mock");
        assert!(!devices.is_open("mock"));

        let mut tags = Vec::new();
        dispatcher.drain_with(|_| Vec::new());
        let mut rx = dispatcher.subscribe_async();
        devices.close("mock");
        dispatcher.drain();
        while let Ok(event) = rx.try_recv() {
            tags.push(event.tag());
        }
        assert!(tags.is_empty());
        assert_eq!(devices.send_input("mock", b"x"), Err(CoreError::DeviceNotOpen("mock".into())));
    }

    #[test]
    fn test_detach_while_open_is_device_lost() {
        let backend = Arc::new(MockBackend::new());
        let dispatcher = Dispatcher::new();
        let mut devices = manager(&backend, &dispatcher);
        backend.plug("mock", None);
        devices.scan_now().unwrap();
        devices.open("mock", 9600).unwrap();

        let snapshot = Vec::new();
        let events = devices.route(Notice::PortsScanned(snapshot));
        assert_eq!(events, vec![Event::DeviceLost { identifier: "mock".into() }]);
        assert!(!devices.is_open("mock"));

        // A late failure from the old pump is discarded.
        let late = devices.route(Notice::Pump {
            identifier: "mock".into(),
            generation: 1,
            notice: PumpNotice::Failed { message: "gone".into(), vanished: true },
        });
        assert!(late.is_empty());
    }

    #[test]
    fn test_link_failure_is_connection_error() {
        let backend = Arc::new(MockBackend::new());
        let dispatcher = Dispatcher::new();
        let mut devices = manager(&backend, &dispatcher);
        backend.plug("mock", None);
        devices.scan_now().unwrap();
        devices.open("mock", 9600).unwrap();

        let events = devices.route(Notice::Pump {
            identifier: "mock".into(),
            generation: 1,
            notice: PumpNotice::Failed { message: "link failure".into(), vanished: false },
        });
        // Undecided until the port list settles.
        assert!(events.is_empty());
        assert!(!devices.is_open("mock"));
        assert!(devices.tick(Instant::now()).is_empty());

        let events = devices.tick(Instant::now() + Duration::from_secs(5));
        assert_eq!(
            events,
            vec![Event::ConnectionError { identifier: "mock".into(), message: "link failure".into() }]
        );
        assert!(devices.tick(Instant::now() + Duration::from_secs(10)).is_empty());
        // Still attached, so it can be reopened.
        devices.open("mock", 9600).unwrap();
    }

    #[test]
    fn test_link_failure_then_unplug_is_device_lost_once() {
        let backend = Arc::new(MockBackend::new());
        let dispatcher = Dispatcher::new();
        let mut devices = manager(&backend, &dispatcher);
        backend.plug("mock", None);
        devices.scan_now().unwrap();
        devices.open("mock", 9600).unwrap();

        let events = devices.route(Notice::Pump {
            identifier: "mock".into(),
            generation: 1,
            notice: PumpNotice::Failed { message: "read failed".into(), vanished: false },
        });
        assert!(events.is_empty());

        // The OS drops the port a moment later.
        backend.unplug("mock");
        assert_eq!(devices.scan_now().unwrap(), vec![Event::DeviceLost { identifier: "mock".into() }]);
        assert!(devices.tick(Instant::now() + Duration::from_secs(10)).is_empty());
        assert!(devices.scan_now().unwrap().is_empty());
        assert!(devices.devices().is_empty());
    }

    #[test]
    fn test_unlisted_port_at_settle_time_is_device_lost() {
        let backend = Arc::new(MockBackend::new());
        let dispatcher = Dispatcher::new();
        let mut devices = manager(&backend, &dispatcher);
        backend.plug("mock", None);
        devices.scan_now().unwrap();
        devices.open("mock", 9600).unwrap();

        devices.route(Notice::Pump {
            identifier: "mock".into(),
            generation: 1,
            notice: PumpNotice::Failed { message: "read failed".into(), vanished: false },
        });
        backend.unplug("mock");
        let events = devices.tick(Instant::now() + Duration::from_secs(5));
        assert_eq!(events, vec![Event::DeviceLost { identifier: "mock".into() }]);
        // Already forgotten, so no detach follows.
        assert!(devices.scan_now().unwrap().is_empty());
    }

    #[test]
    fn test_close_releases_port_for_reopen() {
        let backend = Arc::new(MockBackend::new());
        let dispatcher = Dispatcher::new();
        let mut devices = manager(&backend, &dispatcher);
        let device = backend.plug("mock", None);
        devices.scan_now().unwrap();

        for _ in 0..20 {
            devices.open("mock", 115_200).unwrap();
            assert!(device.is_open());
            devices.close("mock");
            assert!(!device.is_open());
        }
    }

    #[test]
    fn test_paste_script_framing() {
        let backend = Arc::new(MockBackend::new());
        let dispatcher = Dispatcher::new();
        let mut devices = manager(&backend, &dispatcher);
        let device = backend.plug("mock", None);
        devices.scan_now().unwrap();
        devices.open("mock", 115_200).unwrap();

        devices.paste_script("mock", "print(1)\r\n").unwrap();
        devices.interrupt("mock").unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while device.written().len() < 12 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(device.written(), b"\x05print(1)\n\x04\x03");
    }

    #[test]
    fn test_hotplug_watcher_pushes_snapshots() {
        let backend = Arc::new(MockBackend::new());
        backend.plug("mock", None);
        let mut dispatcher = Dispatcher::new();
        let mut watcher = HotplugWatcher::spawn(backend.clone(), Duration::from_millis(20), dispatcher.sink()).unwrap();

        let mut snapshots = 0;
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while snapshots == 0 && std::time::Instant::now() < deadline {
            dispatcher.drain_with(|notice| {
                if let Notice::PortsScanned(ports) = notice {
                    assert_eq!(ports.len(), 1);
                    snapshots += 1;
                }
                Vec::new()
            });
            thread::sleep(Duration::from_millis(10));
        }
        watcher.stop();
        assert!(snapshots > 0);
    }
}
