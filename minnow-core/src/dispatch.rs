//! Event dispatcher.
//!
//! One ordered queue shared by every background context. Producers hold an
//! [`EventSink`] and only enqueue; the queue is drained exclusively on the
//! interface thread, which routes raw notifications to their owning component
//! and delivers the resulting events to subscribers in arrival order.

use crate::channel::ChannelNotice;
use crate::device::PortInfo;
use crate::event::{Event, SessionId};
use crate::serial::PumpNotice;
use crossbeam_channel::{Receiver, Sender};
use std::net::TcpStream;
use tokio::sync::broadcast;

const BROADCAST_CAPACITY: usize = 1024;

/// A raw notification from a background context.
#[derive(Debug)]
pub enum Notice {
    /// An event that needs no routing.
    Publish(Event),
    Channel { session: SessionId, notice: ChannelNotice },
    RunnerConnected { session: SessionId, stream: TcpStream },
    RunnerConnectFailed { session: SessionId, reason: String },
    Pump { identifier: String, generation: u64, notice: PumpNotice },
    PortsScanned(Vec<PortInfo>),
}

/// Cloneable producer handle. Safe to move into any thread.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<Notice>,
}

impl EventSink {
    /// Enqueue a public event.
    pub fn publish(&self, event: Event) {
        self.push(Notice::Publish(event));
    }

    pub(crate) fn push(&self, notice: Notice) {
        // The receiver lives as long as the dispatcher; once it is gone
        // nobody is left to observe the notice.
        if self.tx.send(notice).is_err() {
            log::trace!("Dispatcher gone, notice dropped");
        }
    }
}

type Subscriber = Box<dyn FnMut(&Event)>;

/// The single serialization point between background contexts and the
/// interface thread.
pub struct Dispatcher {
    tx: Sender<Notice>,
    rx: Receiver<Notice>,
    subscribers: Vec<Subscriber>,
    broadcast: broadcast::Sender<Event>,
    delivered: u64,
}

impl Dispatcher {
    /// An empty queue.
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx, rx, subscribers: Vec::new(), broadcast, delivered: 0 }
    }

    /// A cloneable handle for posting from other threads.
    pub fn sink(&self) -> EventSink {
        EventSink { tx: self.tx.clone() }
    }

    /// Register a callback invoked on the interface thread for every event.
    pub fn subscribe<F: FnMut(&Event) + 'static>(&mut self, subscriber: F) {
        self.subscribers.push(Box::new(subscriber));
    }

    /// Subscribe from async code. Receives the same events in the same order.
    pub fn subscribe_async(&self) -> broadcast::Receiver<Event> {
        self.broadcast.subscribe()
    }

    /// Number of notices waiting to be drained.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Total events delivered so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Hand one event to every subscriber.
    pub fn deliver(&mut self, event: &Event) {
        log::trace!("Deliver {}", event.tag());
        for subscriber in &mut self.subscribers {
            subscriber(event);
        }
        // No async subscribers is not an error.
        let _ = self.broadcast.send(event.clone());
        self.delivered += 1;
    }

    /// Drain what is queued right now without blocking.
    ///
    /// `Publish` notices are delivered as they are; every other notice goes
    /// to `route`, whose events are delivered in place. Notices enqueued while
    /// draining wait for the next call. Returns the number of notices handled.
    pub fn drain_with<H>(&mut self, mut route: H) -> usize
    where
        H: FnMut(Notice) -> Vec<Event>,
    {
        let pending = self.rx.len();
        let mut handled = 0;
        for _ in 0..pending {
            let Ok(notice) = self.rx.try_recv() else { break };
            handled += 1;
            match notice {
                Notice::Publish(event) => self.deliver(&event),
                other => {
                    for event in route(other) {
                        self.deliver(&event);
                    }
                }
            }
        }
        handled
    }

    /// Drain, delivering only published events. Routed notices are dropped.
    pub fn drain(&mut self) -> usize {
        self.drain_with(|notice| {
            log::debug!("Unrouted notice dropped: {:?}", notice);
            Vec::new()
        })
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::thread;

    fn output(identifier: &str, text: String) -> Event {
        Event::ReplOutput { identifier: identifier.to_string(), text }
    }

    #[test]
    fn test_delivery_preserves_per_source_order() {
        let mut dispatcher = Dispatcher::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink_seen = seen.clone();
        dispatcher.subscribe(move |event| sink_seen.borrow_mut().push(event.clone()));

        let producers: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|id| {
                let sink = dispatcher.sink();
                thread::spawn(move || {
                    for i in 0..200 {
                        sink.publish(output(id, i.to_string()));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        assert_eq!(dispatcher.drain(), 600);
        let seen = seen.borrow();
        assert_eq!(seen.len(), 600);
        for id in ["a", "b", "c"] {
            let texts: Vec<u32> = seen
                .iter()
                .filter_map(|e| match e {
                    Event::ReplOutput { identifier, text } if identifier == id => text.parse().ok(),
                    _ => None,
                })
                .collect();
            assert_eq!(texts, (0..200).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_routed_events_delivered_in_place() {
        let mut dispatcher = Dispatcher::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink_seen = seen.clone();
        dispatcher.subscribe(move |event: &Event| sink_seen.borrow_mut().push(event.tag()));

        let sink = dispatcher.sink();
        sink.publish(output("a", "1".into()));
        sink.push(Notice::PortsScanned(Vec::new()));
        sink.publish(output("a", "2".into()));

        dispatcher.drain_with(|notice| match notice {
            Notice::PortsScanned(_) => vec![Event::DeviceDetached { identifier: "x".into() }],
            _ => Vec::new(),
        });
        assert_eq!(*seen.borrow(), vec!["ReplOutput", "DeviceDetached", "ReplOutput"]);
        assert_eq!(dispatcher.delivered(), 3);
    }

    #[test]
    fn test_drain_never_blocks_when_empty() {
        let mut dispatcher = Dispatcher::default();
        assert_eq!(dispatcher.drain(), 0);
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test]
    async fn test_async_subscriber_sees_same_order() {
        let mut dispatcher = Dispatcher::new();
        let mut rx = dispatcher.subscribe_async();
        let sink = dispatcher.sink();
        sink.publish(output("a", "first".into()));
        sink.publish(Event::DeviceLost { identifier: "a".into() });
        dispatcher.drain();

        let first = tokio::time::timeout(std::time::Duration::from_millis(100), rx.recv()).await.unwrap().unwrap();
        let second = tokio::time::timeout(std::time::Duration::from_millis(100), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.tag(), "ReplOutput");
        assert_eq!(second, Event::DeviceLost { identifier: "a".into() });
    }
}
