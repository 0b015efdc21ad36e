//! Framed channel.
//!
//! Owns one byte transport and two background contexts: a reader that
//! decodes frames and reports them through a notification callback, and a
//! writer that drains a queue of outbound messages. `send` never blocks the
//! caller.

pub mod codec;
pub mod message;

pub use codec::{encode_frame, encode_message, FrameDecoder, MessageStream};
pub use message::{BreakpointLocation, ChannelMessage, StepMode, StopReason};

use crate::error::{CoreError, CoreResult};
use crossbeam_channel::{Receiver, Sender};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// What the reader context reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelNotice {
    Message(ChannelMessage),
    /// Reported exactly once, after the last message. Carries the failure
    /// that closed the channel, or `None` for an orderly close.
    Closed(Option<CoreError>),
}

type Closer = Arc<dyn Fn() + Send + Sync>;

/// A running framed channel.
pub struct FramedChannel {
    name: String,
    outbound: Sender<ChannelMessage>,
    closer: Closer,
    closed_locally: Arc<AtomicBool>,
}

impl FramedChannel {
    /// Start reader and writer contexts over arbitrary transport halves.
    ///
    /// `closer` must make any blocked read on `reader` return promptly.
    pub fn spawn<R, W, C, F>(
        name: &str,
        reader: R,
        writer: W,
        closer: C,
        max_frame_len: u32,
        notify: F,
    ) -> io::Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
        C: Fn() + Send + Sync + 'static,
        F: FnMut(ChannelNotice) + Send + 'static,
    {
        let (outbound, outbound_rx) = crossbeam_channel::unbounded();
        let closer: Closer = Arc::new(closer);
        let closed_locally = Arc::new(AtomicBool::new(false));

        {
            let closer = closer.clone();
            let closed_locally = closed_locally.clone();
            let label = name.to_string();
            thread::Builder::new()
                .name(format!("{name}-reader"))
                .spawn(move || reader_loop(&label, reader, max_frame_len, &closer, &closed_locally, notify))?;
        }
        {
            let closer = closer.clone();
            let label = name.to_string();
            thread::Builder::new()
                .name(format!("{name}-writer"))
                .spawn(move || writer_loop(&label, writer, &outbound_rx, &closer))?;
        }

        log::debug!("Channel {} started", name);
        Ok(Self { name: name.to_string(), outbound, closer, closed_locally })
    }

    /// Start a channel over a connected TCP stream.
    pub fn over_tcp<F>(name: &str, stream: TcpStream, max_frame_len: u32, notify: F) -> io::Result<Self>
    where
        F: FnMut(ChannelNotice) + Send + 'static,
    {
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        Self::spawn(
            name,
            reader,
            stream,
            move || {
                let _ = control.shutdown(Shutdown::Both);
            },
            max_frame_len,
            notify,
        )
    }

    /// Label used in log lines.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a message for the writer context.
    pub fn send(&self, message: ChannelMessage) -> CoreResult<()> {
        if self.closed_locally.load(Ordering::SeqCst) {
            return Err(self.closed_error());
        }
        log::trace!("Channel {} queue {}", self.name, message.kind());
        self.outbound.send(message).map_err(|_| self.closed_error())
    }

    /// Close the transport. Any blocked read returns and the reader reports
    /// `Closed(None)`.
    pub fn shutdown(&self) {
        if !self.closed_locally.swap(true, Ordering::SeqCst) {
            log::debug!("Channel {} shutting down", self.name);
            (self.closer)();
        }
    }

    fn closed_error(&self) -> CoreError {
        CoreError::ConnectionError { identifier: self.name.clone(), message: "channel closed".to_string() }
    }
}

impl Drop for FramedChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn reader_loop<R: Read, F: FnMut(ChannelNotice)>(
    name: &str,
    reader: R,
    max_frame_len: u32,
    closer: &Closer,
    closed_locally: &AtomicBool,
    mut notify: F,
) {
    let mut failure = None;
    for item in MessageStream::new(reader, max_frame_len) {
        match item {
            Ok(message) => {
                log::trace!("Channel {} received {}", name, message.kind());
                notify(ChannelNotice::Message(message));
            }
            Err(e) => {
                closer();
                failure = Some(e);
            }
        }
    }
    // A failed read caused by our own shutdown is an orderly close.
    if closed_locally.load(Ordering::SeqCst) {
        failure = None;
    }
    match &failure {
        Some(e) => log::warn!("Channel {} closed: {}", name, e),
        None => log::debug!("Channel {} closed", name),
    }
    notify(ChannelNotice::Closed(failure));
}

fn writer_loop<W: Write>(name: &str, mut writer: W, outbound: &Receiver<ChannelMessage>, closer: &Closer) {
    for message in outbound {
        let frame = match codec::encode_message(&message) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Channel {} dropped unencodable {}: {}", name, message.kind(), e);
                continue;
            }
        };
        if let Err(e) = writer.write_all(&frame).and_then(|()| writer.flush()) {
            log::warn!("Channel {} write failed: {}", name, e);
            closer();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Duration;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_send_and_receive_over_tcp() {
        let (a, b) = tcp_pair();
        let (tx_a, rx_a) = crossbeam_channel::unbounded();
        let (tx_b, rx_b) = crossbeam_channel::unbounded();
        let left = FramedChannel::over_tcp("left", a, 1024, move |n| {
            let _ = tx_a.send(n);
        })
        .unwrap();
        let right = FramedChannel::over_tcp("right", b, 1024, move |n| {
            let _ = tx_b.send(n);
        })
        .unwrap();

        left.send(ChannelMessage::Continue).unwrap();
        left.send(ChannelMessage::Step { mode: StepMode::Over }).unwrap();
        let first = rx_b.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = rx_b.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first, ChannelNotice::Message(ChannelMessage::Continue));
        assert_eq!(second, ChannelNotice::Message(ChannelMessage::Step { mode: StepMode::Over }));

        right.send(ChannelMessage::Exited { code: 3 }).unwrap();
        assert_eq!(
            rx_a.recv_timeout(Duration::from_secs(2)).unwrap(),
            ChannelNotice::Message(ChannelMessage::Exited { code: 3 })
        );

        drop(right);
        assert_eq!(rx_b.recv_timeout(Duration::from_secs(2)).unwrap(), ChannelNotice::Closed(None));
        assert!(matches!(rx_a.recv_timeout(Duration::from_secs(2)).unwrap(), ChannelNotice::Closed(_)));
    }

    #[test]
    fn test_garbage_closes_channel_once() {
        let (mut raw, b) = tcp_pair();
        let (tx, rx) = crossbeam_channel::unbounded();
        let _channel = FramedChannel::over_tcp("victim", b, 64, move |n| {
            let _ = tx.send(n);
        })
        .unwrap();

        raw.write_all(&u32::MAX.to_be_bytes()).unwrap();
        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            ChannelNotice::Closed(Some(CoreError::ProtocolDesync(_))) => {}
            other => panic!("Expected desync close, got {:?}", other),
        }
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_send_after_shutdown_fails() {
        let (a, _b) = tcp_pair();
        let channel = FramedChannel::over_tcp("closing", a, 64, |_| {}).unwrap();
        channel.shutdown();
        assert!(matches!(channel.send(ChannelMessage::Stop), Err(CoreError::ConnectionError { .. })));
    }
}
