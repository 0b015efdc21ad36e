#![allow(clippy::unreadable_literal)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::significant_drop_tightening)]

use crossbeam_channel::Receiver;
use minnow_core::channel::{encode_frame, encode_message, BreakpointLocation, ChannelNotice, StepMode};
use minnow_core::{ChannelMessage, CoreError, FramedChannel};
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

const MAX_FRAME: u32 = 64 * 1024;
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

fn channel_over(stream: TcpStream) -> (FramedChannel, Receiver<ChannelNotice>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let channel = FramedChannel::over_tcp("test", stream, MAX_FRAME, move |notice| {
        let _ = tx.send(notice);
    })
    .unwrap();
    (channel, rx)
}

fn conversation() -> Vec<ChannelMessage> {
    vec![
        ChannelMessage::SetBreakpoints {
            breakpoints: vec![
                BreakpointLocation { file: "main.mw".into(), line: 3 },
                BreakpointLocation { file: "main.mw".into(), line: 12 },
            ],
        },
        ChannelMessage::Step { mode: StepMode::Over },
        ChannelMessage::Continue,
        ChannelMessage::Error { message: "héllo wörld ✓".into() },
        ChannelMessage::Exited { code: 0 },
        ChannelMessage::Stop,
    ]
}

fn expect_messages(rx: &Receiver<ChannelNotice>, expected: &[ChannelMessage]) {
    for want in expected {
        match rx.recv_timeout(RECV_TIMEOUT).expect("message arrives") {
            ChannelNotice::Message(got) => assert_eq!(&got, want),
            other => panic!("Expected {:?}, got {:?}", want, other),
        }
    }
}

#[test]
fn test_byte_at_a_time_delivery() {
    let (mut raw, peer) = tcp_pair();
    raw.set_nodelay(true).unwrap();
    let (_channel, rx) = channel_over(peer);

    let messages = conversation();
    let bytes: Vec<u8> = messages.iter().flat_map(|m| encode_message(m).unwrap()).collect();
    let writer = thread::spawn(move || {
        for byte in bytes {
            raw.write_all(&[byte]).unwrap();
        }
        raw
    });

    expect_messages(&rx, &messages);
    drop(writer.join().unwrap());
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), ChannelNotice::Closed(None));
}

#[test]
fn test_irregular_chunks_and_many_frames_per_write() {
    let (mut raw, peer) = tcp_pair();
    let (_channel, rx) = channel_over(peer);

    let messages: Vec<ChannelMessage> = conversation().into_iter().cycle().take(60).collect();
    let bytes: Vec<u8> = messages.iter().flat_map(|m| encode_message(m).unwrap()).collect();
    let sizes = [1usize, 7, 3, 64, 2, 500, 13];
    let writer = thread::spawn(move || {
        let mut offset = 0;
        for size in sizes.iter().cycle() {
            if offset >= bytes.len() {
                break;
            }
            let end = (offset + size).min(bytes.len());
            raw.write_all(&bytes[offset..end]).unwrap();
            offset = end;
            thread::sleep(Duration::from_micros(200));
        }
        raw
    });

    expect_messages(&rx, &messages);
    drop(writer.join().unwrap());
}

#[test]
fn test_two_channels_talk_both_ways() {
    let (a, b) = tcp_pair();
    let (left, left_rx) = channel_over(a);
    let (right, right_rx) = channel_over(b);

    for message in conversation() {
        left.send(message).unwrap();
    }
    right.send(ChannelMessage::Continue).unwrap();

    expect_messages(&right_rx, &conversation());
    expect_messages(&left_rx, &[ChannelMessage::Continue]);

    left.shutdown();
    assert_eq!(left_rx.recv_timeout(RECV_TIMEOUT).unwrap(), ChannelNotice::Closed(None));
    assert_eq!(right_rx.recv_timeout(RECV_TIMEOUT).unwrap(), ChannelNotice::Closed(None));
    assert!(left.send(ChannelMessage::Stop).is_err());
}

#[test]
fn test_oversized_frame_desyncs_channel() {
    let (mut raw, peer) = tcp_pair();
    let (_channel, rx) = channel_over(peer);

    raw.write_all(&encode_message(&ChannelMessage::Continue).unwrap()).unwrap();
    raw.write_all(&(MAX_FRAME + 1).to_be_bytes()).unwrap();

    expect_messages(&rx, &[ChannelMessage::Continue]);
    match rx.recv_timeout(RECV_TIMEOUT).unwrap() {
        ChannelNotice::Closed(Some(CoreError::ProtocolDesync(_))) => {}
        other => panic!("Expected desync, got {:?}", other),
    }
    // Nothing follows the close notice.
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn test_malformed_payload_closes_with_error() {
    let (mut raw, peer) = tcp_pair();
    let (_channel, rx) = channel_over(peer);

    raw.write_all(&encode_frame(br#"{"kind":"evt.nonsense","body":{}}"#).unwrap()).unwrap();
    match rx.recv_timeout(RECV_TIMEOUT).unwrap() {
        ChannelNotice::Closed(Some(_)) => {}
        other => panic!("Expected failure close, got {:?}", other),
    }
}
