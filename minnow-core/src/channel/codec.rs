//! Length-prefixed framing.
//!
//! `[4-byte big-endian length][payload]`. The decoder accumulates bytes until
//! a whole frame is buffered, so the way a stream is chunked never changes
//! the decoded sequence.

use super::message::ChannelMessage;
use crate::error::{CoreError, CoreResult};
use std::io::{ErrorKind, Read};

/// Width of the length prefix in bytes.
pub const LENGTH_PREFIX: usize = 4;

const READ_CHUNK: usize = 4096;

/// Prefix `payload` with its length.
pub fn encode_frame(payload: &[u8]) -> CoreResult<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| CoreError::ProtocolDesync(format!("Payload of {} bytes does not fit a frame", payload.len())))?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Encode a message into a complete frame.
pub fn encode_message(message: &ChannelMessage) -> CoreResult<Vec<u8>> {
    encode_frame(&message.encode()?)
}

/// Incremental frame decoder.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_len: u32,
}

impl FrameDecoder {
    /// Frames larger than `max_len` bytes are refused.
    pub fn new(max_len: u32) -> Self {
        Self { buffer: Vec::new(), max_len }
    }

    /// Append received bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes received but not yet consumed by a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pop the next complete payload, if one is buffered.
    pub fn next_frame(&mut self) -> CoreResult<Option<Vec<u8>>> {
        if self.buffer.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let mut prefix = [0u8; LENGTH_PREFIX];
        prefix.copy_from_slice(&self.buffer[..LENGTH_PREFIX]);
        let len = u32::from_be_bytes(prefix);
        if len > self.max_len {
            return Err(CoreError::ProtocolDesync(format!(
                "Frame length {} exceeds limit {}",
                len, self.max_len
            )));
        }
        let end = LENGTH_PREFIX + len as usize;
        if self.buffer.len() < end {
            return Ok(None);
        }
        let payload = self.buffer[LENGTH_PREFIX..end].to_vec();
        self.buffer.drain(..end);
        Ok(Some(payload))
    }

    /// Called when the transport reports end of stream.
    pub fn finish(&self) -> CoreResult<()> {
        if self.buffer.is_empty() {
            Ok(())
        } else {
            Err(CoreError::ProtocolDesync(format!(
                "{} trailing bytes at end of stream",
                self.buffer.len()
            )))
        }
    }
}

/// Lazy sequence of decoded messages read from a byte transport.
///
/// Ends when the transport closes. The first error (desync or I/O failure)
/// is yielded once and terminates the sequence. Read timeouts are retried,
/// so a transport with a read timeout can be polled without losing state.
pub struct MessageStream<R> {
    reader: R,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
    done: bool,
}

impl<R: Read> MessageStream<R> {
    /// Read framed messages from `reader`.
    pub fn new(reader: R, max_frame_len: u32) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(max_frame_len),
            chunk: vec![0u8; READ_CHUNK],
            done: false,
        }
    }

    fn fail(&mut self, err: CoreError) -> Option<CoreResult<ChannelMessage>> {
        self.done = true;
        Some(Err(err))
    }
}

impl<R: Read> Iterator for MessageStream<R> {
    type Item = CoreResult<ChannelMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.decoder.next_frame() {
                Ok(Some(payload)) => {
                    return match ChannelMessage::decode(&payload) {
                        Ok(message) => Some(Ok(message)),
                        Err(e) => self.fail(e),
                    };
                }
                Ok(None) => {}
                Err(e) => return self.fail(e),
            }

            match self.reader.read(&mut self.chunk) {
                Ok(0) => {
                    self.done = true;
                    return self.decoder.finish().err().map(Err);
                }
                Ok(n) => {
                    let (head, _) = self.chunk.split_at(n);
                    self.decoder.feed(head);
                }
                Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) => {
                    return self.fail(CoreError::ConnectionError {
                        identifier: "channel".to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}
