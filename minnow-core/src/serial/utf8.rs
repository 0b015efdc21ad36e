//! Incremental lossy UTF-8 decoding.

/// Turns byte chunks into text without ever failing. Invalid sequences
/// become U+FFFD; a multi-byte character split across chunks is held back
/// until its tail arrives.
#[derive(Debug, Default)]
pub struct LossyUtf8Decoder {
    pending: Vec<u8>,
}

impl LossyUtf8Decoder {
    /// A decoder with nothing pending.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `bytes`, holding back an incomplete trailing sequence.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let keep = incomplete_tail(&self.pending);
        let split = self.pending.len() - keep;
        let text = String::from_utf8_lossy(&self.pending[..split]).into_owned();
        self.pending.drain(..split);
        text
    }

    /// Flush a dangling partial character as a replacement character.
    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Length of a trailing, possibly-valid but unfinished UTF-8 sequence.
fn incomplete_tail(bytes: &[u8]) -> usize {
    // A sequence is at most 4 bytes, so only the last 3 can be unfinished.
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let needed = match byte {
            0xC2..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF4 => 4,
            _ => return 0,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_multibyte_character() {
        let mut decoder = LossyUtf8Decoder::new();
        let bytes = "°C".as_bytes();
        assert_eq!(decoder.decode(&bytes[..1]), "");
        assert_eq!(decoder.decode(&bytes[1..]), "°C");
    }

    #[test]
    fn test_invalid_bytes_become_replacement() {
        let mut decoder = LossyUtf8Decoder::new();
        assert_eq!(decoder.decode(&[b'o', b'k', 0xFF, b'!']), "ok\u{FFFD}!");
    }

    #[test]
    fn test_finish_flushes_partial() {
        let mut decoder = LossyUtf8Decoder::new();
        assert_eq!(decoder.decode(&[0xE2, 0x82]), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_ansi_passthrough() {
        let mut decoder = LossyUtf8Decoder::new();
        assert_eq!(decoder.decode(b"\x1B[31mred"), "\x1B[31mred");
    }
}
