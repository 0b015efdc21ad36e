//! Telemetry parser.
//!
//! Separates plain REPL text from numeric tuples embedded in the same serial
//! byte stream. With the default delimiters a line such as `(1, -2.5, 3)`
//! printed by the board becomes one sample; everything else is text.
//! A delimited buffer that does not decode is handed back as text verbatim.

use crate::config::TelemetryConfig;
use serde::{Deserialize, Serialize};

/// One structured numeric sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Strictly increasing per parser, starting at 0.
    pub sequence: u64,
    /// Comma-separated values between the markers.
    pub values: Vec<f64>,
}

/// Output of one `feed` call, in stream order.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    Text(Vec<u8>),
    Sample(TelemetrySample),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Text,
    Sample,
}

/// Stateful byte-stream scanner.
#[derive(Debug)]
pub struct TelemetryParser {
    start: Vec<u8>,
    /// `borders[i]`: longest proper prefix of `start[..=i]` that is also its suffix.
    borders: Vec<usize>,
    end: Vec<u8>,
    line_start_only: bool,
    max_sample_len: usize,
    state: State,
    /// Bytes of the start marker matched so far while in `Text`.
    matched: usize,
    at_line_start: bool,
    text: Vec<u8>,
    sample: Vec<u8>,
    next_sequence: u64,
}

impl TelemetryParser {
    /// The marker configuration must already be validated.
    pub fn new(config: &TelemetryConfig) -> Self {
        Self {
            start: config.start_marker.as_bytes().to_vec(),
            borders: prefix_borders(config.start_marker.as_bytes()),
            end: config.end_marker.as_bytes().to_vec(),
            line_start_only: config.line_start_only,
            max_sample_len: config.max_sample_len,
            state: State::Text,
            matched: 0,
            at_line_start: true,
            text: Vec::new(),
            sample: Vec::new(),
            next_sequence: 0,
        }
    }

    /// Sequence number the next sample will carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Scan a chunk. Text that might still turn into a start marker is held
    /// back until the next chunk decides it.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Parsed> {
        let mut out = Vec::new();
        for &byte in bytes {
            match self.state {
                State::Text => self.scan_text(byte, &mut out),
                State::Sample => self.scan_sample(byte, &mut out),
            }
        }
        self.flush_text(&mut out);
        out
    }

    /// Give back everything still buffered as text, e.g. when the
    /// connection closes mid-sample.
    pub fn finish(&mut self) -> Vec<Parsed> {
        let mut out = Vec::new();
        self.text.extend_from_slice(&self.start[..self.matched]);
        self.matched = 0;
        if self.state == State::Sample {
            self.abort_sample();
        }
        self.flush_text(&mut out);
        out
    }

    fn may_start_here(&self) -> bool {
        self.matched > 0 || !self.line_start_only || self.at_line_start
    }

    fn scan_text(&mut self, byte: u8, out: &mut Vec<Parsed>) {
        // Partial marker turned out to be text: give back the bytes that can
        // no longer begin a marker and keep the overlapping tail. In line
        // mode a marker cannot start once text has been seen on the line.
        while self.matched > 0 && byte != self.start[self.matched] {
            let keep = if self.line_start_only { 0 } else { self.borders[self.matched - 1] };
            self.text.extend_from_slice(&self.start[..self.matched - keep]);
            self.matched = keep;
            self.at_line_start = false;
        }
        if self.may_start_here() && byte == self.start[self.matched] {
            self.matched += 1;
            if self.matched == self.start.len() {
                self.matched = 0;
                self.flush_text(out);
                self.state = State::Sample;
            }
            return;
        }
        self.text.push(byte);
        self.at_line_start = byte == b'\n';
    }

    fn scan_sample(&mut self, byte: u8, out: &mut Vec<Parsed>) {
        if self.line_start_only && byte == b'\n' {
            self.abort_sample();
            self.text.push(byte);
            self.at_line_start = true;
            return;
        }
        self.sample.push(byte);
        if self.sample.ends_with(&self.end) {
            let body_len = self.sample.len() - self.end.len();
            match decode_tuple(&self.sample[..body_len]) {
                Some(values) => {
                    let sample = TelemetrySample { sequence: self.next_sequence, values };
                    self.next_sequence += 1;
                    self.sample.clear();
                    out.push(Parsed::Sample(sample));
                }
                None => self.abort_sample(),
            }
            self.state = State::Text;
            self.at_line_start = false;
        } else if self.sample.len() > self.max_sample_len {
            self.abort_sample();
            self.at_line_start = false;
        }
    }

    /// Move the start marker and the sample buffer back into the text stream.
    fn abort_sample(&mut self) {
        self.text.extend_from_slice(&self.start);
        self.text.append(&mut self.sample);
        self.state = State::Text;
    }

    fn flush_text(&mut self, out: &mut Vec<Parsed>) {
        if !self.text.is_empty() {
            out.push(Parsed::Text(std::mem::take(&mut self.text)));
        }
    }
}

fn prefix_borders(marker: &[u8]) -> Vec<usize> {
    let mut borders = vec![0; marker.len()];
    let mut k = 0;
    for i in 1..marker.len() {
        while k > 0 && marker[i] != marker[k] {
            k = borders[k - 1];
        }
        if marker[i] == marker[k] {
            k += 1;
        }
        borders[i] = k;
    }
    borders
}

/// Decode `1, -2.5, 3` into values. A single trailing comma is accepted so
/// one-element tuples print as they do on the board (`(1,)`).
fn decode_tuple(body: &[u8]) -> Option<Vec<f64>> {
    let text = std::str::from_utf8(body).ok()?;
    let mut tokens: Vec<&str> = text.split(',').map(str::trim).collect();
    if tokens.len() > 1 && tokens.last().is_some_and(|t| t.is_empty()) {
        tokens.pop();
    }
    let values = tokens.into_iter().map(parse_number).collect::<Option<Vec<_>>>()?;
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

/// Base-10 number with optional sign and fraction. No exponents, no
/// `inf`/`nan`.
fn parse_number(token: &str) -> Option<f64> {
    let unsigned = token.strip_prefix(['+', '-']).unwrap_or(token);
    let (int_part, frac_part) = match unsigned.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (unsigned, None),
    };
    let digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    let has_digits = !int_part.is_empty() || frac_part.is_some_and(|f| !f.is_empty());
    if !has_digits || !digits(int_part) || !frac_part.map_or(true, digits) {
        return None;
    }
    token.parse().ok()
}

/// Render `values` with the given delimiters, the way a board prints them.
pub fn encode_sample(values: &[f64], config: &TelemetryConfig) -> Vec<u8> {
    let body = values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
    format!("{}{}{}", config.start_marker, body, config.end_marker).into_bytes()
}
