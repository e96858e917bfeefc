//! # Length-Framed Wire Codec
//!
//! Purpose: Encode commands and decode responses for the SSDB-style text
//! framing shared by the client and the test server.
//!
//! ## Wire Format
//!
//! ```text
//! <len>\n<len raw bytes>\n      one value (frame)
//! ...                           more values
//! \n                            terminator (a bare "\r\n" is accepted too)
//! ```
//!
//! `set k 12345` therefore travels as `3\nset\n1\nk\n5\n12345\n\n`.
//!
//! ## Design Principles
//! 1. **Streaming Parse**: The parser never consumes a partial packet; callers
//!    append bytes and retry.
//! 2. **Zero-Copy Values**: Parsed values are `Bytes` slices of the packet.
//! 3. **Bounded Write Buffer**: `FrameWriter` never grows past its capacity;
//!    overflow flushes to the sink first.
//! 4. **Fail Fast**: A malformed length token is a protocol error.

use std::io::{self, Write};

use bytes::{Bytes, BytesMut};

use crate::error::{SkvError, SkvResult};

const END_N: u8 = b'\n';
const END_R: u8 = b'\r';

/// Appends one frame (`len\npayload\n`) to `out`.
pub fn encode_frame(payload: &[u8], out: &mut Vec<u8>) {
    push_u64(out, payload.len() as u64);
    out.push(END_N);
    out.extend_from_slice(payload);
    out.push(END_N);
}

/// Encodes a complete packet: every value framed, then the terminator.
pub fn encode_frames<T: AsRef<[u8]>>(values: &[T], out: &mut Vec<u8>) {
    for value in values {
        encode_frame(value.as_ref(), out);
    }
    out.push(END_N);
}

/// Tries to parse one complete packet from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed; nothing is consumed in that
/// case. On success the packet (terminator included) is split off `buf` and
/// any trailing bytes stay for the next call. Blank lines before the first
/// value are skipped.
pub fn parse_frames(buf: &mut BytesMut) -> SkvResult<Option<Vec<Bytes>>> {
    let mut offset = 0;
    let mut spans: Vec<(usize, usize)> = Vec::new();

    loop {
        let idx = match buf[offset..].iter().position(|&b| b == END_N) {
            Some(idx) => idx,
            None => return Ok(None),
        };
        let line_end = offset + idx + 1;
        let line = &buf[offset..offset + idx];

        if line.is_empty() || line == [END_R] {
            if spans.is_empty() {
                offset = line_end;
                continue;
            }
            let packet = buf.split_to(line_end).freeze();
            let values = spans
                .iter()
                .map(|&(start, end)| packet.slice(start..end))
                .collect();
            return Ok(Some(values));
        }

        let size = parse_len(line)?;
        let start = line_end;
        let end = start
            .checked_add(size)
            .ok_or_else(|| SkvError::Protocol("frame length overflow".into()))?;
        // Payload plus its trailing newline must be buffered.
        if end >= buf.len() {
            return Ok(None);
        }
        if buf[end] != END_N {
            return Err(SkvError::Protocol(format!(
                "frame of {} bytes is not newline terminated",
                size
            )));
        }
        spans.push((start, end));
        offset = end + 1;
    }
}

fn parse_len(line: &[u8]) -> SkvResult<usize> {
    let mut value: usize = 0;
    for &b in line {
        if !b.is_ascii_digit() {
            return Err(SkvError::Protocol(format!(
                "bad length token {:?}",
                String::from_utf8_lossy(line)
            )));
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as usize))
            .ok_or_else(|| SkvError::Protocol("length token overflow".into()))?;
    }
    Ok(value)
}

/// Buffered command writer with a fixed capacity.
///
/// Small writes are copied into the buffer; a write that would reach the
/// capacity flushes the buffer to the sink first. This keeps one syscall per
/// command for the common case.
#[derive(Debug)]
pub struct FrameWriter {
    buf: Vec<u8>,
    capacity: usize,
}

impl FrameWriter {
    /// Smallest accepted capacity; anything below is bumped up.
    pub const MIN_CAPACITY: usize = 64;

    /// Creates a writer whose buffer holds at most `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(Self::MIN_CAPACITY);
        FrameWriter {
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Buffer capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently buffered (the write offset).
    pub fn offset(&self) -> usize {
        self.buf.len()
    }

    /// Drops buffered bytes without writing them.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Frees the buffer allocation; the next write reallocates lazily.
    pub fn release(&mut self) {
        self.buf = Vec::new();
    }

    /// Writes one frame for `payload`.
    pub fn write_frame<W: Write>(&mut self, sink: &mut W, payload: &[u8]) -> io::Result<()> {
        let mut digits = [0u8; 20];
        let len = format_u64(payload.len() as u64, &mut digits);
        self.write(sink, &digits[..len])?;
        self.write(sink, &[END_N])?;
        self.write(sink, payload)?;
        self.write(sink, &[END_N])
    }

    /// Writes the packet terminator and flushes everything to the sink.
    pub fn finish<W: Write>(&mut self, sink: &mut W) -> io::Result<()> {
        self.write(sink, &[END_N])?;
        self.flush(sink)
    }

    fn write<W: Write>(&mut self, sink: &mut W, bytes: &[u8]) -> io::Result<()> {
        if self.buf.len() + bytes.len() < self.capacity {
            self.buf.extend_from_slice(bytes);
            return Ok(());
        }
        self.flush(sink)?;
        if bytes.len() < self.capacity {
            self.buf.extend_from_slice(bytes);
            Ok(())
        } else {
            sink.write_all(bytes)
        }
    }

    fn flush<W: Write>(&mut self, sink: &mut W) -> io::Result<()> {
        if !self.buf.is_empty() {
            sink.write_all(&self.buf)?;
            self.buf.clear();
        }
        sink.flush()
    }
}

/// Appends the decimal form of `value` without allocating.
pub fn push_u64(out: &mut Vec<u8>, value: u64) {
    let mut digits = [0u8; 20];
    let len = format_u64(value, &mut digits);
    out.extend_from_slice(&digits[..len]);
}

/// Appends the decimal form of a signed `value` without allocating.
pub fn push_i64(out: &mut Vec<u8>, value: i64) {
    if value < 0 {
        out.push(b'-');
    }
    push_u64(out, value.unsigned_abs());
}

fn format_u64(mut value: u64, buf: &mut [u8; 20]) -> usize {
    // Digits land in reverse, then get flipped in place.
    if value == 0 {
        buf[0] = b'0';
        return 1;
    }
    let mut len = 0;
    while value > 0 {
        buf[len] = b'0' + (value % 10) as u8;
        value /= 10;
        len += 1;
    }
    buf[..len].reverse();
    len
}
