//! # Command Arguments
//!
//! Purpose: Turn typed Rust values into the raw bytes of one wire frame.
//!
//! ## Framing Rules
//! - integers: decimal text
//! - floats: shortest text that round-trips
//! - booleans: `1` / `0`
//! - `SystemTime`: Unix seconds
//! - `Duration`: nanoseconds
//! - strings and byte buffers: as-is
//! - `None` / `Arg::Nil`: empty value
//! - structured values: handed to the pluggable `ArgEncoder`, only when the
//!   connection has encoding enabled

use std::borrow::Cow;
use std::io::Write;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::Serialize;

use skv_common::{push_i64, push_u64, SkvError, SkvResult};

/// Serializer for argument types with no built-in framing rule.
pub trait ArgEncoder: Send + Sync {
    /// Encodes a structured value into frame bytes.
    fn encode(&self, value: &serde_json::Value) -> SkvResult<Vec<u8>>;
}

/// Default encoder: compact JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonEncoder;

impl ArgEncoder for JsonEncoder {
    fn encode(&self, value: &serde_json::Value) -> SkvResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|err| SkvError::ArgumentType(err.to_string()))
    }
}

/// One command argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg<'a> {
    /// Raw bytes or UTF-8 text.
    Bytes(Cow<'a, [u8]>),
    /// Reference-counted buffer, framed without copying.
    Shared(Bytes),
    Int(i64),
    Uint(u64),
    Float(f64),
    Float32(f32),
    Bool(bool),
    Time(SystemTime),
    Duration(Duration),
    Nil,
    /// Needs an `ArgEncoder`.
    Structured(serde_json::Value),
}

impl<'a> Arg<'a> {
    /// Builds a structured argument from any serializable value.
    pub fn structured<T: Serialize + ?Sized>(value: &T) -> SkvResult<Arg<'static>> {
        serde_json::to_value(value)
            .map(Arg::Structured)
            .map_err(|err| SkvError::ArgumentType(err.to_string()))
    }

    /// True when framing this argument requires an encoder.
    pub fn needs_encoder(&self) -> bool {
        matches!(self, Arg::Structured(_))
    }

    /// Returns the frame payload for this argument.
    ///
    /// Text forms are rendered into `scratch`; byte variants borrow directly.
    /// Structured values fail with `ArgumentType` when `encoder` is `None`.
    pub fn encode<'s>(
        &'s self,
        scratch: &'s mut Vec<u8>,
        encoder: Option<&dyn ArgEncoder>,
    ) -> SkvResult<&'s [u8]> {
        scratch.clear();
        match self {
            Arg::Bytes(data) => return Ok(data.as_ref()),
            Arg::Shared(data) => return Ok(data.as_ref()),
            Arg::Int(value) => push_i64(scratch, *value),
            Arg::Uint(value) => push_u64(scratch, *value),
            Arg::Float(value) => write_display(scratch, value),
            Arg::Float32(value) => write_display(scratch, value),
            Arg::Bool(value) => scratch.push(if *value { b'1' } else { b'0' }),
            Arg::Time(at) => push_i64(scratch, unix_seconds(*at)),
            Arg::Duration(span) => write_display(scratch, &span.as_nanos()),
            Arg::Nil => {}
            Arg::Structured(value) => match encoder {
                Some(encoder) => *scratch = encoder.encode(value)?,
                None => {
                    return Err(SkvError::ArgumentType(
                        "structured argument without encoding enabled".into(),
                    ))
                }
            },
        }
        Ok(scratch.as_slice())
    }
}

fn write_display<T: std::fmt::Display>(out: &mut Vec<u8>, value: &T) {
    // Writing into a Vec cannot fail.
    let _ = write!(out, "{}", value);
}

fn unix_seconds(at: SystemTime) -> i64 {
    match at.duration_since(UNIX_EPOCH) {
        Ok(since) => since.as_secs() as i64,
        Err(before) => -(before.duration().as_secs() as i64),
    }
}

impl<'a> From<&'a str> for Arg<'a> {
    fn from(value: &'a str) -> Self {
        Arg::Bytes(Cow::Borrowed(value.as_bytes()))
    }
}

impl<'a> From<&'a String> for Arg<'a> {
    fn from(value: &'a String) -> Self {
        Arg::Bytes(Cow::Borrowed(value.as_bytes()))
    }
}

impl From<String> for Arg<'static> {
    fn from(value: String) -> Self {
        Arg::Bytes(Cow::Owned(value.into_bytes()))
    }
}

impl<'a> From<&'a [u8]> for Arg<'a> {
    fn from(value: &'a [u8]) -> Self {
        Arg::Bytes(Cow::Borrowed(value))
    }
}

impl<'a, const N: usize> From<&'a [u8; N]> for Arg<'a> {
    fn from(value: &'a [u8; N]) -> Self {
        Arg::Bytes(Cow::Borrowed(&value[..]))
    }
}

impl From<Vec<u8>> for Arg<'static> {
    fn from(value: Vec<u8>) -> Self {
        Arg::Bytes(Cow::Owned(value))
    }
}

impl From<Bytes> for Arg<'static> {
    fn from(value: Bytes) -> Self {
        Arg::Shared(value)
    }
}

macro_rules! impl_from_signed {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Arg<'static> {
            fn from(value: $ty) -> Self {
                Arg::Int(value as i64)
            }
        })*
    };
}

macro_rules! impl_from_unsigned {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Arg<'static> {
            fn from(value: $ty) -> Self {
                Arg::Uint(value as u64)
            }
        })*
    };
}

impl_from_signed!(i8, i16, i32, i64, isize);
impl_from_unsigned!(u8, u16, u32, u64, usize);

impl From<f64> for Arg<'static> {
    fn from(value: f64) -> Self {
        Arg::Float(value)
    }
}

impl From<f32> for Arg<'static> {
    fn from(value: f32) -> Self {
        Arg::Float32(value)
    }
}

impl From<bool> for Arg<'static> {
    fn from(value: bool) -> Self {
        Arg::Bool(value)
    }
}

impl From<SystemTime> for Arg<'static> {
    fn from(value: SystemTime) -> Self {
        Arg::Time(value)
    }
}

impl From<Duration> for Arg<'static> {
    fn from(value: Duration) -> Self {
        Arg::Duration(value)
    }
}

impl From<serde_json::Value> for Arg<'static> {
    fn from(value: serde_json::Value) -> Self {
        Arg::Structured(value)
    }
}

impl<'a, T: Into<Arg<'a>>> From<Option<T>> for Arg<'a> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => value.into(),
            None => Arg::Nil,
        }
    }
}

/// Builds a `Vec<Arg>` from heterogeneous values.
///
/// ```
/// use skv_client::args;
/// let cmd = args!["set", "counter", 12345];
/// assert_eq!(cmd.len(), 3);
/// ```
#[macro_export]
macro_rules! args {
    ($($value:expr),* $(,)?) => {
        vec![$($crate::Arg::from($value)),*]
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use skv_common::{parse_frames, FrameWriter};

    fn payload(arg: Arg<'_>) -> Vec<u8> {
        let mut scratch = Vec::new();
        arg.encode(&mut scratch, Some(&JsonEncoder)).unwrap().to_vec()
    }

    fn framed(arg: Arg<'_>) -> Vec<u8> {
        let mut scratch = Vec::new();
        let mut writer = FrameWriter::with_capacity(256);
        let mut sink = Vec::new();
        let bytes = arg.encode(&mut scratch, None).unwrap();
        writer.write_frame(&mut sink, bytes).unwrap();
        writer.finish(&mut sink).unwrap();
        sink
    }

    #[test]
    fn integer_frames_as_decimal() {
        let wire = framed(Arg::from(12345));
        assert_eq!(&wire, b"5\n12345\n\n");

        let mut buf = bytes::BytesMut::from(&wire[..]);
        let values = parse_frames(&mut buf).unwrap().unwrap();
        let parsed: i64 = std::str::from_utf8(&values[0]).unwrap().parse().unwrap();
        assert_eq!(parsed, 12345);
    }

    #[test]
    fn bool_frames_as_digit() {
        let wire = framed(Arg::from(true));
        assert_eq!(&wire, b"1\n1\n\n");

        let mut buf = bytes::BytesMut::from(&wire[..]);
        let values = parse_frames(&mut buf).unwrap().unwrap();
        assert_eq!(&values[0][..], b"1");
        assert_eq!(payload(Arg::from(false)), b"0");
    }

    #[test]
    fn negative_and_unsigned_integers() {
        assert_eq!(payload(Arg::from(-7i8)), b"-7");
        assert_eq!(payload(Arg::from(u64::MAX)), b"18446744073709551615");
        assert_eq!(payload(Arg::from(0usize)), b"0");
    }

    #[test]
    fn floats_use_shortest_round_trip_text() {
        assert_eq!(payload(Arg::from(0.1f64)), b"0.1");
        assert_eq!(payload(Arg::from(2.5f32)), b"2.5");
        assert_eq!(payload(Arg::from(3.0f64)), b"3");
        let text = payload(Arg::from(1.0f64 / 3.0));
        let back: f64 = std::str::from_utf8(&text).unwrap().parse().unwrap();
        assert_eq!(back, 1.0 / 3.0);
    }

    #[test]
    fn time_and_duration_units() {
        let at = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        assert_eq!(payload(Arg::from(at)), b"1700000000");
        assert_eq!(payload(Arg::from(Duration::from_millis(3))), b"3000000");
    }

    #[test]
    fn text_bytes_and_nil_pass_through() {
        assert_eq!(payload(Arg::from("key")), b"key");
        assert_eq!(payload(Arg::from(vec![0u8, 255])), vec![0u8, 255]);
        assert_eq!(payload(Arg::from(Bytes::from_static(b"shared"))), b"shared");
        assert_eq!(payload(Arg::from(None::<&str>)), b"");
        assert_eq!(payload(Arg::from(Some("x"))), b"x");
    }

    #[test]
    fn structured_requires_encoder() {
        #[derive(Serialize)]
        struct Point {
            x: i32,
            y: i32,
        }

        let arg = Arg::structured(&Point { x: 1, y: 2 }).unwrap();
        assert!(arg.needs_encoder());

        let mut scratch = Vec::new();
        let err = arg.encode(&mut scratch, None).unwrap_err();
        assert!(matches!(err, SkvError::ArgumentType(_)));

        assert_eq!(payload(arg), br#"{"x":1,"y":2}"#);
    }

    #[test]
    fn args_macro_mixes_types() {
        let cmd = args!["zset", "board", "alice", 42u32, 1.5f64, true];
        assert_eq!(cmd.len(), 6);
        assert_eq!(cmd[3], Arg::Uint(42));
        assert_eq!(cmd[5], Arg::Bool(true));
    }
}
