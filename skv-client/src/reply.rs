//! Parsed server response: the status token followed by payload values.

use bytes::Bytes;

/// Status token for a successful command.
pub const STATUS_OK: &str = "ok";
/// Status token for a missing key.
pub const STATUS_NOT_FOUND: &str = "not_found";

/// One response packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    values: Vec<Bytes>,
}

impl Reply {
    pub fn new(values: Vec<Bytes>) -> Self {
        Reply { values }
    }

    /// First value, conventionally the status token.
    pub fn status(&self) -> Option<&str> {
        self.values
            .first()
            .and_then(|status| std::str::from_utf8(status).ok())
    }

    /// True when the status token is `ok`.
    pub fn is_ok(&self) -> bool {
        self.status() == Some(STATUS_OK)
    }

    /// True when the status token is `not_found`.
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(STATUS_NOT_FOUND)
    }

    /// All values including the status token.
    pub fn values(&self) -> &[Bytes] {
        &self.values
    }

    /// Values after the status token.
    pub fn data(&self) -> &[Bytes] {
        self.values.get(1..).unwrap_or(&[])
    }

    /// Value at `idx` (0 is the status token).
    pub fn get(&self, idx: usize) -> Option<&Bytes> {
        self.values.get(idx)
    }

    /// Value at `idx` as UTF-8 text.
    pub fn get_str(&self, idx: usize) -> Option<&str> {
        self.get(idx).and_then(|value| std::str::from_utf8(value).ok())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> Vec<Bytes> {
        self.values
    }
}
