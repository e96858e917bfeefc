//! # Leased Client
//!
//! Purpose: The handle callers run commands on. Wraps one pooled connection
//! and returns it to the pool on `close` or drop.
//!
//! ## Design Principles
//! 1. **RAII Leases**: Dropping a client releases its connection, so a lease
//!    can't leak on an early return.
//! 2. **Error Slot**: The last command error stays readable after the call.
//! 3. **Placeholder Clients**: `Connectors::get_client` never fails; the
//!    acquisition error surfaces on the first command instead.

use std::sync::Arc;
use std::time::Instant;

use skv_common::{SkvError, SkvResult};

use crate::arg::Arg;
use crate::connectors::{Parcel, PoolShared};
use crate::reply::Reply;

struct Lease {
    parcel: Parcel,
    pool: Arc<PoolShared>,
}

/// A connection leased from `Connectors`.
pub struct Client {
    lease: Option<Lease>,
    auto_close: bool,
    opened_at: Instant,
    // Set only on placeholders.
    acquire_error: Option<SkvError>,
    error: Option<SkvError>,
}

impl Client {
    pub(crate) fn leased(parcel: Parcel, pool: Arc<PoolShared>, auto_close: bool) -> Self {
        Client {
            lease: Some(Lease { parcel, pool }),
            auto_close,
            opened_at: Instant::now(),
            acquire_error: None,
            error: None,
        }
    }

    pub(crate) fn placeholder(err: SkvError) -> Self {
        Client {
            lease: None,
            auto_close: false,
            opened_at: Instant::now(),
            acquire_error: Some(err.clone()),
            error: Some(err),
        }
    }

    /// Runs one command and returns the parsed reply.
    ///
    /// With auto-close the lease is released after the command, whatever the
    /// outcome.
    pub fn exec(&mut self, args: &[Arg<'_>]) -> SkvResult<Reply> {
        let result = match self.lease.as_mut() {
            Some(lease) => lease.parcel.conn.exec(args),
            None => Err(self.acquire_error.clone().unwrap_or_else(SkvError::closed)),
        };
        if let Err(err) = &result {
            self.error = Some(err.clone());
        }
        if self.auto_close {
            self.close();
        }
        result
    }

    /// Sends `ping`; false on placeholders and released clients.
    pub fn ping(&mut self) -> bool {
        match self.lease.as_mut() {
            Some(lease) => lease.parcel.conn.ping(),
            None => false,
        }
    }

    /// True while leased and the connection is open.
    pub fn is_open(&self) -> bool {
        self.lease
            .as_ref()
            .map_or(false, |lease| lease.parcel.conn.is_open())
    }

    /// Returns the connection to the pool. Idempotent.
    pub fn close(&mut self) {
        if let Some(Lease { parcel, pool }) = self.lease.take() {
            pool.release(parcel, self.opened_at.elapsed());
        }
    }

    /// Last error seen by this client, or the acquisition error of a
    /// placeholder.
    pub fn error(&self) -> Option<&SkvError> {
        self.error.as_ref()
    }

    /// When the lease was granted.
    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Index of the cell that owns the leased connection.
    #[cfg(test)]
    pub(crate) fn cell_index(&self) -> Option<usize> {
        self.lease.as_ref().map(|lease| lease.parcel.cell.index())
    }

    /// Releases after every command when true.
    pub fn auto_close(&self) -> bool {
        self.auto_close
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("leased", &self.lease.is_some())
            .field("open", &self.is_open())
            .field("auto_close", &self.auto_close)
            .field("error", &self.error)
            .finish()
    }
}
