//! # Cell
//!
//! Purpose: A bounded sub-pool holding at most `capacity` connections. Cells
//! are the unit the pool grows and shrinks by.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Idle connections sit in a free-list and are
//!    reused before the factory dials a new one.
//! 2. **Minimal Locking**: The cell mutex is held only while moving idle
//!    connections or adjusting counters; dialing and pinging happen outside.
//! 3. **Lease Accounting**: `leased` counts connections handed out and not yet
//!    returned, so a cell is only closed when nobody holds one of its members.
//! 4. **Lazy Repair**: A cell flagged `Check` re-validates its idle members on
//!    the next acquisition instead of reconnecting eagerly.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use skv_common::SkvResult;

use crate::conn::Connection;

/// Builds a new, started connection for a cell.
pub type ConnectionFactory = Arc<dyn Fn() -> SkvResult<Connection> + Send + Sync>;

/// Lifecycle state of a cell slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellStatus {
    Stopped,
    Started,
}

/// Counters exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellStats {
    pub idle: usize,
    pub total: usize,
    pub leased: usize,
}

struct CellState {
    status: CellStatus,
    idle: Vec<Connection>,
    // Members alive in this cell: idle plus leased.
    total: usize,
    leased: usize,
}

/// Bounded sub-pool of connections.
pub struct Cell {
    index: usize,
    capacity: usize,
    check: AtomicBool,
    state: Mutex<CellState>,
    factory: ConnectionFactory,
}

impl Cell {
    /// Creates a stopped cell for slot `index`.
    pub fn new(index: usize, capacity: usize, factory: ConnectionFactory) -> Self {
        Cell {
            index,
            capacity: capacity.max(1),
            check: AtomicBool::new(false),
            state: Mutex::new(CellState {
                status: CellStatus::Stopped,
                idle: Vec::with_capacity(capacity),
                total: 0,
                leased: 0,
            }),
            factory,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn status(&self) -> CellStatus {
        self.state.lock().status
    }

    pub fn stats(&self) -> CellStats {
        let state = self.state.lock();
        CellStats {
            idle: state.idle.len(),
            total: state.total,
            leased: state.leased,
        }
    }

    /// Moves the cell to Started, dialing one warm connection first.
    ///
    /// A dial failure leaves the cell Stopped and returns the error, so a
    /// failed growth attempt never exposes an unreachable cell.
    pub fn start(&self) -> SkvResult<()> {
        if self.status() == CellStatus::Started {
            return Ok(());
        }
        let warm = (self.factory)()?;

        let mut state = self.state.lock();
        state.status = CellStatus::Started;
        self.check.store(false, Ordering::Release);
        if state.total < self.capacity {
            state.total += 1;
            state.idle.push(warm);
        } else {
            drop(state);
            let mut warm = warm;
            warm.close();
        }
        debug!(cell = self.index, "cell started");
        Ok(())
    }

    /// Leases an idle connection, or dials a new one while under capacity.
    ///
    /// Returns `Ok(None)` when the cell is stopped or every member is leased.
    pub fn get(&self) -> SkvResult<Option<Connection>> {
        {
            let mut state = self.state.lock();
            if state.status != CellStatus::Started {
                return Ok(None);
            }
            if let Some(conn) = state.idle.pop() {
                state.leased += 1;
                return Ok(Some(conn));
            }
            if state.total >= self.capacity {
                return Ok(None);
            }
            // Reserve the slot before dialing outside the lock.
            state.total += 1;
            state.leased += 1;
        }

        match (self.factory)() {
            Ok(conn) => Ok(Some(conn)),
            Err(err) => {
                let mut state = self.state.lock();
                state.total = state.total.saturating_sub(1);
                state.leased = state.leased.saturating_sub(1);
                Err(err)
            }
        }
    }

    /// Leases an open idle connection without dialing.
    ///
    /// Skips cells flagged for re-validation.
    pub fn take_idle(&self) -> Option<Connection> {
        if self.needs_check() {
            return None;
        }
        let mut state = self.state.lock();
        if state.status != CellStatus::Started {
            return None;
        }
        let pos = state.idle.iter().rposition(Connection::is_open)?;
        let conn = state.idle.swap_remove(pos);
        state.leased += 1;
        Some(conn)
    }

    /// Ends a lease and returns the connection to the free-list.
    ///
    /// A stopped cell discards the connection instead.
    pub fn put(&self, conn: Connection) {
        let mut state = self.state.lock();
        state.leased = state.leased.saturating_sub(1);
        if state.status == CellStatus::Started {
            state.idle.push(conn);
            return;
        }
        state.total = state.total.saturating_sub(1);
        drop(state);
        let mut conn = conn;
        conn.close();
    }

    /// Flags the cell so the next acquirer re-validates its idle members.
    pub fn mark_check(&self) {
        self.check.store(true, Ordering::Release);
    }

    pub fn needs_check(&self) -> bool {
        self.check.load(Ordering::Acquire)
    }

    /// Pings every idle member, restarting the unresponsive ones.
    ///
    /// The flag stays set if any restart failed.
    pub fn check_health(&self) {
        let mut idle = mem::take(&mut self.state.lock().idle);
        let mut failed = 0usize;
        for conn in idle.iter_mut() {
            if conn.is_open() && conn.ping() {
                continue;
            }
            if let Err(err) = conn.start() {
                warn!(cell = self.index, error = %err, "idle connection restart failed");
                failed += 1;
            }
        }

        let mut state = self.state.lock();
        if state.status == CellStatus::Started {
            state.idle.append(&mut idle);
        } else {
            state.total = state.total.saturating_sub(idle.len());
            drop(state);
            idle.iter_mut().for_each(Connection::close);
        }
        self.check.store(failed > 0, Ordering::Release);
    }

    /// Stops the cell if no member is leased. Returns true when it closed.
    pub fn check_close(&self) -> bool {
        let idle = {
            let mut state = self.state.lock();
            if state.status != CellStatus::Started || state.leased > 0 {
                return false;
            }
            state.status = CellStatus::Stopped;
            state.total = 0;
            mem::take(&mut state.idle)
        };
        let closed = idle.len();
        for mut conn in idle {
            conn.close();
        }
        debug!(cell = self.index, closed, "idle cell closed");
        true
    }

    /// Stops the cell unconditionally and closes its idle members.
    ///
    /// Leased members are discarded when they come back.
    pub fn close(&self) {
        let idle = {
            let mut state = self.state.lock();
            state.status = CellStatus::Stopped;
            let idle = mem::take(&mut state.idle);
            state.total = state.total.saturating_sub(idle.len());
            idle
        };
        for mut conn in idle {
            conn.close();
        }
    }
}

impl std::fmt::Debug for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell")
            .field("index", &self.index)
            .field("capacity", &self.capacity)
            .field("check", &self.needs_check())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use skv_common::{Config, SkvError};

    use crate::conn::ConnectionSettings;

    // Factory producing unopened connections, so no socket is needed.
    fn offline_factory(calls: Arc<AtomicUsize>) -> ConnectionFactory {
        let settings = Arc::new(ConnectionSettings::from(&Config::default()));
        Arc::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Connection::new(Arc::clone(&settings)))
        })
    }

    #[test]
    fn leases_never_exceed_capacity() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cell = Cell::new(0, 2, offline_factory(calls.clone()));
        cell.start().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let first = cell.get().unwrap().expect("warm connection");
        let second = cell.get().unwrap().expect("dialed connection");
        assert!(cell.get().unwrap().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cell.stats(), CellStats { idle: 0, total: 2, leased: 2 });

        cell.put(first);
        let again = cell.get().unwrap().expect("reused connection");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        cell.put(again);
        cell.put(second);
        assert_eq!(cell.stats(), CellStats { idle: 2, total: 2, leased: 0 });
    }

    #[test]
    fn stopped_cell_yields_nothing_and_discards_returns() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cell = Cell::new(3, 2, offline_factory(calls.clone()));
        assert!(cell.get().unwrap().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        cell.start().unwrap();
        let conn = cell.get().unwrap().unwrap();
        cell.close();
        cell.put(conn);
        assert_eq!(cell.stats(), CellStats { idle: 0, total: 0, leased: 0 });
    }

    #[test]
    fn check_close_waits_for_leases() {
        let cell = Cell::new(0, 2, offline_factory(Arc::new(AtomicUsize::new(0))));
        cell.start().unwrap();
        let conn = cell.get().unwrap().unwrap();
        assert!(!cell.check_close());
        assert_eq!(cell.status(), CellStatus::Started);

        cell.put(conn);
        assert!(cell.check_close());
        assert_eq!(cell.status(), CellStatus::Stopped);
        assert!(!cell.check_close());

        cell.start().unwrap();
        assert_eq!(cell.status(), CellStatus::Started);
        assert_eq!(cell.stats().total, 1);
    }

    #[test]
    fn failed_start_leaves_cell_stopped() {
        let factory: ConnectionFactory = Arc::new(|| Err(SkvError::closed()));
        let cell = Cell::new(1, 4, factory);
        assert!(cell.start().is_err());
        assert_eq!(cell.status(), CellStatus::Stopped);
    }

    #[test]
    fn failed_dial_releases_reservation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let settings = Arc::new(ConnectionSettings::from(&Config::default()));
        let counter = calls.clone();
        let factory: ConnectionFactory = Arc::new(move || {
            // First call warms the cell, later calls fail.
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Connection::new(Arc::clone(&settings)))
            } else {
                Err(SkvError::closed())
            }
        });
        let cell = Cell::new(0, 2, factory);
        cell.start().unwrap();
        let _warm = cell.get().unwrap().unwrap();
        assert!(cell.get().is_err());
        assert_eq!(cell.stats(), CellStats { idle: 0, total: 1, leased: 1 });
    }

    #[test]
    fn take_idle_skips_closed_and_flagged() {
        let cell = Cell::new(0, 2, offline_factory(Arc::new(AtomicUsize::new(0))));
        cell.start().unwrap();
        // Offline connections are never open.
        assert!(cell.take_idle().is_none());
        cell.mark_check();
        assert!(cell.needs_check());
        assert!(cell.take_idle().is_none());
    }
}
