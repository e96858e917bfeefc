//! # Connectors
//!
//! Purpose: The adaptive pool. Owns a slot-stable array of cells, grows by a
//! cell when acquirers find every cell exhausted, parks overflow acquirers in
//! a bounded wait queue, and lets a background health loop shrink the pool
//! back toward its minimum when load drops.
//!
//! ## Design Principles
//! 1. **No Pool-Wide Lock on the Hot Path**: Acquire and release touch only
//!    atomics, one cell mutex, and the wait queue when someone is waiting.
//! 2. **Slot Stability**: Cells are created lazily into `OnceLock` slots and
//!    never freed, so a lease can always find its cell again.
//! 3. **Serialized Resizing**: Growth and shrink both run under `grow_lock`;
//!    only the health loop shrinks.
//! 4. **Direct Hand-Off**: A released connection goes straight to the oldest
//!    waiter instead of through the free-list.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use skv_common::{Config, SkvError, SkvResult};

use crate::arg::{ArgEncoder, JsonEncoder};
use crate::cell::{Cell, ConnectionFactory};
use crate::client::Client;
use crate::conn::{Connection, ConnectionSettings};
use crate::health::HealthHandle;
use crate::metrics::{PoolInfo, PoolMetrics};
use crate::waiters::WaitQueue;

/// Back-off after a failed growth attempt in the health loop.
const GROW_BACKOFF: Duration = Duration::from_millis(10);

/// Lifecycle state of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    Stopped,
    Started,
}

/// A leased connection together with the cell it belongs to.
pub(crate) struct Parcel {
    pub(crate) conn: Connection,
    pub(crate) cell: Arc<Cell>,
}

/// State shared by the pool handle, its clients and the health thread.
pub(crate) struct PoolShared {
    config: Config,
    factory: ConnectionFactory,
    cell_min: usize,
    cell_max: usize,
    cell_pos: AtomicUsize,
    started: AtomicBool,
    cells: Box<[OnceLock<Arc<Cell>>]>,
    grow_lock: Mutex<()>,
    round: AtomicUsize,
    active: AtomicUsize,
    shrink_every: u64,
    waiters: WaitQueue<Parcel>,
    metrics: PoolMetrics,
}

impl PoolShared {
    fn new(config: Config, encoder: Arc<dyn ArgEncoder>) -> Self {
        let settings = Arc::new(ConnectionSettings::from_config(&config, encoder));
        let factory: ConnectionFactory =
            Arc::new(move || Connection::connect(Arc::clone(&settings)));
        let cell_max = config.cell_max();
        let cell_min = config.cell_min();
        let cells = (0..cell_max).map(|_| OnceLock::new()).collect();
        let tick = config.health_tick.as_nanos().max(1);
        let shrink_every = u64::try_from(config.health_interval.as_nanos() / tick)
            .unwrap_or(u64::MAX)
            .max(1);
        let waiters = WaitQueue::new(config.max_wait_size);

        PoolShared {
            config,
            factory,
            cell_min,
            cell_max,
            cell_pos: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            cells,
            grow_lock: Mutex::new(()),
            round: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            shrink_every,
            waiters,
            metrics: PoolMetrics::new(),
        }
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    fn cell(&self, idx: usize) -> Option<&Arc<Cell>> {
        self.cells.get(idx).and_then(OnceLock::get)
    }

    /// Provisions `cell_min` cells and marks the pool Started.
    ///
    /// On failure every cell started here is closed again and the pool stays
    /// Stopped.
    fn open(&self) -> SkvResult<()> {
        let _grow = self.grow_lock.lock();
        self.waiters.reopen();
        self.metrics.take();
        self.round.store(0, Ordering::Relaxed);
        self.cell_pos.store(0, Ordering::Release);

        for idx in 0..self.cell_min {
            if let Err(err) = self.start_cell(idx) {
                for started in 0..idx {
                    if let Some(cell) = self.cell(started) {
                        cell.close();
                    }
                }
                self.cell_pos.store(0, Ordering::Release);
                return Err(err);
            }
            self.cell_pos.store(idx + 1, Ordering::Release);
        }
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    /// Marks the pool Stopped, fails every waiter and closes every cell.
    fn shutdown(&self) -> bool {
        if !self.started.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.waiters.close();
        let _grow = self.grow_lock.lock();
        for cell in self.cells.iter().filter_map(OnceLock::get) {
            cell.close();
        }
        self.cell_pos.store(0, Ordering::Release);
        true
    }

    fn start_cell(&self, idx: usize) -> SkvResult<()> {
        let cell = self.cells[idx].get_or_init(|| {
            Arc::new(Cell::new(idx, self.config.pool_size, Arc::clone(&self.factory)))
        });
        cell.start()
    }

    /// Activates the next cell slot. Returns false when already at `cell_max`.
    fn append_cell(&self) -> SkvResult<bool> {
        let _grow = self.grow_lock.lock();
        if !self.is_started() {
            return Ok(false);
        }
        let pos = self.cell_pos.load(Ordering::Acquire);
        if pos >= self.cell_max {
            return Ok(false);
        }
        self.start_cell(pos)?;
        self.cell_pos.store(pos + 1, Ordering::Release);
        debug!(cell_pos = pos + 1, cell_max = self.cell_max, "pool grew");
        Ok(true)
    }

    /// Acquires a connection and wraps it in a leased `Client`.
    pub(crate) fn acquire(self: &Arc<Self>, auto_close: bool) -> SkvResult<Client> {
        if !self.is_started() {
            return Err(SkvError::NotStarted);
        }
        let began = Instant::now();
        self.metrics.record_acquire();

        let parcel = match self.probe() {
            Some(parcel) => {
                self.metrics.record_create_time(began.elapsed());
                parcel
            }
            None => self.acquire_slow(began)?,
        };
        self.active.fetch_add(1, Ordering::AcqRel);
        Ok(Client::leased(parcel, Arc::clone(self), auto_close))
    }

    /// Two round-robin probes over the active cells.
    fn probe(&self) -> Option<Parcel> {
        let pos = self.cell_pos.load(Ordering::Acquire);
        if pos == 0 {
            return None;
        }
        let mut pi = self.round.load(Ordering::Relaxed);
        for attempt in 0..2 {
            if attempt > 0 {
                thread::yield_now();
                pi += 1;
            }
            if pi >= pos {
                pi = 0;
            }
            let cell = match self.cell(pi) {
                Some(cell) => cell,
                None => continue,
            };
            let conn = match cell.get() {
                Ok(Some(conn)) => conn,
                Ok(None) => continue,
                Err(err) => {
                    warn!(cell = pi, error = %err, "connection factory failed");
                    continue;
                }
            };
            match validate(cell, conn) {
                Ok(conn) => {
                    self.round.store(cell.index(), Ordering::Relaxed);
                    return Some(Parcel {
                        conn,
                        cell: Arc::clone(cell),
                    });
                }
                Err(conn) => cell.put(conn),
            }
        }
        None
    }

    /// Slow path: fail fast when the queue is full, grow once, then wait.
    fn acquire_slow(&self, began: Instant) -> SkvResult<Parcel> {
        let waiting = self.waiters.len();
        if waiting >= self.waiters.capacity() {
            return Err(SkvError::Busy { waiting });
        }

        if self.cell_pos.load(Ordering::Acquire) < self.cell_max {
            match self.append_cell() {
                Ok(_) => {
                    if let Some(parcel) = self.probe() {
                        self.metrics.record_create_time(began.elapsed());
                        return Ok(parcel);
                    }
                }
                Err(err) => warn!(error = %err, "pool growth failed"),
            }
        }

        let waiter = self.waiters.register()?;
        // A release may have landed between the probe and registration.
        self.feed_waiters(false);

        match self.waiters.wait(&waiter, self.config.get_client_timeout) {
            Ok(parcel) => {
                self.metrics.record_wait(began.elapsed());
                Ok(parcel)
            }
            Err(err) => {
                if matches!(err, SkvError::Timeout { .. }) {
                    self.metrics.record_timeout();
                }
                Err(err)
            }
        }
    }

    /// Hands connections from active cells to parked waiters.
    ///
    /// With `dial` the cells may open new connections; without it only open
    /// idle members are offered.
    fn feed_waiters(&self, dial: bool) -> usize {
        let mut served = 0;
        let pos = self.cell_pos.load(Ordering::Acquire);
        for idx in 0..pos {
            if self.waiters.is_empty() {
                break;
            }
            let cell = match self.cell(idx) {
                Some(cell) => cell,
                None => continue,
            };
            while !self.waiters.is_empty() {
                let conn = if dial {
                    match cell.get() {
                        Ok(Some(conn)) => conn,
                        Ok(None) => break,
                        Err(err) => {
                            warn!(cell = idx, error = %err, "connection factory failed");
                            break;
                        }
                    }
                } else {
                    match cell.take_idle() {
                        Some(conn) => conn,
                        None => break,
                    }
                };
                let conn = match validate(cell, conn) {
                    Ok(conn) => conn,
                    Err(conn) => {
                        cell.put(conn);
                        break;
                    }
                };
                let parcel = Parcel {
                    conn,
                    cell: Arc::clone(cell),
                };
                match self.waiters.hand_off(parcel) {
                    Ok(()) => served += 1,
                    Err(parcel) => {
                        parcel.cell.put(parcel.conn);
                        return served;
                    }
                }
            }
        }
        served
    }

    /// Returns a lease to the pool.
    pub(crate) fn release(&self, parcel: Parcel, leased_for: Duration) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        let Parcel { mut conn, cell } = parcel;

        if !self.is_started() {
            conn.close();
            cell.put(conn);
            return;
        }

        self.metrics.record_parallel_time(leased_for);
        if conn.is_open() {
            // Waiters parked after this check are served by the health tick.
            if self.waiters.is_empty() {
                cell.put(conn);
            } else if let Err(parcel) = self.waiters.hand_off(Parcel { conn, cell }) {
                parcel.cell.put(parcel.conn);
            }
            return;
        }

        cell.put(conn);
        cell.mark_check();
        self.metrics.record_return_fail();
    }

    /// One health tick: periodic shrink evaluation, then waiter service.
    pub(crate) fn health_tick(&self, tick: u64) {
        if !self.is_started() {
            return;
        }
        if self.cell_min != self.cell_max && tick % self.shrink_every == 0 {
            self.evaluate_shrink();
        }

        if self.waiters.is_empty() {
            return;
        }
        self.feed_waiters(true);
        if self.waiters.is_empty() || self.cell_pos.load(Ordering::Acquire) >= self.cell_max {
            return;
        }
        match self.append_cell() {
            Ok(true) => {
                self.feed_waiters(true);
            }
            Ok(false) => {}
            Err(err) => {
                warn!(error = %err, "pool growth failed, backing off");
                thread::sleep(GROW_BACKOFF);
            }
        }
    }

    /// Drops one cell when the last window's demand fits in one cell fewer,
    /// then closes every unleased cell at or beyond `cell_pos`.
    ///
    /// The sweep runs on every evaluation so a cell that still held a lease
    /// when it fell out of range is closed once that lease comes back.
    fn evaluate_shrink(&self) {
        let window = self.metrics.take();
        if !self.waiters.is_empty() {
            return;
        }

        let _grow = self.grow_lock.lock();
        let pos = self.cell_pos.load(Ordering::Acquire);
        let threshold = (pos.saturating_sub(1) * self.config.pool_size) as u64;
        let new_pos = if pos > self.cell_min && window.created < threshold {
            self.cell_pos.store(pos - 1, Ordering::Release);
            pos - 1
        } else {
            pos
        };

        let mut closed = 0;
        for cell in self.cells[new_pos..].iter().filter_map(OnceLock::get) {
            if cell.check_close() {
                closed += 1;
            }
        }
        if new_pos < pos {
            debug!(cell_pos = new_pos, created = window.created, closed, "pool shrank");
        } else if closed > 0 {
            debug!(cell_pos = new_pos, closed, "drained cells closed");
        }
    }

    fn info(&self) -> PoolInfo {
        PoolInfo::from_snapshot(
            self.metrics.snapshot(),
            self.config.health_interval,
            self.active.load(Ordering::Acquire),
            self.waiters.len(),
            (self.cell_pos.load(Ordering::Acquire), self.cell_min, self.cell_max),
        )
    }
}

/// Re-validates a connection fresh out of a cell.
///
/// Returns the connection back in `Err` when it could not be made usable.
fn validate(cell: &Cell, mut conn: Connection) -> Result<Connection, Connection> {
    if cell.needs_check() {
        if !conn.is_open() || !conn.ping() {
            if let Err(err) = conn.start() {
                debug!(cell = cell.index(), error = %err, "restart of flagged connection failed");
                return Err(conn);
            }
        }
        cell.check_health();
        return Ok(conn);
    }
    if !conn.is_open() {
        if let Err(err) = conn.start() {
            debug!(cell = cell.index(), error = %err, "reconnect failed");
            return Err(conn);
        }
    }
    Ok(conn)
}

/// Adaptive connection pool handle.
///
/// Dropping the handle closes the pool.
pub struct Connectors {
    shared: Arc<PoolShared>,
    health: Mutex<Option<HealthHandle>>,
}

impl Connectors {
    /// Creates a stopped pool using `JsonEncoder` for structured arguments.
    pub fn new(config: Config) -> SkvResult<Self> {
        Self::with_encoder(config, Arc::new(JsonEncoder))
    }

    /// Creates a stopped pool with a custom structured-argument encoder.
    pub fn with_encoder(config: Config, encoder: Arc<dyn ArgEncoder>) -> SkvResult<Self> {
        config.validate()?;
        Ok(Connectors {
            shared: Arc::new(PoolShared::new(config, encoder)),
            health: Mutex::new(None),
        })
    }

    /// Provisions the minimum cells and launches the health loop.
    ///
    /// Starting a started pool is a no-op.
    pub fn start(&self) -> SkvResult<()> {
        let mut health = self.health.lock();
        if self.shared.is_started() {
            return Ok(());
        }
        self.shared.open()?;
        match HealthHandle::spawn(Arc::clone(&self.shared)) {
            Ok(handle) => *health = Some(handle),
            Err(err) => {
                self.shared.shutdown();
                return Err(SkvError::connection("spawn health loop", err));
            }
        }

        let (cell_min, cell_max) = self.cell_bounds();
        info!(
            addr = %self.shared.config.addr(),
            cell_min,
            cell_max,
            pool_size = self.shared.config.pool_size,
            "pool started"
        );
        Ok(())
    }

    /// Stops the health loop, fails waiters and closes every cell.
    ///
    /// Outstanding clients stay usable until released; their connections are
    /// closed on release.
    pub fn close(&self) {
        let handle = self.health.lock().take();
        if let Some(handle) = handle {
            handle.stop();
        }
        if self.shared.shutdown() {
            info!(addr = %self.shared.config.addr(), "pool closed");
        }
    }

    /// Acquires a client, failing with `NotStarted`, `Busy`, `Timeout` or
    /// `Closed`.
    pub fn new_client(&self) -> SkvResult<Client> {
        self.shared.acquire(false)
    }

    /// Acquires a client that never fails.
    ///
    /// An acquisition error yields a placeholder client whose commands all
    /// return that error. Successful clients release themselves after each
    /// command when `auto_close` is configured.
    pub fn get_client(&self) -> Client {
        match self.shared.acquire(self.shared.config.auto_close) {
            Ok(client) => client,
            Err(err) => {
                debug!(error = %err, "acquisition failed, returning placeholder client");
                Client::placeholder(err)
            }
        }
    }

    /// Snapshot of pool load for the current health window.
    pub fn info(&self) -> PoolInfo {
        self.shared.info()
    }

    /// Whether the pool is started.
    pub fn status(&self) -> PoolStatus {
        if self.shared.is_started() {
            PoolStatus::Started
        } else {
            PoolStatus::Stopped
        }
    }

    /// Number of active cells.
    pub fn cell_pos(&self) -> usize {
        self.shared.cell_pos.load(Ordering::Acquire)
    }

    /// `(cell_min, cell_max)`.
    pub fn cell_bounds(&self) -> (usize, usize) {
        (self.shared.cell_min, self.shared.cell_max)
    }

    /// Acquirers currently parked in the wait queue.
    pub fn waiting(&self) -> usize {
        self.shared.waiters.len()
    }

    /// Clients currently leased.
    pub fn active(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Configuration the pool was built with.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }
}

impl Drop for Connectors {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connectors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connectors")
            .field("addr", &self.shared.config.addr())
            .field("status", &self.status())
            .field("cell_pos", &self.cell_pos())
            .field("active", &self.active())
            .field("waiting", &self.waiting())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellStatus;
    use skv_server::ServerHandle;

    fn local_config(server: &ServerHandle) -> Config {
        Config::new("127.0.0.1", server.port()).with_timeouts(
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(2),
        )
    }

    fn wait_for(mut condition: impl FnMut() -> bool, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        condition()
    }

    #[test]
    fn sixth_lease_is_served_by_second_cell() {
        let server = ServerHandle::spawn(None).unwrap();
        let config = local_config(&server)
            .with_pool(5, 5, 20)
            .with_health(Duration::from_secs(60), Duration::from_millis(50));
        let pool = Connectors::new(config).unwrap();
        pool.start().unwrap();
        assert_eq!(pool.cell_bounds(), (1, 4));

        let held: Vec<Client> = (0..6).map(|_| pool.new_client().unwrap()).collect();
        let cells: Vec<Option<usize>> = held.iter().map(Client::cell_index).collect();
        assert_eq!(cells[..5], [Some(0); 5]);
        assert_eq!(cells[5], Some(1));
        assert_eq!(pool.cell_pos(), 2);
    }

    #[test]
    fn drained_cell_closes_after_its_last_lease_returns() {
        let server = ServerHandle::spawn(None).unwrap();
        let config = local_config(&server)
            .with_pool(2, 2, 4)
            .with_health(Duration::from_millis(100), Duration::from_millis(50));
        let pool = Connectors::new(config).unwrap();
        pool.start().unwrap();

        let first = pool.new_client().unwrap();
        let second = pool.new_client().unwrap();
        let third = pool.new_client().unwrap();
        assert_eq!(third.cell_index(), Some(1));
        drop(first);
        drop(second);

        assert!(wait_for(|| pool.cell_pos() == 1, Duration::from_secs(3)));
        let cell = Arc::clone(pool.shared.cell(1).unwrap());
        assert_eq!(cell.status(), CellStatus::Started);

        drop(third);
        assert!(wait_for(|| cell.status() == CellStatus::Stopped, Duration::from_secs(3)));
        assert_eq!(cell.stats().total, 0);
    }

    #[test]
    fn release_without_waiters_returns_to_free_list() {
        let server = ServerHandle::spawn(None).unwrap();
        let pool = Connectors::new(local_config(&server).with_pool(1, 1, 1)).unwrap();
        pool.start().unwrap();

        let client = pool.new_client().unwrap();
        drop(client);
        let cell = pool.shared.cell(0).unwrap();
        assert_eq!(cell.stats().idle, 1);
        assert_eq!(cell.stats().leased, 0);
        assert!(pool.shared.waiters.is_empty());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = Config::new("127.0.0.1", 8888).with_pool(10, 5, 5);
        assert!(matches!(Connectors::new(config), Err(SkvError::Config(_))));
    }

    #[test]
    fn stopped_pool_rejects_acquisition() {
        let pool = Connectors::new(Config::default()).unwrap();
        assert_eq!(pool.status(), PoolStatus::Stopped);
        assert!(matches!(pool.new_client(), Err(SkvError::NotStarted)));

        let mut client = pool.get_client();
        assert!(!client.is_open());
        assert!(matches!(client.exec(&[crate::Arg::from("ping")]), Err(SkvError::NotStarted)));
        assert_eq!(pool.info().created, 0);
    }

    #[test]
    fn cell_bounds_follow_config() {
        let config = Config::new("127.0.0.1", 8888).with_pool(5, 12, 23);
        let pool = Connectors::new(config).unwrap();
        assert_eq!(pool.cell_bounds(), (2, 4));
        assert_eq!(pool.config().max_pool_size, 23);
        assert_eq!(pool.cell_pos(), 0);
        assert_eq!(pool.shared.cells.len(), 4);
    }

    #[test]
    fn shrink_cadence_rounds_to_ticks() {
        let config = Config::new("127.0.0.1", 8888)
            .with_health(Duration::from_millis(250), Duration::from_millis(100));
        let pool = Connectors::new(config).unwrap();
        assert_eq!(pool.shared.shrink_every, 2);

        let config = Config::new("127.0.0.1", 8888)
            .with_health(Duration::from_millis(50), Duration::from_millis(100));
        let pool = Connectors::new(config).unwrap();
        assert_eq!(pool.shared.shrink_every, 1);
    }

    #[test]
    fn start_fails_when_server_unreachable() {
        // Bind then drop to get a port nothing listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = Config::new("127.0.0.1", port).with_timeouts(
            Duration::from_millis(200),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let pool = Connectors::new(config).unwrap();
        assert!(pool.start().unwrap_err().is_connection());
        assert_eq!(pool.status(), PoolStatus::Stopped);
        assert_eq!(pool.cell_pos(), 0);
    }
}
