//! # Health Loop
//!
//! Purpose: Runs the pool's periodic maintenance on its own thread while the
//! pool is started.
//!
//! ## Design Principles
//! 1. **Single Wake Source**: `recv_timeout` on the stop channel is both the
//!    tick timer and the shutdown signal.
//! 2. **Joined on Close**: `stop` drops the sender and joins the thread, so no
//!    tick runs after the pool is closed.
//! 3. **Work Lives Elsewhere**: Each tick calls back into the pool; this module
//!    only owns timing.

use std::io;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::debug;

use crate::connectors::PoolShared;

/// Handle to the health thread; `stop` wakes it and waits for it to exit.
pub(crate) struct HealthHandle {
    stop: Option<mpsc::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl HealthHandle {
    /// Spawns the loop, calling `PoolShared::health_tick` once per tick.
    pub(crate) fn spawn(pool: Arc<PoolShared>) -> io::Result<Self> {
        let tick = pool.config().health_tick;
        let (stop, stopped) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name("skv-health".to_string())
            .spawn(move || {
                let mut ticks: u64 = 0;
                loop {
                    // Disconnect is the stop signal.
                    match stopped.recv_timeout(tick) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    ticks = ticks.wrapping_add(1);
                    pool.health_tick(ticks);
                }
                debug!("health loop stopped");
            })?;

        Ok(HealthHandle {
            stop: Some(stop),
            join: Some(join),
        })
    }

    /// Stops the loop and joins the thread.
    pub(crate) fn stop(mut self) {
        drop(self.stop.take());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
