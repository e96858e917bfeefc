//! # Wait Queue
//!
//! Bounded park-and-notify queue used when every cell is exhausted. A
//! releaser hands its connection straight to the oldest parked waiter.
//!
//! Delivery is exactly-once: removing a waiter from the queue and filling its
//! slot both happen under the queue lock, so a waiter whose deadline expires
//! while it is being served still receives the item instead of dropping it.
//! Lock order is always queue, then slot.

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use skv_common::{SkvError, SkvResult};

enum Slot<T> {
    Waiting,
    Delivered(T),
    Closed,
}

/// One parked acquirer.
pub struct Waiter<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T> Waiter<T> {
    fn new() -> Self {
        Waiter {
            slot: Mutex::new(Slot::Waiting),
            ready: Condvar::new(),
        }
    }

    fn fill(&self, slot: Slot<T>) {
        *self.slot.lock() = slot;
        self.ready.notify_one();
    }

    fn take(&self) -> Slot<T> {
        mem::replace(&mut *self.slot.lock(), Slot::Waiting)
    }
}

struct QueueState<T> {
    waiters: VecDeque<Arc<Waiter<T>>>,
    closed: bool,
}

/// FIFO hand-off queue with a fixed capacity.
pub struct WaitQueue<T> {
    capacity: usize,
    // Mirrors `waiters.len()` for lock-free readers.
    waiting: AtomicUsize,
    state: Mutex<QueueState<T>>,
}

impl<T> WaitQueue<T> {
    pub fn new(capacity: usize) -> Self {
        WaitQueue {
            capacity,
            waiting: AtomicUsize::new(0),
            state: Mutex::new(QueueState {
                waiters: VecDeque::with_capacity(capacity),
                closed: false,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of parked waiters.
    pub fn len(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parks a new waiter at the back of the queue.
    ///
    /// Fails with `Busy` when the queue is full and `Closed` after `close`.
    pub fn register(&self) -> SkvResult<Arc<Waiter<T>>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(SkvError::Closed);
        }
        if state.waiters.len() >= self.capacity {
            return Err(SkvError::Busy {
                waiting: state.waiters.len(),
            });
        }
        let waiter = Arc::new(Waiter::new());
        state.waiters.push_back(Arc::clone(&waiter));
        self.waiting.store(state.waiters.len(), Ordering::Release);
        Ok(waiter)
    }

    /// Gives `item` to the oldest waiter, or returns it when nobody waits.
    pub fn hand_off(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        let waiter = match state.waiters.pop_front() {
            Some(waiter) => waiter,
            None => return Err(item),
        };
        self.waiting.store(state.waiters.len(), Ordering::Release);
        waiter.fill(Slot::Delivered(item));
        Ok(())
    }

    /// Blocks until `waiter` is served, the queue closes, or `timeout` passes.
    pub fn wait(&self, waiter: &Arc<Waiter<T>>, timeout: Duration) -> SkvResult<T> {
        let deadline = Instant::now() + timeout;
        {
            let mut slot = waiter.slot.lock();
            loop {
                match mem::replace(&mut *slot, Slot::Waiting) {
                    Slot::Delivered(item) => return Ok(item),
                    Slot::Closed => return Err(SkvError::Closed),
                    Slot::Waiting => {}
                }
                if waiter.ready.wait_until(&mut slot, deadline).timed_out() {
                    break;
                }
            }
        }

        let mut state = self.state.lock();
        if let Some(pos) = state.waiters.iter().position(|parked| Arc::ptr_eq(parked, waiter)) {
            let waiting = state.waiters.len();
            state.waiters.remove(pos);
            self.waiting.store(state.waiters.len(), Ordering::Release);
            return Err(SkvError::Timeout { timeout, waiting });
        }
        drop(state);

        // Already popped by a hand-off or close; its slot is filled.
        match waiter.take() {
            Slot::Delivered(item) => Ok(item),
            Slot::Closed => Err(SkvError::Closed),
            Slot::Waiting => Err(SkvError::Timeout { timeout, waiting: self.len() }),
        }
    }

    /// Fails every parked waiter with `Closed` and rejects new ones.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        for waiter in state.waiters.drain(..) {
            waiter.fill(Slot::Closed);
        }
        self.waiting.store(0, Ordering::Release);
    }

    /// Accepts waiters again after `close`.
    pub fn reopen(&self) {
        self.state.lock().closed = false;
    }
}
