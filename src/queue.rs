//! A cancel-safe queue of bus transfers, for hosts which submit transfers
//! from more than one context (an OS driver, or several tasks) to a single
//! worker that owns the bus.
//!
//! At most one transfer is in flight at a time, and queued transfers run in
//! the order they were submitted.  Short transfers which carry no payload
//! (a status or line poll, say) may ask to skip the queue, which they do
//! only if the worker is idle and nothing is waiting.
//!
//! The lock is injected as an embassy-sync [`RawMutex`], so the same queue
//! works across cores, from interrupts, or (with `NoopRawMutex`) within a
//! single task.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use core::cell::RefCell;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;
use heapless::{Deque, Vec};

/// Why a transfer was refused.  The transfer is handed back so the caller
/// can complete it.
#[derive(Debug, PartialEq, Eq)]
pub enum QueueError<T> {
    /// The queue is dropping everything, usually because the device is
    /// going away.
    Dropping(T),
    /// No room in the queue.
    Full(T),
}

/// What became of a started transfer.
#[derive(Debug, PartialEq, Eq)]
pub enum Started<T> {
    /// The worker is idle, so the caller should run the transfer now.  It
    /// is in flight until [`WorkQueue::complete()`] is called.
    Now(T),
    /// The transfer is waiting its turn.
    Queued,
}

struct Inner<T, const N: usize> {
    queue: Deque<T, N>,
    in_flight: bool,
    dropping: bool,
    stalled: bool,
}

pub struct WorkQueue<M: RawMutex, T, const N: usize> {
    inner: Mutex<M, RefCell<Inner<T, N>>>,
}

impl<M: RawMutex, T, const N: usize> WorkQueue<M, T, N> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Inner {
                queue: Deque::new(),
                in_flight: false,
                dropping: false,
                stalled: false,
            })),
        }
    }

    /// Submit a transfer.
    pub fn start(&self, item: T, fast_start: bool) -> Result<Started<T>, QueueError<T>> {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            if inner.dropping {
                debug!("Queue: dropping, transfer refused");
                return Err(QueueError::Dropping(item));
            }

            if fast_start && !inner.in_flight && !inner.stalled && inner.queue.is_empty() {
                trace!("Queue: fast start");
                inner.in_flight = true;
                return Ok(Started::Now(item));
            }

            inner.queue.push_back(item).map_err(|item| {
                warn!("Queue: full");
                QueueError::Full(item)
            })?;
            Ok(Started::Queued)
        })
    }

    /// Take the next transfer for the worker, if it is idle and one is
    /// waiting.  The transfer is in flight until `complete()`.
    pub fn next(&self) -> Option<T> {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            if inner.in_flight || inner.stalled {
                return None;
            }
            let item = inner.queue.pop_front()?;
            inner.in_flight = true;
            Some(item)
        })
    }

    /// The in-flight transfer has finished.
    pub fn complete(&self) {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            if !inner.in_flight {
                warn!("Queue: complete with nothing in flight");
            }
            inner.in_flight = false;
        });
    }

    /// Remove the queued transfers matching `pred`, returning them to be
    /// completed as cancelled.  The in-flight transfer is not affected;
    /// cancel it through its abort flag.
    pub fn cancel(&self, mut pred: impl FnMut(&T) -> bool) -> Vec<T, N> {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            let mut cancelled = Vec::new();
            let mut kept = Deque::new();
            while let Some(item) = inner.queue.pop_front() {
                // Both have room for everything that was queued
                let overflow = if pred(&item) {
                    cancelled.push(item).is_err()
                } else {
                    kept.push_back(item).is_err()
                };
                if overflow {
                    error!("Queue: lost a transfer while cancelling");
                }
            }
            inner.queue = kept;
            if !cancelled.is_empty() {
                debug!("Queue: cancelled {} transfers", cancelled.len());
            }
            cancelled
        })
    }

    /// Remove every queued transfer.
    pub fn cancel_all(&self) -> Vec<T, N> {
        self.cancel(|_| true)
    }

    /// Refuse new transfers while set.
    pub fn set_dropping(&self, dropping: bool) {
        self.inner.lock(|inner| inner.borrow_mut().dropping = dropping);
    }

    /// Hold queued transfers until `unstall()`.  Transfers may still be
    /// submitted.
    pub fn stall(&self) {
        self.inner.lock(|inner| inner.borrow_mut().stalled = true);
    }

    pub fn unstall(&self) {
        self.inner.lock(|inner| inner.borrow_mut().stalled = false);
    }

    /// Whether nothing is in flight or waiting.
    pub fn is_idle(&self) -> bool {
        self.inner.lock(|inner| {
            let inner = inner.borrow();
            !inner.in_flight && inner.queue.is_empty()
        })
    }

    /// The number of transfers waiting.
    pub fn len(&self) -> usize {
        self.inner.lock(|inner| inner.borrow().queue.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<M: RawMutex, T, const N: usize> Default for WorkQueue<M, T, N> {
    fn default() -> Self {
        Self::new()
    }
}
