//! Contains the supervision hooks every long-running bus loop calls: feeding
//! the watchdog and checking whether the host has aborted the operation.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use portable_atomic::{AtomicBool, Ordering};

/// Implemented by the platform.  Every busy-wait and yield loop in the
/// drivers calls these, so they must be cheap.
pub trait Supervisor {
    /// Feed the watchdog.
    fn feed(&mut self);

    /// Whether the current operation should be abandoned.
    fn is_cancelled(&self) -> bool;
}

/// An abort flag, shared between whatever receives the host's abort request
/// (typically the USB control handler) and the bus supervisor.
pub struct AbortFlag {
    flag: AtomicBool,
}

impl AbortFlag {
    pub const fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
        }
    }

    /// Request the current operation is abandoned.
    pub fn abort(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Clear the abort, ready for the next operation.
    pub fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

impl Default for AbortFlag {
    fn default() -> Self {
        Self::new()
    }
}
