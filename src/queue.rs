// MIT/Apache2 License

//! Bounded blocking queues of image indices.
//!
//! Each swapchain owns up to two of these: the present queue feeding the
//! queue-manager thread and the acquire queue feeding blocked acquirers.
//! Capacity is always `image_count + 1` so the shutdown sentinel
//! [`SENTINEL`] can be pushed even when every image index is in flight.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Pushed to wake and terminate the other side during shutdown.
pub(crate) const SENTINEL: u32 = u32::MAX;

/// Why a pull came back empty.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum PullError {
    /// Asked for an immediate pull (timeout zero) and nothing was queued.
    NotReady,
    /// The timeout elapsed.
    Timeout,
}

#[derive(Debug)]
pub(crate) struct BoundedQueue {
    items: Mutex<VecDeque<u32>>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
}

impl BoundedQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Append an index, blocking while the queue is full. With the
    /// sentinel slot reserved by the sizing rule this never blocks in
    /// practice.
    pub fn push(&self, value: u32) {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        while items.len() >= self.capacity {
            items = self
                .not_full
                .wait(items)
                .unwrap_or_else(|e| e.into_inner());
        }
        items.push_back(value);
        self.not_empty.notify_one();
    }

    /// Remove the oldest index, waiting up to `timeout_ns` nanoseconds.
    /// `u64::MAX` waits forever; zero never blocks.
    pub fn pull(&self, timeout_ns: u64) -> Result<u32, PullError> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());

        if timeout_ns == 0 {
            return match items.pop_front() {
                Some(v) => {
                    self.not_full.notify_one();
                    Ok(v)
                }
                None => Err(PullError::NotReady),
            };
        }

        let deadline = if timeout_ns == u64::MAX {
            None
        } else {
            Some(Instant::now() + Duration::from_nanos(timeout_ns))
        };

        loop {
            if let Some(v) = items.pop_front() {
                self.not_full.notify_one();
                return Ok(v);
            }

            match deadline {
                None => {
                    items = self
                        .not_empty
                        .wait(items)
                        .unwrap_or_else(|e| e.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PullError::Timeout);
                    }
                    let (guard, _) = self
                        .not_empty
                        .wait_timeout(items, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    items = guard;
                }
            }
        }
    }
}
