// MIT/Apache2 License

//! Swapchain status codes and the cross-thread sticky latch.
//!
//! A swapchain's status is read and written from both the application
//! thread(s) and the queue-manager thread, so it lives in a single atomic
//! and every mutation goes through [`StatusLatch::merge`]. Error statuses
//! are permanent once seen; suboptimal sticks until overwritten by an
//! error; timeout and not-ready pass through without being recorded.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use thiserror::Error;

/// The combined result of a swapchain operation.
///
/// Negative raw values are permanent errors, mirroring the taxonomy of the
/// presentation API this engine backs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    Success,
    Suboptimal,
    Timeout,
    NotReady,
    OutOfHostMemory,
    SurfaceLost,
    OutOfDate,
    InitializationFailed,
}

impl Status {
    #[inline]
    pub(crate) const fn to_raw(self) -> i32 {
        match self {
            Status::Success => 0,
            Status::Suboptimal => 1,
            Status::Timeout => 2,
            Status::NotReady => 3,
            Status::OutOfHostMemory => -1,
            Status::SurfaceLost => -2,
            Status::OutOfDate => -3,
            Status::InitializationFailed => -4,
        }
    }

    #[inline]
    pub(crate) const fn from_raw(raw: i32) -> Self {
        match raw {
            0 => Status::Success,
            1 => Status::Suboptimal,
            2 => Status::Timeout,
            3 => Status::NotReady,
            -1 => Status::OutOfHostMemory,
            -2 => Status::SurfaceLost,
            -3 => Status::OutOfDate,
            _ => Status::InitializationFailed,
        }
    }

    /// Whether this status permanently poisons the swapchain.
    #[inline]
    pub const fn is_error(self) -> bool {
        self.to_raw() < 0
    }

    /// Split into the "did it work, and was it suboptimal" shape used by
    /// the public acquire/present entry points.
    #[inline]
    pub(crate) fn into_result(self) -> Result<bool, SwapchainError> {
        match self {
            Status::Success => Ok(false),
            Status::Suboptimal => Ok(true),
            Status::Timeout => Err(SwapchainError::Timeout),
            Status::NotReady => Err(SwapchainError::NotReady),
            Status::OutOfHostMemory => Err(SwapchainError::OutOfHostMemory),
            Status::SurfaceLost => Err(SwapchainError::SurfaceLost),
            Status::OutOfDate => Err(SwapchainError::OutOfDate),
            Status::InitializationFailed => Err(SwapchainError::InitializationFailed),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Errors surfaced by swapchain creation, acquire and present.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
pub enum SwapchainError {
    /// The timeout elapsed before an image became available. Transient.
    #[error("timed out waiting for a presentable image")]
    Timeout,
    /// No image was immediately available. Transient.
    #[error("no presentable image is ready")]
    NotReady,
    /// The server rejected a request or the event channel closed.
    #[error("the surface has been lost")]
    SurfaceLost,
    /// The swapchain no longer matches the surface and must be recreated.
    #[error("the swapchain is out of date")]
    OutOfDate,
    /// Allocation failure, or the server lacks the required extensions.
    #[error("out of host memory")]
    OutOfHostMemory,
    /// Swapchain setup failed; all partial state has been released.
    #[error("swapchain initialization failed")]
    InitializationFailed,
}

/// The shared sticky status cell.
///
/// All writes funnel through [`merge`](Self::merge), the single
/// compare-and-set site, so concurrent updates from the worker and the
/// application cannot lose an error.
#[derive(Debug)]
pub(crate) struct StatusLatch(AtomicI32);

impl StatusLatch {
    #[inline]
    pub fn new(initial: Status) -> Self {
        Self(AtomicI32::new(initial.to_raw()))
    }

    #[inline]
    pub fn get(&self) -> Status {
        Status::from_raw(self.0.load(Ordering::Acquire))
    }

    /// Combine the result of an operation into the latch and return the
    /// status to report to the caller.
    ///
    /// Errors stick and are never overwritten by anything. Suboptimal
    /// sticks until an error lands. Timeout and not-ready are reported but
    /// never recorded. Success reports whatever is already latched.
    pub fn merge(&self, result: Status) -> Status {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let cur = Status::from_raw(current);
            if cur.is_error() {
                return cur;
            }

            if result.is_error() || result == Status::Suboptimal {
                match self.0.compare_exchange_weak(
                    current,
                    result.to_raw(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        if cur != result {
                            log::debug!("swapchain status changed to {result}");
                        }
                        return result;
                    }
                    Err(actual) => {
                        current = actual;
                        continue;
                    }
                }
            }

            if result == Status::Timeout || result == Status::NotReady {
                return result;
            }

            // Plain success: report the latched status (possibly suboptimal).
            return cur;
        }
    }
}
