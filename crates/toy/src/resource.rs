//! Resource accounting and cancellation.
//!
//! The heap is generic over a [`ResourceTracker`] so embedders choose
//! between unlimited execution ([`NoLimitTracker`]) and bounded execution
//! ([`LimitedTracker`]) without a runtime branch on the hot allocation
//! path.
//!
//! Cancellation is separate: an [`InterruptHandle`] wraps a shared atomic
//! flag the host may set from any thread; the VM observes it on loop
//! back-edges and calls and unwinds with a cancellation error.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

/// Default cap on call-frame depth.
pub const DEFAULT_MAX_FRAMES: usize = 1024;

/// Default cap on the operand stack, in values.
pub const DEFAULT_MAX_STACK: usize = 64 * 1024;

/// Error produced when a tracker refuses an allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceError {
    pub message: String,
}

impl ResourceError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ResourceError {}

/// Tracks heap allocations and container growth.
///
/// Implementations must be cheap: `on_allocate` runs for every heap object
/// and `on_container_insert` for every element insertion.
pub trait ResourceTracker {
    /// Called before a heap slot is allocated; `estimate` is the
    /// approximate payload size in bytes.
    fn on_allocate(&mut self, estimate: usize) -> Result<(), ResourceError>;

    /// Called when a heap slot is freed.
    fn on_free(&mut self, estimate: usize);

    /// Called before a container grows by one element.
    fn on_container_insert(&mut self) -> Result<(), ResourceError>;
}

/// Tracker that allows everything; the default for trusted scripts.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLimitTracker;

impl ResourceTracker for NoLimitTracker {
    #[inline]
    fn on_allocate(&mut self, _estimate: usize) -> Result<(), ResourceError> {
        Ok(())
    }

    #[inline]
    fn on_free(&mut self, _estimate: usize) {}

    #[inline]
    fn on_container_insert(&mut self) -> Result<(), ResourceError> {
        Ok(())
    }
}

/// Tracker that enforces allocation-count and byte budgets.
#[derive(Debug, Clone)]
pub struct LimitedTracker {
    max_allocations: usize,
    max_memory_bytes: usize,
    allocations: usize,
    memory_bytes: usize,
}

impl LimitedTracker {
    #[must_use]
    pub fn new(max_allocations: usize, max_memory_bytes: usize) -> Self {
        Self {
            max_allocations,
            max_memory_bytes,
            allocations: 0,
            memory_bytes: 0,
        }
    }

    /// Live allocation count.
    #[must_use]
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    /// Estimated live heap bytes.
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        self.memory_bytes
    }
}

impl ResourceTracker for LimitedTracker {
    fn on_allocate(&mut self, estimate: usize) -> Result<(), ResourceError> {
        if self.allocations >= self.max_allocations {
            return Err(ResourceError::new(format!(
                "allocation limit of {} objects exceeded",
                self.max_allocations
            )));
        }
        if self.memory_bytes.saturating_add(estimate) > self.max_memory_bytes {
            return Err(ResourceError::new(format!(
                "memory limit of {} bytes exceeded",
                self.max_memory_bytes
            )));
        }
        self.allocations += 1;
        self.memory_bytes += estimate;
        Ok(())
    }

    fn on_free(&mut self, estimate: usize) {
        self.allocations = self.allocations.saturating_sub(1);
        self.memory_bytes = self.memory_bytes.saturating_sub(estimate);
    }

    fn on_container_insert(&mut self) -> Result<(), ResourceError> {
        if self.memory_bytes.saturating_add(size_of::<usize>() * 2) > self.max_memory_bytes {
            return Err(ResourceError::new(format!(
                "memory limit of {} bytes exceeded",
                self.max_memory_bytes
            )));
        }
        Ok(())
    }
}

/// Shared cancellation flag for a VM run.
///
/// Cloning the handle shares the flag; the host sets it from another
/// thread, the VM checks it on every loop back-edge and call.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of the running script.
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// True when cancellation was requested.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Clears the flag (before reusing the handle for another run).
    pub fn reset(&self) {
        self.flag.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limited_tracker_enforces_allocation_count() {
        let mut tracker = LimitedTracker::new(2, usize::MAX);
        assert!(tracker.on_allocate(8).is_ok());
        assert!(tracker.on_allocate(8).is_ok());
        assert!(tracker.on_allocate(8).is_err());
        tracker.on_free(8);
        assert!(tracker.on_allocate(8).is_ok());
    }

    #[test]
    fn limited_tracker_enforces_bytes() {
        let mut tracker = LimitedTracker::new(usize::MAX, 100);
        assert!(tracker.on_allocate(60).is_ok());
        assert!(tracker.on_allocate(60).is_err());
    }

    #[test]
    fn interrupt_handle_shares_flag() {
        let handle = InterruptHandle::new();
        let clone = handle.clone();
        assert!(!clone.is_interrupted());
        handle.interrupt();
        assert!(clone.is_interrupted());
        handle.reset();
        assert!(!clone.is_interrupted());
    }
}
