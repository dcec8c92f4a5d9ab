//! Allocator capability shared by concurrently running partition chains.
//!
//! Operators that retain data across batches (the hash aggregate) account the
//! retained bytes against one engine-level budget. Callers reserve bytes and
//! receive an RAII [`MemoryReservation`]; dropping it returns the bytes.
//! Exceeding the budget is an execution error, never a silent over-commit.

use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Result, StrataError};

/// Memory accounting capability handed to the compiler and the table reader.
pub trait Allocator: Send + Sync + Debug {
    /// Account `bytes` against the budget, failing when it does not fit.
    fn try_reserve(&self, bytes: usize) -> Result<()>;

    /// Return `bytes` previously granted by [`Allocator::try_reserve`].
    fn release(&self, bytes: usize);

    /// Bytes currently accounted.
    fn allocated_bytes(&self) -> usize;

    /// Configured budget (`usize::MAX` for unbounded).
    fn limit_bytes(&self) -> usize;
}

/// Budgeted allocator backed by a single atomic counter.
#[derive(Debug)]
pub struct MemoryBudget {
    limit_bytes: usize,
    in_use_bytes: AtomicUsize,
}

impl MemoryBudget {
    /// Create an allocator with an engine-level budget.
    #[must_use]
    pub fn new(limit_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            limit_bytes,
            in_use_bytes: AtomicUsize::new(0),
        })
    }

    /// Allocator that accounts usage but never rejects a reservation.
    #[must_use]
    pub fn unbounded() -> Arc<Self> {
        Self::new(usize::MAX)
    }
}

impl Allocator for MemoryBudget {
    fn try_reserve(&self, bytes: usize) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        loop {
            let current = self.in_use_bytes.load(Ordering::Acquire);
            let next = current.saturating_add(bytes);
            if next > self.limit_bytes {
                return Err(StrataError::execution(format!(
                    "memory budget exceeded: requested {bytes} bytes with {current} of {} in use",
                    self.limit_bytes
                )));
            }
            if self
                .in_use_bytes
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    fn release(&self, bytes: usize) {
        let mut current = self.in_use_bytes.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(bytes);
            match self.in_use_bytes.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    fn allocated_bytes(&self) -> usize {
        self.in_use_bytes.load(Ordering::Acquire)
    }

    fn limit_bytes(&self) -> usize {
        self.limit_bytes
    }
}

/// RAII reservation that releases its bytes on drop.
#[derive(Debug)]
pub struct MemoryReservation {
    allocator: Arc<dyn Allocator>,
    reserved_bytes: usize,
}

impl MemoryReservation {
    /// Empty reservation bound to `allocator`.
    pub fn new(allocator: Arc<dyn Allocator>) -> Self {
        Self {
            allocator,
            reserved_bytes: 0,
        }
    }

    /// Grow the reservation by `bytes`.
    pub fn grow(&mut self, bytes: usize) -> Result<()> {
        self.allocator.try_reserve(bytes)?;
        self.reserved_bytes += bytes;
        Ok(())
    }

    /// Release everything held so far, keeping the reservation usable.
    pub fn free(&mut self) {
        if self.reserved_bytes > 0 {
            self.allocator.release(self.reserved_bytes);
            self.reserved_bytes = 0;
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.reserved_bytes
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.free();
    }
}
