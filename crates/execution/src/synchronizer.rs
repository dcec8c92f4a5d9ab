//! Completion barrier at the fan-in point of a compiled plan.
//!
//! Every partition chain instance feeds the same [`Synchronizer`]. Batches pass
//! straight through it; completion signals are counted, and only the signal
//! that brings the outstanding count to zero is forwarded downstream. An
//! explicit abort path (errors, cancellation, timeout) releases anyone waiting
//! on the barrier so a partition that never finishes cannot deadlock the query.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use strata_common::{Result, StrataError};

#[derive(Debug)]
enum BarrierStatus {
    /// Waiting for partitions to finish.
    Running,
    /// Last partition arrived; downstream completion is in progress.
    Finishing,
    Released,
    Aborted(StrataError),
}

#[derive(Debug)]
struct BarrierState {
    outstanding: usize,
    status: BarrierStatus,
}

/// Shared counter plus condition variable tracking outstanding partitions.
#[derive(Debug)]
pub struct Synchronizer {
    partitions: usize,
    state: Mutex<BarrierState>,
    settled: Condvar,
}

impl Synchronizer {
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions,
            state: Mutex::new(BarrierState {
                outstanding: partitions,
                status: BarrierStatus::Running,
            }),
            settled: Condvar::new(),
        }
    }

    /// Number of partitions the barrier waits for.
    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Partitions that have not signalled completion yet.
    pub fn outstanding(&self) -> usize {
        self.lock_state().outstanding
    }

    /// Whether batches may still flow through the barrier.
    pub fn check_open(&self) -> Result<()> {
        let state = self.try_lock()?;
        match &state.status {
            BarrierStatus::Running => Ok(()),
            BarrierStatus::Aborted(reason) => Err(reason.clone()),
            BarrierStatus::Finishing | BarrierStatus::Released => Err(StrataError::execution(
                "batch delivered after every partition finished",
            )),
        }
    }

    /// Record one partition's completion.
    ///
    /// Returns `true` for exactly one caller: the one whose arrival brought
    /// the outstanding count to zero. That caller must forward completion
    /// downstream and then report the outcome through [`Synchronizer::complete`].
    pub fn arrive(&self) -> Result<bool> {
        let mut state = self.try_lock()?;
        match &state.status {
            BarrierStatus::Running => {}
            BarrierStatus::Aborted(reason) => return Err(reason.clone()),
            BarrierStatus::Finishing | BarrierStatus::Released => {
                return Err(StrataError::execution(
                    "completion signalled after the barrier was released",
                ))
            }
        }
        if state.outstanding == 0 {
            return Err(StrataError::execution(format!(
                "more completion signals than the {} expected partitions",
                self.partitions
            )));
        }
        state.outstanding -= 1;
        if state.outstanding == 0 {
            state.status = BarrierStatus::Finishing;
            return Ok(true);
        }
        Ok(false)
    }

    /// Settle the barrier with the outcome of downstream completion.
    pub fn complete(&self, outcome: &Result<()>) {
        let mut state = self.lock_state();
        if matches!(state.status, BarrierStatus::Finishing) {
            state.status = match outcome {
                Ok(()) => BarrierStatus::Released,
                Err(e) => BarrierStatus::Aborted(e.clone()),
            };
            self.settled.notify_all();
        }
    }

    /// Abort the barrier unless it already settled. The first reason wins.
    ///
    /// Returns whether this call aborted the barrier.
    pub fn abort(&self, reason: &StrataError) -> bool {
        let mut state = self.lock_state();
        match state.status {
            BarrierStatus::Running | BarrierStatus::Finishing => {
                state.status = BarrierStatus::Aborted(reason.clone());
                self.settled.notify_all();
                true
            }
            BarrierStatus::Released | BarrierStatus::Aborted(_) => false,
        }
    }

    /// Block until the barrier is released or aborted.
    ///
    /// When `timeout` elapses first the barrier aborts itself and the timeout
    /// error is returned.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.try_lock()?;
        loop {
            match &state.status {
                BarrierStatus::Released => return Ok(()),
                BarrierStatus::Aborted(reason) => return Err(reason.clone()),
                BarrierStatus::Running | BarrierStatus::Finishing => {}
            }
            let now = Instant::now();
            if now >= deadline {
                let err = StrataError::execution(format!(
                    "timed out after {timeout:?} waiting for {} of {} partitions to finish",
                    state.outstanding, self.partitions
                ));
                state.status = BarrierStatus::Aborted(err.clone());
                self.settled.notify_all();
                return Err(err);
            }
            state = self
                .settled
                .wait_timeout(state, deadline - now)
                .map_err(|_| poisoned())?
                .0;
        }
    }

    /// Whether the barrier settled successfully.
    pub fn is_released(&self) -> bool {
        matches!(self.lock_state().status, BarrierStatus::Released)
    }

    fn try_lock(&self) -> Result<MutexGuard<'_, BarrierState>> {
        self.state.lock().map_err(|_| poisoned())
    }

    fn lock_state(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn poisoned() -> StrataError {
    StrataError::execution("completion barrier lock poisoned")
}
