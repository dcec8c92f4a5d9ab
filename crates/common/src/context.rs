//! Query-scoped context and cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, StrataError};
use crate::ids::QueryId;

/// A cancellation token that can be shared across partition threads.
/// Operators check it at every batch boundary and completion call.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Context passed alongside every batch delivery and completion call.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub query_id: QueryId,
    pub cancel: CancellationToken,
}

impl QueryContext {
    pub fn new(query_id: QueryId) -> Self {
        Self {
            query_id,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(query_id: QueryId, cancel: CancellationToken) -> Self {
        Self { query_id, cancel }
    }

    /// Return [`StrataError::Cancelled`] once cancellation was requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(StrataError::Cancelled)
        } else {
            Ok(())
        }
    }
}
