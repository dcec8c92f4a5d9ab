//! Shared configuration, error types, IDs, and runtime primitives for strata crates.
//!
//! Architecture role:
//! - defines engine/planner configuration passed across layers
//! - provides common [`StrataError`] / [`Result`] contracts
//! - hosts the query context, cancellation token and allocator capability
//!   observed by every physical operator
//! - hosts operator metrics
//!
//! Key modules:
//! - [`config`]
//! - [`context`]
//! - [`error`]
//! - [`ids`]
//! - [`memory`]
//! - [`metrics`]

pub mod config;
pub mod context;
pub mod error;
pub mod ids;
pub mod memory;
pub mod metrics;

pub use config::EngineConfig;
pub use context::{CancellationToken, QueryContext};
pub use error::{Result, StrataError};
pub use ids::*;
pub use memory::{Allocator, MemoryBudget, MemoryReservation};
pub use metrics::{global_metrics, MetricsRegistry};
