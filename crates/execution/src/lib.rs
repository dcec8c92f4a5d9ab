//! Physical planning and push-based execution for strata.
//!
//! Architecture role:
//! - compiles optimized logical plans into linked chains of physical operators
//!   ([`build`])
//! - evaluates expressions over Arrow record batches
//! - coordinates concurrently scanned partitions through a shared completion
//!   barrier so shared operators finish exactly once ([`PhysicalPlan`])
//! - ships an in-memory [`MemTable`] reader for embedding and tests
//!
//! Key modules:
//! - [`planner`]
//! - [`node`]
//! - [`plan`]
//! - [`synchronizer`]
//! - [`expressions`]

pub mod aggregate;
pub mod diagram;
pub mod expressions;
pub mod memtable;
pub mod node;
pub mod operators;
pub mod plan;
pub mod planner;
pub mod scalar;
pub mod synchronizer;

// Re-export only what you want at the crate root (no globs).
pub use aggregate::HashAggregate;
pub use diagram::Diagram;
pub use expressions::{compile_expr, PhysicalExpr};
pub use memtable::{MemTable, MemTableProvider};
pub use node::{Operator, PartitionChain, PlanNode};
pub use operators::{BatchConsumer, FilterOperator, OutputSink, ProjectOperator};
pub use plan::PhysicalPlan;
pub use planner::{build, PhysicalPlannerConfig};
pub use synchronizer::Synchronizer;
