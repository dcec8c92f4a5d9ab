//! Logical planning layer for strata.
//!
//! Architecture role:
//! - defines the logical operator tree and expression language
//! - validates plans while they are built ([`PlanBuilder`])
//! - declares the storage capabilities the engine consumes
//!   ([`TableProvider`], [`TableReader`], [`PartitionCallback`])
//! - rewrites plans through ordered optimizer passes
//!
//! Key modules:
//! - [`logical_plan`]
//! - [`builder`]
//! - [`optimizer`]
//! - [`table`]
//! - [`explain`]

pub mod builder;
pub mod coercion;
pub mod explain;
pub mod logical_plan;
pub mod optimizer;
pub mod table;
pub mod visitor;

pub use builder::*;
pub use explain::explain_logical;
pub use logical_plan::*;
pub use optimizer::*;
pub use table::*;
pub use visitor::*;
