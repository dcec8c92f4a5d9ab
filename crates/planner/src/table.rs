//! Storage capabilities consumed by the engine.
//!
//! The engine never scans data itself. A [`TableProvider`] resolves table names
//! to [`TableReader`]s, and a reader pushes record batches into one
//! [`PartitionCallback`] per concurrently scanned partition.

use std::fmt::Debug;
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use serde::{Deserialize, Serialize};
use strata_common::{Allocator, QueryContext, Result, TxId};

use crate::logical_plan::Expr;

/// Resolves a table name to a readable handle.
pub trait TableProvider: Send + Sync + Debug {
    fn get_table(&self, name: &str) -> Result<Arc<dyn TableReader>>;
}

/// Readable handle for one table.
pub trait TableReader: Send + Sync + Debug {
    /// Full table schema.
    fn schema(&self) -> SchemaRef;

    /// Run `f` under a read-only view, handing it the view's transaction id.
    fn view(&self, ctx: &QueryContext, f: &mut dyn FnMut(TxId) -> Result<()>) -> Result<()>;

    /// Drive every callback with the batches of one partition followed by
    /// exactly one [`PartitionCallback::finish`] call.
    ///
    /// Batches conform to `schema` (the table schema narrowed by
    /// `options.projection`). Readers may scan partitions concurrently and
    /// must return the first error any callback reported.
    fn iterator(
        &self,
        ctx: &QueryContext,
        tx: TxId,
        allocator: Arc<dyn Allocator>,
        schema: SchemaRef,
        options: &IterOptions,
        callbacks: &[Arc<dyn PartitionCallback>],
    ) -> Result<()>;
}

/// Hints pushed down from the optimized logical plan into the reader.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IterOptions {
    /// Columns to materialize, in table order. `None` reads every column.
    pub projection: Option<Vec<String>>,
    /// Predicates the reader may use to skip data it can prove does not
    /// match. Skipping is best effort; rows that pass still get filtered
    /// downstream.
    pub filters: Vec<Expr>,
}

/// Per-partition receiver of the streaming protocol.
pub trait PartitionCallback: Send + Sync {
    /// Deliver one batch. Ownership of the batch moves to the callee.
    fn callback(&self, ctx: &QueryContext, batch: RecordBatch) -> Result<()>;

    /// Signal that this partition has no more batches.
    fn finish(&self, ctx: &QueryContext) -> Result<()>;
}
