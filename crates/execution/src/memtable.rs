//! In-memory table reader.
//!
//! Each table holds a list of partitions, each a list of record batches. The
//! iterator assigns partitions round-robin to the callbacks it is given and
//! drives every callback on its own scoped thread: batches in partition order,
//! then exactly one completion call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;

use arrow::array::{Array, BooleanArray};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use arrow_schema::SchemaRef;
use strata_common::{Allocator, MemoryReservation, QueryContext, Result, StrataError, TxId};
use strata_planner::{IterOptions, PartitionCallback, TableProvider, TableReader};
use tracing::debug;

use crate::expressions::{compile_expr, PhysicalExpr};

/// Partitioned, immutable in-memory table.
#[derive(Debug)]
pub struct MemTable {
    schema: SchemaRef,
    partitions: Vec<Vec<RecordBatch>>,
    next_tx: AtomicU64,
}

impl MemTable {
    /// Every batch must carry exactly `schema`'s fields.
    pub fn try_new(schema: SchemaRef, partitions: Vec<Vec<RecordBatch>>) -> Result<Self> {
        for (p, batches) in partitions.iter().enumerate() {
            for batch in batches {
                if batch.schema().fields() != schema.fields() {
                    return Err(StrataError::InvalidConfig(format!(
                        "batch in partition {p} does not match the table schema"
                    )));
                }
            }
        }
        Ok(Self {
            schema,
            partitions,
            next_tx: AtomicU64::new(1),
        })
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Compile the filter hints this reader can evaluate. Hints that do not
    /// compile are ignored: pruning is best effort.
    fn pruning_predicates(&self, options: &IterOptions) -> Vec<Arc<dyn PhysicalExpr>> {
        options
            .filters
            .iter()
            .filter_map(|f| match compile_expr(f, &self.schema) {
                Ok(p) => Some(p),
                Err(e) => {
                    debug!(hint = %f, error = %e, "ignoring filter hint");
                    None
                }
            })
            .collect()
    }

    fn drive(
        &self,
        ctx: &QueryContext,
        assigned: &[&Vec<RecordBatch>],
        scan: &ScanState<'_>,
        callback: &Arc<dyn PartitionCallback>,
    ) -> Result<()> {
        for batch in assigned.iter().flat_map(|p| p.iter()) {
            ctx.check_cancelled()?;
            if scan.prunes(batch) {
                continue;
            }
            let projected = scan.project(batch)?;
            let mut reservation = MemoryReservation::new(Arc::clone(scan.allocator));
            reservation.grow(projected.get_array_memory_size())?;
            callback.callback(ctx, projected)?;
        }
        ctx.check_cancelled()?;
        callback.finish(ctx)
    }
}

struct ScanState<'a> {
    schema: SchemaRef,
    indices: Vec<usize>,
    pruning: Vec<Arc<dyn PhysicalExpr>>,
    allocator: &'a Arc<dyn Allocator>,
}

impl ScanState<'_> {
    /// Whether some hint provably rejects every row of `batch`.
    fn prunes(&self, batch: &RecordBatch) -> bool {
        self.pruning.iter().any(|p| match p.evaluate(batch) {
            Ok(mask) => mask
                .as_any()
                .downcast_ref::<BooleanArray>()
                .is_some_and(|m| m.true_count() == 0 && m.len() > 0),
            Err(_) => false,
        })
    }

    fn project(&self, batch: &RecordBatch) -> Result<RecordBatch> {
        let columns = self
            .indices
            .iter()
            .map(|i| Arc::clone(batch.column(*i)))
            .collect::<Vec<_>>();
        let options = RecordBatchOptions::new().with_row_count(Some(batch.num_rows()));
        RecordBatch::try_new_with_options(Arc::clone(&self.schema), columns, &options)
            .map_err(|e| StrataError::execution(format!("cannot project scanned batch: {e}")))
    }
}

impl TableReader for MemTable {
    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn view(&self, ctx: &QueryContext, f: &mut dyn FnMut(TxId) -> Result<()>) -> Result<()> {
        ctx.check_cancelled()?;
        let tx = TxId(self.next_tx.fetch_add(1, Ordering::Relaxed));
        f(tx)
    }

    fn iterator(
        &self,
        ctx: &QueryContext,
        tx: TxId,
        allocator: Arc<dyn Allocator>,
        schema: SchemaRef,
        options: &IterOptions,
        callbacks: &[Arc<dyn PartitionCallback>],
    ) -> Result<()> {
        if callbacks.is_empty() {
            return Err(StrataError::execution("table scan needs at least one callback"));
        }
        let indices = schema
            .fields()
            .iter()
            .map(|f| {
                self.schema.index_of(f.name()).map_err(|_| {
                    StrataError::execution(format!("column '{}' is not in the table", f.name()))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let scan = ScanState {
            schema,
            indices,
            pruning: self.pruning_predicates(options),
            allocator: &allocator,
        };

        let mut assignments = vec![Vec::new(); callbacks.len()];
        for (p, batches) in self.partitions.iter().enumerate() {
            assignments[p % callbacks.len()].push(batches);
        }
        debug!(
            query_id = %ctx.query_id,
            tx = %tx,
            partitions = self.partitions.len(),
            callbacks = callbacks.len(),
            "memtable scan started"
        );

        thread::scope(|s| {
            let handles = callbacks
                .iter()
                .zip(&assignments)
                .map(|(cb, assigned)| {
                    let scan = &scan;
                    s.spawn(move || self.drive(ctx, assigned, scan, cb))
                })
                .collect::<Vec<_>>();
            let mut first_err = None;
            for handle in handles {
                let res = handle
                    .join()
                    .unwrap_or_else(|_| Err(StrataError::execution("scan thread panicked")));
                if let Err(e) = res {
                    first_err.get_or_insert(e);
                }
            }
            first_err.map_or(Ok(()), Err)
        })
    }
}

/// Name-to-table registry serving [`MemTable`]s.
#[derive(Debug, Default)]
pub struct MemTableProvider {
    tables: RwLock<HashMap<String, Arc<MemTable>>>,
}

impl MemTableProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a table. Returns the replaced table, if any.
    pub fn register_table(&self, name: &str, table: Arc<MemTable>) -> Option<Arc<MemTable>> {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), table)
    }
}

impl TableProvider for MemTableProvider {
    fn get_table(&self, name: &str) -> Result<Arc<dyn TableReader>> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|t| Arc::clone(t) as Arc<dyn TableReader>)
            .ok_or_else(|| StrataError::Plan(format!("table '{name}' not found")))
    }
}
