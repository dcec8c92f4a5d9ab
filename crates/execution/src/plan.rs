//! Compiled plan: scan adapter plus execution coordinator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use strata_common::{global_metrics, Allocator, QueryContext, Result, StrataError};
use strata_planner::{IterOptions, PartitionCallback, TableReader};
use tracing::{debug, info, warn, Span};

use crate::diagram::Diagram;
use crate::node::{Operator, PartitionChain, PlanNode};
use crate::operators::OutputSink;
use crate::synchronizer::Synchronizer;

/// Runnable physical plan produced by [`crate::build`].
///
/// Holds the table reader with the pushed-down scan options, one
/// [`PartitionChain`] per partition instance, the shared completion barrier
/// and the output sink. A plan executes at most once.
#[derive(Debug)]
pub struct PhysicalPlan {
    pub(crate) table: String,
    pub(crate) reader: Arc<dyn TableReader>,
    pub(crate) scan_schema: SchemaRef,
    pub(crate) options: IterOptions,
    pub(crate) allocator: Arc<dyn Allocator>,
    pub(crate) partitions: Vec<Arc<PartitionChain>>,
    pub(crate) barrier: Arc<Synchronizer>,
    pub(crate) output: Arc<PlanNode>,
    pub(crate) pipeline: Vec<&'static str>,
    pub(crate) barrier_timeout: Duration,
    pub(crate) started: AtomicBool,
    pub(crate) span: Span,
}

impl PhysicalPlan {
    /// Schema of the result batches.
    pub fn schema(&self) -> SchemaRef {
        match self.output.operator() {
            Operator::Output(sink) => sink.schema(),
            _ => Arc::clone(&self.scan_schema),
        }
    }

    /// Schema of the batches the reader is asked to produce.
    pub fn scan_schema(&self) -> SchemaRef {
        Arc::clone(&self.scan_schema)
    }

    /// Projection and filter hints handed to the reader.
    pub fn iter_options(&self) -> &IterOptions {
        &self.options
    }

    pub fn partitions(&self) -> &[Arc<PartitionChain>] {
        &self.partitions
    }

    pub fn barrier(&self) -> &Arc<Synchronizer> {
        &self.barrier
    }

    /// Operator kinds in data-flow order, scan adapter first. Barrier and
    /// output nodes are not listed.
    pub fn pipeline(&self) -> &[&'static str] {
        &self.pipeline
    }

    /// One operator per logical node: equals the logical plan's node count.
    pub fn operator_count(&self) -> usize {
        self.pipeline.len()
    }

    /// Diagram of the first partition's path from the scan to the output.
    pub fn draw(&self) -> Diagram {
        let projection = match &self.options.projection {
            Some(cols) => format!("[{}]", cols.join(", ")),
            None => "*".to_string(),
        };
        let scan = format!(
            "TableScan#0 [table={}, projection={projection}, hints={}]",
            self.table,
            self.options.filters.len()
        );
        Diagram::new(scan, self.partitions.first().map(|p| p.head().draw()))
    }

    /// Whether the output received its completion signal.
    pub fn is_finished(&self) -> bool {
        self.output_sink().map(OutputSink::is_finished).unwrap_or(false)
    }

    /// Run the scan and push every result batch into `consumer`.
    ///
    /// Returns once the completion barrier released (all partitions finished
    /// and the output completed) or with the first error any partition, the
    /// reader or the barrier timeout produced. Batches delivered before an
    /// error are not retracted; treat a failed execution as having no result.
    pub fn execute<F>(&self, ctx: &QueryContext, consumer: F) -> Result<()>
    where
        F: FnMut(RecordBatch) -> Result<()> + Send + 'static,
    {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(StrataError::execution(
                "physical plan already executed; compile a new plan per execution",
            ));
        }
        let _entered = self.span.enter();
        let sink = self.output_sink()?;
        sink.install(Box::new(consumer))?;

        let query_id = ctx.query_id.to_string();
        let started = Instant::now();
        info!(
            query_id = %ctx.query_id,
            table = %self.table,
            partitions = self.partitions.len(),
            "execution started"
        );

        let callbacks = self
            .partitions
            .iter()
            .map(|p| Arc::clone(p) as Arc<dyn PartitionCallback>)
            .collect::<Vec<_>>();
        let scanned = self.reader.view(ctx, &mut |tx| {
            debug!(query_id = %ctx.query_id, tx = %tx, "scan view opened");
            self.reader.iterator(
                ctx,
                tx,
                Arc::clone(&self.allocator),
                Arc::clone(&self.scan_schema),
                &self.options,
                &callbacks,
            )
        });
        if let Err(e) = &scanned {
            self.barrier.abort(e);
        }
        let waited = self.barrier.wait(self.barrier_timeout);

        // the barrier keeps the first failure any partition reported
        let result = match (scanned, waited) {
            (_, Err(first)) => Err(first),
            (Err(e), Ok(())) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        };

        global_metrics().observe_execution(&query_id, started.elapsed().as_secs_f64());
        match &result {
            Ok(()) => {
                let (batches, rows) = sink.delivered();
                info!(
                    query_id = %ctx.query_id,
                    batches,
                    rows,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "execution finished"
                );
            }
            Err(e) if e.is_cancelled() => {
                global_metrics().inc_cancelled(&query_id);
                warn!(query_id = %ctx.query_id, "execution cancelled");
            }
            Err(e) => {
                warn!(query_id = %ctx.query_id, stage = e.stage(), error = %e, "execution failed");
            }
        }
        result
    }

    /// Execute and gather every result batch.
    pub fn collect(&self, ctx: &QueryContext) -> Result<Vec<RecordBatch>> {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        self.execute(ctx, move |batch| {
            sink.lock()
                .map_err(|_| StrataError::execution("result buffer lock poisoned"))?
                .push(batch);
            Ok(())
        })?;
        let mut guard = batches
            .lock()
            .map_err(|_| StrataError::execution("result buffer lock poisoned"))?;
        Ok(std::mem::take(&mut *guard))
    }

    fn output_sink(&self) -> Result<&OutputSink> {
        match self.output.operator() {
            Operator::Output(sink) => Ok(sink),
            other => Err(StrataError::execution(format!(
                "plan ends in {} instead of an output node",
                other.name()
            ))),
        }
    }
}
