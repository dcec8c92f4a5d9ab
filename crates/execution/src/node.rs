//! Physical plan nodes and the streaming protocol.
//!
//! A node owns its single downstream successor. Data flows producer to
//! consumer: `callback` pushes one batch, `finish` signals that no more
//! batches follow. Every call checks the query's cancellation token first.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use arrow::record_batch::RecordBatch;
use strata_common::{global_metrics, NodeId, PartitionId, QueryContext, Result, StrataError};
use strata_planner::PartitionCallback;
use tracing::{debug, Span};

use crate::aggregate::HashAggregate;
use crate::diagram::Diagram;
use crate::operators::{FilterOperator, OutputSink, ProjectOperator};
use crate::synchronizer::Synchronizer;

/// Closed set of physical operator kinds.
#[derive(Debug)]
pub enum Operator {
    Filter(FilterOperator),
    Project(ProjectOperator),
    HashAggregate(HashAggregate),
    /// Completion barrier shared by all partition instances.
    Synchronizer(Arc<Synchronizer>),
    /// Terminal result sink.
    Output(OutputSink),
}

impl Operator {
    pub fn name(&self) -> &'static str {
        match self {
            Operator::Filter(_) => "Filter",
            Operator::Project(_) => "Project",
            Operator::HashAggregate(_) => "HashAggregate",
            Operator::Synchronizer(_) => "Synchronizer",
            Operator::Output(_) => "Output",
        }
    }

    /// Whether the node exists to coordinate execution rather than to
    /// implement a logical operator.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Operator::Synchronizer(_) | Operator::Output(_))
    }
}

/// One physical operator instance wired to its downstream successor.
#[derive(Debug)]
pub struct PlanNode {
    id: NodeId,
    partition: Option<PartitionId>,
    operator: Operator,
    next: OnceLock<Arc<PlanNode>>,
    span: Span,
}

impl PlanNode {
    /// `partition` is `None` for nodes shared by every partition instance.
    pub fn new(
        id: NodeId,
        partition: Option<PartitionId>,
        operator: Operator,
        parent: &Span,
    ) -> Arc<Self> {
        let span = tracing::debug_span!(
            parent: parent,
            "operator",
            operator = operator.name(),
            node = id.0,
            partition = partition.map(|p| p.0)
        );
        Arc::new(Self {
            id,
            partition,
            operator,
            next: OnceLock::new(),
            span,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn partition(&self) -> Option<PartitionId> {
        self.partition
    }

    pub fn operator(&self) -> &Operator {
        &self.operator
    }

    pub fn next(&self) -> Option<&Arc<PlanNode>> {
        self.next.get()
    }

    /// Identity used in errors and diagrams, e.g. `Filter#1[p0]`.
    pub fn label(&self) -> String {
        match self.partition {
            Some(p) => format!("{}#{}[p{}]", self.operator.name(), self.id, p),
            None => format!("{}#{}", self.operator.name(), self.id),
        }
    }

    /// Wire the downstream successor. Succeeds once; the terminal output node
    /// never accepts one.
    pub fn set_next(&self, next: Arc<PlanNode>) -> Result<()> {
        if matches!(self.operator, Operator::Output(_)) {
            return Err(StrataError::execution("output node cannot have a successor")
                .in_node(&self.label()));
        }
        let next_label = next.label();
        self.next.set(next).map_err(|_| {
            StrataError::execution(format!(
                "successor already set, refusing to rewire to {next_label}"
            ))
            .in_node(&self.label())
        })
    }

    /// Push one batch through this node.
    pub fn callback(&self, ctx: &QueryContext, batch: RecordBatch) -> Result<()> {
        let _entered = self.span.enter();
        ctx.check_cancelled()?;
        self.dispatch(ctx, batch).map_err(|e| e.in_node(&self.label()))
    }

    /// Signal that no more batches follow on this path.
    pub fn finish(&self, ctx: &QueryContext) -> Result<()> {
        let _entered = self.span.enter();
        ctx.check_cancelled()?;
        self.complete(ctx).map_err(|e| e.in_node(&self.label()))
    }

    /// Render this node and everything downstream of it.
    pub fn draw(&self) -> Diagram {
        let details = match &self.operator {
            Operator::Filter(f) => format!("{} [{f}]", self.label()),
            Operator::Project(p) => format!("{} [{p}]", self.label()),
            Operator::HashAggregate(a) => format!("{} [{a}]", self.label()),
            Operator::Synchronizer(s) => {
                format!("{} [partitions={}]", self.label(), s.partitions())
            }
            Operator::Output(_) => self.label(),
        };
        Diagram::new(details, self.next().map(|n| n.draw()))
    }

    fn successor(&self) -> Result<&Arc<PlanNode>> {
        self.next
            .get()
            .ok_or_else(|| StrataError::execution("no successor wired"))
    }

    fn dispatch(&self, ctx: &QueryContext, batch: RecordBatch) -> Result<()> {
        let query_id = ctx.query_id.to_string();
        let rows_in = batch.num_rows() as u64;
        match &self.operator {
            Operator::Filter(f) => {
                let out = f.apply(&batch)?;
                drop(batch);
                global_metrics().record_operator(
                    &query_id,
                    "Filter",
                    rows_in,
                    out.num_rows() as u64,
                    1,
                );
                self.successor()?.callback(ctx, out)
            }
            Operator::Project(p) => {
                let out = p.apply(&batch)?;
                drop(batch);
                global_metrics().record_operator(
                    &query_id,
                    "Project",
                    rows_in,
                    out.num_rows() as u64,
                    1,
                );
                self.successor()?.callback(ctx, out)
            }
            Operator::HashAggregate(a) => {
                a.update(&batch)?;
                global_metrics().record_operator(&query_id, "HashAggregate", rows_in, 0, 0);
                Ok(())
            }
            Operator::Synchronizer(s) => {
                s.check_open()?;
                self.successor()?.callback(ctx, batch)
            }
            Operator::Output(o) => o.deliver(batch),
        }
    }

    fn complete(&self, ctx: &QueryContext) -> Result<()> {
        match &self.operator {
            Operator::Filter(_) | Operator::Project(_) => self.successor()?.finish(ctx),
            Operator::HashAggregate(a) => {
                let out = a.emit()?;
                debug!(
                    query_id = %ctx.query_id,
                    node = %self.label(),
                    rows = out.num_rows(),
                    "aggregate emitted"
                );
                global_metrics().record_emit(
                    &ctx.query_id.to_string(),
                    "HashAggregate",
                    out.num_rows() as u64,
                );
                let next = self.successor()?;
                next.callback(ctx, out)?;
                next.finish(ctx)
            }
            Operator::Synchronizer(s) => {
                if !s.arrive()? {
                    debug!(
                        query_id = %ctx.query_id,
                        outstanding = s.outstanding(),
                        "partition arrived at barrier"
                    );
                    return Ok(());
                }
                let outcome = self.successor().and_then(|next| next.finish(ctx));
                s.complete(&outcome);
                outcome
            }
            Operator::Output(o) => o.finish(),
        }
    }
}

impl fmt::Display for PlanNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Entry point of one partition instance, handed to the table reader.
///
/// Guards the per-partition protocol: no batch after completion and exactly
/// one completion. Any failure aborts the shared barrier so the query cannot
/// hang on a partition that will never finish.
#[derive(Debug)]
pub struct PartitionChain {
    partition: PartitionId,
    head: Arc<PlanNode>,
    barrier: Arc<Synchronizer>,
    finished: AtomicBool,
}

impl PartitionChain {
    pub fn new(partition: PartitionId, head: Arc<PlanNode>, barrier: Arc<Synchronizer>) -> Self {
        Self {
            partition,
            head,
            barrier,
            finished: AtomicBool::new(false),
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// First node of this partition's chain.
    pub fn head(&self) -> &Arc<PlanNode> {
        &self.head
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn fail(&self, err: StrataError) -> StrataError {
        if self.barrier.abort(&err) {
            debug!(partition = %self.partition, error = %err, "partition aborted the barrier");
        }
        err
    }
}

impl PartitionCallback for PartitionChain {
    fn callback(&self, ctx: &QueryContext, batch: RecordBatch) -> Result<()> {
        if self.is_finished() {
            return Err(self.fail(StrataError::execution(format!(
                "partition {} received a batch after it finished",
                self.partition
            ))));
        }
        self.head.callback(ctx, batch).map_err(|e| self.fail(e))
    }

    fn finish(&self, ctx: &QueryContext) -> Result<()> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return Err(self.fail(StrataError::execution(format!(
                "partition {} finished more than once",
                self.partition
            ))));
        }
        self.head.finish(ctx).map_err(|e| self.fail(e))?;
        global_metrics().inc_partitions_finished(&ctx.query_id.to_string());
        debug!(query_id = %ctx.query_id, partition = %self.partition, "partition finished");
        Ok(())
    }
}
