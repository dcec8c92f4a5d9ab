//! Compile an optimized logical plan into a runnable [`PhysicalPlan`].
//!
//! Input contract:
//! - the plan was produced by the plan builder (and optionally optimized), so
//!   its single leaf is a table scan;
//! - `table_schema` is the authoritative schema of the scanned table.
//!
//! Output shape:
//! - `concurrency` partition instances of the streaming prefix (every node
//!   below the first aggregate), each ending at one shared [`Synchronizer`];
//! - after the synchronizer, one shared suffix starting at the first
//!   aggregate, ending in the output sink.
//!
//! Data flows leaf to root: the operator compiled from the node directly above
//! the scan receives batches first.

use std::sync::Arc;
use std::time::Duration;

use arrow_schema::{Field, Schema, SchemaRef};
use strata_common::{Allocator, EngineConfig, NodeId, PartitionId, Result, StrataError};
use strata_planner::{Expr, IterOptions, LogicalPlan};
use tracing::{debug, info, info_span, Span};

use crate::aggregate::HashAggregate;
use crate::expressions::compile_expr;
use crate::node::{Operator, PartitionChain, PlanNode};
use crate::operators::{FilterOperator, OutputSink, ProjectOperator};
use crate::plan::PhysicalPlan;
use crate::synchronizer::Synchronizer;

/// Knobs the compiler needs from the engine configuration.
#[derive(Debug, Clone)]
pub struct PhysicalPlannerConfig {
    /// Partition chain instances to build.
    pub concurrency: usize,
    /// How long execution waits for all partitions to finish.
    pub barrier_timeout: Duration,
}

impl Default for PhysicalPlannerConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for PhysicalPlannerConfig {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            concurrency: cfg.concurrency,
            barrier_timeout: Duration::from_millis(cfg.barrier_timeout_ms),
        }
    }
}

/// Compile `plan` into a physical operator chain.
///
/// Fails with [`StrataError::Compile`] when the table cannot be resolved, when
/// the table schema lacks a projected column, or when any expression does not
/// resolve against its operator's input schema.
pub fn build(
    plan: &LogicalPlan,
    table_schema: SchemaRef,
    allocator: Arc<dyn Allocator>,
    span: &Span,
    cfg: &PhysicalPlannerConfig,
) -> Result<PhysicalPlan> {
    if cfg.concurrency == 0 {
        return Err(StrataError::InvalidConfig(
            "concurrency must be at least 1".to_string(),
        ));
    }
    let build_span = info_span!(parent: span, "build_physical_plan", concurrency = cfg.concurrency);
    let _entered = build_span.enter();

    // root-to-leaf in the logical tree, leaf-to-root once reversed
    let mut flow = Vec::with_capacity(plan.node_count());
    let mut cur = Some(plan);
    while let Some(node) = cur {
        flow.push(node);
        cur = node.input();
    }
    flow.reverse();

    let (leaf, above) = flow
        .split_first()
        .ok_or_else(|| StrataError::Compile("empty logical plan".to_string()))?;
    let LogicalPlan::TableScan {
        table,
        provider,
        projection,
        filters,
        ..
    } = leaf
    else {
        return Err(StrataError::Compile(format!(
            "plan leaf is {}, expected a table scan",
            leaf.name()
        )));
    };

    let reader = provider
        .get_table(table)
        .map_err(|e| StrataError::Compile(format!("cannot resolve table '{table}': {e}")))?;
    let scan_schema = scan_schema(&table_schema, projection.as_deref())?;
    debug!(
        table = %table,
        columns = scan_schema.fields().len(),
        hints = filters.len(),
        "compiled scan"
    );

    let mut pipeline = vec!["TableScan"];
    let mut prefix = Vec::new();
    let mut suffix = Vec::new();
    let mut schema = Arc::clone(&scan_schema);
    for node in above {
        let (operator, out_schema) = compile_node(node, &schema, &allocator)?;
        debug!(
            operator = operator.name(),
            logical = node.name(),
            fields = out_schema.fields().len(),
            "compiled operator"
        );
        pipeline.push(operator.name());
        if suffix.is_empty() && !matches!(operator, Operator::HashAggregate(_)) {
            prefix.push(operator);
        } else {
            suffix.push(operator);
        }
        schema = out_schema;
    }

    // node ids follow data flow: scan adapter 0, prefix, barrier, suffix, output
    let barrier_id = prefix.len() + 1;
    let output = PlanNode::new(
        NodeId(barrier_id + suffix.len() + 1),
        None,
        Operator::Output(OutputSink::new(Arc::clone(&schema))),
        span,
    );
    let mut downstream = Arc::clone(&output);
    for (j, operator) in suffix.into_iter().enumerate().rev() {
        let node = PlanNode::new(NodeId(barrier_id + 1 + j), None, operator, span);
        node.set_next(downstream)?;
        downstream = node;
    }

    let barrier = Arc::new(Synchronizer::new(cfg.concurrency));
    let barrier_node = PlanNode::new(
        NodeId(barrier_id),
        None,
        Operator::Synchronizer(Arc::clone(&barrier)),
        span,
    );
    barrier_node.set_next(downstream)?;

    let mut partitions = Vec::with_capacity(cfg.concurrency);
    for p in 0..cfg.concurrency {
        let partition = PartitionId(p);
        let mut head = Arc::clone(&barrier_node);
        for (i, template) in prefix.iter().enumerate().rev() {
            let node = PlanNode::new(NodeId(i + 1), Some(partition), replicate(template)?, span);
            node.set_next(head)?;
            head = node;
        }
        partitions.push(Arc::new(PartitionChain::new(
            partition,
            head,
            Arc::clone(&barrier),
        )));
    }

    info!(
        table = %table,
        operators = pipeline.len(),
        partitions = cfg.concurrency,
        "physical plan compiled"
    );

    Ok(PhysicalPlan {
        table: table.clone(),
        reader,
        scan_schema,
        options: IterOptions {
            projection: projection.clone(),
            filters: filters.clone(),
        },
        allocator,
        partitions,
        barrier,
        output,
        pipeline,
        barrier_timeout: cfg.barrier_timeout,
        started: Default::default(),
        span: span.clone(),
    })
}

fn scan_schema(table_schema: &SchemaRef, projection: Option<&[String]>) -> Result<SchemaRef> {
    let Some(cols) = projection else {
        return Ok(Arc::clone(table_schema));
    };
    let indices = cols
        .iter()
        .map(|c| {
            table_schema.index_of(c).map_err(|_| {
                StrataError::Compile(format!("projected column '{c}' is not in the table schema"))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let projected = table_schema
        .project(&indices)
        .map_err(|e| StrataError::Compile(format!("cannot project table schema: {e}")))?;
    Ok(Arc::new(projected))
}

fn compile_node(
    node: &LogicalPlan,
    input: &SchemaRef,
    allocator: &Arc<dyn Allocator>,
) -> Result<(Operator, SchemaRef)> {
    match node {
        LogicalPlan::Filter { predicate, .. } => {
            let compiled = compile_expr(predicate, input)?;
            let op = FilterOperator::try_new(compiled, predicate.to_string())?;
            Ok((Operator::Filter(op), Arc::clone(input)))
        }
        LogicalPlan::Projection { exprs, .. } => {
            let mut compiled = Vec::with_capacity(exprs.len());
            let mut fields = Vec::with_capacity(exprs.len());
            for (e, alias) in exprs {
                let c = compile_expr(e, input)?;
                let nullable = match e {
                    Expr::Column(name) => input
                        .field_with_name(name)
                        .map_or(true, |f| f.is_nullable()),
                    _ => true,
                };
                fields.push(Field::new(alias, c.data_type(), nullable));
                compiled.push(c);
            }
            let op = ProjectOperator::try_new(compiled, Arc::new(Schema::new(fields)))?;
            let schema = op.schema();
            Ok((Operator::Project(op), schema))
        }
        LogicalPlan::Aggregate {
            group_exprs,
            aggr_exprs,
            ..
        } => {
            let op = HashAggregate::try_new(group_exprs, aggr_exprs, input, Arc::clone(allocator))?;
            let schema = op.schema();
            Ok((Operator::HashAggregate(op), schema))
        }
        LogicalPlan::TableScan { table, .. } => Err(StrataError::Compile(format!(
            "scan of '{table}' can only appear as the plan leaf"
        ))),
    }
}

/// Fresh per-partition copy of a streaming operator.
fn replicate(template: &Operator) -> Result<Operator> {
    match template {
        Operator::Filter(f) => Ok(Operator::Filter(f.clone())),
        Operator::Project(p) => Ok(Operator::Project(p.clone())),
        other => Err(StrataError::Compile(format!(
            "{} cannot be instantiated per partition",
            other.name()
        ))),
    }
}
