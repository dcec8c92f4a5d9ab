#![allow(dead_code)]

use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema, SchemaRef};
use strata_common::{Allocator, QueryContext, Result, StrataError, TxId};
use strata_planner::{
    col, lit, AggExpr, IterOptions, LogicalPlan, PartitionCallback, PlanBuilder, TableProvider,
    TableReader,
};

/// Reader that only exposes a schema; planner tests never scan.
#[derive(Debug)]
pub struct SchemaOnlyReader {
    schema: SchemaRef,
}

impl TableReader for SchemaOnlyReader {
    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn view(&self, _ctx: &QueryContext, f: &mut dyn FnMut(TxId) -> Result<()>) -> Result<()> {
        f(TxId(0))
    }

    fn iterator(
        &self,
        _ctx: &QueryContext,
        _tx: TxId,
        _allocator: Arc<dyn Allocator>,
        _schema: SchemaRef,
        _options: &IterOptions,
        _callbacks: &[Arc<dyn PartitionCallback>],
    ) -> Result<()> {
        Err(StrataError::Unsupported(
            "schema-only reader cannot scan".to_string(),
        ))
    }
}

#[derive(Debug)]
pub struct SamplesProvider;

impl TableProvider for SamplesProvider {
    fn get_table(&self, name: &str) -> Result<Arc<dyn TableReader>> {
        match name {
            "samples" => Ok(Arc::new(SchemaOnlyReader {
                schema: samples_schema(),
            })),
            other => Err(StrataError::Plan(format!("unknown table '{other}'"))),
        }
    }
}

pub fn samples_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("timestamp", DataType::Int64, false),
        Field::new("label", DataType::Utf8, true),
        Field::new("stacktrace", DataType::Utf8, true),
        Field::new("value", DataType::Int64, true),
        Field::new("duration", DataType::Float64, true),
    ]))
}

pub fn samples() -> PlanBuilder {
    PlanBuilder::scan(Arc::new(SamplesProvider), "samples").expect("scan samples")
}

/// Scan -> Filter(label = 'abc') -> Aggregate(sum(value) by stacktrace) -> Project.
pub fn label_sum_plan() -> LogicalPlan {
    samples()
        .filter(col("label").eq(lit("abc")))
        .and_then(|b| {
            b.aggregate(
                vec![(AggExpr::Sum(col("value")), "value_sum".to_string())],
                vec![col("stacktrace")],
            )
        })
        .and_then(|b| b.project_columns(&["stacktrace", "value_sum"]))
        .expect("label sum plan")
        .build()
}

pub fn scan_of(plan: &LogicalPlan) -> &LogicalPlan {
    let mut node = plan;
    while let Some(input) = node.input() {
        node = input;
    }
    node
}

pub fn scan_projection(plan: &LogicalPlan) -> Option<Vec<String>> {
    match scan_of(plan) {
        LogicalPlan::TableScan { projection, .. } => projection.clone(),
        _ => None,
    }
}

pub fn scan_filters(plan: &LogicalPlan) -> Vec<strata_planner::Expr> {
    match scan_of(plan) {
        LogicalPlan::TableScan { filters, .. } => filters.clone(),
        _ => Vec::new(),
    }
}

/// Node names root-to-leaf.
pub fn shape(plan: &LogicalPlan) -> Vec<&'static str> {
    let mut out = Vec::new();
    let mut node = Some(plan);
    while let Some(n) = node {
        out.push(n.name());
        node = n.input();
    }
    out
}
