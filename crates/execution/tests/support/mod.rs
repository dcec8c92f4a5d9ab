#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arrow::array::{Array, Float64Array, Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use strata_common::{Allocator, MemoryBudget, QueryContext, QueryId, Result, StrataError, TxId};
use strata_execution::{build, MemTable, MemTableProvider, PhysicalPlan, PhysicalPlannerConfig};
use strata_planner::{
    col, lit, AggExpr, IterOptions, LogicalPlan, PartitionCallback, PlanBuilder, TableProvider,
    TableReader,
};
use tracing::Span;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
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

/// One batch of `samples` rows given as `(label, stacktrace, value)`.
pub fn samples_batch(rows: &[(&str, &str, i64)]) -> RecordBatch {
    let n = rows.len() as i64;
    RecordBatch::try_new(
        samples_schema(),
        vec![
            Arc::new(Int64Array::from((0..n).collect::<Vec<_>>())),
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.0).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.1).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(rows.iter().map(|r| r.2).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.2 as f64 / 10.0).collect::<Vec<_>>(),
            )),
        ],
    )
    .expect("samples batch")
}

pub fn mem_provider(partitions: Vec<Vec<RecordBatch>>) -> Arc<MemTableProvider> {
    let provider = Arc::new(MemTableProvider::new());
    let table = MemTable::try_new(samples_schema(), partitions).expect("memtable");
    provider.register_table("samples", Arc::new(table));
    provider
}

/// Scan -> Filter(label = 'abc') -> Aggregate(sum(value) by stacktrace) -> Project.
pub fn label_sum_plan(provider: Arc<dyn TableProvider>) -> LogicalPlan {
    PlanBuilder::scan(provider, "samples")
        .and_then(|b| b.filter(col("label").eq(lit("abc"))))
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

pub fn planner_config(concurrency: usize) -> PhysicalPlannerConfig {
    PhysicalPlannerConfig {
        concurrency,
        barrier_timeout: Duration::from_secs(10),
    }
}

pub fn compile(plan: &LogicalPlan, concurrency: usize) -> PhysicalPlan {
    compile_with(plan, &planner_config(concurrency))
}

pub fn compile_with(plan: &LogicalPlan, cfg: &PhysicalPlannerConfig) -> PhysicalPlan {
    build(
        plan,
        samples_schema(),
        MemoryBudget::unbounded(),
        &Span::none(),
        cfg,
    )
    .expect("build physical plan")
}

pub fn ctx(id: u64) -> QueryContext {
    QueryContext::new(QueryId(id))
}

pub fn strings(batch: &RecordBatch, name: &str) -> Vec<Option<String>> {
    let idx = batch.schema().index_of(name).expect("column");
    let arr = batch
        .column(idx)
        .as_any()
        .downcast_ref::<StringArray>()
        .expect("utf8 column");
    (0..arr.len())
        .map(|i| (!arr.is_null(i)).then(|| arr.value(i).to_string()))
        .collect()
}

pub fn ints(batch: &RecordBatch, name: &str) -> Vec<Option<i64>> {
    let idx = batch.schema().index_of(name).expect("column");
    let arr = batch
        .column(idx)
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("int64 column");
    (0..arr.len())
        .map(|i| (!arr.is_null(i)).then(|| arr.value(i)))
        .collect()
}

/// What a [`ScriptedReader`] does after delivering every partition's batches.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Callback indices in the order `finish` is called. Defaults to 0..n.
    pub finish_order: Option<Vec<usize>>,
    /// Call each `finish` from its own thread.
    pub threaded: bool,
    /// Never finish this callback.
    pub skip_finish: Option<usize>,
    /// Finish this callback a second time once all finished.
    pub finish_twice: Option<usize>,
    /// Deliver another batch to this callback once all finished.
    pub batch_after_finish: Option<usize>,
    /// Cancel the query after this many accepted batches.
    pub cancel_after: Option<usize>,
}

/// Reader that follows a [`Script`], for exercising the completion protocol.
#[derive(Debug)]
pub struct ScriptedReader {
    partitions: Vec<Vec<RecordBatch>>,
    script: Script,
    /// Incremented right before each `finish` call.
    pub finishes: Arc<AtomicUsize>,
    /// Batches the chain accepted without error.
    pub accepted: AtomicUsize,
}

impl ScriptedReader {
    pub fn new(partitions: Vec<Vec<RecordBatch>>, script: Script) -> Arc<Self> {
        Arc::new(Self {
            partitions,
            script,
            finishes: Arc::new(AtomicUsize::new(0)),
            accepted: AtomicUsize::new(0),
        })
    }

    fn finish_one(&self, ctx: &QueryContext, cb: &Arc<dyn PartitionCallback>) -> Result<()> {
        self.finishes.fetch_add(1, Ordering::SeqCst);
        cb.finish(ctx)
    }
}

fn project(batch: &RecordBatch, schema: &SchemaRef) -> RecordBatch {
    let indices = schema
        .fields()
        .iter()
        .map(|f| batch.schema().index_of(f.name()).expect("projected column"))
        .collect::<Vec<_>>();
    batch.project(&indices).expect("project")
}

impl TableReader for ScriptedReader {
    fn schema(&self) -> SchemaRef {
        samples_schema()
    }

    fn view(&self, _ctx: &QueryContext, f: &mut dyn FnMut(TxId) -> Result<()>) -> Result<()> {
        f(TxId(1))
    }

    fn iterator(
        &self,
        ctx: &QueryContext,
        _tx: TxId,
        _allocator: Arc<dyn Allocator>,
        schema: SchemaRef,
        _options: &IterOptions,
        callbacks: &[Arc<dyn PartitionCallback>],
    ) -> Result<()> {
        for (i, cb) in callbacks.iter().enumerate() {
            for batch in self.partitions.get(i).into_iter().flatten() {
                cb.callback(ctx, project(batch, &schema))?;
                let accepted = self.accepted.fetch_add(1, Ordering::SeqCst) + 1;
                if self.script.cancel_after == Some(accepted) {
                    ctx.cancel.cancel();
                }
            }
        }

        let order = self
            .script
            .finish_order
            .clone()
            .unwrap_or_else(|| (0..callbacks.len()).collect());
        let order = order
            .into_iter()
            .filter(|i| self.script.skip_finish != Some(*i))
            .collect::<Vec<_>>();
        if self.script.threaded {
            thread::scope(|s| {
                let handles = order
                    .iter()
                    .enumerate()
                    .map(|(pos, &i)| {
                        let cb = &callbacks[i];
                        s.spawn(move || {
                            thread::sleep(Duration::from_millis((pos as u64 * 3) % 7));
                            self.finish_one(ctx, cb)
                        })
                    })
                    .collect::<Vec<_>>();
                handles
                    .into_iter()
                    .map(|h| {
                        h.join()
                            .unwrap_or_else(|_| Err(StrataError::execution("finish panicked")))
                    })
                    .collect::<Result<Vec<_>>>()
            })?;
        } else {
            for i in order {
                self.finish_one(ctx, &callbacks[i])?;
            }
        }

        if let Some(i) = self.script.finish_twice {
            callbacks[i].finish(ctx)?;
        }
        if let Some(i) = self.script.batch_after_finish {
            let batch = samples_batch(&[("abc", "late", 1)]);
            callbacks[i].callback(ctx, project(&batch, &schema))?;
        }
        Ok(())
    }
}

/// Serves one reader under the name `samples`.
#[derive(Debug)]
pub struct SingleTable(pub Arc<dyn TableReader>);

impl TableProvider for SingleTable {
    fn get_table(&self, name: &str) -> Result<Arc<dyn TableReader>> {
        if name == "samples" {
            Ok(Arc::clone(&self.0))
        } else {
            Err(StrataError::Plan(format!("unknown table '{name}'")))
        }
    }
}

pub fn scripted_provider(reader: &Arc<ScriptedReader>) -> Arc<dyn TableProvider> {
    Arc::new(SingleTable(Arc::clone(reader) as Arc<dyn TableReader>))
}
