//! Stateless streaming transforms and the terminal output sink.

use std::fmt;
use std::sync::{Arc, Mutex};

use arrow::array::{ArrayRef, BooleanArray};
use arrow::compute::filter_record_batch;
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use arrow_schema::{DataType, SchemaRef};
use strata_common::{Result, StrataError};

use crate::expressions::PhysicalExpr;

/// Keeps the rows for which the predicate is true. Null counts as false.
///
/// Batches where nothing matches are forwarded empty, never dropped.
#[derive(Debug, Clone)]
pub struct FilterOperator {
    predicate: Arc<dyn PhysicalExpr>,
    display: String,
}

impl FilterOperator {
    pub fn try_new(predicate: Arc<dyn PhysicalExpr>, display: String) -> Result<Self> {
        if predicate.data_type() != DataType::Boolean {
            return Err(StrataError::Compile(format!(
                "filter predicate '{display}' evaluates to {}, expected Boolean",
                predicate.data_type()
            )));
        }
        Ok(Self { predicate, display })
    }

    pub fn apply(&self, batch: &RecordBatch) -> Result<RecordBatch> {
        let mask = self.predicate.evaluate(batch)?;
        let mask = mask
            .as_any()
            .downcast_ref::<BooleanArray>()
            .ok_or_else(|| StrataError::execution("filter predicate did not produce booleans"))?;
        filter_record_batch(batch, mask)
            .map_err(|e| StrataError::execution(format!("filter kernel failed: {e}")))
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display)
    }
}

/// Evaluates an ordered output list; row count is unchanged.
#[derive(Debug, Clone)]
pub struct ProjectOperator {
    exprs: Vec<Arc<dyn PhysicalExpr>>,
    schema: SchemaRef,
}

impl ProjectOperator {
    pub fn try_new(exprs: Vec<Arc<dyn PhysicalExpr>>, schema: SchemaRef) -> Result<Self> {
        if exprs.len() != schema.fields().len() {
            return Err(StrataError::Compile(format!(
                "projection has {} expressions for {} output fields",
                exprs.len(),
                schema.fields().len()
            )));
        }
        Ok(Self { exprs, schema })
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    pub fn apply(&self, batch: &RecordBatch) -> Result<RecordBatch> {
        let columns = self
            .exprs
            .iter()
            .map(|e| e.evaluate(batch))
            .collect::<Result<Vec<ArrayRef>>>()?;
        let options = RecordBatchOptions::new().with_row_count(Some(batch.num_rows()));
        RecordBatch::try_new_with_options(Arc::clone(&self.schema), columns, &options)
            .map_err(|e| StrataError::execution(format!("projection produced invalid batch: {e}")))
    }
}

impl fmt::Display for ProjectOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self
            .schema
            .fields()
            .iter()
            .map(|f| f.name().as_str())
            .collect::<Vec<_>>();
        write!(f, "{}", names.join(", "))
    }
}

/// Caller-supplied receiver of the final result batches.
pub type BatchConsumer = Box<dyn FnMut(RecordBatch) -> Result<()> + Send>;

struct OutputState {
    consumer: Option<BatchConsumer>,
    finished: bool,
    batches: usize,
    rows: usize,
}

/// Terminal node. Forwards batches to the installed consumer and records the
/// single completion signal.
pub struct OutputSink {
    schema: SchemaRef,
    state: Mutex<OutputState>,
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSink")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl OutputSink {
    pub fn new(schema: SchemaRef) -> Self {
        Self {
            schema,
            state: Mutex::new(OutputState {
                consumer: None,
                finished: false,
                batches: 0,
                rows: 0,
            }),
        }
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    /// Install the consumer. Only one consumer may ever be installed.
    pub fn install(&self, consumer: BatchConsumer) -> Result<()> {
        let mut state = self.lock()?;
        if state.consumer.is_some() {
            return Err(StrataError::execution("output consumer already installed"));
        }
        state.consumer = Some(consumer);
        Ok(())
    }

    pub fn deliver(&self, batch: RecordBatch) -> Result<()> {
        let mut state = self.lock()?;
        if state.finished {
            return Err(StrataError::execution("batch delivered after output finished"));
        }
        state.batches += 1;
        state.rows += batch.num_rows();
        match state.consumer.as_mut() {
            Some(consumer) => consumer(batch),
            None => Err(StrataError::execution("no output consumer installed")),
        }
    }

    pub fn finish(&self) -> Result<()> {
        let mut state = self.lock()?;
        if state.finished {
            return Err(StrataError::execution("output finished more than once"));
        }
        state.finished = true;
        // release whatever the consumer captured
        state.consumer = None;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().map(|s| s.finished).unwrap_or(false)
    }

    /// `(batches, rows)` delivered so far.
    pub fn delivered(&self) -> (usize, usize) {
        self.state
            .lock()
            .map(|s| (s.batches, s.rows))
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, OutputState>> {
        self.state
            .lock()
            .map_err(|_| StrataError::execution("output lock poisoned"))
    }
}
