//! Hash aggregate shared by every partition of a query.
//!
//! Partitions update the group table concurrently; every update of the table
//! is a critical section under one mutex. Accumulation is commutative, so the
//! finalized output does not depend on the interleaving of partitions. Output
//! rows are sorted by group key.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};

use arrow::array::{Array, ArrayRef};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use strata_common::{Allocator, MemoryReservation, Result, StrataError};
use strata_planner::coercion::sum_type;
use strata_planner::{AggExpr, Expr};

use crate::expressions::{cast_if_needed, compile_expr, PhysicalExpr};
use crate::scalar::{
    canonical_type, cmp_keys, cmp_scalars, is_scalar_type, scalar_from_array, scalars_to_array,
    ScalarValue,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggKind {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

#[derive(Debug)]
struct AggSpec {
    kind: AggKind,
    input: Arc<dyn PhysicalExpr>,
    out_type: DataType,
    display: String,
}

#[derive(Debug, Clone)]
enum AggState {
    Count(i64),
    SumInt(Option<i64>),
    SumUInt(Option<u64>),
    SumFloat(Option<f64>),
    Min(Option<ScalarValue>),
    Max(Option<ScalarValue>),
    Avg { sum: f64, count: i64 },
}

type GroupMap = HashMap<Vec<ScalarValue>, Vec<AggState>>;

#[derive(Debug)]
struct GroupTable {
    groups: GroupMap,
    reservation: MemoryReservation,
    emitted: bool,
}

/// Group-by aggregate that emits one batch on completion.
#[derive(Debug)]
pub struct HashAggregate {
    group_exprs: Vec<Arc<dyn PhysicalExpr>>,
    group_types: Vec<DataType>,
    aggs: Vec<AggSpec>,
    schema: SchemaRef,
    table: Mutex<GroupTable>,
}

impl HashAggregate {
    /// Compile group keys and aggregates against `input_schema`.
    pub fn try_new(
        group_exprs: &[Expr],
        aggr_exprs: &[(AggExpr, String)],
        input_schema: &SchemaRef,
        allocator: Arc<dyn Allocator>,
    ) -> Result<Self> {
        let mut fields = Vec::with_capacity(group_exprs.len() + aggr_exprs.len());
        let mut keys = Vec::with_capacity(group_exprs.len());
        let mut group_types = Vec::with_capacity(group_exprs.len());
        for g in group_exprs {
            let compiled = compile_expr(g, input_schema)?;
            let dt = compiled.data_type();
            if !is_scalar_type(&dt) {
                return Err(StrataError::Compile(format!(
                    "cannot group by {dt} key '{g}'"
                )));
            }
            fields.push(Field::new(g.output_name(), dt.clone(), true));
            keys.push(cast_if_needed(compiled, &canonical_type(&dt)));
            group_types.push(dt);
        }

        let mut aggs = Vec::with_capacity(aggr_exprs.len());
        for (agg, alias) in aggr_exprs {
            let compiled = compile_expr(agg.input(), input_schema)?;
            let in_type = compiled.data_type();
            let (kind, input, out_type) = match agg {
                AggExpr::Count(_) => (AggKind::Count, compiled, DataType::Int64),
                AggExpr::Sum(_) => {
                    let st = sum_type(&in_type).ok_or_else(|| {
                        StrataError::Compile(format!("cannot sum {in_type} in '{agg}'"))
                    })?;
                    (AggKind::Sum, cast_if_needed(compiled, &st), st)
                }
                AggExpr::Avg(_) => {
                    if sum_type(&in_type).is_none() {
                        return Err(StrataError::Compile(format!(
                            "cannot average {in_type} in '{agg}'"
                        )));
                    }
                    (
                        AggKind::Avg,
                        cast_if_needed(compiled, &DataType::Float64),
                        DataType::Float64,
                    )
                }
                AggExpr::Min(_) | AggExpr::Max(_) => {
                    if !is_scalar_type(&in_type) {
                        return Err(StrataError::Compile(format!(
                            "cannot order {in_type} values in '{agg}'"
                        )));
                    }
                    let kind = if matches!(agg, AggExpr::Min(_)) {
                        AggKind::Min
                    } else {
                        AggKind::Max
                    };
                    (kind, cast_if_needed(compiled, &canonical_type(&in_type)), in_type)
                }
            };
            fields.push(Field::new(alias, out_type.clone(), true));
            aggs.push(AggSpec {
                kind,
                input,
                out_type,
                display: format!("{alias} := {agg}"),
            });
        }

        Ok(Self {
            group_exprs: keys,
            group_types,
            aggs,
            schema: Arc::new(Schema::new(fields)),
            table: Mutex::new(GroupTable {
                groups: HashMap::new(),
                reservation: MemoryReservation::new(allocator),
                emitted: false,
            }),
        })
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    /// Number of groups accumulated so far.
    pub fn group_count(&self) -> usize {
        self.table.lock().map(|t| t.groups.len()).unwrap_or(0)
    }

    /// Fold one batch into the group table.
    pub fn update(&self, batch: &RecordBatch) -> Result<()> {
        let keys = self
            .group_exprs
            .iter()
            .map(|e| e.evaluate(batch))
            .collect::<Result<Vec<ArrayRef>>>()?;
        let inputs = self
            .aggs
            .iter()
            .map(|a| a.input.evaluate(batch))
            .collect::<Result<Vec<ArrayRef>>>()?;

        let mut table = self.lock()?;
        if table.emitted {
            return Err(StrataError::execution(
                "aggregate received a batch after emitting its result",
            ));
        }
        let GroupTable {
            groups,
            reservation,
            ..
        } = &mut *table;

        for row in 0..batch.num_rows() {
            let key = keys
                .iter()
                .map(|k| scalar_from_array(k, row))
                .collect::<Result<Vec<_>>>()?;
            let states = match groups.entry(key) {
                Entry::Occupied(o) => o.into_mut(),
                Entry::Vacant(v) => {
                    reservation.grow(group_bytes(v.key(), self.aggs.len()))?;
                    v.insert(self.init_states())
                }
            };
            for ((state, spec), input) in states.iter_mut().zip(&self.aggs).zip(&inputs) {
                update_state(state, spec, input, row)?;
            }
        }
        Ok(())
    }

    /// Finalize every group into one batch.
    ///
    /// Without group keys an empty input still yields one row (count 0, other
    /// aggregates null). The table's memory reservation is released here.
    pub fn emit(&self) -> Result<RecordBatch> {
        let mut table = self.lock()?;
        if table.emitted {
            return Err(StrataError::execution("aggregate emitted more than once"));
        }
        table.emitted = true;
        let mut groups = mem::take(&mut table.groups);
        table.reservation.free();
        drop(table);

        if groups.is_empty() && self.group_exprs.is_empty() {
            groups.insert(Vec::new(), self.init_states());
        }
        let mut rows = groups.into_iter().collect::<Vec<_>>();
        rows.sort_by(|a, b| cmp_keys(&a.0, &b.0));

        let mut columns = Vec::with_capacity(self.schema.fields().len());
        for (i, dt) in self.group_types.iter().enumerate() {
            let values = rows
                .iter()
                .map(|(key, _)| key.get(i).cloned().unwrap_or(ScalarValue::Null))
                .collect::<Vec<_>>();
            columns.push(scalars_to_array(&values, dt)?);
        }
        for (j, spec) in self.aggs.iter().enumerate() {
            let values = rows
                .iter()
                .map(|(_, states)| states.get(j).map_or(ScalarValue::Null, finalize))
                .collect::<Vec<_>>();
            columns.push(scalars_to_array(&values, &spec.out_type)?);
        }

        let options = RecordBatchOptions::new().with_row_count(Some(rows.len()));
        RecordBatch::try_new_with_options(Arc::clone(&self.schema), columns, &options)
            .map_err(|e| StrataError::execution(format!("aggregate produced invalid batch: {e}")))
    }

    fn init_states(&self) -> Vec<AggState> {
        self.aggs
            .iter()
            .map(|a| match a.kind {
                AggKind::Count => AggState::Count(0),
                AggKind::Sum if a.out_type == DataType::Int64 => AggState::SumInt(None),
                AggKind::Sum if a.out_type == DataType::UInt64 => AggState::SumUInt(None),
                AggKind::Sum => AggState::SumFloat(None),
                AggKind::Min => AggState::Min(None),
                AggKind::Max => AggState::Max(None),
                AggKind::Avg => AggState::Avg { sum: 0.0, count: 0 },
            })
            .collect()
    }

    fn lock(&self) -> Result<MutexGuard<'_, GroupTable>> {
        self.table
            .lock()
            .map_err(|_| StrataError::execution("aggregate state lock poisoned"))
    }
}

impl fmt::Display for HashAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let groups = self
            .schema
            .fields()
            .iter()
            .take(self.group_exprs.len())
            .map(|f| f.name().as_str())
            .collect::<Vec<_>>();
        let aggs = self
            .aggs
            .iter()
            .map(|a| a.display.as_str())
            .collect::<Vec<_>>();
        write!(f, "group_by=[{}] aggs=[{}]", groups.join(", "), aggs.join(", "))
    }
}

fn group_bytes(key: &[ScalarValue], aggs: usize) -> usize {
    key.iter().map(ScalarValue::estimate_bytes).sum::<usize>()
        + mem::size_of::<Vec<ScalarValue>>()
        + mem::size_of::<Vec<AggState>>()
        + aggs * mem::size_of::<AggState>()
}

fn is_null_at(array: &ArrayRef, row: usize) -> bool {
    array.logical_nulls().is_some_and(|n| n.is_null(row))
}

fn update_state(state: &mut AggState, spec: &AggSpec, input: &ArrayRef, row: usize) -> Result<()> {
    if is_null_at(input, row) {
        return Ok(());
    }
    match state {
        AggState::Count(c) => *c += 1,
        AggState::SumInt(acc) => {
            let ScalarValue::Int64(v) = scalar_from_array(input, row)? else {
                return Err(StrataError::execution("integer sum over non-integer input"));
            };
            let next = acc.unwrap_or(0).checked_add(v).ok_or_else(|| {
                StrataError::execution(format!("integer overflow in '{}'", spec.display))
            })?;
            *acc = Some(next);
        }
        AggState::SumUInt(acc) => {
            let ScalarValue::UInt64(v) = scalar_from_array(input, row)? else {
                return Err(StrataError::execution("unsigned sum over non-unsigned input"));
            };
            let next = acc.unwrap_or(0).checked_add(v).ok_or_else(|| {
                StrataError::execution(format!("integer overflow in '{}'", spec.display))
            })?;
            *acc = Some(next);
        }
        AggState::SumFloat(acc) => {
            let v = scalar_from_array(input, row)?
                .as_f64()
                .ok_or_else(|| StrataError::execution("float sum over non-numeric input"))?;
            *acc = Some(acc.unwrap_or(0.0) + v);
        }
        AggState::Min(cur) | AggState::Max(cur) => {
            let v = scalar_from_array(input, row)?;
            let keep_new = match cur.as_ref() {
                None => true,
                Some(c) => {
                    let ord = cmp_scalars(&v, c);
                    if spec.kind == AggKind::Min {
                        ord.is_lt()
                    } else {
                        ord.is_gt()
                    }
                }
            };
            if keep_new {
                *cur = Some(v);
            }
        }
        AggState::Avg { sum, count } => {
            let v = scalar_from_array(input, row)?
                .as_f64()
                .ok_or_else(|| StrataError::execution("avg over non-numeric input"))?;
            *sum += v;
            *count += 1;
        }
    }
    Ok(())
}

fn finalize(state: &AggState) -> ScalarValue {
    match state {
        AggState::Count(c) => ScalarValue::Int64(*c),
        AggState::SumInt(v) => v.map_or(ScalarValue::Null, ScalarValue::Int64),
        AggState::SumUInt(v) => v.map_or(ScalarValue::Null, ScalarValue::UInt64),
        AggState::SumFloat(v) => {
            v.map_or(ScalarValue::Null, |f| ScalarValue::Float64Bits(f.to_bits()))
        }
        AggState::Min(v) | AggState::Max(v) => v.clone().unwrap_or(ScalarValue::Null),
        AggState::Avg { count: 0, .. } => ScalarValue::Null,
        AggState::Avg { sum, count } => ScalarValue::Float64Bits((sum / *count as f64).to_bits()),
    }
}
