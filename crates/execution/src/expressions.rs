//! Expression compilation and evaluation for physical operators.
//!
//! Input contract:
//! - expressions were validated by the plan builder against the logical schema;
//! - columns are resolved by name against the operator's physical input schema.
//!
//! Output contract:
//! - each evaluation returns an `ArrayRef` aligned to input batch row count.

use std::fmt::Debug;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, AsArray, BooleanArray, BooleanBuilder, Float64Builder, Int64Builder,
    StringArray, StringBuilder,
};
use arrow::compute::kernels::{
    boolean::{and_kleene, not, or_kleene},
    cast::{cast_with_options, CastOptions},
    cmp::{eq, gt, gt_eq, lt, lt_eq, neq},
    numeric::{add, div, mul, sub},
};
use arrow::datatypes::{Float64Type, Int64Type};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, SchemaRef};
use strata_common::{Result, StrataError};
use strata_planner::coercion::{arithmetic_type, comparison_type};
use strata_planner::{BinaryOp, Expr, LiteralValue, ScalarFunction};

/// Executable expression.
pub trait PhysicalExpr: Send + Sync + Debug {
    /// Static output data type of this expression.
    fn data_type(&self) -> DataType;
    /// Evaluate the expression for every row in `batch`.
    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef>;
}

/// Compile a logical expression against the schema of the batches it will see.
///
/// Unknown columns and operand types without a common type are compile errors.
pub fn compile_expr(expr: &Expr, input_schema: &SchemaRef) -> Result<Arc<dyn PhysicalExpr>> {
    match expr {
        Expr::Column(name) => {
            let index = input_schema.index_of(name).map_err(|_| {
                StrataError::Compile(format!(
                    "column '{name}' is not produced by the operator input"
                ))
            })?;
            let dt = input_schema.field(index).data_type().clone();
            Ok(Arc::new(ColumnExpr {
                name: name.clone(),
                index,
                dt,
            }))
        }

        Expr::Literal(v) => Ok(Arc::new(LiteralExpr {
            v: v.clone(),
            dt: v.data_type(),
        })),

        Expr::Not(e) => {
            let inner = compile_boolean(e, input_schema)?;
            Ok(Arc::new(NotExpr { inner }))
        }

        Expr::And(a, b) | Expr::Or(a, b) => {
            let left = compile_boolean(a, input_schema)?;
            let right = compile_boolean(b, input_schema)?;
            let op = if matches!(expr, Expr::And(..)) {
                BoolOp::And
            } else {
                BoolOp::Or
            };
            Ok(Arc::new(BoolBinaryExpr { left, right, op }))
        }

        Expr::BinaryOp { left, op, right } => {
            let l = compile_expr(left, input_schema)?;
            let r = compile_expr(right, input_schema)?;
            let (ldt, rdt) = (l.data_type(), r.data_type());
            if op.is_comparison() {
                let common = comparison_type(&ldt, &rdt).ok_or_else(|| {
                    StrataError::Compile(format!("cannot compare {ldt} with {rdt} in '{expr}'"))
                })?;
                Ok(Arc::new(CmpExpr {
                    left: cast_if_needed(l, &common),
                    right: cast_if_needed(r, &common),
                    op: *op,
                }))
            } else {
                let out = arithmetic_type(&ldt, &rdt).ok_or_else(|| {
                    StrataError::Compile(format!(
                        "arithmetic requires numeric operands, got {ldt} and {rdt} in '{expr}'"
                    ))
                })?;
                Ok(Arc::new(ArithExpr {
                    left: cast_if_needed(l, &out),
                    right: cast_if_needed(r, &out),
                    op: *op,
                    out,
                }))
            }
        }

        Expr::Function { func, args } => {
            let [arg] = args.as_slice() else {
                return Err(StrataError::Compile(format!(
                    "{}() takes exactly one argument",
                    func.name()
                )));
            };
            let arg = compile_expr(arg, input_schema)?;
            let adt = arg.data_type();
            let out = match func {
                ScalarFunction::Abs => arithmetic_type(&adt, &adt).ok_or_else(|| {
                    StrataError::Compile(format!("abs() requires numeric input, got {adt}"))
                })?,
                ScalarFunction::Lower | ScalarFunction::Upper => {
                    if adt != DataType::Utf8 {
                        return Err(StrataError::Compile(format!(
                            "{}() requires a string input, got {adt}",
                            func.name()
                        )));
                    }
                    DataType::Utf8
                }
            };
            Ok(Arc::new(FunctionExpr {
                func: *func,
                arg: cast_if_needed(arg, &out),
                out,
            }))
        }
    }
}

fn compile_boolean(expr: &Expr, input_schema: &SchemaRef) -> Result<Arc<dyn PhysicalExpr>> {
    let compiled = compile_expr(expr, input_schema)?;
    match compiled.data_type() {
        DataType::Boolean => Ok(compiled),
        DataType::Null => Ok(cast_if_needed(compiled, &DataType::Boolean)),
        other => Err(StrataError::Compile(format!(
            "expected boolean operand, got {other} in '{expr}'"
        ))),
    }
}

/// Wrap `expr` in a cast unless it already produces `to_type`.
pub fn cast_if_needed(expr: Arc<dyn PhysicalExpr>, to_type: &DataType) -> Arc<dyn PhysicalExpr> {
    if &expr.data_type() == to_type {
        expr
    } else {
        Arc::new(CastExpr {
            inner: expr,
            to_type: to_type.clone(),
        })
    }
}

fn kernel_err(what: &str) -> impl FnOnce(ArrowError) -> StrataError + '_ {
    move |e| StrataError::execution(format!("{what} failed: {e}"))
}

// =====================
// Standard expressions
// =====================

#[derive(Debug)]
struct ColumnExpr {
    name: String,
    index: usize,
    dt: DataType,
}

impl PhysicalExpr for ColumnExpr {
    fn data_type(&self) -> DataType {
        self.dt.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        if self.index >= batch.num_columns() {
            return Err(StrataError::execution(format!(
                "batch has {} columns, column '{}' expected at {}",
                batch.num_columns(),
                self.name,
                self.index
            )));
        }
        Ok(Arc::clone(batch.column(self.index)))
    }
}

#[derive(Debug)]
struct LiteralExpr {
    v: LiteralValue,
    dt: DataType,
}

impl PhysicalExpr for LiteralExpr {
    fn data_type(&self) -> DataType {
        self.dt.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        Ok(scalar_to_array(&self.v, batch.num_rows()))
    }
}

#[derive(Debug)]
struct CastExpr {
    inner: Arc<dyn PhysicalExpr>,
    to_type: DataType,
}

impl PhysicalExpr for CastExpr {
    fn data_type(&self) -> DataType {
        self.to_type.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.inner.evaluate(batch)?;
        // out-of-range values fail the cast instead of turning into nulls
        let options = CastOptions {
            safe: false,
            ..CastOptions::default()
        };
        cast_with_options(&arr, &self.to_type, &options).map_err(kernel_err("cast"))
    }
}

#[derive(Debug)]
struct NotExpr {
    inner: Arc<dyn PhysicalExpr>,
}

impl PhysicalExpr for NotExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.inner.evaluate(batch)?;
        let b = as_boolean(&arr, "NOT")?;
        Ok(Arc::new(not(b).map_err(kernel_err("not"))?))
    }
}

#[derive(Debug, Clone, Copy)]
enum BoolOp {
    And,
    Or,
}

#[derive(Debug)]
struct BoolBinaryExpr {
    left: Arc<dyn PhysicalExpr>,
    right: Arc<dyn PhysicalExpr>,
    op: BoolOp,
}

impl PhysicalExpr for BoolBinaryExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let l = self.left.evaluate(batch)?;
        let r = self.right.evaluate(batch)?;
        let lb = as_boolean(&l, "AND/OR")?;
        let rb = as_boolean(&r, "AND/OR")?;
        let out = match self.op {
            BoolOp::And => and_kleene(lb, rb),
            BoolOp::Or => or_kleene(lb, rb),
        }
        .map_err(kernel_err("boolean kernel"))?;
        Ok(Arc::new(out))
    }
}

#[derive(Debug)]
struct CmpExpr {
    left: Arc<dyn PhysicalExpr>,
    right: Arc<dyn PhysicalExpr>,
    op: BinaryOp,
}

impl PhysicalExpr for CmpExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let l = self.left.evaluate(batch)?;
        let r = self.right.evaluate(batch)?;
        if l.data_type() == &DataType::Null {
            // comparing against NULL is unknown for every row
            return Ok(arrow::array::new_null_array(
                &DataType::Boolean,
                batch.num_rows(),
            ));
        }
        let res = match self.op {
            BinaryOp::Eq => eq(&l, &r),
            BinaryOp::NotEq => neq(&l, &r),
            BinaryOp::Lt => lt(&l, &r),
            BinaryOp::LtEq => lt_eq(&l, &r),
            BinaryOp::Gt => gt(&l, &r),
            BinaryOp::GtEq => gt_eq(&l, &r),
            other => {
                return Err(StrataError::execution(format!(
                    "'{}' is not a comparison",
                    other.symbol()
                )))
            }
        }
        .map_err(kernel_err("comparison kernel"))?;
        Ok(Arc::new(res))
    }
}

#[derive(Debug)]
struct ArithExpr {
    left: Arc<dyn PhysicalExpr>,
    right: Arc<dyn PhysicalExpr>,
    op: BinaryOp,
    out: DataType,
}

impl PhysicalExpr for ArithExpr {
    fn data_type(&self) -> DataType {
        self.out.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let l = self.left.evaluate(batch)?;
        let r = self.right.evaluate(batch)?;
        match self.op {
            BinaryOp::Plus => add(&l, &r),
            BinaryOp::Minus => sub(&l, &r),
            BinaryOp::Multiply => mul(&l, &r),
            BinaryOp::Divide => div(&l, &r),
            other => {
                return Err(StrataError::execution(format!(
                    "'{}' is not an arithmetic operator",
                    other.symbol()
                )))
            }
        }
        .map_err(kernel_err("arithmetic kernel"))
    }
}

#[derive(Debug)]
struct FunctionExpr {
    func: ScalarFunction,
    arg: Arc<dyn PhysicalExpr>,
    out: DataType,
}

impl PhysicalExpr for FunctionExpr {
    fn data_type(&self) -> DataType {
        self.out.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.arg.evaluate(batch)?;
        match self.func {
            ScalarFunction::Abs => match arr.data_type() {
                DataType::Int64 => {
                    let out = arr.as_primitive::<Int64Type>().try_unary::<_, Int64Type, _>(|v| {
                        v.checked_abs().ok_or_else(|| {
                            ArrowError::ComputeError(format!("abs overflow for {v}"))
                        })
                    });
                    Ok(Arc::new(out.map_err(kernel_err("abs"))?))
                }
                DataType::Float64 => {
                    let out = arr
                        .as_primitive::<Float64Type>()
                        .unary::<_, Float64Type>(f64::abs);
                    Ok(Arc::new(out))
                }
                other => Err(StrataError::execution(format!(
                    "abs() got unexpected input type {other}"
                ))),
            },
            ScalarFunction::Lower | ScalarFunction::Upper => {
                let strings = arr
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .ok_or_else(|| StrataError::execution("string function expects Utf8"))?;
                let out = strings
                    .iter()
                    .map(|v| {
                        v.map(|s| match self.func {
                            ScalarFunction::Lower => s.to_lowercase(),
                            _ => s.to_uppercase(),
                        })
                    })
                    .collect::<StringArray>();
                Ok(Arc::new(out))
            }
        }
    }
}

// ------------------ helpers ------------------

fn as_boolean<'a>(arr: &'a ArrayRef, op: &str) -> Result<&'a BooleanArray> {
    arr.as_any()
        .downcast_ref::<BooleanArray>()
        .ok_or_else(|| StrataError::execution(format!("{op} expects boolean")))
}

fn scalar_to_array(v: &LiteralValue, len: usize) -> ArrayRef {
    match v {
        LiteralValue::Int64(x) => {
            let mut b = Int64Builder::with_capacity(len);
            b.append_value_n(*x, len);
            Arc::new(b.finish())
        }
        LiteralValue::Float64(x) => {
            let mut b = Float64Builder::with_capacity(len);
            b.append_value_n(*x, len);
            Arc::new(b.finish())
        }
        LiteralValue::Boolean(x) => {
            let mut b = BooleanBuilder::with_capacity(len);
            b.append_n(len, *x);
            Arc::new(b.finish())
        }
        LiteralValue::Utf8(s) => {
            let mut b = StringBuilder::with_capacity(len, s.len() * len);
            for _ in 0..len {
                b.append_value(s);
            }
            Arc::new(b.finish())
        }
        LiteralValue::Null => arrow::array::new_null_array(&DataType::Null, len),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float64Array, Int32Array, Int64Array};
    use arrow_schema::{Field, Schema};
    use strata_planner::{col, lit};

    fn batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int32, true),
            Field::new("b", DataType::Int64, true),
            Field::new("s", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![Some(1), Some(-5), None])),
                Arc::new(Int64Array::from(vec![10, 20, 30])),
                Arc::new(StringArray::from(vec![Some("Ab"), None, Some("cD")])),
            ],
        )
        .expect("batch")
    }

    fn eval(e: &Expr) -> ArrayRef {
        let b = batch();
        compile_expr(e, &b.schema())
            .expect("compile")
            .evaluate(&b)
            .expect("evaluate")
    }

    #[test]
    fn mixed_width_integers_compare_and_add() {
        let cmp = eval(&col("a").lt(col("b")));
        let cmp = cmp.as_boolean();
        assert!(cmp.value(0));
        assert!(cmp.value(1));
        assert!(cmp.is_null(2));

        let sum = eval(&(col("a") + col("b")));
        let sum = sum.as_any().downcast_ref::<Int64Array>().expect("int64");
        assert_eq!(sum.value(0), 11);
        assert_eq!(sum.value(1), 15);
    }

    #[test]
    fn int_and_float_arithmetic_widens_to_float() {
        let out = eval(&(col("b") / lit(4.0)));
        let out = out.as_any().downcast_ref::<Float64Array>().expect("f64");
        assert_eq!(out.value(0), 2.5);
    }

    #[test]
    fn functions_evaluate() {
        let abs = eval(&Expr::call(ScalarFunction::Abs, vec![col("a")]));
        let abs = abs.as_any().downcast_ref::<Int64Array>().expect("int64");
        assert_eq!(abs.value(1), 5);

        let upper = eval(&Expr::call(ScalarFunction::Upper, vec![col("s")]));
        let upper = upper.as_any().downcast_ref::<StringArray>().expect("utf8");
        assert_eq!(upper.value(0), "AB");
        assert!(upper.is_null(1));
    }

    #[test]
    fn integer_overflow_is_an_execution_error() {
        let b = batch();
        let e = compile_expr(&(col("b") * lit(i64::MAX)), &b.schema()).expect("compile");
        let err = e.evaluate(&b).expect_err("overflow");
        assert_eq!(err.stage(), "execution");
    }

    #[test]
    fn unknown_column_is_a_compile_error() {
        let b = batch();
        let err = compile_expr(&col("zzz"), &b.schema()).expect_err("unknown");
        assert!(matches!(err, StrataError::Compile(_)));
    }
}
