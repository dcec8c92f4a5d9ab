use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema, SchemaRef};
use serde::{Deserialize, Serialize};
use strata_common::{Result, StrataError};

use crate::coercion::{arithmetic_type, comparison_type, is_numeric, is_orderable, sum_type};
use crate::table::TableProvider;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Column(String),
    Literal(LiteralValue),
    BinaryOp {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Function {
        func: ScalarFunction,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LiteralValue {
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Boolean(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Multiply,
    Divide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarFunction {
    Abs,
    Lower,
    Upper,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggExpr {
    Count(Expr),
    Sum(Expr),
    Min(Expr),
    Max(Expr),
    Avg(Expr),
}

/// Logical operator tree. Every node except `TableScan` owns exactly one input.
#[derive(Debug, Clone)]
pub enum LogicalPlan {
    TableScan {
        table: String,
        provider: Arc<dyn TableProvider>,
        /// Full table schema as reported by the reader.
        source_schema: SchemaRef,
        /// Columns read from storage, in table order; set by projection pushdown.
        projection: Option<Vec<String>>,
        /// Predicate hints storage may use for pruning; set by filter pushdown.
        filters: Vec<Expr>,
    },
    Filter {
        predicate: Expr,
        input: Box<LogicalPlan>,
    },
    Aggregate {
        group_exprs: Vec<Expr>,
        aggr_exprs: Vec<(AggExpr, String)>,
        input: Box<LogicalPlan>,
    },
    Projection {
        exprs: Vec<(Expr, String)>,
        input: Box<LogicalPlan>,
    },
}

pub fn col(name: impl Into<String>) -> Expr {
    Expr::Column(name.into())
}

pub fn lit(value: impl Into<LiteralValue>) -> Expr {
    Expr::Literal(value.into())
}

impl From<i64> for LiteralValue {
    fn from(v: i64) -> Self {
        LiteralValue::Int64(v)
    }
}

impl From<f64> for LiteralValue {
    fn from(v: f64) -> Self {
        LiteralValue::Float64(v)
    }
}

impl From<bool> for LiteralValue {
    fn from(v: bool) -> Self {
        LiteralValue::Boolean(v)
    }
}

impl From<&str> for LiteralValue {
    fn from(v: &str) -> Self {
        LiteralValue::Utf8(v.to_string())
    }
}

impl From<String> for LiteralValue {
    fn from(v: String) -> Self {
        LiteralValue::Utf8(v)
    }
}

impl LiteralValue {
    pub fn data_type(&self) -> DataType {
        match self {
            LiteralValue::Int64(_) => DataType::Int64,
            LiteralValue::Float64(_) => DataType::Float64,
            LiteralValue::Utf8(_) => DataType::Utf8,
            LiteralValue::Boolean(_) => DataType::Boolean,
            LiteralValue::Null => DataType::Null,
        }
    }
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq
        )
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::Plus => "+",
            BinaryOp::Minus => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
        }
    }
}

impl ScalarFunction {
    pub fn name(self) -> &'static str {
        match self {
            ScalarFunction::Abs => "abs",
            ScalarFunction::Lower => "lower",
            ScalarFunction::Upper => "upper",
        }
    }
}

impl Expr {
    fn binary(self, op: BinaryOp, right: Expr) -> Expr {
        Expr::BinaryOp {
            left: Box::new(self),
            op,
            right: Box::new(right),
        }
    }

    pub fn eq(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Eq, other)
    }

    pub fn not_eq(self, other: Expr) -> Expr {
        self.binary(BinaryOp::NotEq, other)
    }

    pub fn lt(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Lt, other)
    }

    pub fn lt_eq(self, other: Expr) -> Expr {
        self.binary(BinaryOp::LtEq, other)
    }

    pub fn gt(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Gt, other)
    }

    pub fn gt_eq(self, other: Expr) -> Expr {
        self.binary(BinaryOp::GtEq, other)
    }

    pub fn and(self, other: Expr) -> Expr {
        Expr::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Expr) -> Expr {
        Expr::Or(Box::new(self), Box::new(other))
    }

    pub fn call(func: ScalarFunction, args: Vec<Expr>) -> Expr {
        Expr::Function { func, args }
    }

    /// Column names this expression reads.
    pub fn columns(&self) -> HashSet<String> {
        let mut out = HashSet::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut HashSet<String>) {
        match self {
            Expr::Column(c) => {
                out.insert(c.clone());
            }
            Expr::Literal(_) => {}
            Expr::BinaryOp { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            Expr::And(a, b) | Expr::Or(a, b) => {
                a.collect_columns(out);
                b.collect_columns(out);
            }
            Expr::Not(x) => x.collect_columns(out),
            Expr::Function { args, .. } => {
                for arg in args {
                    arg.collect_columns(out);
                }
            }
        }
    }

    /// Name of the column this expression produces when it is not aliased.
    pub fn output_name(&self) -> String {
        match self {
            Expr::Column(c) => c.clone(),
            other => other.to_string(),
        }
    }

    /// Resolve the result type of this expression against `schema`.
    ///
    /// Fails with a planning error when a column is unknown or operand types
    /// do not fit the operator.
    pub fn data_type(&self, schema: &Schema) -> Result<DataType> {
        match self {
            Expr::Column(name) => schema
                .field_with_name(name)
                .map(|f| f.data_type().clone())
                .map_err(|_| {
                    StrataError::Plan(format!(
                        "unknown column '{name}'; available: [{}]",
                        field_names(schema).join(", ")
                    ))
                }),
            Expr::Literal(v) => Ok(v.data_type()),
            Expr::BinaryOp { left, op, right } => {
                let lt = left.data_type(schema)?;
                let rt = right.data_type(schema)?;
                if op.is_comparison() {
                    comparison_type(&lt, &rt).map(|_| DataType::Boolean).ok_or_else(|| {
                        StrataError::Plan(format!(
                            "cannot compare {lt} with {rt} in '{self}'"
                        ))
                    })
                } else {
                    arithmetic_type(&lt, &rt).ok_or_else(|| {
                        StrataError::Plan(format!(
                            "arithmetic '{}' requires numeric operands, got {lt} and {rt}",
                            op.symbol()
                        ))
                    })
                }
            }
            Expr::And(a, b) | Expr::Or(a, b) => {
                let at = a.data_type(schema)?;
                let bt = b.data_type(schema)?;
                if at != DataType::Boolean || bt != DataType::Boolean {
                    return Err(StrataError::Plan(format!(
                        "boolean connective requires boolean operands in '{self}'"
                    )));
                }
                Ok(DataType::Boolean)
            }
            Expr::Not(x) => {
                if x.data_type(schema)? != DataType::Boolean {
                    return Err(StrataError::Plan(format!(
                        "NOT requires a boolean operand in '{self}'"
                    )));
                }
                Ok(DataType::Boolean)
            }
            Expr::Function { func, args } => {
                let [arg] = args.as_slice() else {
                    return Err(StrataError::Plan(format!(
                        "{}() takes exactly one argument, got {}",
                        func.name(),
                        args.len()
                    )));
                };
                let at = arg.data_type(schema)?;
                match func {
                    ScalarFunction::Abs => arithmetic_type(&at, &at).ok_or_else(|| {
                        StrataError::Plan(format!("abs() requires numeric input, got {at}"))
                    }),
                    ScalarFunction::Lower | ScalarFunction::Upper => {
                        if at != DataType::Utf8 {
                            return Err(StrataError::Plan(format!(
                                "{}() requires a string input, got {at}",
                                func.name()
                            )));
                        }
                        Ok(DataType::Utf8)
                    }
                }
            }
        }
    }
}

impl std::ops::Add for Expr {
    type Output = Expr;

    fn add(self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::Plus, rhs)
    }
}

impl std::ops::Sub for Expr {
    type Output = Expr;

    fn sub(self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::Minus, rhs)
    }
}

impl std::ops::Mul for Expr {
    type Output = Expr;

    fn mul(self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::Multiply, rhs)
    }
}

impl std::ops::Div for Expr {
    type Output = Expr;

    fn div(self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::Divide, rhs)
    }
}

impl std::ops::Not for Expr {
    type Output = Expr;

    fn not(self) -> Expr {
        Expr::Not(Box::new(self))
    }
}

impl fmt::Display for LiteralValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiteralValue::Int64(v) => write!(f, "{v}"),
            LiteralValue::Float64(v) => write!(f, "{v:?}"),
            LiteralValue::Utf8(v) => write!(f, "'{v}'"),
            LiteralValue::Boolean(v) => write!(f, "{v}"),
            LiteralValue::Null => f.write_str("NULL"),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(c) => f.write_str(c),
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::BinaryOp { left, op, right } => {
                write_operand(f, left)?;
                write!(f, " {} ", op.symbol())?;
                write_operand(f, right)
            }
            Expr::And(a, b) => {
                write_operand(f, a)?;
                f.write_str(" AND ")?;
                write_operand(f, b)
            }
            Expr::Or(a, b) => {
                write_operand(f, a)?;
                f.write_str(" OR ")?;
                write_operand(f, b)
            }
            Expr::Not(x) => {
                f.write_str("NOT ")?;
                write_operand(f, x)
            }
            Expr::Function { func, args } => {
                write!(f, "{}(", func.name())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            }
        }
    }
}

fn write_operand(f: &mut fmt::Formatter<'_>, e: &Expr) -> fmt::Result {
    match e {
        Expr::BinaryOp { .. } | Expr::And(..) | Expr::Or(..) => write!(f, "({e})"),
        other => write!(f, "{other}"),
    }
}

impl AggExpr {
    pub fn input(&self) -> &Expr {
        match self {
            AggExpr::Count(e)
            | AggExpr::Sum(e)
            | AggExpr::Min(e)
            | AggExpr::Max(e)
            | AggExpr::Avg(e) => e,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AggExpr::Count(_) => "count",
            AggExpr::Sum(_) => "sum",
            AggExpr::Min(_) => "min",
            AggExpr::Max(_) => "max",
            AggExpr::Avg(_) => "avg",
        }
    }

    /// Result type of the finalized aggregate over `schema`.
    pub fn data_type(&self, schema: &Schema) -> Result<DataType> {
        let input = self.input().data_type(schema)?;
        match self {
            AggExpr::Count(_) => Ok(DataType::Int64),
            AggExpr::Sum(_) => sum_type(&input).ok_or_else(|| {
                StrataError::Plan(format!("sum() requires numeric input, got {input} for '{self}'"))
            }),
            AggExpr::Avg(_) => {
                if !is_numeric(&input) {
                    return Err(StrataError::Plan(format!(
                        "avg() requires numeric input, got {input} for '{self}'"
                    )));
                }
                Ok(DataType::Float64)
            }
            AggExpr::Min(_) | AggExpr::Max(_) => {
                if !is_orderable(&input) {
                    return Err(StrataError::Plan(format!(
                        "{}() is not defined over {input}",
                        self.name()
                    )));
                }
                Ok(input)
            }
        }
    }
}

impl fmt::Display for AggExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.input())
    }
}

impl LogicalPlan {
    /// Short node kind name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            LogicalPlan::TableScan { .. } => "TableScan",
            LogicalPlan::Filter { .. } => "Filter",
            LogicalPlan::Aggregate { .. } => "Aggregate",
            LogicalPlan::Projection { .. } => "Projection",
        }
    }

    pub fn input(&self) -> Option<&LogicalPlan> {
        match self {
            LogicalPlan::TableScan { .. } => None,
            LogicalPlan::Filter { input, .. }
            | LogicalPlan::Aggregate { input, .. }
            | LogicalPlan::Projection { input, .. } => Some(input),
        }
    }

    pub fn input_mut(&mut self) -> Option<&mut LogicalPlan> {
        match self {
            LogicalPlan::TableScan { .. } => None,
            LogicalPlan::Filter { input, .. }
            | LogicalPlan::Aggregate { input, .. }
            | LogicalPlan::Projection { input, .. } => Some(input),
        }
    }

    /// Number of nodes in the tree.
    pub fn node_count(&self) -> usize {
        1 + self.input().map_or(0, LogicalPlan::node_count)
    }

    /// Output schema of this node.
    pub fn schema(&self) -> Result<SchemaRef> {
        match self {
            LogicalPlan::TableScan {
                source_schema,
                projection,
                ..
            } => match projection {
                None => Ok(Arc::clone(source_schema)),
                Some(cols) => {
                    let fields = source_schema
                        .fields()
                        .iter()
                        .filter(|f| cols.iter().any(|c| c == f.name()))
                        .cloned()
                        .collect::<Vec<_>>();
                    if fields.len() != cols.len() {
                        let missing = cols
                            .iter()
                            .filter(|c| source_schema.field_with_name(c).is_err())
                            .cloned()
                            .collect::<Vec<_>>();
                        return Err(StrataError::Plan(format!(
                            "projection references unknown columns {missing:?}"
                        )));
                    }
                    Ok(Arc::new(Schema::new(fields)))
                }
            },
            LogicalPlan::Filter { input, .. } => input.schema(),
            LogicalPlan::Aggregate {
                group_exprs,
                aggr_exprs,
                input,
            } => {
                let in_schema = input.schema()?;
                let mut fields = Vec::with_capacity(group_exprs.len() + aggr_exprs.len());
                for g in group_exprs {
                    fields.push(Field::new(g.output_name(), g.data_type(&in_schema)?, true));
                }
                for (agg, alias) in aggr_exprs {
                    fields.push(Field::new(alias, agg.data_type(&in_schema)?, true));
                }
                Ok(Arc::new(Schema::new(fields)))
            }
            LogicalPlan::Projection { exprs, input } => {
                let in_schema = input.schema()?;
                let fields = exprs
                    .iter()
                    .map(|(e, alias)| {
                        let nullable = match e {
                            Expr::Column(c) => in_schema
                                .field_with_name(c)
                                .map(|f| f.is_nullable())
                                .unwrap_or(true),
                            _ => true,
                        };
                        Ok(Field::new(alias, e.data_type(&in_schema)?, nullable))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Arc::new(Schema::new(fields)))
            }
        }
    }

    /// Replace this node's input through `f`, keeping the node itself.
    pub fn map_input(
        self,
        f: &mut impl FnMut(LogicalPlan) -> Result<LogicalPlan>,
    ) -> Result<LogicalPlan> {
        Ok(match self {
            scan @ LogicalPlan::TableScan { .. } => scan,
            LogicalPlan::Filter { predicate, input } => LogicalPlan::Filter {
                predicate,
                input: Box::new(f(*input)?),
            },
            LogicalPlan::Aggregate {
                group_exprs,
                aggr_exprs,
                input,
            } => LogicalPlan::Aggregate {
                group_exprs,
                aggr_exprs,
                input: Box::new(f(*input)?),
            },
            LogicalPlan::Projection { exprs, input } => LogicalPlan::Projection {
                exprs,
                input: Box::new(f(*input)?),
            },
        })
    }

    /// Rewrite the tree root-first: `f` sees a node before its (possibly
    /// replaced) input is rewritten.
    pub fn transform_down(
        self,
        f: &mut impl FnMut(LogicalPlan) -> Result<LogicalPlan>,
    ) -> Result<LogicalPlan> {
        let node = f(self)?;
        node.map_input(&mut |child| child.transform_down(&mut *f))
    }

    /// Rewrite the tree leaf-first: `f` sees a node after its input was rewritten.
    pub fn transform_up(
        self,
        f: &mut impl FnMut(LogicalPlan) -> Result<LogicalPlan>,
    ) -> Result<LogicalPlan> {
        let node = self.map_input(&mut |child| child.transform_up(&mut *f))?;
        f(node)
    }
}

pub(crate) fn field_names(schema: &Schema) -> Vec<String> {
    schema.fields().iter().map(|f| f.name().clone()).collect()
}
