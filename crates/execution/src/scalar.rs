//! Row-level values used as group keys and accumulator state.

use std::cmp::Ordering;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, BooleanBuilder, Float64Array, Float64Builder, Int64Array,
    Int64Builder, StringArray, StringBuilder, UInt64Array, UInt64Builder,
};
use arrow::compute::kernels::cast::cast;
use arrow_schema::DataType;
use strata_common::{Result, StrataError};

/// Hashable single value. Floats are stored by bit pattern so keys can be
/// compared for equality and hashed; build them with [`ScalarValue::float`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScalarValue {
    Int64(i64),
    UInt64(u64),
    Float64Bits(u64),
    Utf8(String),
    Boolean(bool),
    Null,
}

impl ScalarValue {
    /// `-0.0` is stored as `0.0` and every NaN as the canonical NaN, so equal
    /// floats land in one group.
    pub fn float(v: f64) -> Self {
        let v = if v.is_nan() {
            f64::NAN
        } else if v == 0.0 {
            0.0
        } else {
            v
        };
        ScalarValue::Float64Bits(v.to_bits())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Int64(v) => Some(*v as f64),
            ScalarValue::UInt64(v) => Some(*v as f64),
            ScalarValue::Float64Bits(v) => Some(f64::from_bits(*v)),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }

    pub fn estimate_bytes(&self) -> usize {
        match self {
            ScalarValue::Int64(_) | ScalarValue::UInt64(_) | ScalarValue::Float64Bits(_) => 8,
            ScalarValue::Utf8(s) => std::mem::size_of::<String>() + s.len(),
            ScalarValue::Boolean(_) => 1,
            ScalarValue::Null => 0,
        }
    }
}

/// Total order over scalars of one type; nulls sort first.
pub fn cmp_scalars(a: &ScalarValue, b: &ScalarValue) -> Ordering {
    match (a, b) {
        (ScalarValue::Null, ScalarValue::Null) => Ordering::Equal,
        (ScalarValue::Null, _) => Ordering::Less,
        (_, ScalarValue::Null) => Ordering::Greater,
        (ScalarValue::Int64(x), ScalarValue::Int64(y)) => x.cmp(y),
        (ScalarValue::UInt64(x), ScalarValue::UInt64(y)) => x.cmp(y),
        (ScalarValue::Utf8(x), ScalarValue::Utf8(y)) => x.cmp(y),
        (ScalarValue::Boolean(x), ScalarValue::Boolean(y)) => x.cmp(y),
        (x, y) => match (x.as_f64(), y.as_f64()) {
            (Some(fx), Some(fy)) => fx.total_cmp(&fy),
            _ => format!("{x:?}").cmp(&format!("{y:?}")),
        },
    }
}

pub fn cmp_keys(a: &[ScalarValue], b: &[ScalarValue]) -> Ordering {
    a.iter()
        .zip(b)
        .map(|(x, y)| cmp_scalars(x, y))
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// Type an array is normalized to before values are read out row by row.
pub fn canonical_type(dt: &DataType) -> DataType {
    match dt {
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32 => DataType::Int64,
        DataType::Float32 | DataType::Float64 => DataType::Float64,
        DataType::LargeUtf8 => DataType::Utf8,
        other => other.clone(),
    }
}

/// Whether values of `dt` can be held as [`ScalarValue`]s.
pub fn is_scalar_type(dt: &DataType) -> bool {
    matches!(
        canonical_type(dt),
        DataType::Int64
            | DataType::UInt64
            | DataType::Float64
            | DataType::Utf8
            | DataType::Boolean
            | DataType::Null
    )
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef, what: &str) -> Result<&'a T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| StrataError::execution(format!("expected {what}")))
}

pub fn scalar_from_array(array: &ArrayRef, row: usize) -> Result<ScalarValue> {
    if array.is_null(row) {
        return Ok(ScalarValue::Null);
    }
    match array.data_type() {
        DataType::Int64 => Ok(ScalarValue::Int64(
            downcast::<Int64Array>(array, "Int64Array")?.value(row),
        )),
        DataType::UInt64 => Ok(ScalarValue::UInt64(
            downcast::<UInt64Array>(array, "UInt64Array")?.value(row),
        )),
        DataType::Float64 => Ok(ScalarValue::float(
            downcast::<Float64Array>(array, "Float64Array")?.value(row),
        )),
        DataType::Utf8 => Ok(ScalarValue::Utf8(
            downcast::<StringArray>(array, "StringArray")?
                .value(row)
                .to_string(),
        )),
        DataType::Boolean => Ok(ScalarValue::Boolean(
            downcast::<BooleanArray>(array, "BooleanArray")?.value(row),
        )),
        DataType::Null => Ok(ScalarValue::Null),
        other => Err(StrataError::execution(format!(
            "cannot read {other} values row by row"
        ))),
    }
}

/// Build an array of `dt` from scalars held in the canonical representation.
pub fn scalars_to_array(values: &[ScalarValue], dt: &DataType) -> Result<ArrayRef> {
    let canonical = canonical_type(dt);
    let array: ArrayRef = match &canonical {
        DataType::Int64 => {
            let mut b = Int64Builder::with_capacity(values.len());
            for v in values {
                match v {
                    ScalarValue::Int64(x) => b.append_value(*x),
                    ScalarValue::Null => b.append_null(),
                    _ => return Err(mismatch("Int64")),
                }
            }
            Arc::new(b.finish())
        }
        DataType::UInt64 => {
            let mut b = UInt64Builder::with_capacity(values.len());
            for v in values {
                match v {
                    ScalarValue::UInt64(x) => b.append_value(*x),
                    ScalarValue::Null => b.append_null(),
                    _ => return Err(mismatch("UInt64")),
                }
            }
            Arc::new(b.finish())
        }
        DataType::Float64 => {
            let mut b = Float64Builder::with_capacity(values.len());
            for v in values {
                match v {
                    ScalarValue::Null => b.append_null(),
                    other => b.append_value(other.as_f64().ok_or_else(|| mismatch("Float64"))?),
                }
            }
            Arc::new(b.finish())
        }
        DataType::Utf8 => {
            let mut b = StringBuilder::with_capacity(values.len(), values.len() * 8);
            for v in values {
                match v {
                    ScalarValue::Utf8(x) => b.append_value(x),
                    ScalarValue::Null => b.append_null(),
                    _ => return Err(mismatch("Utf8")),
                }
            }
            Arc::new(b.finish())
        }
        DataType::Boolean => {
            let mut b = BooleanBuilder::with_capacity(values.len());
            for v in values {
                match v {
                    ScalarValue::Boolean(x) => b.append_value(*x),
                    ScalarValue::Null => b.append_null(),
                    _ => return Err(mismatch("Boolean")),
                }
            }
            Arc::new(b.finish())
        }
        DataType::Null => arrow::array::new_null_array(&DataType::Null, values.len()),
        other => {
            return Err(StrataError::execution(format!(
                "cannot build {other} output column"
            )))
        }
    };
    if &canonical == dt {
        Ok(array)
    } else {
        cast(&array, dt).map_err(|e| StrataError::execution(format!("cast to {dt} failed: {e}")))
    }
}

fn mismatch(target: &str) -> StrataError {
    StrataError::execution(format!("type mismatch while building {target} array"))
}
