//! Type rules shared by plan validation and physical expression compilation.

use arrow_schema::DataType;

pub fn is_numeric(dt: &DataType) -> bool {
    is_integer(dt) || matches!(dt, DataType::Float32 | DataType::Float64)
}

pub fn is_integer(dt: &DataType) -> bool {
    matches!(
        dt,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
    )
}

/// Common type both sides of a comparison are cast to, if they are comparable.
pub fn comparison_type(left: &DataType, right: &DataType) -> Option<DataType> {
    if left == right {
        return Some(left.clone());
    }
    match (left, right) {
        (DataType::Null, other) | (other, DataType::Null) => Some(other.clone()),
        (l, r) if is_numeric(l) && is_numeric(r) => arithmetic_type(l, r),
        _ => None,
    }
}

/// Result type of `+ - * /`: integers widen to Int64, anything with a float
/// operand becomes Float64.
pub fn arithmetic_type(left: &DataType, right: &DataType) -> Option<DataType> {
    if !is_numeric(left) || !is_numeric(right) {
        return None;
    }
    if is_integer(left) && is_integer(right) {
        Some(DataType::Int64)
    } else {
        Some(DataType::Float64)
    }
}

/// Accumulator type of `sum` over `input`. Unsigned 64-bit sums stay
/// unsigned; every other integer sums as Int64.
pub fn sum_type(input: &DataType) -> Option<DataType> {
    match input {
        DataType::UInt64 => Some(DataType::UInt64),
        other => arithmetic_type(other, other),
    }
}

/// Whether `min`/`max` are defined over `dt`.
pub fn is_orderable(dt: &DataType) -> bool {
    is_numeric(dt) || matches!(dt, DataType::Utf8 | DataType::Boolean)
}
