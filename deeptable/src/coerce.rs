//! Coercion of Arrow columns to flat numeric values.
//!
//! Rendering and domain computation need every column as a plain run of numbers. The set of
//! supported physical types is closed; anything else fails fast with an error rather than
//! silently producing garbage.
//!
//! Unit conventions:
//! - dictionary columns yield their integer keys, not their values;
//! - booleans yield `1.0` and `0.0`;
//! - timestamps and dates yield milliseconds since the Unix epoch;
//! - nulls yield `NaN`.

use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::types::{
    ArrowPrimitiveType, Date32Type, Date64Type, Float16Type, Float32Type, Float64Type, Int8Type,
    Int16Type, Int32Type, Int64Type, TimestampMicrosecondType, TimestampMillisecondType,
    TimestampNanosecondType, TimestampSecondType, UInt8Type, UInt16Type, UInt32Type, UInt64Type,
};
use arrow_array::{Array, ArrayRef, Float32Array};
use arrow_schema::{DataType, TimeUnit};
use bytes::{BufMut, Bytes, BytesMut};
use deeptable_error::{DeeptableResult, deeptable_bail, deeptable_err};
use num_traits::AsPrimitive;

const MS_PER_DAY: f64 = 86_400_000.0;

fn primitive<T>(array: &dyn Array, scale: f64) -> Vec<f64>
where
    T: ArrowPrimitiveType,
    T::Native: AsPrimitive<f64>,
{
    array
        .as_primitive::<T>()
        .iter()
        .map(|v| v.map_or(f64::NAN, |v| v.as_() * scale))
        .collect()
}

/// Convert a column to `f64` values, one per row.
pub fn to_f64_values(array: &dyn Array) -> DeeptableResult<Vec<f64>> {
    Ok(match array.data_type() {
        DataType::Float16 => array
            .as_primitive::<Float16Type>()
            .iter()
            .map(|v| v.map_or(f64::NAN, f64::from))
            .collect(),
        DataType::Float32 => primitive::<Float32Type>(array, 1.0),
        DataType::Float64 => primitive::<Float64Type>(array, 1.0),
        DataType::Int8 => primitive::<Int8Type>(array, 1.0),
        DataType::Int16 => primitive::<Int16Type>(array, 1.0),
        DataType::Int32 => primitive::<Int32Type>(array, 1.0),
        DataType::Int64 => primitive::<Int64Type>(array, 1.0),
        DataType::UInt8 => primitive::<UInt8Type>(array, 1.0),
        DataType::UInt16 => primitive::<UInt16Type>(array, 1.0),
        DataType::UInt32 => primitive::<UInt32Type>(array, 1.0),
        DataType::UInt64 => primitive::<UInt64Type>(array, 1.0),
        DataType::Boolean => array
            .as_boolean()
            .iter()
            .map(|v| v.map_or(f64::NAN, |b| if b { 1.0 } else { 0.0 }))
            .collect(),
        DataType::Dictionary(..) => {
            let dict = array.as_any_dictionary();
            let mut keys = to_f64_values(dict.keys())?;
            // A null dictionary slot may still carry a key in its buffer.
            for (idx, key) in keys.iter_mut().enumerate() {
                if array.is_null(idx) {
                    *key = f64::NAN;
                }
            }
            keys
        }
        DataType::Timestamp(TimeUnit::Second, _) => {
            primitive::<TimestampSecondType>(array, 1_000.0)
        }
        DataType::Timestamp(TimeUnit::Millisecond, _) => {
            primitive::<TimestampMillisecondType>(array, 1.0)
        }
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            primitive::<TimestampMicrosecondType>(array, 1e-3)
        }
        DataType::Timestamp(TimeUnit::Nanosecond, _) => {
            primitive::<TimestampNanosecondType>(array, 1e-6)
        }
        DataType::Date32 => primitive::<Date32Type>(array, MS_PER_DAY),
        DataType::Date64 => primitive::<Date64Type>(array, 1.0),
        other => deeptable_bail!("cannot coerce column of type {} to numbers", other),
    })
}

/// Convert a column to `f32` values, one per row. Precision loss is accepted.
#[allow(clippy::cast_possible_truncation)]
pub fn to_f32_values(array: &dyn Array) -> DeeptableResult<Vec<f32>> {
    if let Some(floats) = array.as_primitive_opt::<Float32Type>() {
        return Ok(floats
            .iter()
            .map(|v| v.unwrap_or(f32::NAN))
            .collect());
    }
    Ok(to_f64_values(array)?
        .into_iter()
        .map(|v| v as f32)
        .collect())
}

/// Convert a column to an `f32` Arrow array.
pub fn to_f32_array(array: &dyn Array) -> DeeptableResult<ArrayRef> {
    Ok(Arc::new(Float32Array::from(to_f32_values(array)?)))
}

/// Pack a column as little-endian `f32`s, ready for upload into a device buffer.
pub fn to_f32_bytes(array: &dyn Array) -> DeeptableResult<Bytes> {
    let values = to_f32_values(array)?;
    let mut bytes = BytesMut::with_capacity(values.len() * size_of::<f32>());
    for value in values {
        bytes.put_f32_le(value);
    }
    Ok(bytes.freeze())
}

/// Read an integer row-index column as `u64`s. Nulls and negative values are rejected.
pub fn ix_values(array: &dyn Array) -> DeeptableResult<Vec<u64>> {
    fn unsigned<T>(array: &dyn Array) -> Vec<u64>
    where
        T: ArrowPrimitiveType,
        T::Native: AsPrimitive<u64>,
    {
        array
            .as_primitive::<T>()
            .values()
            .iter()
            .map(|v| v.as_())
            .collect()
    }
    fn signed<T>(array: &dyn Array) -> DeeptableResult<Vec<u64>>
    where
        T: ArrowPrimitiveType,
        T::Native: Into<i64>,
    {
        array
            .as_primitive::<T>()
            .values()
            .iter()
            .map(|v| {
                let v: i64 = (*v).into();
                u64::try_from(v).map_err(|_| deeptable_err!("negative index {}", v))
            })
            .collect()
    }

    if array.null_count() > 0 {
        deeptable_bail!("index column contains {} nulls", array.null_count());
    }
    match array.data_type() {
        DataType::UInt8 => Ok(unsigned::<UInt8Type>(array)),
        DataType::UInt16 => Ok(unsigned::<UInt16Type>(array)),
        DataType::UInt32 => Ok(unsigned::<UInt32Type>(array)),
        DataType::UInt64 => Ok(unsigned::<UInt64Type>(array)),
        DataType::Int8 => signed::<Int8Type>(array),
        DataType::Int16 => signed::<Int16Type>(array),
        DataType::Int32 => signed::<Int32Type>(array),
        DataType::Int64 => signed::<Int64Type>(array),
        other => deeptable_bail!("index column must be an integer column, found {}", other),
    }
}

#[cfg(test)]
mod tests {
    use arrow_array::{
        BooleanArray, Date32Array, DictionaryArray, Int64Array, StringArray,
        TimestampSecondArray, UInt32Array,
    };

    use super::*;

    #[test]
    fn integers_and_nulls() {
        let array = Int64Array::from(vec![Some(-3), None, Some(7)]);
        let values = to_f64_values(&array).unwrap();
        assert_eq!(values[0], -3.0);
        assert!(values[1].is_nan());
        assert_eq!(values[2], 7.0);
    }

    #[test]
    fn booleans_are_zero_one() {
        let array = BooleanArray::from(vec![true, false, true]);
        assert_eq!(to_f32_values(&array).unwrap(), vec![1.0, 0.0, 1.0]);
    }

    #[test]
    fn dictionaries_yield_keys() {
        let array: DictionaryArray<Int8Type> = vec!["b", "a", "b", "c"].into_iter().collect();
        assert_eq!(to_f64_values(&array).unwrap(), vec![0.0, 1.0, 0.0, 2.0]);
    }

    #[test]
    fn times_are_milliseconds() {
        let ts = TimestampSecondArray::from(vec![1, 2]);
        assert_eq!(to_f64_values(&ts).unwrap(), vec![1_000.0, 2_000.0]);
        let dates = Date32Array::from(vec![1]);
        assert_eq!(to_f64_values(&dates).unwrap(), vec![MS_PER_DAY]);
    }

    #[test]
    fn unsupported_type_fails() {
        let array = StringArray::from(vec!["x"]);
        assert!(to_f64_values(&array).is_err());
    }

    #[test]
    fn f32_bytes_are_little_endian() {
        let array: ArrayRef = Arc::new(UInt32Array::from(vec![1, 2]));
        let bytes = to_f32_bytes(&array).unwrap();
        assert_eq!(&bytes[..4], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[4..], &2.0f32.to_le_bytes());
    }

    #[test]
    fn ix_rejects_negative() {
        assert_eq!(ix_values(&UInt32Array::from(vec![4, 5])).unwrap(), vec![4, 5]);
        assert!(ix_values(&Int64Array::from(vec![-1])).is_err());
    }
}
