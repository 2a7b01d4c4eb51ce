//! Byte-size estimation for memory accounting.

use crate::array::Array;
use crate::batch::Batch;
use crate::field::DataType;

/// Estimated width in bytes of a single value of the given type.
///
/// Variable-length types use a fixed estimate; observed batch sizes should be
/// preferred where a batch is available.
pub const fn datatype_width(datatype: DataType) -> usize {
    match datatype {
        DataType::Null => 0,
        DataType::Boolean => 1,
        DataType::Int32 | DataType::UInt32 => 4,
        DataType::Int64 | DataType::UInt64 | DataType::Float64 => 8,
        DataType::Utf8 => 16,
    }
}

/// Estimated width in bytes of one row with the given column types.
pub fn row_width(types: &[DataType]) -> usize {
    types.iter().map(|t| datatype_width(*t)).sum()
}

/// Heap bytes held by an array's buffers.
pub fn array_byte_size(array: &Array) -> usize {
    let validity_size = |len: usize| (len + 7) / 8;

    match array {
        Array::Null(_) => 0,
        Array::Boolean(arr) => {
            validity_size(arr.len()) + arr.validity().map(|v| validity_size(v.len())).unwrap_or(0)
        }
        Array::Int32(arr) => {
            arr.values().len() * 4 + arr.validity().map(|v| validity_size(v.len())).unwrap_or(0)
        }
        Array::Int64(arr) => {
            arr.values().len() * 8 + arr.validity().map(|v| validity_size(v.len())).unwrap_or(0)
        }
        Array::UInt32(arr) => {
            arr.values().len() * 4 + arr.validity().map(|v| validity_size(v.len())).unwrap_or(0)
        }
        Array::UInt64(arr) => {
            arr.values().len() * 8 + arr.validity().map(|v| validity_size(v.len())).unwrap_or(0)
        }
        Array::Float64(arr) => {
            arr.values().len() * 8 + arr.validity().map(|v| validity_size(v.len())).unwrap_or(0)
        }
        Array::Utf8(arr) => {
            arr.data().len()
                + arr.offsets().len() * 4
                + arr.validity().map(|v| validity_size(v.len())).unwrap_or(0)
        }
    }
}

/// Heap bytes held by all columns of a batch.
pub fn batch_byte_size(batch: &Batch) -> usize {
    batch.columns().iter().map(|c| array_byte_size(c)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{Int64Array, Utf8Array};

    #[test]
    fn batch_size_scales_with_rows(){
        let small = Batch::try_new(vec![
            Array::Int64(Int64Array::from_iter(0..8)),
            Array::Utf8(Utf8Array::from_iter(["aaaa"; 8])),
        ])
        .unwrap();
        let large = Batch::try_new(vec![
            Array::Int64(Int64Array::from_iter(0..64)),
            Array::Utf8(Utf8Array::from_iter(["aaaa"; 64])),
        ])
        .unwrap();

        assert!(batch_byte_size(&large) > batch_byte_size(&small));
        assert!(batch_byte_size(&small) > 0);
    }

    #[test]
    fn row_width_sums_columns() {
        let width = row_width(&[DataType::Int64, DataType::Int32, DataType::Utf8]);
        assert_eq!(8 + 4 + 16, width);
    }
}
