use crate::array::{Array, BooleanArray, NullArray, PrimitiveArray, Utf8Array};
use crate::bitmap::Bitmap;
use crate::field::DataType;
use morsel_error::{ErrorKind, MorselError, Result};

/// Mutable builder for a single array, filled one row at a time.
///
/// Row-wise copies are how the join output and partition row buffers are
/// assembled; the validity bitmap is only materialized on finish if any null
/// was pushed, so built arrays compare equal to their `from_iter` equivalents.
#[derive(Debug)]
pub enum ArrayBuilder {
    Null(usize),
    Boolean(BooleanBuilder),
    Int32(PrimitiveBuilder<i32>),
    Int64(PrimitiveBuilder<i64>),
    UInt32(PrimitiveBuilder<u32>),
    UInt64(PrimitiveBuilder<u64>),
    Float64(PrimitiveBuilder<f64>),
    Utf8(Utf8Builder),
}

impl ArrayBuilder {
    pub fn new(datatype: DataType) -> Self {
        match datatype {
            DataType::Null => Self::Null(0),
            DataType::Boolean => Self::Boolean(BooleanBuilder::default()),
            DataType::Int32 => Self::Int32(PrimitiveBuilder::default()),
            DataType::Int64 => Self::Int64(PrimitiveBuilder::default()),
            DataType::UInt32 => Self::UInt32(PrimitiveBuilder::default()),
            DataType::UInt64 => Self::UInt64(PrimitiveBuilder::default()),
            DataType::Float64 => Self::Float64(PrimitiveBuilder::default()),
            DataType::Utf8 => Self::Utf8(Utf8Builder::default()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Null(len) => *len,
            Self::Boolean(b) => b.values.len(),
            Self::Int32(b) => b.values.len(),
            Self::Int64(b) => b.values.len(),
            Self::UInt32(b) => b.values.len(),
            Self::UInt64(b) => b.values.len(),
            Self::Float64(b) => b.values.len(),
            Self::Utf8(b) => b.offsets.len() - 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push_null(&mut self) {
        match self {
            Self::Null(len) => *len += 1,
            Self::Boolean(b) => b.push_null(),
            Self::Int32(b) => b.push_null(),
            Self::Int64(b) => b.push_null(),
            Self::UInt32(b) => b.push_null(),
            Self::UInt64(b) => b.push_null(),
            Self::Float64(b) => b.push_null(),
            Self::Utf8(b) => b.push_null(),
        }
    }

    /// Copy the value at `idx` in `src` to the end of this builder.
    ///
    /// Nulls in the source are copied as nulls. The source array must match
    /// the builder's type.
    pub fn push_from(&mut self, src: &Array, idx: usize) -> Result<()> {
        if !src.is_valid(idx).ok_or_else(|| {
            MorselError::with_kind(
                ErrorKind::Internal,
                format!("Row {idx} out of bounds for array of length {}", src.len()),
            )
        })? {
            self.push_null();
            return Ok(());
        }

        match (self, src) {
            (Self::Null(len), Array::Null(_)) => *len += 1,
            (Self::Boolean(b), Array::Boolean(arr)) => {
                b.push(arr.value(idx).expect("index in bounds"))
            }
            (Self::Int32(b), Array::Int32(arr)) => b.push(*arr.value(idx).expect("index in bounds")),
            (Self::Int64(b), Array::Int64(arr)) => b.push(*arr.value(idx).expect("index in bounds")),
            (Self::UInt32(b), Array::UInt32(arr)) => {
                b.push(*arr.value(idx).expect("index in bounds"))
            }
            (Self::UInt64(b), Array::UInt64(arr)) => {
                b.push(*arr.value(idx).expect("index in bounds"))
            }
            (Self::Float64(b), Array::Float64(arr)) => {
                b.push(*arr.value(idx).expect("index in bounds"))
            }
            (Self::Utf8(b), Array::Utf8(arr)) => b.push(arr.value(idx).expect("index in bounds")),
            (builder, src) => {
                return Err(MorselError::with_kind(
                    ErrorKind::Internal,
                    format!(
                        "Array type {} does not match builder type {}",
                        src.datatype(),
                        builder.datatype(),
                    ),
                ))
            }
        }

        Ok(())
    }

    pub fn datatype(&self) -> DataType {
        match self {
            Self::Null(_) => DataType::Null,
            Self::Boolean(_) => DataType::Boolean,
            Self::Int32(_) => DataType::Int32,
            Self::Int64(_) => DataType::Int64,
            Self::UInt32(_) => DataType::UInt32,
            Self::UInt64(_) => DataType::UInt64,
            Self::Float64(_) => DataType::Float64,
            Self::Utf8(_) => DataType::Utf8,
        }
    }

    /// Produce the built array, resetting the builder to empty.
    pub fn finish(&mut self) -> Array {
        match self {
            Self::Null(len) => {
                let arr = NullArray::new(*len);
                *len = 0;
                Array::Null(arr)
            }
            Self::Boolean(b) => Array::Boolean(std::mem::take(b).finish()),
            Self::Int32(b) => Array::Int32(std::mem::take(b).finish()),
            Self::Int64(b) => Array::Int64(std::mem::take(b).finish()),
            Self::UInt32(b) => Array::UInt32(std::mem::take(b).finish()),
            Self::UInt64(b) => Array::UInt64(std::mem::take(b).finish()),
            Self::Float64(b) => Array::Float64(std::mem::take(b).finish()),
            Self::Utf8(b) => Array::Utf8(std::mem::take(b).finish()),
        }
    }
}

#[derive(Debug)]
pub struct PrimitiveBuilder<T> {
    values: Vec<T>,
    validity: Bitmap,
    has_nulls: bool,
}

impl<T> Default for PrimitiveBuilder<T> {
    fn default() -> Self {
        PrimitiveBuilder {
            values: Vec::new(),
            validity: Bitmap::default(),
            has_nulls: false,
        }
    }
}

impl<T: Default> PrimitiveBuilder<T> {
    pub fn push(&mut self, val: T) {
        self.values.push(val);
        self.validity.push(true);
    }

    pub fn push_null(&mut self) {
        self.values.push(T::default());
        self.validity.push(false);
        self.has_nulls = true;
    }

    pub fn finish(self) -> PrimitiveArray<T> {
        let validity = self.has_nulls.then_some(self.validity);
        PrimitiveArray::new(self.values, validity)
    }
}

#[derive(Debug, Default)]
pub struct BooleanBuilder {
    values: Bitmap,
    validity: Bitmap,
    has_nulls: bool,
}

impl BooleanBuilder {
    pub fn push(&mut self, val: bool) {
        self.values.push(val);
        self.validity.push(true);
    }

    pub fn push_null(&mut self) {
        self.values.push(false);
        self.validity.push(false);
        self.has_nulls = true;
    }

    pub fn finish(self) -> BooleanArray {
        let validity = self.has_nulls.then_some(self.validity);
        BooleanArray::new(self.values, validity)
    }
}

#[derive(Debug)]
pub struct Utf8Builder {
    offsets: Vec<u32>,
    data: Vec<u8>,
    validity: Bitmap,
    has_nulls: bool,
}

impl Default for Utf8Builder {
    fn default() -> Self {
        Utf8Builder {
            offsets: vec![0],
            data: Vec::new(),
            validity: Bitmap::default(),
            has_nulls: false,
        }
    }
}

impl Utf8Builder {
    pub fn push(&mut self, val: &str) {
        self.data.extend_from_slice(val.as_bytes());
        self.offsets.push(self.data.len() as u32);
        self.validity.push(true);
    }

    pub fn push_null(&mut self) {
        self.offsets.push(self.data.len() as u32);
        self.validity.push(false);
        self.has_nulls = true;
    }

    pub fn finish(self) -> Utf8Array {
        let validity = self.has_nulls.then_some(self.validity);
        Utf8Array::new(self.offsets, self.data, validity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Int64Array;

    #[test]
    fn built_equals_from_iter() {
        let src = Array::Int64(Int64Array::from_iter([7, 8, 9]));

        let mut builder = ArrayBuilder::new(DataType::Int64);
        builder.push_from(&src, 2).unwrap();
        builder.push_from(&src, 0).unwrap();

        let got = builder.finish();
        assert_eq!(Array::Int64(Int64Array::from_iter([9, 7])), got);
        assert_eq!(0, builder.len());
    }

    #[test]
    fn nulls_copied_and_padded() {
        let src = Array::Utf8(Utf8Array::from_iter([Some("a"), None]));

        let mut builder = ArrayBuilder::new(DataType::Utf8);
        builder.push_from(&src, 0).unwrap();
        builder.push_from(&src, 1).unwrap();
        builder.push_null();

        let got = builder.finish();
        assert_eq!(
            Array::Utf8(Utf8Array::from_iter([Some("a"), None, None])),
            got
        );
    }

    #[test]
    fn type_mismatch_errors() {
        let src = Array::Int64(Int64Array::from_iter([1]));
        let mut builder = ArrayBuilder::new(DataType::Utf8);
        builder.push_from(&src, 0).unwrap_err();
    }
}
