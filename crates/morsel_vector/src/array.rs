use crate::bitmap::Bitmap;
use crate::field::DataType;
use crate::scalar::ScalarValue;

#[derive(Debug, Clone, PartialEq)]
pub enum Array {
    Null(NullArray),
    Boolean(BooleanArray),
    Int32(Int32Array),
    Int64(Int64Array),
    UInt32(UInt32Array),
    UInt64(UInt64Array),
    Float64(Float64Array),
    Utf8(Utf8Array),
}

impl Array {
    pub fn len(&self) -> usize {
        match self {
            Self::Null(arr) => arr.len(),
            Self::Boolean(arr) => arr.len(),
            Self::Int32(arr) => arr.len(),
            Self::Int64(arr) => arr.len(),
            Self::UInt32(arr) => arr.len(),
            Self::UInt64(arr) => arr.len(),
            Self::Float64(arr) => arr.len(),
            Self::Utf8(arr) => arr.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn datatype(&self) -> DataType {
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

    /// Get the validity at the given index, None if out of bounds.
    pub fn is_valid(&self, idx: usize) -> Option<bool> {
        match self {
            Self::Null(arr) => arr.is_valid(idx),
            Self::Boolean(arr) => arr.is_valid(idx),
            Self::Int32(arr) => arr.is_valid(idx),
            Self::Int64(arr) => arr.is_valid(idx),
            Self::UInt32(arr) => arr.is_valid(idx),
            Self::UInt64(arr) => arr.is_valid(idx),
            Self::Float64(arr) => arr.is_valid(idx),
            Self::Utf8(arr) => arr.is_valid(idx),
        }
    }

    /// Get an owned scalar value at the given index.
    pub fn scalar(&self, idx: usize) -> Option<ScalarValue> {
        if !self.is_valid(idx)? {
            return Some(ScalarValue::Null);
        }

        Some(match self {
            Self::Null(_) => ScalarValue::Null,
            Self::Boolean(arr) => ScalarValue::Boolean(arr.value(idx)?),
            Self::Int32(arr) => ScalarValue::Int32(*arr.value(idx)?),
            Self::Int64(arr) => ScalarValue::Int64(*arr.value(idx)?),
            Self::UInt32(arr) => ScalarValue::UInt32(*arr.value(idx)?),
            Self::UInt64(arr) => ScalarValue::UInt64(*arr.value(idx)?),
            Self::Float64(arr) => ScalarValue::Float64(*arr.value(idx)?),
            Self::Utf8(arr) => ScalarValue::Utf8(arr.value(idx)?.to_string()),
        })
    }

    /// Compare the value at `idx` with the value at `other_idx` in `other`.
    ///
    /// Arrays of different types never compare equal. Null comparison follows
    /// `nulls_equal`: when false, null never equals anything (including null).
    ///
    /// Panics if either index is out of bounds.
    pub fn values_eq(&self, idx: usize, other: &Array, other_idx: usize, nulls_equal: bool) -> bool {
        let self_valid = self.is_valid(idx).expect("index in bounds");
        let other_valid = other.is_valid(other_idx).expect("index in bounds");

        match (self_valid, other_valid) {
            (false, false) => return nulls_equal,
            (true, true) => (),
            _ => return false,
        }

        match (self, other) {
            (Self::Boolean(a), Self::Boolean(b)) => a.value(idx) == b.value(other_idx),
            (Self::Int32(a), Self::Int32(b)) => a.value(idx) == b.value(other_idx),
            (Self::Int64(a), Self::Int64(b)) => a.value(idx) == b.value(other_idx),
            (Self::UInt32(a), Self::UInt32(b)) => a.value(idx) == b.value(other_idx),
            (Self::UInt64(a), Self::UInt64(b)) => a.value(idx) == b.value(other_idx),
            (Self::Float64(a), Self::Float64(b)) => a.value(idx) == b.value(other_idx),
            (Self::Utf8(a), Self::Utf8(b)) => a.value(idx) == b.value(other_idx),
            _ => false,
        }
    }
}

/// A logical array for representing some number of nulls.
#[derive(Debug, Clone, PartialEq)]
pub struct NullArray {
    len: usize,
}

impl NullArray {
    pub const fn new(len: usize) -> Self {
        NullArray { len }
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub fn is_valid(&self, idx: usize) -> Option<bool> {
        if idx >= self.len {
            return None;
        }
        Some(false)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BooleanArray {
    values: Bitmap,
    validity: Option<Bitmap>,
}

impl BooleanArray {
    pub fn new(values: Bitmap, validity: Option<Bitmap>) -> Self {
        if let Some(validity) = &validity {
            assert_eq!(values.len(), validity.len());
        }
        BooleanArray { values, validity }
    }

    pub const fn len(&self) -> usize {
        self.values.len()
    }

    pub const fn values(&self) -> &Bitmap {
        &self.values
    }

    pub const fn validity(&self) -> Option<&Bitmap> {
        self.validity.as_ref()
    }

    pub fn is_valid(&self, idx: usize) -> Option<bool> {
        if idx >= self.len() {
            return None;
        }
        Some(match &self.validity {
            Some(validity) => validity.value(idx),
            None => true,
        })
    }

    /// Get the raw value at the given index, not accounting for validity.
    pub fn value(&self, idx: usize) -> Option<bool> {
        if idx >= self.len() {
            return None;
        }
        Some(self.values.value(idx))
    }
}

impl FromIterator<bool> for BooleanArray {
    fn from_iter<T: IntoIterator<Item = bool>>(iter: T) -> Self {
        BooleanArray {
            values: Bitmap::from_bool_iter(iter),
            validity: None,
        }
    }
}

/// Array for storing primitive values.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimitiveArray<T> {
    /// Underlying primitive values.
    values: Vec<T>,

    /// Validity bitmap. "True" indicates the value at that index is valid,
    /// "false" indicates null. None means all values are valid.
    validity: Option<Bitmap>,
}

pub type Int32Array = PrimitiveArray<i32>;
pub type Int64Array = PrimitiveArray<i64>;
pub type UInt32Array = PrimitiveArray<u32>;
pub type UInt64Array = PrimitiveArray<u64>;
pub type Float64Array = PrimitiveArray<f64>;

impl<T> PrimitiveArray<T> {
    pub fn new(values: Vec<T>, validity: Option<Bitmap>) -> Self {
        if let Some(validity) = &validity {
            assert_eq!(values.len(), validity.len());
        }
        PrimitiveArray { values, validity }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub const fn validity(&self) -> Option<&Bitmap> {
        self.validity.as_ref()
    }

    pub fn is_valid(&self, idx: usize) -> Option<bool> {
        if idx >= self.len() {
            return None;
        }
        Some(match &self.validity {
            Some(validity) => validity.value(idx),
            None => true,
        })
    }

    /// Get the raw value at the given index, not accounting for validity.
    pub fn value(&self, idx: usize) -> Option<&T> {
        self.values.get(idx)
    }
}

impl<T> FromIterator<T> for PrimitiveArray<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        PrimitiveArray {
            values: iter.into_iter().collect(),
            validity: None,
        }
    }
}

impl<T: Default> FromIterator<Option<T>> for PrimitiveArray<T> {
    fn from_iter<I: IntoIterator<Item = Option<T>>>(iter: I) -> Self {
        let mut values = Vec::new();
        let mut validity = Bitmap::default();
        for item in iter {
            match item {
                Some(v) => {
                    values.push(v);
                    validity.push(true);
                }
                None => {
                    values.push(T::default());
                    validity.push(false);
                }
            }
        }
        PrimitiveArray {
            values,
            validity: Some(validity),
        }
    }
}

/// Array for storing variable length utf8 data.
#[derive(Debug, Clone, PartialEq)]
pub struct Utf8Array {
    /// Offsets into the data buffer, `len + 1` entries.
    offsets: Vec<u32>,

    /// Raw string bytes.
    data: Vec<u8>,

    validity: Option<Bitmap>,
}

impl Utf8Array {
    pub fn new(offsets: Vec<u32>, data: Vec<u8>, validity: Option<Bitmap>) -> Self {
        assert!(!offsets.is_empty());
        if let Some(validity) = &validity {
            assert_eq!(offsets.len() - 1, validity.len());
        }
        Utf8Array {
            offsets,
            data,
            validity,
        }
    }

    pub fn len(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub const fn validity(&self) -> Option<&Bitmap> {
        self.validity.as_ref()
    }

    pub fn is_valid(&self, idx: usize) -> Option<bool> {
        if idx >= self.len() {
            return None;
        }
        Some(match &self.validity {
            Some(validity) => validity.value(idx),
            None => true,
        })
    }

    /// Get the raw value at the given index, not accounting for validity.
    pub fn value(&self, idx: usize) -> Option<&str> {
        if idx >= self.len() {
            return None;
        }
        let start = self.offsets[idx] as usize;
        let end = self.offsets[idx + 1] as usize;
        std::str::from_utf8(&self.data[start..end]).ok()
    }
}

impl<'a> FromIterator<&'a str> for Utf8Array {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let mut offsets = vec![0];
        let mut data = Vec::new();
        for s in iter {
            data.extend_from_slice(s.as_bytes());
            offsets.push(data.len() as u32);
        }
        Utf8Array {
            offsets,
            data,
            validity: None,
        }
    }
}

impl<'a> FromIterator<Option<&'a str>> for Utf8Array {
    fn from_iter<I: IntoIterator<Item = Option<&'a str>>>(iter: I) -> Self {
        let mut offsets = vec![0];
        let mut data = Vec::new();
        let mut validity = Bitmap::default();
        for s in iter {
            match s {
                Some(s) => {
                    data.extend_from_slice(s.as_bytes());
                    validity.push(true);
                }
                None => validity.push(false),
            }
            offsets.push(data.len() as u32);
        }
        Utf8Array {
            offsets,
            data,
            validity: Some(validity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_access() {
        let arr = Array::Int64(Int64Array::from_iter([Some(4), None, Some(6)]));

        assert_eq!(Some(ScalarValue::Int64(4)), arr.scalar(0));
        assert_eq!(Some(ScalarValue::Null), arr.scalar(1));
        assert_eq!(Some(ScalarValue::Int64(6)), arr.scalar(2));
        assert_eq!(None, arr.scalar(3));
    }

    #[test]
    fn values_eq_same_type() {
        let a = Array::Utf8(Utf8Array::from_iter(["aa", "bb"]));
        let b = Array::Utf8(Utf8Array::from_iter(["bb", "cc"]));

        assert!(a.values_eq(1, &b, 0, false));
        assert!(!a.values_eq(0, &b, 1, false));
    }

    #[test]
    fn values_eq_nulls() {
        let a = Array::Int32(Int32Array::from_iter([Some(1), None]));
        let b = Array::Int32(Int32Array::from_iter([None, Some(1)]));

        assert!(!a.values_eq(1, &b, 0, false));
        assert!(a.values_eq(1, &b, 0, true));
        assert!(!a.values_eq(0, &b, 0, true));
        assert!(a.values_eq(0, &b, 1, false));
    }

    #[test]
    fn values_eq_mismatched_types() {
        let a = Array::Int32(Int32Array::from_iter([1]));
        let b = Array::Int64(Int64Array::from_iter([1]));

        assert!(!a.values_eq(0, &b, 0, false));
    }
}
