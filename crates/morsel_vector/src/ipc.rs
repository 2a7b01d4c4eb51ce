//! Compact binary encoding for batches.
//!
//! This is the payload format used inside spill-file frames. It is not a
//! stable interchange format; both ends are always the same build of this
//! crate.

use crate::array::{Array, BooleanArray, NullArray, PrimitiveArray, Utf8Array};
use crate::batch::Batch;
use crate::bitmap::Bitmap;
use morsel_error::{ErrorKind, MorselError, Result};

const TAG_NULL: u8 = 0;
const TAG_BOOLEAN: u8 = 1;
const TAG_INT32: u8 = 2;
const TAG_INT64: u8 = 3;
const TAG_UINT32: u8 = 4;
const TAG_UINT64: u8 = 5;
const TAG_FLOAT64: u8 = 6;
const TAG_UTF8: u8 = 7;

trait LeBytes: Sized + Copy + Default {
    const SIZE: usize;
    fn write_le(&self, out: &mut Vec<u8>);
    fn read_le(buf: &[u8]) -> Self;
}

macro_rules! impl_le_bytes {
    ($typ:ty, $size:expr) => {
        impl LeBytes for $typ {
            const SIZE: usize = $size;

            fn write_le(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(buf: &[u8]) -> Self {
                <$typ>::from_le_bytes(buf.try_into().expect("buffer of exact size"))
            }
        }
    };
}

impl_le_bytes!(i32, 4);
impl_le_bytes!(i64, 8);
impl_le_bytes!(u32, 4);
impl_le_bytes!(u64, 8);
impl_le_bytes!(f64, 8);

/// Encode a batch to the end of `out`.
pub fn encode_batch(batch: &Batch, out: &mut Vec<u8>) {
    (batch.num_columns() as u32).write_le(out);
    (batch.num_rows() as u64).write_le(out);

    for col in batch.columns() {
        encode_array(col, out);
    }
}

fn encode_array(array: &Array, out: &mut Vec<u8>) {
    match array {
        Array::Null(_) => out.push(TAG_NULL),
        Array::Boolean(arr) => {
            out.push(TAG_BOOLEAN);
            encode_validity(arr.validity(), out);
            out.extend_from_slice(arr.values().data());
        }
        Array::Int32(arr) => encode_primitive(TAG_INT32, arr, out),
        Array::Int64(arr) => encode_primitive(TAG_INT64, arr, out),
        Array::UInt32(arr) => encode_primitive(TAG_UINT32, arr, out),
        Array::UInt64(arr) => encode_primitive(TAG_UINT64, arr, out),
        Array::Float64(arr) => encode_primitive(TAG_FLOAT64, arr, out),
        Array::Utf8(arr) => {
            out.push(TAG_UTF8);
            encode_validity(arr.validity(), out);
            for offset in arr.offsets() {
                offset.write_le(out);
            }
            (arr.data().len() as u64).write_le(out);
            out.extend_from_slice(arr.data());
        }
    }
}

fn encode_primitive<T: LeBytes>(tag: u8, arr: &PrimitiveArray<T>, out: &mut Vec<u8>) {
    out.push(tag);
    encode_validity(arr.validity(), out);
    for val in arr.values() {
        val.write_le(out);
    }
}

fn encode_validity(validity: Option<&Bitmap>, out: &mut Vec<u8>) {
    match validity {
        Some(bitmap) => {
            out.push(1);
            out.extend_from_slice(bitmap.data());
        }
        None => out.push(0),
    }
}

/// Decode a batch previously produced by `encode_batch`.
pub fn decode_batch(buf: &[u8]) -> Result<Batch> {
    let mut reader = Reader { buf, pos: 0 };

    let num_cols = reader.read::<u32>()? as usize;
    let num_rows = reader.read::<u64>()? as usize;

    let mut cols = Vec::with_capacity(num_cols);
    for _ in 0..num_cols {
        cols.push(decode_array(&mut reader, num_rows)?);
    }

    if cols.is_empty() && num_rows > 0 {
        return Err(MorselError::with_kind(
            ErrorKind::Internal,
            "Encoded batch has rows but no columns",
        ));
    }

    Batch::try_new(cols)
}

fn decode_array(reader: &mut Reader, num_rows: usize) -> Result<Array> {
    let tag = reader.read_u8()?;
    Ok(match tag {
        TAG_NULL => Array::Null(NullArray::new(num_rows)),
        TAG_BOOLEAN => {
            let validity = decode_validity(reader, num_rows)?;
            let values = reader.read_bitmap(num_rows)?;
            Array::Boolean(BooleanArray::new(values, validity))
        }
        TAG_INT32 => Array::Int32(decode_primitive(reader, num_rows)?),
        TAG_INT64 => Array::Int64(decode_primitive(reader, num_rows)?),
        TAG_UINT32 => Array::UInt32(decode_primitive(reader, num_rows)?),
        TAG_UINT64 => Array::UInt64(decode_primitive(reader, num_rows)?),
        TAG_FLOAT64 => Array::Float64(decode_primitive(reader, num_rows)?),
        TAG_UTF8 => {
            let validity = decode_validity(reader, num_rows)?;
            let mut offsets = Vec::with_capacity(num_rows + 1);
            for _ in 0..num_rows + 1 {
                offsets.push(reader.read::<u32>()?);
            }
            let data_len = reader.read::<u64>()? as usize;
            let data = reader.read_bytes(data_len)?.to_vec();
            Array::Utf8(Utf8Array::new(offsets, data, validity))
        }
        other => {
            return Err(MorselError::with_kind(
                ErrorKind::Internal,
                format!("Invalid array type tag: {other}"),
            ))
        }
    })
}

fn decode_primitive<T: LeBytes>(reader: &mut Reader, num_rows: usize) -> Result<PrimitiveArray<T>> {
    let validity = decode_validity(reader, num_rows)?;
    let mut values = Vec::with_capacity(num_rows);
    for _ in 0..num_rows {
        let buf = reader.read_bytes(T::SIZE)?;
        values.push(T::read_le(buf));
    }
    Ok(PrimitiveArray::new(values, validity))
}

fn decode_validity(reader: &mut Reader, num_rows: usize) -> Result<Option<Bitmap>> {
    match reader.read_u8()? {
        0 => Ok(None),
        1 => Ok(Some(reader.read_bitmap(num_rows)?)),
        other => Err(MorselError::with_kind(
            ErrorKind::Internal,
            format!("Invalid validity flag: {other}"),
        )),
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.buf.len() {
            return Err(MorselError::with_kind(
                ErrorKind::Internal,
                "Truncated batch encoding",
            ));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read<T: LeBytes>(&mut self) -> Result<T> {
        Ok(T::read_le(self.read_bytes(T::SIZE)?))
    }

    fn read_bitmap(&mut self, num_bits: usize) -> Result<Bitmap> {
        let bytes = self.read_bytes((num_bits + 7) / 8)?;
        Ok(Bitmap::from_raw(num_bits, bytes.to_vec()))
    }
}
