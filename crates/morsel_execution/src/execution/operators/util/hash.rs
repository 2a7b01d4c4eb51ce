use ahash::RandomState;
use morsel_error::{MorselError, Result};
use morsel_vector::array::{Array, BooleanArray, PrimitiveArray, Utf8Array};

/// State used for all hashing operations during physical execution.
///
/// Hashes must be consistent across batches and across spill cycles, so the
/// state is fixed.
pub const HASH_RANDOM_STATE: RandomState = RandomState::with_seeds(0, 0, 0, 0);

/// Routes hashes to partitions and extracts the in-partition hash code.
///
/// The low `bits` of a hash pick the partition, the remaining high bits are
/// the hash code stored with the row. Routing bits and storage bits are
/// disjoint so a partition's hash-table lookup never re-mixes the
/// partitioning bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionMask {
    mask: u64,
    bits: u32,
}

impl PartitionMask {
    /// Create a mask for the given partition count.
    ///
    /// Panics if the count is not a power of two.
    pub fn new(num_partitions: usize) -> Self {
        assert!(
            num_partitions.is_power_of_two(),
            "partition count must be a power of two, got {num_partitions}"
        );
        let bits = num_partitions.trailing_zeros();
        PartitionMask {
            mask: num_partitions as u64 - 1,
            bits,
        }
    }

    pub const fn bits(&self) -> u32 {
        self.bits
    }

    /// Partition index for a hash.
    pub const fn partition(&self, hash: u64) -> usize {
        (hash & self.mask) as usize
    }

    /// In-partition hash code for a hash.
    ///
    /// Stored alongside spilled rows as a 32-bit column and reused as the
    /// routing hash in later cycles.
    pub const fn inner_hash(&self, hash: u64) -> u32 {
        (hash >> self.bits) as u32
    }
}

/// Round a partition count up to the next power of two.
pub const fn round_up_power_of_two(n: usize) -> usize {
    if n <= 1 {
        1
    } else {
        n.next_power_of_two()
    }
}

/// Hash every row in the provided arrays, writing the values to `hashes`.
///
/// All arrays provided must be of the same length, and the provided hash
/// buffer must equal that length. Hashes of multiple arrays are combined
/// column-by-column.
pub fn hash_arrays<'a>(arrays: &[&Array], hashes: &'a mut [u64]) -> Result<&'a mut [u64]> {
    for (idx, array) in arrays.iter().enumerate() {
        if array.len() != hashes.len() {
            return Err(MorselError::new(format!(
                "Expected array of length {}, got {}",
                hashes.len(),
                array.len()
            )));
        }

        let combine_hash = idx > 0;

        match array {
            Array::Null(_) => hash_null(hashes, combine_hash),
            Array::Boolean(arr) => hash_bool(arr, hashes, combine_hash),
            Array::Int32(arr) => hash_primitive(arr, hashes, combine_hash),
            Array::Int64(arr) => hash_primitive(arr, hashes, combine_hash),
            Array::UInt32(arr) => hash_primitive(arr, hashes, combine_hash),
            Array::UInt64(arr) => hash_primitive(arr, hashes, combine_hash),
            Array::Float64(arr) => hash_primitive(arr, hashes, combine_hash),
            Array::Utf8(arr) => hash_utf8(arr, hashes, combine_hash),
        }
    }

    Ok(hashes)
}

/// Helper trait for hashing values.
///
/// This is mostly for floats since they don't automatically implement `Hash`.
trait HashValue {
    fn hash_one(&self) -> u64;
}

macro_rules! impl_hash_value {
    ($typ:ty) => {
        impl HashValue for $typ {
            fn hash_one(&self) -> u64 {
                HASH_RANDOM_STATE.hash_one(self)
            }
        }
    };
}

impl_hash_value!(bool);
impl_hash_value!(i32);
impl_hash_value!(i64);
impl_hash_value!(u32);
impl_hash_value!(u64);
impl_hash_value!(str);

impl HashValue for f64 {
    fn hash_one(&self) -> u64 {
        HASH_RANDOM_STATE.hash_one(self.to_ne_bytes())
    }
}

/// Combines two hashes into one hash.
///
/// This implementation came from datafusion.
const fn combine_hashes(l: u64, r: u64) -> u64 {
    let hash = (17 * 37u64).wrapping_add(l);
    hash.wrapping_mul(37).wrapping_add(r)
}

/// All nulls should hash to the same value.
///
/// _What_ that value is is arbitrary, but it needs to be consistent.
fn null_hash_value() -> u64 {
    HASH_RANDOM_STATE.hash_one(1)
}

fn hash_null(hashes: &mut [u64], combine: bool) {
    let null_hash = null_hash_value();

    if combine {
        for hash in hashes.iter_mut() {
            *hash = combine_hashes(null_hash, *hash);
        }
    } else {
        for hash in hashes.iter_mut() {
            *hash = null_hash;
        }
    }
}

fn hash_bool(array: &BooleanArray, hashes: &mut [u64], combine: bool) {
    for (idx, hash) in hashes.iter_mut().enumerate() {
        let value_hash = if array.is_valid(idx).expect("index in bounds") {
            array.value(idx).expect("index in bounds").hash_one()
        } else {
            null_hash_value()
        };
        *hash = if combine {
            combine_hashes(value_hash, *hash)
        } else {
            value_hash
        };
    }
}

fn hash_primitive<T: HashValue>(array: &PrimitiveArray<T>, hashes: &mut [u64], combine: bool) {
    match array.validity() {
        Some(bitmap) => {
            for ((val, hash), valid) in array
                .values()
                .iter()
                .zip(hashes.iter_mut())
                .zip(bitmap.iter())
            {
                let value_hash = if valid { val.hash_one() } else { null_hash_value() };
                *hash = if combine {
                    combine_hashes(value_hash, *hash)
                } else {
                    value_hash
                };
            }
        }
        None => {
            for (val, hash) in array.values().iter().zip(hashes.iter_mut()) {
                *hash = if combine {
                    combine_hashes(val.hash_one(), *hash)
                } else {
                    val.hash_one()
                };
            }
        }
    }
}

fn hash_utf8(array: &Utf8Array, hashes: &mut [u64], combine: bool) {
    for (idx, hash) in hashes.iter_mut().enumerate() {
        let value_hash = if array.is_valid(idx).expect("index in bounds") {
            array.value(idx).expect("index in bounds").hash_one()
        } else {
            null_hash_value()
        };
        *hash = if combine {
            combine_hashes(value_hash, *hash)
        } else {
            value_hash
        };
    }
}
