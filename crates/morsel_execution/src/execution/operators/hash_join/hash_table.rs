use super::metrics::HashJoinMetrics;
use hashbrown::raw::RawTable;
use morsel_error::{ErrorKind, MorselError, Result};
use morsel_vector::array::{Array, UInt32Array};
use morsel_vector::batch::Batch;
use morsel_vector::bitmap::Bitmap;
use std::fmt;
use std::time::Instant;

/// Bytes per hash table entry, used for reservation estimates.
pub const HASH_TABLE_ENTRY_BYTES: usize = std::mem::size_of::<(u64, RowKey)>();

/// Points to a row in the hash table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowKey {
    /// Index of the batch in the batches vector.
    pub batch_idx: u32,
    /// Index of the row in the batch.
    pub row_idx: u32,
}

/// Get the hidden hash-value column carried as the last column of partition
/// batches.
pub fn hidden_hash_column(batch: &Batch) -> Result<&UInt32Array> {
    let col = batch
        .column(batch.num_columns().wrapping_sub(1))
        .ok_or_else(|| {
            MorselError::with_kind(ErrorKind::Internal, "Partition batch has no columns")
        })?;
    match col.as_ref() {
        Array::UInt32(arr) => Ok(arr),
        other => Err(MorselError::with_kind(
            ErrorKind::Internal,
            format!(
                "Expected UInt32 hash-value column as last column, got {}",
                other.datatype()
            ),
        )),
    }
}

/// Hash table over one partition's build rows.
///
/// Keyed on the in-partition hash code stored in the hidden hash-value
/// column. Each batch carries a matched bitmap so unmatched build rows can be
/// emitted for build-preserving joins and set operations.
pub struct JoinHashTable {
    /// All collected batches, trailing hash-value column included.
    batches: Vec<Batch>,
    /// Build-side key column indices.
    key_cols: Vec<usize>,
    /// Hash table pointing to a row.
    table: RawTable<(u64, RowKey)>,
    /// Per-batch visited bitmaps.
    matched: Vec<Bitmap>,
    /// Whether null keys compare equal (set operation semantics).
    nulls_equal: bool,
}

impl JoinHashTable {
    /// Build a table over the given partition batches.
    ///
    /// Rows with a null key are kept in `batches` (they may still be emitted
    /// as unmatched) but are only inserted into the table when nulls compare
    /// equal.
    pub fn build(
        batches: Vec<Batch>,
        key_cols: Vec<usize>,
        nulls_equal: bool,
        metrics: &mut HashJoinMetrics,
    ) -> Result<Self> {
        let mut table = RawTable::new();
        let mut matched = Vec::with_capacity(batches.len());

        for (batch_idx, batch) in batches.iter().enumerate() {
            let hashes = hidden_hash_column(batch)?;
            matched.push(Bitmap::zeroed(batch.num_rows()));

            // Raw hashbrown reserves 1 at a time on insert if it's out of
            // capacity. Grow here instead, and count the growth.
            let remaining = table.capacity() - table.len();
            if remaining < batch.num_rows() {
                let started = Instant::now();
                table.reserve(batch.num_rows() - remaining, |(hash, _)| *hash);
                metrics.num_resizing += 1;
                metrics.resizing_time_ms += started.elapsed().as_millis() as u64;
            }

            for (row_idx, hash) in hashes.values().iter().enumerate() {
                if !nulls_equal && Self::any_key_null(batch, &key_cols, row_idx) {
                    continue;
                }
                let row_key = RowKey {
                    batch_idx: batch_idx as u32,
                    row_idx: row_idx as u32,
                };
                let hash = u64::from(*hash);
                table.insert(hash, (hash, row_key), |(hash, _)| *hash);
            }
        }

        metrics.num_entries += table.len() as u64;
        metrics.num_buckets += table.buckets() as u64;

        Ok(JoinHashTable {
            batches,
            key_cols,
            table,
            matched,
            nulls_equal,
        })
    }

    fn any_key_null(batch: &Batch, key_cols: &[usize], row: usize) -> bool {
        key_cols.iter().any(|col| {
            !batch
                .column(*col)
                .and_then(|c| c.is_valid(row))
                .unwrap_or(false)
        })
    }

    pub fn num_entries(&self) -> usize {
        self.table.len()
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    /// Collect build rows matching the probe row into `out`.
    ///
    /// Candidates come from the hash table; each is verified against the
    /// probe key values before being returned.
    pub fn probe(
        &self,
        inner_hash: u64,
        probe_cols: &[&Array],
        probe_row: usize,
        out: &mut Vec<RowKey>,
    ) {
        out.clear();

        // SAFETY: Iterator only lives for this method call.
        // See: https://docs.rs/hashbrown/latest/hashbrown/raw/struct.RawTable.html#method.iter_hash
        unsafe {
            self.table.iter_hash(inner_hash).for_each(|bucket| {
                let val = bucket.as_ref();

                // Hashbrown only stores the first seven bits of the hash.
                // Check here to further prune items we pull out of the table.
                if val.0 != inner_hash {
                    return;
                }

                out.push(val.1);
            })
        }

        out.retain(|key| self.keys_equal(*key, probe_cols, probe_row));
    }

    fn keys_equal(&self, key: RowKey, probe_cols: &[&Array], probe_row: usize) -> bool {
        let batch = &self.batches[key.batch_idx as usize];
        self.key_cols
            .iter()
            .zip(probe_cols.iter())
            .all(|(build_col, probe_col)| {
                batch
                    .column(*build_col)
                    .expect("key column in bounds")
                    .values_eq(key.row_idx as usize, probe_col, probe_row, self.nulls_equal)
            })
    }

    pub fn mark_matched(&mut self, key: RowKey) {
        self.matched[key.batch_idx as usize].set(key.row_idx as usize, true);
    }

    pub fn is_matched(&self, key: RowKey) -> bool {
        self.matched[key.batch_idx as usize].value(key.row_idx as usize)
    }

    pub fn is_row_matched(&self, batch_idx: usize, row_idx: usize) -> bool {
        self.matched[batch_idx].value(row_idx)
    }
}

impl fmt::Debug for JoinHashTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHashTable")
            .field("num_batches", &self.batches.len())
            .field("num_entries", &self.table.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use morsel_vector::array::{Int64Array, Utf8Array};

    fn partition_batch(keys: &[Option<i64>], payload: &[&str], hashes: &[u32]) -> Batch {
        Batch::try_new(vec![
            Array::Int64(keys.iter().copied().collect::<Int64Array>()),
            Array::Utf8(payload.iter().copied().collect::<Utf8Array>()),
            Array::UInt32(hashes.iter().copied().collect::<UInt32Array>()),
        ])
        .unwrap()
    }

    #[test]
    fn probe_verifies_keys() {
        let mut metrics = HashJoinMetrics::default();
        // Rows 0 and 2 collide on the stored hash but have different keys.
        let batch = partition_batch(
            &[Some(1), Some(2), Some(3)],
            &["a", "b", "c"],
            &[100, 200, 100],
        );
        let table = JoinHashTable::build(vec![batch], vec![0], false, &mut metrics).unwrap();

        assert_eq!(3, table.num_entries());
        assert_eq!(3, metrics.num_entries);

        let probe_keys = Array::Int64(Int64Array::from_iter([1]));
        let mut out = Vec::new();
        table.probe(100, &[&probe_keys], 0, &mut out);

        assert_eq!(
            vec![RowKey {
                batch_idx: 0,
                row_idx: 0
            }],
            out
        );
    }

    #[test]
    fn duplicate_keys_all_returned() {
        let mut metrics = HashJoinMetrics::default();
        let batch = partition_batch(&[Some(2), Some(2)], &["b", "c"], &[7, 7]);
        let table = JoinHashTable::build(vec![batch], vec![0], false, &mut metrics).unwrap();

        let probe_keys = Array::Int64(Int64Array::from_iter([2]));
        let mut out = Vec::new();
        table.probe(7, &[&probe_keys], 0, &mut out);

        assert_eq!(2, out.len());
    }

    #[test]
    fn null_keys_not_inserted_unless_set_op() {
        let mut metrics = HashJoinMetrics::default();
        let batch = partition_batch(&[Some(1), None], &["a", "b"], &[5, 6]);
        let table =
            JoinHashTable::build(vec![batch.clone()], vec![0], false, &mut metrics).unwrap();
        assert_eq!(1, table.num_entries());

        let table = JoinHashTable::build(vec![batch], vec![0], true, &mut metrics).unwrap();
        assert_eq!(2, table.num_entries());

        let probe_keys = Array::Int64(Int64Array::from_iter([None::<i64>]));
        let mut out = Vec::new();
        table.probe(6, &[&probe_keys], 0, &mut out);
        assert_eq!(1, out.len());
    }

    #[test]
    fn matched_bitmaps() {
        let mut metrics = HashJoinMetrics::default();
        let batch = partition_batch(&[Some(1), Some(2)], &["a", "b"], &[5, 6]);
        let mut table = JoinHashTable::build(vec![batch], vec![0], false, &mut metrics).unwrap();

        let key = RowKey {
            batch_idx: 0,
            row_idx: 1,
        };
        assert!(!table.is_matched(key));
        table.mark_matched(key);
        assert!(table.is_matched(key));
        assert!(!table.is_row_matched(0, 0));
    }
}
