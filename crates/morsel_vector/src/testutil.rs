//! Utilities for asserting batch contents in tests.

use crate::batch::Batch;
use crate::scalar::ScalarValue;

/// Collect every row of a batch as owned scalars.
pub fn batch_rows(batch: &Batch) -> Vec<Vec<ScalarValue>> {
    (0..batch.num_rows())
        .map(|row| {
            batch
                .columns()
                .iter()
                .map(|col| col.scalar(row).expect("row in bounds"))
                .collect()
        })
        .collect()
}

/// Collect rows from many batches into one sorted list, for order-insensitive
/// (multiset) comparisons.
pub fn sorted_rows(batches: &[Batch]) -> Vec<Vec<ScalarValue>> {
    let mut rows: Vec<Vec<ScalarValue>> = batches.iter().flat_map(|b| batch_rows(b)).collect();
    rows.sort_by_key(|row| {
        row.iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("\u{1}")
    });
    rows
}
