use super::hash_table::{JoinHashTable, HASH_TABLE_ENTRY_BYTES};
use super::metrics::HashJoinMetrics;
use super::spill::{SpillFile, SpillSet, SpillWriter};
use crate::runtime::allocator::Allocator;
use morsel_error::{ErrorKind, MorselError, OptionExt, Result};
use morsel_vector::array::{Array, UInt32Array};
use morsel_vector::batch::Batch;
use morsel_vector::builder::ArrayBuilder;
use morsel_vector::field::DataType;
use morsel_vector::size::batch_byte_size;
use std::sync::Arc;
use tracing::debug;

/// One of the P hash-partitioned row buckets within a single cycle.
///
/// Holds build rows in sealed batches (each with a trailing hash-value
/// column), an optional hash table built after the build drain, and optional
/// inner/outer spill writers once the partition has spilled. Lives for one
/// cycle; spill files outlive it.
#[derive(Debug)]
pub struct HashPartition {
    idx: usize,
    records_per_batch: usize,

    /// Builders for the visible build columns of the batch being filled.
    buffer: Vec<ArrayBuilder>,
    /// Hash codes for the buffered rows.
    buffer_hashes: Vec<u32>,

    /// Sealed in-memory batches, trailing hash-value column included.
    batches: Vec<Batch>,
    /// Allocator bytes reserved for `batches`.
    bytes_in_memory: usize,
    /// Allocator bytes reserved for the hash table.
    table_bytes: usize,

    hash_table: Option<JoinHashTable>,

    spilled: bool,
    inner_writer: Option<SpillWriter>,
    inner_file: Option<SpillFile>,

    outer_buffer: Option<Vec<ArrayBuilder>>,
    outer_hashes: Vec<u32>,
    outer_writer: Option<SpillWriter>,
    outer_file: Option<SpillFile>,

    /// Build rows appended, in-memory and spilled.
    num_rows: usize,
}

impl HashPartition {
    pub fn new(idx: usize, build_types: &[DataType], records_per_batch: usize) -> Self {
        HashPartition {
            idx,
            records_per_batch,
            buffer: build_types.iter().map(|t| ArrayBuilder::new(*t)).collect(),
            buffer_hashes: Vec::new(),
            batches: Vec::new(),
            bytes_in_memory: 0,
            table_bytes: 0,
            hash_table: None,
            spilled: false,
            inner_writer: None,
            inner_file: None,
            outer_buffer: None,
            outer_hashes: Vec::new(),
            outer_writer: None,
            outer_file: None,
            num_rows: 0,
        }
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn is_spilled(&self) -> bool {
        self.spilled
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn in_memory_batches(&self) -> usize {
        self.batches.len()
    }

    pub fn bytes_in_memory(&self) -> usize {
        self.bytes_in_memory
    }

    pub fn hash_table(&self) -> Option<&JoinHashTable> {
        self.hash_table.as_ref()
    }

    pub fn hash_table_mut(&mut self) -> Option<&mut JoinHashTable> {
        self.hash_table.as_mut()
    }

    /// Append one build row.
    ///
    /// `cols` are the visible build columns of the incoming batch. Seals an
    /// internal batch whenever the buffer reaches the configured row count.
    pub fn append_inner_row(
        &mut self,
        cols: &[&Array],
        row: usize,
        inner_hash: u32,
        allocator: &Allocator,
    ) -> Result<()> {
        for (builder, col) in self.buffer.iter_mut().zip(cols.iter()) {
            builder.push_from(col, row)?;
        }
        self.buffer_hashes.push(inner_hash);
        self.num_rows += 1;

        if self.buffer_hashes.len() >= self.records_per_batch {
            self.seal_inner_batch(allocator)?;
        }
        Ok(())
    }

    /// Append a whole batch at once, bypassing the per-row copy.
    ///
    /// Used when there is a single partition; `cols` are the visible build
    /// columns.
    pub fn append_inner_batch(
        &mut self,
        cols: &[Arc<Array>],
        hashes: &[u32],
        allocator: &Allocator,
    ) -> Result<()> {
        let mut full = cols.to_vec();
        full.push(Arc::new(Array::UInt32(UInt32Array::from_iter(
            hashes.iter().copied(),
        ))));
        let batch = Batch::try_from_arcs(full)?;

        self.num_rows += batch.num_rows();
        self.push_sealed_batch(batch, allocator)
    }

    /// Flush any partially filled batch.
    ///
    /// Called at the end of the build drain; goes to the spill file if the
    /// partition is spilled.
    pub fn complete_inner_batch(&mut self, allocator: &Allocator) -> Result<()> {
        self.seal_inner_batch(allocator)
    }

    fn seal_inner_batch(&mut self, allocator: &Allocator) -> Result<()> {
        if self.buffer_hashes.is_empty() {
            return Ok(());
        }

        let mut cols: Vec<Array> = self.buffer.iter_mut().map(|b| b.finish()).collect();
        cols.push(Array::UInt32(UInt32Array::from_iter(
            self.buffer_hashes.drain(..),
        )));
        let batch = Batch::try_new(cols)?;

        self.push_sealed_batch(batch, allocator)
    }

    fn push_sealed_batch(&mut self, batch: Batch, allocator: &Allocator) -> Result<()> {
        if self.spilled {
            let writer = self.inner_writer.as_mut().required("inner spill writer")?;
            writer.write_batch(&batch)?;
            return Ok(());
        }

        let bytes = batch_byte_size(&batch);
        allocator.try_reserve(bytes, "partition batch")?;
        self.bytes_in_memory += bytes;
        self.batches.push(batch);
        Ok(())
    }

    /// Spill this partition: flush buffered rows to the inner file and stream
    /// all future appends there.
    pub fn spill(&mut self, spill_set: &mut SpillSet, cycle: u32, allocator: &Allocator) -> Result<()> {
        if self.spilled {
            return Ok(());
        }

        debug!(
            partition = self.idx,
            cycle,
            batches = self.batches.len(),
            rows = self.num_rows,
            "spilling partition"
        );

        let mut writer = spill_set.writer(&format!("c{cycle}_p{}_inner", self.idx))?;
        for batch in self.batches.drain(..) {
            writer.write_batch(&batch)?;
        }
        self.inner_writer = Some(writer);
        self.spilled = true;

        allocator.release(self.bytes_in_memory);
        self.bytes_in_memory = 0;

        // Flush the partial buffer through the writer as well.
        self.seal_inner_batch(allocator)
    }

    /// Close the inner spill writer, recording the finished file.
    pub fn finish_inner_writer(&mut self, metrics: &mut HashJoinMetrics) -> Result<()> {
        if let Some(writer) = self.inner_writer.take() {
            let file = writer.finish()?;
            metrics.spill_bytes += file.bytes;
            self.inner_file = Some(file);
        }
        Ok(())
    }

    pub fn take_inner_file(&mut self) -> Option<SpillFile> {
        self.inner_file.take()
    }

    /// Build the hash table over this partition's sealed batches.
    pub fn build_hash_table(
        &mut self,
        key_cols: &[usize],
        nulls_equal: bool,
        doubling_factor: f64,
        allocator: &Allocator,
        metrics: &mut HashJoinMetrics,
    ) -> Result<()> {
        let estimate =
            (self.num_rows as f64 * HASH_TABLE_ENTRY_BYTES as f64 * doubling_factor) as usize;
        allocator.try_reserve(estimate, "hash table build")?;
        self.table_bytes = estimate;

        let batches = std::mem::take(&mut self.batches);
        let table = JoinHashTable::build(batches, key_cols.to_vec(), nulls_equal, metrics)?;
        self.hash_table = Some(table);
        Ok(())
    }

    /// Append one probe row destined for this (spilled) partition's outer
    /// file.
    pub fn append_outer_row(
        &mut self,
        cols: &[Arc<Array>],
        row: usize,
        inner_hash: u32,
        probe_types: &[DataType],
        spill_set: &mut SpillSet,
        cycle: u32,
    ) -> Result<()> {
        if !self.spilled {
            return Err(MorselError::with_kind(
                ErrorKind::Internal,
                format!("Probe row routed to outer file of in-memory partition {}", self.idx),
            ));
        }

        let buffer = self
            .outer_buffer
            .get_or_insert_with(|| probe_types.iter().map(|t| ArrayBuilder::new(*t)).collect());
        for (builder, col) in buffer.iter_mut().zip(cols.iter()) {
            builder.push_from(col, row)?;
        }
        self.outer_hashes.push(inner_hash);

        if self.outer_hashes.len() >= self.records_per_batch {
            self.seal_outer_batch(spill_set, cycle)?;
        }
        Ok(())
    }

    fn seal_outer_batch(&mut self, spill_set: &mut SpillSet, cycle: u32) -> Result<()> {
        if self.outer_hashes.is_empty() {
            return Ok(());
        }

        let buffer = self.outer_buffer.as_mut().required("outer row buffer")?;
        let mut cols: Vec<Array> = buffer.iter_mut().map(|b| b.finish()).collect();
        cols.push(Array::UInt32(UInt32Array::from_iter(
            self.outer_hashes.drain(..),
        )));
        let batch = Batch::try_new(cols)?;

        if self.outer_writer.is_none() {
            self.outer_writer =
                Some(spill_set.writer(&format!("c{cycle}_p{}_outer", self.idx))?);
        }
        self.outer_writer
            .as_mut()
            .required("outer spill writer")?
            .write_batch(&batch)
    }

    /// Flush buffered probe rows and close the outer writer.
    pub fn complete_outer(
        &mut self,
        spill_set: &mut SpillSet,
        cycle: u32,
        metrics: &mut HashJoinMetrics,
    ) -> Result<()> {
        self.seal_outer_batch(spill_set, cycle)?;
        if let Some(writer) = self.outer_writer.take() {
            let file = writer.finish()?;
            metrics.spill_bytes += file.bytes;
            self.outer_file = Some(file);
        }
        Ok(())
    }

    pub fn take_outer_file(&mut self) -> Option<SpillFile> {
        self.outer_file.take()
    }

    /// Release all in-memory structures. Spill files are untouched.
    pub fn close(&mut self, allocator: &Allocator) {
        self.batches.clear();
        self.hash_table = None;
        self.buffer.clear();
        self.buffer_hashes.clear();
        self.outer_buffer = None;
        self.outer_hashes.clear();
        self.inner_writer = None;
        self.outer_writer = None;

        allocator.release(self.bytes_in_memory + self.table_bytes);
        self.bytes_in_memory = 0;
        self.table_bytes = 0;
    }

    /// One line of per-partition statistics for memory failure dumps.
    pub fn debug_stats(&self) -> String {
        format!(
            "partition {}: rows {}, in-memory batches {}, in-memory bytes {}, spilled {}, table entries {}",
            self.idx,
            self.num_rows,
            self.batches.len(),
            self.bytes_in_memory,
            self.spilled,
            self.hash_table.as_ref().map(|t| t.num_entries()).unwrap_or(0),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use morsel_vector::array::Int64Array;

    fn int_col(vals: &[i64]) -> Array {
        Array::Int64(vals.iter().copied().collect::<Int64Array>())
    }

    #[test]
    fn rows_seal_into_batches() {
        let allocator = Allocator::with_limit(0);
        let mut part = HashPartition::new(0, &[DataType::Int64], 2);

        let col = int_col(&[10, 20, 30]);
        for row in 0..3 {
            part.append_inner_row(&[&col], row, row as u32, &allocator).unwrap();
        }

        assert_eq!(1, part.in_memory_batches());
        part.complete_inner_batch(&allocator).unwrap();
        assert_eq!(2, part.in_memory_batches());
        assert_eq!(3, part.num_rows());
        assert!(part.bytes_in_memory() > 0);

        // Sealed batches carry the hash-value column.
        assert_eq!(2, part.in_memory_batches());
        let mut metrics = HashJoinMetrics::default();
        part.build_hash_table(&[0], false, 2.0, &allocator, &mut metrics)
            .unwrap();
        assert_eq!(3, part.hash_table().unwrap().num_entries());

        part.close(&allocator);
        assert_eq!(0, allocator.used());
    }

    #[test]
    fn spill_flushes_buffered_rows() {
        let allocator = Allocator::with_limit(0);
        let mut spill_set = SpillSet::create(&std::env::temp_dir(), 1).unwrap();
        let mut part = HashPartition::new(3, &[DataType::Int64], 2);

        let col = int_col(&[1, 2, 3, 4, 5]);
        for row in 0..5 {
            part.append_inner_row(&[&col], row, 9, &allocator).unwrap();
        }
        assert_eq!(2, part.in_memory_batches());

        part.spill(&mut spill_set, 0, &allocator).unwrap();
        assert!(part.is_spilled());
        assert_eq!(0, part.in_memory_batches());
        assert_eq!(0, allocator.used());

        let mut metrics = HashJoinMetrics::default();
        part.finish_inner_writer(&mut metrics).unwrap();
        let file = part.take_inner_file().unwrap();
        // Two sealed batches plus the flushed partial buffer.
        assert_eq!(3, file.batches);
        assert!(metrics.spill_bytes > 0);

        spill_set.close();
    }

    #[test]
    fn outer_rows_only_for_spilled_partitions() {
        let allocator = Allocator::with_limit(0);
        let mut spill_set = SpillSet::create(&std::env::temp_dir(), 2).unwrap();
        let mut part = HashPartition::new(1, &[DataType::Int64], 4);

        let col = Arc::new(int_col(&[7]));
        let err = part
            .append_outer_row(
                &[col.clone()],
                0,
                5,
                &[DataType::Int64],
                &mut spill_set,
                0,
            )
            .unwrap_err();
        assert_eq!(morsel_error::ErrorKind::Internal, err.kind());

        part.spill(&mut spill_set, 0, &allocator).unwrap();
        part.append_outer_row(&[col], 0, 5, &[DataType::Int64], &mut spill_set, 0)
            .unwrap();

        let mut metrics = HashJoinMetrics::default();
        part.complete_outer(&mut spill_set, 0, &mut metrics).unwrap();
        let file = part.take_outer_file().unwrap();
        assert_eq!(1, file.batches);

        spill_set.close();
    }
}
