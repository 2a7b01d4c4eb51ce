use super::hash_table::{hidden_hash_column, RowKey};
use super::metrics::HashJoinMetrics;
use super::partition::HashPartition;
use super::spill::{SpillReader, SpillSet};
use super::JoinType;
use crate::execution::operators::util::hash::{hash_arrays, PartitionMask};
use crate::execution::operators::{BatchStream, StreamPoll};
use hashbrown::raw::RawTable;
use morsel_error::{ErrorKind, MorselError, OptionExt, Result};
use morsel_vector::array::Array;
use morsel_vector::batch::Batch;
use morsel_vector::builder::ArrayBuilder;
use morsel_vector::field::DataType;
use morsel_vector::scalar::ScalarValue;
use morsel_vector::size::batch_byte_size;
use std::fmt;
use std::sync::Arc;

/// Where the probe phase pulls its batches from this cycle.
#[derive(Debug)]
pub(super) enum ProbeSource<'a> {
    Stream(&'a mut dyn BatchStream),
    Spilled(&'a mut SpillReader),
    Empty,
}

impl ProbeSource<'_> {
    fn poll(&mut self) -> Result<StreamPoll> {
        match self {
            Self::Stream(stream) => stream.poll_next(),
            Self::Spilled(reader) => Ok(match reader.next_batch()? {
                Some(batch) => StreamPoll::Batch(batch),
                None => StreamPoll::Exhausted,
            }),
            Self::Empty => Ok(StreamPoll::Exhausted),
        }
    }
}

/// Assembles output batches row by row.
///
/// Layout is the projected build columns followed by the projected probe
/// columns; either side may be absent for a given row (null padding) or for
/// the whole join (probe-only variants have a zero-width build section).
#[derive(Debug)]
pub(super) struct OutputBuilder {
    builders: Vec<ArrayBuilder>,
    build_width: usize,
    target_rows: usize,
    rows: usize,
}

impl OutputBuilder {
    pub fn new(output_types: &[DataType], build_width: usize, target_rows: usize) -> Self {
        OutputBuilder {
            builders: output_types.iter().map(|t| ArrayBuilder::new(*t)).collect(),
            build_width,
            target_rows,
            rows: 0,
        }
    }

    fn push_row(
        &mut self,
        build: Option<(&Batch, usize)>,
        probe: Option<(&[Arc<Array>], usize)>,
    ) -> Result<()> {
        for (idx, builder) in self.builders[..self.build_width].iter_mut().enumerate() {
            match build {
                Some((batch, row)) => {
                    let col = batch.column(idx).required("build output column")?;
                    builder.push_from(col, row)?;
                }
                None => builder.push_null(),
            }
        }
        for (idx, builder) in self.builders[self.build_width..].iter_mut().enumerate() {
            match probe {
                Some((cols, row)) => builder.push_from(&cols[idx], row)?,
                None => builder.push_null(),
            }
        }
        self.rows += 1;
        Ok(())
    }

    fn is_full(&self) -> bool {
        self.rows >= self.target_rows
    }

    fn len(&self) -> usize {
        self.rows
    }

    fn take_batch(&mut self) -> Result<Batch> {
        let cols = self.builders.iter_mut().map(|b| b.finish()).collect();
        self.rows = 0;
        Batch::try_new(cols)
    }
}

/// Dedup table over probe-side keys, used by EXCEPT to suppress duplicate
/// unmatched rows. Null keys compare equal (set operation semantics).
#[derive(Default)]
struct ProbeDedup {
    table: RawTable<(u64, u32)>,
    rows: Vec<Vec<ScalarValue>>,
}

impl fmt::Debug for ProbeDedup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeDedup")
            .field("rows", &self.rows.len())
            .finish_non_exhaustive()
    }
}

impl ProbeDedup {
    fn insert_if_absent(&mut self, keys: &[&Array], row: usize, hash: u64) -> bool {
        let key_vals: Vec<ScalarValue> = keys
            .iter()
            .map(|a| a.scalar(row).expect("row in bounds"))
            .collect();

        let mut exists = false;
        // SAFETY: Iterator only lives for this block.
        unsafe {
            self.table.iter_hash(hash).for_each(|bucket| {
                let val = bucket.as_ref();
                if val.0 == hash && self.rows[val.1 as usize] == key_vals {
                    exists = true;
                }
            })
        }
        if exists {
            return false;
        }

        let idx = self.rows.len() as u32;
        self.rows.push(key_vals);
        self.table.insert(hash, (hash, idx), |(h, _)| *h);
        true
    }
}

/// Result of asking the probe machine for more output.
#[derive(Debug)]
pub(super) enum ProbeStep {
    Output(Batch),
    Pending,
    Finished,
}

#[derive(Debug, Clone, Copy)]
enum ProbeState {
    /// Streaming probe rows against the partitions.
    Streaming,
    /// Emitting unmatched build rows for build-preserving joins.
    Final {
        part: usize,
        batch: usize,
        row: usize,
    },
    /// Everything emitted.
    Drained,
}

/// Cursor over the probe batch currently being routed.
#[derive(Debug)]
struct ProbeCursor {
    /// Visible probe columns, hidden hash column stripped.
    visible: Vec<Arc<Array>>,
    hashes: Vec<u64>,
    num_rows: usize,
    row: usize,

    /// Matches still to emit for the in-progress row.
    pending: Vec<RowKey>,
    pending_pos: usize,
    pending_part: usize,
}

/// Streams probe rows against the cycle's partitions and produces joined
/// output batches.
#[derive(Debug)]
pub(super) struct ProbeMachine {
    join_type: JoinType,
    probe_keys: Vec<usize>,
    probe_types: Vec<DataType>,
    mask: PartitionMask,
    cycle: u32,
    partitions: Vec<HashPartition>,
    dedup: Vec<ProbeDedup>,
    output: OutputBuilder,
    cursor: Option<ProbeCursor>,
    state: ProbeState,
    matches: Vec<RowKey>,
}

impl ProbeMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        join_type: JoinType,
        probe_keys: Vec<usize>,
        probe_types: Vec<DataType>,
        mask: PartitionMask,
        cycle: u32,
        partitions: Vec<HashPartition>,
        output: OutputBuilder,
    ) -> Self {
        let dedup = if join_type == JoinType::ExceptDistinct {
            (0..partitions.len()).map(|_| ProbeDedup::default()).collect()
        } else {
            Vec::new()
        };

        ProbeMachine {
            join_type,
            probe_keys,
            probe_types,
            mask,
            cycle,
            partitions,
            dedup,
            output,
            cursor: None,
            state: ProbeState::Streaming,
            matches: Vec::new(),
        }
    }

    /// Feed the prefetched first probe batch.
    pub fn prime(&mut self, batch: Batch, metrics: &mut HashJoinMetrics) -> Result<()> {
        metrics.probe_batches += 1;
        metrics.probe_rows += batch.num_rows() as u64;
        metrics.probe_bytes += batch_byte_size(&batch) as u64;
        if batch.num_rows() > 0 {
            self.cursor = Some(self.make_cursor(batch)?);
        }
        Ok(())
    }

    pub fn into_partitions(self) -> Vec<HashPartition> {
        self.partitions
    }

    /// Drive the probe until an output batch fills, input runs dry, or the
    /// final state completes.
    pub fn poll_output(
        &mut self,
        source: &mut ProbeSource,
        spill_set: &mut Option<SpillSet>,
        metrics: &mut HashJoinMetrics,
    ) -> Result<ProbeStep> {
        loop {
            if self.output.is_full() {
                return Ok(ProbeStep::Output(self.take_output(metrics)?));
            }

            match self.state {
                ProbeState::Streaming => {
                    if self.cursor.is_none() {
                        match source.poll()? {
                            StreamPoll::Pending => return Ok(ProbeStep::Pending),
                            StreamPoll::Exhausted => {
                                self.finish_outer(spill_set, metrics)?;
                                self.state = if self.join_type.is_right_or_full() {
                                    ProbeState::Final {
                                        part: 0,
                                        batch: 0,
                                        row: 0,
                                    }
                                } else {
                                    ProbeState::Drained
                                };
                                continue;
                            }
                            StreamPoll::Batch(batch) => {
                                metrics.probe_batches += 1;
                                metrics.probe_rows += batch.num_rows() as u64;
                                metrics.probe_bytes += batch_byte_size(&batch) as u64;
                                if batch.num_rows() == 0 {
                                    continue;
                                }
                                self.cursor = Some(self.make_cursor(batch)?);
                            }
                        }
                    }
                    self.advance_cursor(spill_set)?;
                }
                ProbeState::Final { .. } => self.advance_final()?,
                ProbeState::Drained => {
                    return if self.output.len() > 0 {
                        Ok(ProbeStep::Output(self.take_output(metrics)?))
                    } else {
                        Ok(ProbeStep::Finished)
                    };
                }
            }
        }
    }

    fn take_output(&mut self, metrics: &mut HashJoinMetrics) -> Result<Batch> {
        let batch = self.output.take_batch()?;
        metrics.output_batches += 1;
        metrics.output_rows += batch.num_rows() as u64;
        Ok(batch)
    }

    fn make_cursor(&self, batch: Batch) -> Result<ProbeCursor> {
        let num_rows = batch.num_rows();

        let (visible, hashes) = if self.cycle == 0 {
            let visible = batch.columns().to_vec();
            let keys: Vec<&Array> = self
                .probe_keys
                .iter()
                .map(|i| visible[*i].as_ref())
                .collect();
            let mut hashes = vec![0u64; num_rows];
            hash_arrays(&keys, &mut hashes)?;
            (visible, hashes)
        } else {
            // Spilled probe batches carry the hash in the hidden column.
            let hashes = hidden_hash_column(&batch)?
                .values()
                .iter()
                .map(|v| u64::from(*v))
                .collect();
            let visible = batch.columns()[..batch.num_columns() - 1].to_vec();
            (visible, hashes)
        };

        Ok(ProbeCursor {
            visible,
            hashes,
            num_rows,
            row: 0,
            pending: Vec::new(),
            pending_pos: 0,
            pending_part: 0,
        })
    }

    fn advance_cursor(&mut self, spill_set: &mut Option<SpillSet>) -> Result<()> {
        let mut cursor = self.cursor.take().required("probe cursor")?;
        let done = self.process_rows(&mut cursor, spill_set)?;
        if !done {
            self.cursor = Some(cursor);
        }
        Ok(())
    }

    /// Route and emit rows until the output fills or the cursor is consumed.
    fn process_rows(
        &mut self,
        cursor: &mut ProbeCursor,
        spill_set: &mut Option<SpillSet>,
    ) -> Result<bool> {
        loop {
            if self.output.is_full() {
                return Ok(false);
            }

            // Drain matches left over for the in-progress row.
            if cursor.pending_pos < cursor.pending.len() {
                let key = cursor.pending[cursor.pending_pos];
                cursor.pending_pos += 1;
                self.emit_match(cursor, cursor.pending_part, key)?;

                if cursor.pending_pos == cursor.pending.len() {
                    cursor.pending.clear();
                    cursor.pending_pos = 0;
                    cursor.row += 1;
                }
                continue;
            }

            if cursor.row >= cursor.num_rows {
                return Ok(true);
            }

            let row = cursor.row;
            let hash = cursor.hashes[row];
            let part_idx = self.mask.partition(hash);
            let inner_hash = u64::from(self.mask.inner_hash(hash));

            if self.partitions[part_idx].is_spilled() {
                let set = spill_set.as_mut().required("spill set")?;
                self.partitions[part_idx].append_outer_row(
                    &cursor.visible,
                    row,
                    inner_hash as u32,
                    &self.probe_types,
                    set,
                    self.cycle,
                )?;
                cursor.row += 1;
                continue;
            }

            let keys: Vec<&Array> = self
                .probe_keys
                .iter()
                .map(|i| cursor.visible[*i].as_ref())
                .collect();
            match self.partitions[part_idx].hash_table() {
                Some(table) => table.probe(inner_hash, &keys, row, &mut self.matches),
                // Hash table build skipped: nothing can match.
                None => self.matches.clear(),
            }

            match self.join_type {
                JoinType::Inner
                | JoinType::LeftOuter
                | JoinType::RightOuter
                | JoinType::FullOuter => {
                    if self.matches.is_empty() {
                        if self.join_type.is_left_or_full() {
                            self.output.push_row(None, Some((&cursor.visible, row)))?;
                        }
                        cursor.row += 1;
                    } else {
                        // Stage matches; the top of the loop emits them with
                        // output-capacity checks.
                        std::mem::swap(&mut cursor.pending, &mut self.matches);
                        cursor.pending_pos = 0;
                        cursor.pending_part = part_idx;
                    }
                }
                JoinType::LeftSemi => {
                    if !self.matches.is_empty() {
                        self.output.push_row(None, Some((&cursor.visible, row)))?;
                    }
                    cursor.row += 1;
                }
                JoinType::IntersectDistinct => {
                    if !self.matches.is_empty() {
                        let table = self.partitions[part_idx]
                            .hash_table_mut()
                            .required("hash table")?;
                        if !table.is_matched(self.matches[0]) {
                            for key in &self.matches {
                                table.mark_matched(*key);
                            }
                            self.output.push_row(None, Some((&cursor.visible, row)))?;
                        }
                    }
                    cursor.row += 1;
                }
                JoinType::ExceptDistinct => {
                    if self.matches.is_empty()
                        && self.dedup[part_idx].insert_if_absent(&keys, row, inner_hash)
                    {
                        self.output.push_row(None, Some((&cursor.visible, row)))?;
                    }
                    cursor.row += 1;
                }
            }
        }
    }

    fn emit_match(&mut self, cursor: &ProbeCursor, part_idx: usize, key: RowKey) -> Result<()> {
        if self.join_type.is_right_or_full() {
            self.partitions[part_idx]
                .hash_table_mut()
                .required("hash table")?
                .mark_matched(key);
        }

        let table = self.partitions[part_idx].hash_table().required("hash table")?;
        let batch = &table.batches()[key.batch_idx as usize];
        self.output.push_row(
            Some((batch, key.row_idx as usize)),
            Some((&cursor.visible, cursor.row)),
        )
    }

    /// Emit unmatched build rows, null-padded on the probe side.
    fn advance_final(&mut self) -> Result<()> {
        let ProbeState::Final {
            mut part,
            mut batch,
            mut row,
        } = self.state
        else {
            return Err(MorselError::with_kind(
                ErrorKind::Internal,
                "advance_final outside final state",
            ));
        };

        while part < self.partitions.len() {
            if self.output.is_full() {
                break;
            }

            let table = match self.partitions[part].hash_table() {
                Some(table) if !self.partitions[part].is_spilled() => table,
                _ => {
                    part += 1;
                    batch = 0;
                    row = 0;
                    continue;
                }
            };

            if batch >= table.batches().len() {
                part += 1;
                batch = 0;
                row = 0;
                continue;
            }

            let b = &table.batches()[batch];
            if row >= b.num_rows() {
                batch += 1;
                row = 0;
                continue;
            }

            if !table.is_row_matched(batch, row) {
                self.output.push_row(Some((b, row)), None)?;
            }
            row += 1;
        }

        self.state = if part >= self.partitions.len() {
            ProbeState::Drained
        } else {
            ProbeState::Final { part, batch, row }
        };
        Ok(())
    }

    /// Flush buffered probe rows into outer files and close the writers.
    fn finish_outer(
        &mut self,
        spill_set: &mut Option<SpillSet>,
        metrics: &mut HashJoinMetrics,
    ) -> Result<()> {
        for partition in self.partitions.iter_mut().filter(|p| p.is_spilled()) {
            let set = spill_set.as_mut().required("spill set")?;
            partition.complete_outer(set, self.cycle, metrics)?;
        }
        Ok(())
    }
}
