//! Partitioned, spill-capable hash join.
//!
//! The operator consumes a build input (right) and a probe input (left) in
//! batched columnar form. Build rows are hash-partitioned; partitions that
//! fit stay in memory and get hash tables, the rest spill to disk. Probe rows
//! either probe an in-memory table or follow their partition to disk. Spilled
//! build/probe pairs are reprocessed one at a time by re-entering the main
//! state machine with the spill files as inputs, recursing until every pair
//! fits.

pub mod config;
pub mod hash_table;
pub mod memory;
pub mod metrics;
pub mod partition;
pub mod runtime_filter;
pub mod spill;

mod build;
mod probe;

pub use config::HashJoinConfig;
pub use metrics::HashJoinMetrics;

use self::build::BuildStep;
use self::memory::BuildSidePartitioning;
use self::probe::{OutputBuilder, ProbeMachine, ProbeSource, ProbeStep};
use self::runtime_filter::{RuntimeFilterBuilder, RuntimeFilterSink};
use self::spill::{
    SpilledPartitionRef, SpilledState, SpilledStateUpdater, SpillReader, SpillSet,
};
use crate::execution::operators::util::hash::PartitionMask;
use crate::execution::operators::{BatchStream, PollNext, StreamPoll};
use crate::runtime::allocator::Allocator;
use morsel_error::{ErrorKind, MorselError, OptionExt, Result};
use morsel_vector::batch::Batch;
use morsel_vector::field::{DataType, Field, Schema};
use morsel_vector::size::{batch_byte_size, row_width};
use std::sync::Arc;
use tracing::debug;

/// The join variant, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
    /// Emit each probe row once if it has at least one match. Probe columns
    /// only.
    LeftSemi,
    /// Distinct probe rows that exist on the build side. Probe columns only.
    IntersectDistinct,
    /// Distinct probe rows that do not exist on the build side. Probe columns
    /// only.
    ExceptDistinct,
}

impl JoinType {
    /// Probe-preserving: unmatched probe rows are emitted with build columns
    /// null-padded.
    pub const fn is_left_or_full(&self) -> bool {
        matches!(self, Self::LeftOuter | Self::FullOuter)
    }

    /// Build-preserving: unmatched build rows are emitted with probe columns
    /// null-padded in the final-state pass.
    pub const fn is_right_or_full(&self) -> bool {
        matches!(self, Self::RightOuter | Self::FullOuter)
    }

    pub const fn is_set_op(&self) -> bool {
        matches!(self, Self::IntersectDistinct | Self::ExceptDistinct)
    }

    /// Output carries only probe columns.
    pub const fn probe_only_output(&self) -> bool {
        matches!(
            self,
            Self::LeftSemi | Self::IntersectDistinct | Self::ExceptDistinct
        )
    }

    /// Null keys compare equal (IS NOT DISTINCT FROM semantics).
    pub const fn nulls_equal(&self) -> bool {
        self.is_set_op()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriverState {
    /// Sniffing the first batch of each side.
    Init,
    /// Driving the current cycle's build phase.
    Build,
    /// Driving the current cycle's probe phase.
    Probe,
    /// Current cycle finished; pick the next spilled pair or finish.
    NextPair,
    Done,
}

#[derive(Debug)]
enum ShortCircuit {
    No,
    /// Nothing to emit for this cycle; move on to the next spilled pair.
    SkipCycle,
    /// Nothing to emit at all; inputs drained, ready to finish.
    FinishNow,
    /// Nothing to emit at all, but input draining is still pending.
    FinishPending,
}

struct ExhaustionUpdater {
    num_partitions: usize,
}

impl SpilledStateUpdater for ExhaustionUpdater {
    fn exhaustion_error(&self, cycle: u32) -> MorselError {
        MorselError::with_kind(
            ErrorKind::PartitionExhaustion,
            format!(
                "Hash join cannot partition the inner data any further \
                 (spill cycle {cycle}, {} partitions); the join keys are too \
                 skewed to make progress",
                self.num_partitions
            ),
        )
    }
}

/// The hash join operator driver.
///
/// Exposes the pull interface to the enclosing pipeline; internally runs the
/// build and probe phases per cycle and loops back through the spill queue.
#[derive(Debug)]
pub struct HashJoinOperator {
    operator_id: u32,
    join_type: JoinType,
    config: HashJoinConfig,

    /// Probe input.
    left: Box<dyn BatchStream>,
    /// Build input.
    right: Box<dyn BatchStream>,
    left_keys: Vec<usize>,
    right_keys: Vec<usize>,
    filter_sink: Option<Arc<dyn RuntimeFilterSink>>,

    state: DriverState,
    build_schema: Schema,
    build_types: Vec<DataType>,
    probe_types: Vec<DataType>,
    output_schema: Schema,

    allocator: Allocator,
    build_calc: Option<BuildSidePartitioning>,
    spill_set: Option<SpillSet>,
    spilled_state: SpilledState,
    partitions: Vec<partition::HashPartition>,
    mask: PartitionMask,
    spilled_inners: Vec<Option<SpilledPartitionRef>>,
    probe: Option<ProbeMachine>,
    runtime_filter: Option<RuntimeFilterBuilder>,
    metrics: HashJoinMetrics,

    cycle_build_reader: Option<SpillReader>,
    cycle_probe_reader: Option<SpillReader>,
    current_pair: Option<SpilledPartitionRef>,
    pending_build_batch: Option<Batch>,
    pending_probe_batch: Option<Batch>,

    prefetched_build: bool,
    prefetched_probe: bool,
    build_side_empty: bool,
    probe_side_empty: bool,
    skip_hash_table_build: bool,
    spilling_enabled: bool,

    was_killed: bool,
    cleaned_up: bool,
    last_record_count: usize,
}

impl HashJoinOperator {
    #[allow(clippy::too_many_arguments)]
    pub fn try_new(
        operator_id: u32,
        join_type: JoinType,
        left: Box<dyn BatchStream>,
        right: Box<dyn BatchStream>,
        left_keys: Vec<usize>,
        right_keys: Vec<usize>,
        config: HashJoinConfig,
        filter_sink: Option<Arc<dyn RuntimeFilterSink>>,
    ) -> Result<Self> {
        if left_keys.is_empty() || left_keys.len() != right_keys.len() {
            return Err(MorselError::new(format!(
                "Hash join requires matching key columns on both sides, got {} and {}",
                left_keys.len(),
                right_keys.len()
            )));
        }

        let probe_schema = left.schema().clone();
        let build_schema = right.schema().clone();

        for (left_key, right_key) in left_keys.iter().zip(right_keys.iter()) {
            let left_field = probe_schema.fields.get(*left_key).ok_or_else(|| {
                MorselError::new(format!("Probe key column {left_key} out of bounds"))
            })?;
            let right_field = build_schema.fields.get(*right_key).ok_or_else(|| {
                MorselError::new(format!("Build key column {right_key} out of bounds"))
            })?;
            if left_field.datatype != right_field.datatype {
                return Err(MorselError::new(format!(
                    "Join key types differ: {} vs {}",
                    left_field.datatype, right_field.datatype
                )));
            }
        }

        if join_type.is_set_op() && probe_schema.types() != build_schema.types() {
            return Err(MorselError::new(
                "Set operations require both inputs to have the same column types",
            ));
        }

        let output_schema = if join_type.probe_only_output() {
            probe_schema.clone()
        } else {
            let build_fields = build_schema.fields.iter().map(|f| {
                Field::new(
                    f.name.clone(),
                    f.datatype,
                    f.nullable || join_type.is_left_or_full(),
                )
            });
            let probe_fields = probe_schema.fields.iter().map(|f| {
                Field::new(
                    f.name.clone(),
                    f.datatype,
                    f.nullable || join_type.is_right_or_full(),
                )
            });
            Schema::new(build_fields.chain(probe_fields))
        };

        let allocator = Allocator::with_limit(config.max_memory);

        Ok(HashJoinOperator {
            operator_id,
            join_type,
            build_types: build_schema.types(),
            probe_types: probe_schema.types(),
            build_schema,
            output_schema,
            left,
            right,
            left_keys,
            right_keys,
            filter_sink,
            state: DriverState::Init,
            allocator,
            build_calc: None,
            spill_set: None,
            spilled_state: SpilledState::new(1),
            partitions: Vec::new(),
            mask: PartitionMask::new(1),
            spilled_inners: Vec::new(),
            probe: None,
            runtime_filter: None,
            metrics: HashJoinMetrics::default(),
            cycle_build_reader: None,
            cycle_probe_reader: None,
            current_pair: None,
            pending_build_batch: None,
            pending_probe_batch: None,
            prefetched_build: false,
            prefetched_probe: false,
            build_side_empty: false,
            probe_side_empty: false,
            skip_hash_table_build: false,
            spilling_enabled: true,
            was_killed: false,
            cleaned_up: false,
            last_record_count: 0,
            config,
        })
    }

    /// Pull the next outcome.
    pub fn poll_next(&mut self) -> Result<PollNext> {
        if self.was_killed {
            if let Err(e) = self.drain_inputs() {
                debug!(%e, "error draining inputs after cancel");
            }
            self.cleanup();
            self.state = DriverState::Done;
            return Ok(PollNext::Exhausted);
        }

        match self.poll_inner() {
            Ok(PollNext::Batch(batch)) => {
                self.last_record_count = batch.num_rows();
                Ok(PollNext::Batch(batch))
            }
            Ok(other) => Ok(other),
            Err(e) => {
                self.cleanup();
                self.state = DriverState::Done;
                Err(e)
            }
        }
    }

    fn poll_inner(&mut self) -> Result<PollNext> {
        loop {
            match self.state {
                DriverState::Init => {
                    if !self.prefetch_inputs()? {
                        return Ok(PollNext::Pending);
                    }
                    self.skip_hash_table_build = self.build_side_empty;
                    self.state = DriverState::Build;
                    return Ok(PollNext::Schema(self.output_schema.clone()));
                }
                DriverState::Build => {
                    match self.short_circuit()? {
                        ShortCircuit::No => (),
                        ShortCircuit::SkipCycle => {
                            self.state = DriverState::NextPair;
                            continue;
                        }
                        ShortCircuit::FinishPending => return Ok(PollNext::Pending),
                        ShortCircuit::FinishNow => {
                            self.cleanup();
                            self.state = DriverState::Done;
                            return Ok(PollNext::Exhausted);
                        }
                    }

                    match self.run_build_phase()? {
                        BuildStep::Pending => return Ok(PollNext::Pending),
                        BuildStep::Finished => {
                            self.setup_probe()?;
                            self.state = DriverState::Probe;
                        }
                    }
                }
                DriverState::Probe => {
                    let machine = self.probe.as_mut().required("probe machine")?;
                    let mut source = if let Some(reader) = self.cycle_probe_reader.as_mut() {
                        ProbeSource::Spilled(reader)
                    } else if self.spilled_state.cycle() == 0 && !self.probe_side_empty {
                        ProbeSource::Stream(&mut *self.left)
                    } else {
                        ProbeSource::Empty
                    };

                    match machine.poll_output(&mut source, &mut self.spill_set, &mut self.metrics)?
                    {
                        ProbeStep::Output(batch) => return Ok(PollNext::Batch(batch)),
                        ProbeStep::Pending => return Ok(PollNext::Pending),
                        ProbeStep::Finished => self.state = DriverState::NextPair,
                    }
                }
                DriverState::NextPair => {
                    self.finish_cycle()?;
                    if self.start_next_pair()? {
                        self.state = DriverState::Build;
                    } else {
                        self.cleanup();
                        self.state = DriverState::Done;
                        return Ok(PollNext::Exhausted);
                    }
                }
                DriverState::Done => return Ok(PollNext::Exhausted),
            }
        }
    }

    /// Sniff the first non-empty batch of each side to discover emptiness.
    fn prefetch_inputs(&mut self) -> Result<bool> {
        while !self.prefetched_build {
            match self.right.poll_next()? {
                StreamPoll::Pending => return Ok(false),
                StreamPoll::Exhausted => {
                    self.build_side_empty = true;
                    self.prefetched_build = true;
                }
                StreamPoll::Batch(batch) => {
                    self.metrics.build_batches += 1;
                    self.metrics.build_rows += batch.num_rows() as u64;
                    self.metrics.build_bytes += batch_byte_size(&batch) as u64;
                    if batch.num_rows() == 0 {
                        continue;
                    }
                    self.pending_build_batch = Some(batch);
                    self.prefetched_build = true;
                }
            }
        }

        while !self.prefetched_probe {
            match self.left.poll_next()? {
                StreamPoll::Pending => return Ok(false),
                StreamPoll::Exhausted => {
                    self.probe_side_empty = true;
                    self.prefetched_probe = true;
                }
                StreamPoll::Batch(batch) => {
                    if batch.num_rows() == 0 {
                        continue;
                    }
                    // Counted when the probe machine consumes it.
                    self.pending_probe_batch = Some(batch);
                    self.prefetched_probe = true;
                }
            }
        }

        Ok(true)
    }

    /// Decide whether this cycle (or the whole join) can produce anything.
    fn short_circuit(&mut self) -> Result<ShortCircuit> {
        let probe_dead = self.probe_side_empty && !self.join_type.is_right_or_full();
        let build_dead = self.build_side_empty
            && matches!(
                self.join_type,
                JoinType::Inner | JoinType::LeftSemi | JoinType::IntersectDistinct
            );

        if !probe_dead && !build_dead {
            return Ok(ShortCircuit::No);
        }

        if self.spilled_state.cycle() == 0 {
            if self.drain_inputs()? {
                Ok(ShortCircuit::FinishNow)
            } else {
                Ok(ShortCircuit::FinishPending)
            }
        } else {
            Ok(ShortCircuit::SkipCycle)
        }
    }

    fn drain_inputs(&mut self) -> Result<bool> {
        self.pending_build_batch = None;
        self.pending_probe_batch = None;
        self.right.cancel();
        self.left.cancel();

        loop {
            match self.right.poll_next()? {
                StreamPoll::Pending => return Ok(false),
                StreamPoll::Exhausted => break,
                StreamPoll::Batch(_) => continue,
            }
        }
        loop {
            match self.left.poll_next()? {
                StreamPoll::Pending => return Ok(false),
                StreamPoll::Exhausted => break,
                StreamPoll::Batch(_) => continue,
            }
        }
        Ok(true)
    }

    fn setup_probe(&mut self) -> Result<()> {
        let output = OutputBuilder::new(
            &self.output_schema.types(),
            if self.join_type.probe_only_output() {
                0
            } else {
                self.build_types.len()
            },
            self.output_target_rows(),
        );

        let partitions = std::mem::take(&mut self.partitions);
        let mut machine = ProbeMachine::new(
            self.join_type,
            self.left_keys.clone(),
            self.probe_types.clone(),
            self.mask,
            self.spilled_state.cycle(),
            partitions,
            output,
        );

        if let Some(batch) = self.pending_probe_batch.take() {
            machine.prime(batch, &mut self.metrics)?;
        }

        self.probe = Some(machine);
        Ok(())
    }

    fn output_target_rows(&self) -> usize {
        let mut budget = self.config.output_batch_size;
        if self.config.max_memory > 0 {
            let cap =
                (self.config.max_memory as f64 * self.config.output_batch_size_mem_factor) as usize;
            budget = budget.min(cap.max(1));
        }
        let width = row_width(&self.output_schema.types()).max(1);
        (budget / width).clamp(1, 64 * 1024)
    }

    /// Tear down the finished cycle: record outer files on the spilled pairs,
    /// enqueue them, release partitions, delete the processed pair's files.
    fn finish_cycle(&mut self) -> Result<()> {
        if let Some(machine) = self.probe.take() {
            let mut partitions = machine.into_partitions();
            for (idx, part) in partitions.iter_mut().enumerate() {
                if let Some(mut sp) = self.spilled_inners.get_mut(idx).and_then(Option::take) {
                    sp.update_outer(part.take_outer_file());

                    if sp.inner.batches == 0 && sp.outer_batch_count() == 0 {
                        if let Some(set) = self.spill_set.as_mut() {
                            set.delete(&sp.inner.path);
                            if let Some(outer) = &sp.outer {
                                set.delete(&outer.path);
                            }
                        }
                    } else {
                        debug!(
                            cycle = sp.cycle,
                            origin = sp.origin_partition,
                            prior_origin = sp.prior_origin_partition,
                            inner_batches = sp.inner.batches,
                            outer_batches = sp.outer_batch_count(),
                            "enqueueing spilled partition pair"
                        );
                        self.spilled_state.enqueue(sp);
                    }
                }
                part.close(&self.allocator);
            }
        }

        for part in &mut self.partitions {
            part.close(&self.allocator);
        }
        self.partitions.clear();
        self.spilled_inners.clear();
        self.build_calc = None;
        self.runtime_filter = None;

        // Close readers before deleting the files under them.
        self.cycle_build_reader = None;
        self.cycle_probe_reader = None;
        if let Some(pair) = self.current_pair.take() {
            if let Some(set) = self.spill_set.as_mut() {
                set.delete(&pair.inner.path);
                if let Some(outer) = &pair.outer {
                    set.delete(&outer.path);
                }
            }
        }

        Ok(())
    }

    /// Dequeue the next spilled pair and rebind the cycle inputs to it.
    ///
    /// Returns false once the queue is exhausted.
    fn start_next_pair(&mut self) -> Result<bool> {
        loop {
            let Some(sp) = self.spilled_state.dequeue() else {
                return Ok(false);
            };

            let updater = self.exhaustion_updater();
            self.spilled_state.update_cycle(&sp, &updater)?;
            self.metrics.spill_cycle = self.metrics.spill_cycle.max(u64::from(sp.cycle));

            // No probe rows and a join that only emits matches: the pair
            // cannot produce output.
            if sp.outer_batch_count() == 0 && !self.join_type.is_right_or_full() {
                if let Some(set) = self.spill_set.as_mut() {
                    set.delete(&sp.inner.path);
                }
                continue;
            }

            if sp.outer_batch_count() > 0 && !sp.updated_outer {
                return Err(MorselError::with_kind(
                    ErrorKind::Internal,
                    "Spilled partition dequeued before its outer side was recorded",
                ));
            }

            debug!(
                cycle = sp.cycle,
                origin = sp.origin_partition,
                prior_origin = sp.prior_origin_partition,
                "processing spilled partition pair"
            );

            // Rebind the build side, consuming the first batch eagerly.
            let mut reader = SpillReader::open(&sp.inner)?;
            self.pending_build_batch = reader.next_batch()?;
            self.build_side_empty = self.pending_build_batch.is_none();
            self.cycle_build_reader = Some(reader);

            match &sp.outer {
                Some(outer) if outer.batches > 0 => {
                    self.cycle_probe_reader = Some(SpillReader::open(outer)?);
                    self.probe_side_empty = false;
                }
                _ => {
                    self.cycle_probe_reader = None;
                    self.probe_side_empty = true;
                }
            }

            self.skip_hash_table_build = self.build_side_empty;
            self.current_pair = Some(sp);
            return Ok(true);
        }
    }

    fn exhaustion_updater(&self) -> ExhaustionUpdater {
        ExhaustionUpdater {
            num_partitions: self.partitions.len().max(1),
        }
    }

    /// Release every resource. Runs on done, cancel, and error paths;
    /// idempotent and best-effort.
    fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }

        if let Some(machine) = self.probe.take() {
            let mut partitions = machine.into_partitions();
            for part in &mut partitions {
                part.close(&self.allocator);
            }
        }
        for part in &mut self.partitions {
            part.close(&self.allocator);
        }
        self.partitions.clear();

        self.cycle_build_reader = None;
        self.cycle_probe_reader = None;
        self.pending_build_batch = None;
        self.pending_probe_batch = None;
        self.spilled_inners.clear();
        self.current_pair = None;
        let _ = self.spilled_state.drain().count();

        if let Some(set) = self.spill_set.as_mut() {
            set.close();
        }

        self.cleaned_up = true;
        debug!(operator_id = self.operator_id, "hash join cleaned up");
    }

    /// Request cancellation. The next `poll_next` drains the inputs, deletes
    /// spill files, and reports exhaustion.
    pub fn cancel(&mut self) {
        self.was_killed = true;
    }

    /// Idempotent teardown.
    pub fn close(&mut self) {
        self.cleanup();
        self.state = DriverState::Done;
    }

    /// Row count of the most recently produced batch.
    pub fn record_count(&self) -> usize {
        self.last_record_count
    }

    /// Output schema; available after the first poll.
    pub fn schema(&self) -> Option<&Schema> {
        (self.state != DriverState::Init).then_some(&self.output_schema)
    }

    pub fn metrics(&self) -> &HashJoinMetrics {
        &self.metrics
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }
}

#[cfg(test)]
mod tests {
    use super::runtime_filter::{BloomFilterDef, CollectingFilterSink};
    use super::*;
    use crate::execution::operators::test_util::BatchesStream;
    use crate::execution::operators::util::hash::hash_arrays;
    use morsel_vector::array::{Array, Int64Array, Utf8Array};
    use morsel_vector::scalar::ScalarValue;
    use morsel_vector::testutil::sorted_rows;
    use similar_asserts::assert_eq;
    use std::fs;
    use std::path::PathBuf;

    fn test_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("morsel-hj-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn plain_config() -> HashJoinConfig {
        HashJoinConfig {
            spill_directory: test_dir(),
            ..HashJoinConfig::default()
        }
    }

    fn spilling_config() -> HashJoinConfig {
        HashJoinConfig {
            num_partitions: 4,
            records_per_batch: 2,
            max_batches_in_memory: 2,
            spill_directory: test_dir(),
            ..HashJoinConfig::default()
        }
    }

    fn kv_schema(key: &str, val: &str, key_nullable: bool) -> Schema {
        Schema::new([
            Field::new(key, DataType::Int64, key_nullable),
            Field::new(val, DataType::Utf8, true),
        ])
    }

    fn kv_batch(rows: &[(i64, &str)]) -> Batch {
        Batch::try_new(vec![
            Array::Int64(rows.iter().map(|(k, _)| *k).collect::<Int64Array>()),
            Array::Utf8(rows.iter().map(|(_, v)| *v).collect::<Utf8Array>()),
        ])
        .unwrap()
    }

    fn kv_batch_opt(rows: &[(Option<i64>, &str)]) -> Batch {
        Batch::try_new(vec![
            Array::Int64(rows.iter().map(|(k, _)| *k).collect::<Int64Array>()),
            Array::Utf8(rows.iter().map(|(_, v)| *v).collect::<Utf8Array>()),
        ])
        .unwrap()
    }

    fn gen_kv_batches(
        keys: impl IntoIterator<Item = i64>,
        prefix: &str,
        rows_per_batch: usize,
    ) -> Vec<Batch> {
        let keys: Vec<i64> = keys.into_iter().collect();
        keys.chunks(rows_per_batch)
            .map(|chunk| {
                let vals: Vec<String> = chunk.iter().map(|k| format!("{prefix}{k}")).collect();
                Batch::try_new(vec![
                    Array::Int64(chunk.iter().copied().collect::<Int64Array>()),
                    Array::Utf8(vals.iter().map(|s| s.as_str()).collect::<Utf8Array>()),
                ])
                .unwrap()
            })
            .collect()
    }

    fn join_op(
        join_type: JoinType,
        build: Vec<Batch>,
        probe: Vec<Batch>,
        config: HashJoinConfig,
    ) -> HashJoinOperator {
        join_op_nullable(join_type, build, probe, config, false)
    }

    fn join_op_nullable(
        join_type: JoinType,
        build: Vec<Batch>,
        probe: Vec<Batch>,
        config: HashJoinConfig,
        key_nullable: bool,
    ) -> HashJoinOperator {
        HashJoinOperator::try_new(
            1,
            join_type,
            BatchesStream::boxed(kv_schema("p_key", "p_val", key_nullable), probe),
            BatchesStream::boxed(kv_schema("b_key", "b_val", key_nullable), build),
            vec![0],
            vec![0],
            config,
            None,
        )
        .unwrap()
    }

    fn run(op: &mut HashJoinOperator) -> (Schema, Vec<Batch>) {
        let mut schema = None;
        let mut batches = Vec::new();
        loop {
            match op.poll_next().unwrap() {
                PollNext::Schema(s) => schema = Some(s),
                PollNext::Batch(batch) => {
                    assert_eq!(batch.num_rows(), op.record_count());
                    batches.push(batch);
                }
                PollNext::Pending => continue,
                PollNext::Exhausted => break,
            }
        }
        (schema.expect("schema emitted before end of stream"), batches)
    }

    fn i(v: i64) -> ScalarValue {
        ScalarValue::Int64(v)
    }

    fn s(v: &str) -> ScalarValue {
        ScalarValue::Utf8(v.to_string())
    }

    fn null() -> ScalarValue {
        ScalarValue::Null
    }

    fn sort_expected(mut rows: Vec<Vec<ScalarValue>>) -> Vec<Vec<ScalarValue>> {
        rows.sort_by_key(|row| {
            row.iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("\u{1}")
        });
        rows
    }

    #[test]
    fn empty_build_inner_short_circuits() {
        let dir = test_dir();
        let config = HashJoinConfig {
            spill_directory: dir.clone(),
            ..HashJoinConfig::default()
        };
        let mut op = join_op(
            JoinType::Inner,
            vec![],
            vec![kv_batch(&[(1, "x")])],
            config,
        );

        assert!(matches!(op.poll_next().unwrap(), PollNext::Schema(_)));
        assert!(matches!(op.poll_next().unwrap(), PollNext::Exhausted));

        // No partitions were built, so no spill files may exist.
        assert_eq!(0, fs::read_dir(&dir).unwrap().count());
        assert_eq!(0, op.allocator().used());
        assert_eq!(0, op.record_count());
    }

    #[test]
    fn inner_join_small() {
        let build = vec![kv_batch(&[(1, "a"), (2, "b"), (2, "c")])];
        let probe = vec![kv_batch(&[(2, "x"), (3, "y")])];

        let mut op = join_op(JoinType::Inner, build, probe, plain_config());
        let (schema, batches) = run(&mut op);

        assert_eq!(
            vec!["b_key", "b_val", "p_key", "p_val"],
            schema.fields.iter().map(|f| f.name.as_str()).collect::<Vec<_>>()
        );

        let expected = sort_expected(vec![
            vec![i(2), s("b"), i(2), s("x")],
            vec![i(2), s("c"), i(2), s("x")],
        ]);
        assert_eq!(expected, sorted_rows(&batches));
    }

    #[test]
    fn left_outer_pads_unmatched_probe_rows() {
        let build = vec![kv_batch(&[(2, "b")])];
        let probe = vec![kv_batch(&[(2, "x"), (3, "y")])];

        let mut op = join_op(JoinType::LeftOuter, build, probe, plain_config());
        let (schema, batches) = run(&mut op);

        // Build columns are nullable-widened for probe-preserving joins.
        assert!(schema.fields[0].nullable);
        assert!(!schema.fields[2].nullable);

        let expected = sort_expected(vec![
            vec![i(2), s("b"), i(2), s("x")],
            vec![null(), null(), i(3), s("y")],
        ]);
        assert_eq!(expected, sorted_rows(&batches));
    }

    #[test]
    fn left_outer_empty_build_streams_probe() {
        let probe = vec![kv_batch(&[(1, "x")]), kv_batch(&[(2, "y")])];

        let mut op = join_op(JoinType::LeftOuter, vec![], probe, plain_config());
        let (_, batches) = run(&mut op);

        let expected = sort_expected(vec![
            vec![null(), null(), i(1), s("x")],
            vec![null(), null(), i(2), s("y")],
        ]);
        assert_eq!(expected, sorted_rows(&batches));
    }

    #[test]
    fn right_outer_empty_probe_emits_all_build_rows() {
        let build = gen_kv_batches(0..100, "b", 16);

        let mut op = join_op(JoinType::RightOuter, build, vec![], plain_config());
        let (schema, batches) = run(&mut op);

        // Probe columns are nullable-widened for build-preserving joins.
        assert!(schema.fields[2].nullable);

        let rows = sorted_rows(&batches);
        assert_eq!(100, rows.len());
        for row in &rows {
            assert_eq!(null(), row[2]);
            assert_eq!(null(), row[3]);
        }
    }

    #[test]
    fn right_outer_emits_unmatched_build_rows() {
        let build = vec![kv_batch(&[(1, "a"), (2, "b")])];
        let probe = vec![kv_batch(&[(2, "x"), (3, "y")])];

        let mut op = join_op(JoinType::RightOuter, build, probe, plain_config());
        let (_, batches) = run(&mut op);

        let expected = sort_expected(vec![
            vec![i(2), s("b"), i(2), s("x")],
            vec![i(1), s("a"), null(), null()],
        ]);
        assert_eq!(expected, sorted_rows(&batches));
    }

    #[test]
    fn full_outer_pads_both_sides() {
        let build = vec![kv_batch(&[(1, "a"), (2, "b")])];
        let probe = vec![kv_batch(&[(2, "x"), (3, "y")])];

        let mut op = join_op(JoinType::FullOuter, build, probe, plain_config());
        let (_, batches) = run(&mut op);

        let expected = sort_expected(vec![
            vec![i(2), s("b"), i(2), s("x")],
            vec![null(), null(), i(3), s("y")],
            vec![i(1), s("a"), null(), null()],
        ]);
        assert_eq!(expected, sorted_rows(&batches));
    }

    #[test]
    fn left_semi_emits_matched_probe_rows_once() {
        let build = vec![kv_batch(&[(2, "b"), (2, "c")])];
        let probe = vec![kv_batch(&[(2, "x"), (2, "y"), (3, "z")])];

        let mut op = join_op(JoinType::LeftSemi, build, probe, plain_config());
        let (schema, batches) = run(&mut op);

        // Probe columns only.
        assert_eq!(2, schema.fields.len());
        assert_eq!("p_key", schema.fields[0].name);

        let expected = sort_expected(vec![
            vec![i(2), s("x")],
            vec![i(2), s("y")],
        ]);
        assert_eq!(expected, sorted_rows(&batches));
    }

    #[test]
    fn intersect_distinct() {
        let build = vec![kv_batch(&[(1, "a"), (2, "b"), (2, "c")])];
        let probe = vec![kv_batch(&[(2, "x"), (2, "y"), (3, "z")])];

        let mut op = join_op(JoinType::IntersectDistinct, build, probe, plain_config());
        let (_, batches) = run(&mut op);

        let expected = vec![vec![i(2), s("x")]];
        assert_eq!(expected, sorted_rows(&batches));
    }

    #[test]
    fn except_distinct_suppresses_duplicates() {
        let build = vec![kv_batch(&[(1, "a")])];
        let probe = vec![kv_batch(&[(3, "z"), (3, "w"), (4, "q"), (1, "r")])];

        let mut op = join_op(JoinType::ExceptDistinct, build, probe, plain_config());
        let (_, batches) = run(&mut op);

        let expected = sort_expected(vec![
            vec![i(3), s("z")],
            vec![i(4), s("q")],
        ]);
        assert_eq!(expected, sorted_rows(&batches));
    }

    #[test]
    fn inner_join_null_keys_never_match() {
        let build = vec![kv_batch_opt(&[(Some(1), "a"), (None, "b")])];
        let probe = vec![kv_batch_opt(&[(None, "x"), (Some(1), "y")])];

        let mut op = join_op_nullable(JoinType::Inner, build, probe, plain_config(), true);
        let (_, batches) = run(&mut op);

        let expected = vec![vec![i(1), s("a"), i(1), s("y")]];
        assert_eq!(expected, sorted_rows(&batches));
    }

    #[test]
    fn set_ops_treat_nulls_as_equal() {
        let build = vec![kv_batch_opt(&[(None, "a"), (Some(1), "b")])];
        let probe = vec![kv_batch_opt(&[(None, "x"), (None, "y"), (Some(2), "z")])];

        let mut op = join_op_nullable(
            JoinType::IntersectDistinct,
            build.clone(),
            probe.clone(),
            plain_config(),
            true,
        );
        let (_, batches) = run(&mut op);
        assert_eq!(vec![vec![null(), s("x")]], sorted_rows(&batches));

        let mut op =
            join_op_nullable(JoinType::ExceptDistinct, build, probe, plain_config(), true);
        let (_, batches) = run(&mut op);
        assert_eq!(vec![vec![i(2), s("z")]], sorted_rows(&batches));
    }

    #[test]
    fn forced_spills_match_in_memory_result() {
        let build_keys: Vec<i64> = (0..32).chain(0..32).collect();
        let probe_keys: Vec<i64> = (16..64).collect();
        let build = gen_kv_batches(build_keys, "b", 8);
        let probe = gen_kv_batches(probe_keys, "p", 8);

        let mut reference = join_op(JoinType::Inner, build.clone(), probe.clone(), plain_config());
        let (_, expected) = run(&mut reference);
        assert_eq!(0, reference.metrics().spilled_partitions);

        let dir = test_dir();
        let config = HashJoinConfig {
            spill_directory: dir.clone(),
            ..spilling_config()
        };
        let mut spilled = join_op(JoinType::Inner, build, probe, config);
        let (_, got) = run(&mut spilled);

        assert_eq!(sorted_rows(&expected), sorted_rows(&got));
        assert!(spilled.metrics().spilled_partitions > 0);
        assert!(spilled.metrics().spill_cycle >= 1);
        assert!(spilled.metrics().spill_mb() > 0.0);

        // Spill directory removed once the operator is done.
        assert_eq!(0, fs::read_dir(&dir).unwrap().count());
        assert_eq!(0, spilled.allocator().used());
    }

    #[test]
    fn forced_spills_match_for_outer_joins() {
        let build_keys: Vec<i64> = (0..24).collect();
        let probe_keys: Vec<i64> = (12..40).collect();
        let build = gen_kv_batches(build_keys, "b", 8);
        let probe = gen_kv_batches(probe_keys, "p", 8);

        for join_type in [JoinType::LeftOuter, JoinType::RightOuter, JoinType::FullOuter] {
            let mut reference =
                join_op(join_type, build.clone(), probe.clone(), plain_config());
            let (_, expected) = run(&mut reference);

            let mut spilled =
                join_op(join_type, build.clone(), probe.clone(), spilling_config());
            let (_, got) = run(&mut spilled);

            assert_eq!(sorted_rows(&expected), sorted_rows(&got));
            assert!(spilled.metrics().spilled_partitions > 0);
        }
    }

    #[test]
    fn single_partition_fallback_matches_partitioned_run() {
        let build_keys: Vec<i64> = (0..40).collect();
        let probe_keys: Vec<i64> = (20..60).collect();
        let build = gen_kv_batches(build_keys, "b", 8);
        let probe = gen_kv_batches(probe_keys, "p", 8);

        let single = HashJoinConfig {
            num_partitions: 1,
            fallback_enabled: true,
            spill_directory: test_dir(),
            ..HashJoinConfig::default()
        };
        let mut op_single = join_op(JoinType::Inner, build.clone(), probe.clone(), single);
        let (_, single_out) = run(&mut op_single);
        assert_eq!(0, op_single.metrics().spilled_partitions);

        let partitioned = HashJoinConfig {
            num_partitions: 16,
            records_per_batch: 2,
            max_batches_in_memory: 2,
            spill_directory: test_dir(),
            ..HashJoinConfig::default()
        };
        let mut op_part = join_op(JoinType::Inner, build, probe, partitioned);
        let (_, part_out) = run(&mut op_part);
        assert!(op_part.metrics().spilled_partitions > 0);

        assert_eq!(sorted_rows(&single_out), sorted_rows(&part_out));
    }

    #[test]
    fn resource_error_when_fallback_disabled() {
        let config = HashJoinConfig {
            max_memory: 2048,
            num_partitions: 32,
            fallback_enabled: false,
            spill_directory: test_dir(),
            ..HashJoinConfig::default()
        };
        let mut op = join_op(
            JoinType::Inner,
            vec![kv_batch(&[(1, "a")])],
            vec![kv_batch(&[(1, "x")])],
            config,
        );

        assert!(matches!(op.poll_next().unwrap(), PollNext::Schema(_)));
        let err = op.poll_next().unwrap_err();
        assert_eq!(ErrorKind::Resource, err.kind());
    }

    #[test]
    fn skewed_keys_fallback_disables_spilling() {
        // Every row shares one key; the memory limit cannot accommodate the
        // partition layout, so the join falls back to a single in-memory
        // partition.
        let build = gen_kv_batches(std::iter::repeat(7).take(8), "b", 4);
        let probe = gen_kv_batches(std::iter::repeat(7).take(4), "p", 4);

        let config = HashJoinConfig {
            max_memory: 2048,
            num_partitions: 32,
            fallback_enabled: true,
            spill_directory: test_dir(),
            ..HashJoinConfig::default()
        };
        let mut op = join_op(JoinType::Inner, build, probe, config);
        let (_, batches) = run(&mut op);

        let rows = sorted_rows(&batches);
        assert_eq!(32, rows.len());
        assert_eq!(0, op.metrics().spilled_partitions);
        assert_eq!(1, op.metrics().num_partitions);
    }

    #[test]
    fn skewed_keys_exhaust_partitioning() {
        let build = gen_kv_batches(std::iter::repeat(7).take(8), "b", 2);
        let probe = gen_kv_batches(std::iter::repeat(7).take(2), "p", 2);

        let dir = test_dir();
        let config = HashJoinConfig {
            num_partitions: 4,
            records_per_batch: 2,
            max_batches_in_memory: 1,
            max_spill_cycles: 1,
            spill_directory: dir.clone(),
            ..HashJoinConfig::default()
        };
        let mut op = join_op(JoinType::Inner, build, probe, config);

        let err = loop {
            match op.poll_next() {
                Ok(PollNext::Exhausted) => panic!("expected partition exhaustion"),
                Ok(_) => continue,
                Err(e) => break e,
            }
        };
        assert_eq!(ErrorKind::PartitionExhaustion, err.kind());
        assert!(err.to_string().contains("cannot partition the inner data any further"));

        // Cleanup ran on the error path.
        assert_eq!(0, fs::read_dir(&dir).unwrap().count());
        assert_eq!(0, op.allocator().used());
    }

    #[test]
    fn cancel_cleans_up_spill_files() {
        let build = gen_kv_batches(0..64, "b", 4);
        let probe = gen_kv_batches(0..64, "p", 4);

        let dir = test_dir();
        let config = HashJoinConfig {
            spill_directory: dir.clone(),
            output_batch_size: 96,
            ..spilling_config()
        };
        let mut op = join_op(JoinType::Inner, build, probe, config);

        // Run just far enough to have spilled state in flight.
        loop {
            match op.poll_next().unwrap() {
                PollNext::Batch(_) => break,
                PollNext::Exhausted => panic!("join produced no output"),
                _ => continue,
            }
        }

        op.cancel();
        assert!(matches!(op.poll_next().unwrap(), PollNext::Exhausted));
        assert!(matches!(op.poll_next().unwrap(), PollNext::Exhausted));

        assert_eq!(0, fs::read_dir(&dir).unwrap().count());
        assert_eq!(0, op.allocator().used());
    }

    #[test]
    fn runtime_filter_emitted_exactly_once_despite_spill_cycles() {
        let build = gen_kv_batches(0..32, "b", 4);
        let probe = gen_kv_batches(0..32, "p", 4);

        let sink = Arc::new(CollectingFilterSink::default());
        let mut config = spilling_config();
        config.bloom_filters = vec![BloomFilterDef::new("b_key", "p_key")];

        let mut op = HashJoinOperator::try_new(
            42,
            JoinType::Inner,
            BatchesStream::boxed(kv_schema("p_key", "p_val", false), probe),
            BatchesStream::boxed(kv_schema("b_key", "b_val", false), build),
            vec![0],
            vec![0],
            config,
            Some(sink.clone()),
        )
        .unwrap();
        let (_, batches) = run(&mut op);

        assert!(op.metrics().spill_cycle >= 1);
        assert_eq!(32, sorted_rows(&batches).len());

        let received = sink.received.lock();
        assert_eq!(1, received.len());
        assert_eq!(42, received[0].operator_id);

        // Every build key must pass the emitted filter.
        let keys = Array::Int64((0..32).collect::<Int64Array>());
        let mut hashes = vec![0u64; 32];
        hash_arrays(&[&keys], &mut hashes).unwrap();
        for hash in hashes {
            assert!(received[0].filters[0].1.maybe_contains_hash(hash));
        }
    }

    #[test]
    fn build_schema_change_is_fatal() {
        let good = kv_batch(&[(1, "a")]);
        let bad = Batch::try_new(vec![
            Array::Utf8(Utf8Array::from_iter(["oops"])),
            Array::Utf8(Utf8Array::from_iter(["b"])),
        ])
        .unwrap();

        let mut op = join_op(
            JoinType::Inner,
            vec![good, bad],
            vec![kv_batch(&[(1, "x")])],
            plain_config(),
        );

        assert!(matches!(op.poll_next().unwrap(), PollNext::Schema(_)));
        let err = op.poll_next().unwrap_err();
        assert_eq!(ErrorKind::SchemaChanged, err.kind());
    }

    #[test]
    fn close_is_idempotent() {
        let mut op = join_op(
            JoinType::Inner,
            vec![kv_batch(&[(1, "a")])],
            vec![kv_batch(&[(1, "x")])],
            plain_config(),
        );
        assert!(matches!(op.poll_next().unwrap(), PollNext::Schema(_)));

        op.close();
        op.close();
        assert!(matches!(op.poll_next().unwrap(), PollNext::Exhausted));
        assert_eq!(0, op.allocator().used());
    }

    #[test]
    fn output_batches_respect_size_budget() {
        // Output row width is 48 bytes; a 96 byte budget caps batches at two
        // rows.
        let build = vec![kv_batch(&[(1, "a"), (2, "b"), (3, "c"), (4, "d"), (5, "e")])];
        let probe = vec![kv_batch(&[(1, "v"), (2, "w"), (3, "x"), (4, "y"), (5, "z")])];

        let config = HashJoinConfig {
            output_batch_size: 96,
            spill_directory: test_dir(),
            ..HashJoinConfig::default()
        };
        let mut op = join_op(JoinType::Inner, build, probe, config);
        let (_, batches) = run(&mut op);

        assert!(batches.len() >= 3);
        assert!(batches.iter().all(|b| b.num_rows() <= 2));
        assert_eq!(5, batches.iter().map(|b| b.num_rows()).sum::<usize>());
        assert_eq!(5, op.metrics().output_rows);
        assert_eq!(batches.len() as u64, op.metrics().output_batches);
    }

    #[test]
    fn schema_available_after_first_poll() {
        let mut op = join_op(
            JoinType::Inner,
            vec![kv_batch(&[(1, "a")])],
            vec![kv_batch(&[(1, "x")])],
            plain_config(),
        );

        assert!(op.schema().is_none());
        assert!(matches!(op.poll_next().unwrap(), PollNext::Schema(_)));
        assert_eq!(4, op.schema().unwrap().fields.len());
    }
}
