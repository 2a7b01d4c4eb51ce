use super::hash_table::hidden_hash_column;
use super::memory::MemoryCalculator;
use super::partition::HashPartition;
use super::runtime_filter::RuntimeFilterBuilder;
use super::spill::{SpilledPartitionRef, SpillSet};
use super::HashJoinOperator;
use crate::execution::operators::util::hash::{hash_arrays, round_up_power_of_two, PartitionMask};
use crate::execution::operators::StreamPoll;
use morsel_error::{ErrorKind, MorselError, OptionExt, Result};
use morsel_vector::array::Array;
use morsel_vector::batch::Batch;
use morsel_vector::size::batch_byte_size;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub(super) enum BuildStep {
    Pending,
    Finished,
}

impl HashJoinOperator {
    /// Drain the cycle's build input into the partitions, then make the
    /// post-build spill-or-table decision per partition.
    pub(super) fn run_build_phase(&mut self) -> Result<BuildStep> {
        if self.build_calc.is_none() {
            self.init_build_for_cycle()?;
        }

        if !self.build_side_empty {
            loop {
                let batch = match self.next_build_batch()? {
                    StreamPoll::Pending => return Ok(BuildStep::Pending),
                    StreamPoll::Exhausted => break,
                    StreamPoll::Batch(batch) => batch,
                };
                if batch.num_rows() == 0 {
                    continue;
                }
                self.check_build_schema(&batch)?;
                self.partition_build_batch(batch)?;
            }

            // Flush partial batches; spilled partitions flush into their
            // inner files.
            if self.partitions.len() > 1 {
                for idx in 0..self.partitions.len() {
                    self.partitions[idx].complete_inner_batch(&self.allocator)?;
                }
            }
        }

        // Runtime filters go downstream before the probe phase emits
        // anything. Taking the builder also guarantees recursive cycles never
        // emit.
        if let Some(mut filter) = self.runtime_filter.take() {
            filter.emit()?;
        }

        self.post_build_decisions()?;
        Ok(BuildStep::Finished)
    }

    /// Per-cycle build setup: partition tuning (first cycle), partition
    /// allocation, runtime filter resolution.
    fn init_build_for_cycle(&mut self) -> Result<()> {
        let first_cycle = self.spilled_state.cycle() == 0;

        let mut num_partitions = if self.spilling_enabled {
            round_up_power_of_two(self.config.num_partitions)
        } else {
            1
        };

        // Tune the partition count against the memory limit on the first
        // cycle. Disabling spilling entirely is the only legal escape.
        if first_cycle && self.spilling_enabled && num_partitions > 1 {
            let calc = MemoryCalculator::new(&self.config, true);
            let mut partitioning = calc.build_side_partitioning();
            partitioning.initialize(
                first_cycle,
                self.probe_side_empty,
                self.allocator.limit(),
                num_partitions,
                &self.build_types,
                &self.probe_types,
                self.pending_build_batch.as_ref(),
                self.pending_probe_batch.as_ref(),
            );
            partitioning.reduce_partitions_to_fit();

            if partitioning.max_reserved_memory() > self.allocator.limit() {
                if self.config.fallback_enabled {
                    debug!(
                        reserved = partitioning.max_reserved_memory(),
                        limit = self.allocator.limit(),
                        "memory limit cannot accommodate partitioning, disabling spilling"
                    );
                    self.spilling_enabled = false;
                    num_partitions = 1;
                    self.allocator.set_limit(0);
                } else {
                    return Err(MorselError::with_kind(
                        ErrorKind::Resource,
                        format!(
                            "Not enough memory for a partitioned hash join: \
                             {} bytes needed for {} partitions, limit is {} bytes \
                             and fallback is disabled",
                            partitioning.max_reserved_memory(),
                            partitioning.num_partitions(),
                            self.allocator.limit(),
                        ),
                    ));
                }
            } else {
                num_partitions = partitioning.num_partitions();
            }
        }

        if num_partitions == 1 {
            self.spilling_enabled = false;
        }

        self.mask = PartitionMask::new(num_partitions);
        self.spilled_state
            .set_max_cycles(self.config.spill_cycle_limit(self.mask.bits()));
        self.metrics.num_partitions = num_partitions as u64;

        let calc = MemoryCalculator::new(&self.config, self.spilling_enabled);
        let mut partitioning = calc.build_side_partitioning();
        partitioning.initialize(
            first_cycle,
            self.probe_side_empty,
            self.allocator.limit(),
            num_partitions,
            &self.build_types,
            &self.probe_types,
            self.pending_build_batch.as_ref(),
            self.pending_probe_batch.as_ref(),
        );

        self.partitions = (0..num_partitions)
            .map(|idx| HashPartition::new(idx, &self.build_types, self.config.records_per_batch))
            .collect();
        self.spilled_inners = (0..num_partitions).map(|_| None).collect();

        if first_cycle && !self.config.bloom_filters.is_empty() && !self.build_side_empty {
            if let Some(sink) = &self.filter_sink {
                self.runtime_filter = Some(RuntimeFilterBuilder::new(
                    &self.config.bloom_filters,
                    &self.build_schema,
                    self.operator_id,
                    sink.clone(),
                ));
            }
        }

        debug!(
            cycle = self.spilled_state.cycle(),
            num_partitions,
            spilling_enabled = self.spilling_enabled,
            "initialized build phase"
        );

        self.build_calc = Some(partitioning);
        Ok(())
    }

    /// Next build batch: the prefetched one, the cycle's inner spill reader,
    /// or the upstream input.
    fn next_build_batch(&mut self) -> Result<StreamPoll> {
        if let Some(batch) = self.pending_build_batch.take() {
            return Ok(StreamPoll::Batch(batch));
        }

        if let Some(reader) = self.cycle_build_reader.as_mut() {
            return Ok(match reader.next_batch()? {
                Some(batch) => StreamPoll::Batch(batch),
                None => StreamPoll::Exhausted,
            });
        }

        let poll = self.right.poll_next()?;
        if let StreamPoll::Batch(batch) = &poll {
            self.metrics.build_batches += 1;
            self.metrics.build_rows += batch.num_rows() as u64;
            self.metrics.build_bytes += batch_byte_size(batch) as u64;
        }
        Ok(poll)
    }

    fn check_build_schema(&self, batch: &Batch) -> Result<()> {
        let types = batch.column_types();
        // Batches read back from spill carry the trailing hash-value column.
        let visible = if self.spilled_state.cycle() == 0 {
            &types[..]
        } else {
            &types[..types.len().saturating_sub(1)]
        };

        if visible != self.build_types.as_slice() {
            return Err(MorselError::with_kind(
                ErrorKind::SchemaChanged,
                format!(
                    "Build side schema changed mid-stream: expected {:?}, got {visible:?}",
                    self.build_types
                ),
            ));
        }
        Ok(())
    }

    /// Hash, route, and append every row of a build batch, then re-check
    /// memory pressure.
    fn partition_build_batch(&mut self, batch: Batch) -> Result<()> {
        let cycle = self.spilled_state.cycle();
        let num_rows = batch.num_rows();

        let hashes: Vec<u64> = if cycle == 0 {
            let mut keys: Vec<&Array> = Vec::with_capacity(self.right_keys.len());
            for idx in &self.right_keys {
                keys.push(batch.column(*idx).required("build key column")?.as_ref());
            }
            let mut hashes = vec![0u64; num_rows];
            hash_arrays(&keys, &mut hashes)?;
            hashes
        } else {
            // Reuse the hash stored when the rows spilled; the routing bits
            // consumed by earlier cycles are already stripped.
            hidden_hash_column(&batch)?
                .values()
                .iter()
                .map(|v| u64::from(*v))
                .collect()
        };

        if let Some(filter) = self.runtime_filter.as_mut() {
            filter.accumulate(&batch)?;
        }

        let visible: Vec<Arc<Array>> = if cycle == 0 {
            batch.columns().to_vec()
        } else {
            batch.columns()[..batch.num_columns() - 1].to_vec()
        };

        if self.partitions.len() == 1 {
            // Single partition: append the whole batch, no per-row copy.
            let inner: Vec<u32> = hashes.iter().map(|h| self.mask.inner_hash(*h)).collect();
            self.partitions[0].append_inner_batch(&visible, &inner, &self.allocator)?;
        } else {
            let cols: Vec<&Array> = visible.iter().map(|c| c.as_ref()).collect();
            for row in 0..num_rows {
                let hash = hashes[row];
                let part = self.mask.partition(hash);
                self.partitions[part].append_inner_row(
                    &cols,
                    row,
                    self.mask.inner_hash(hash),
                    &self.allocator,
                )?;
            }
        }

        self.spill_while_pressured()
    }

    /// Spill the largest in-memory partitions until the build calculator is
    /// satisfied.
    fn spill_while_pressured(&mut self) -> Result<()> {
        if !self.spilling_enabled {
            return Ok(());
        }

        loop {
            let victim = self
                .build_calc
                .as_ref()
                .required("build calculator")?
                .should_spill_during_build(&self.allocator, &self.partitions);
            let Some(victim) = victim else {
                return Ok(());
            };

            let updater = self.exhaustion_updater();
            self.spilled_state.check_can_spill(&updater)?;

            self.ensure_spill_set()?;
            let cycle = self.spilled_state.cycle();
            let set = self.spill_set.as_mut().required("spill set")?;
            self.partitions[victim].spill(set, cycle, &self.allocator)?;
        }
    }

    pub(super) fn ensure_spill_set(&mut self) -> Result<()> {
        if self.spill_set.is_none() {
            self.spill_set = Some(SpillSet::create(
                &self.config.spill_directory,
                self.operator_id,
            )?);
        }
        Ok(())
    }

    /// Post-build pass: for each in-memory partition, in index order, either
    /// demote it to spilled or build its hash table. Spilled
    /// partitions get their inner files finished and recorded for the probe
    /// phase.
    fn post_build_decisions(&mut self) -> Result<()> {
        let cycle = self.spilled_state.cycle();
        let prior_origin = self.current_pair.as_ref().map(|p| p.origin_partition);
        let nulls_equal = self.join_type.nulls_equal();

        let mut post = {
            let partitioning = self.build_calc.as_ref().required("build calculator")?;
            partitioning.post_build_calculations(&self.allocator)
        };

        for idx in 0..self.partitions.len() {
            if !self.partitions[idx].is_spilled() {
                if self.skip_hash_table_build {
                    continue;
                }

                if self.spilling_enabled && post.should_spill(&self.partitions[idx]) {
                    let updater = self.exhaustion_updater();
                    self.spilled_state.check_can_spill(&updater)?;
                    self.ensure_spill_set()?;
                    let set = self.spill_set.as_mut().required("spill set")?;
                    self.partitions[idx].spill(set, cycle, &self.allocator)?;
                } else {
                    self.partitions[idx]
                        .build_hash_table(
                            &self.right_keys,
                            nulls_equal,
                            self.config.hash_table_doubling_factor,
                            &self.allocator,
                            &mut self.metrics,
                        )
                        .map_err(|e| self.augment_memory_error(e))?;
                    continue;
                }
            }

            self.partitions[idx].finish_inner_writer(&mut self.metrics)?;
            let inner = self.partitions[idx]
                .take_inner_file()
                .required("inner spill file")?;
            self.metrics.spilled_partitions += 1;
            self.spilled_inners[idx] =
                Some(SpilledPartitionRef::new(cycle + 1, idx, prior_origin.unwrap_or(idx), inner));
        }

        Ok(())
    }

    fn augment_memory_error(&self, err: MorselError) -> MorselError {
        if err.kind() != ErrorKind::OutOfMemory {
            return err;
        }
        MorselError::with_kind(err.kind(), format!("{err}\n{}", self.memory_dump()))
    }

    /// Per-partition statistics attached to memory-related failures.
    pub(super) fn memory_dump(&self) -> String {
        let mut out = format!(
            "Memory usage: {} of {} bytes reserved; {} partitions, spill cycle {}",
            self.allocator.used(),
            self.allocator.limit(),
            self.partitions.len(),
            self.spilled_state.cycle(),
        );
        for partition in &self.partitions {
            out.push('\n');
            out.push_str(&partition.debug_stats());
        }
        out
    }
}
