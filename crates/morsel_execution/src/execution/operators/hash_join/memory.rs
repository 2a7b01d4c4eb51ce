use super::config::{HashJoinConfig, HashTableCalcType};
use super::hash_table::HASH_TABLE_ENTRY_BYTES;
use super::partition::HashPartition;
use crate::runtime::allocator::Allocator;
use morsel_vector::batch::Batch;
use morsel_vector::field::DataType;
use morsel_vector::size::{batch_byte_size, row_width};
use tracing::debug;

/// Memory strategy for the build phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalcStrategy {
    /// Flat limit on in-flight internal batches. Selected when
    /// `max_batches_in_memory` is nonzero; mostly a testing knob.
    BatchCount,

    /// Estimate per-partition footprints from configured factors and observed
    /// row widths.
    MemoryEstimate,
}

#[derive(Debug, Clone, Copy)]
struct CalcParams {
    safety_factor: f64,
    fragmentation_factor: f64,
    hash_table_doubling_factor: f64,
    hashtable_calc_type: HashTableCalcType,
    max_batches_in_memory: usize,
    records_per_batch: usize,
}

impl CalcParams {
    /// Estimated bytes for a hash table over `rows` build rows.
    fn hash_table_estimate(&self, rows: usize) -> f64 {
        let base = rows as f64 * HASH_TABLE_ENTRY_BYTES as f64;
        match self.hashtable_calc_type {
            HashTableCalcType::Conservative => base * self.hash_table_doubling_factor,
            HashTableCalcType::Lean => base,
        }
    }
}

/// Entry point for the staged memory calculations around a build phase.
#[derive(Debug)]
pub struct MemoryCalculator {
    strategy: CalcStrategy,
    do_memory_calculation: bool,
    params: CalcParams,
}

impl MemoryCalculator {
    pub fn new(config: &HashJoinConfig, do_memory_calculation: bool) -> Self {
        let strategy = if config.max_batches_in_memory > 0 {
            CalcStrategy::BatchCount
        } else {
            CalcStrategy::MemoryEstimate
        };

        MemoryCalculator {
            strategy,
            do_memory_calculation,
            params: CalcParams {
                safety_factor: config.safety_factor,
                fragmentation_factor: config.fragmentation_factor,
                hash_table_doubling_factor: config.hash_table_doubling_factor,
                hashtable_calc_type: config.hashtable_calc_type,
                max_batches_in_memory: config.max_batches_in_memory,
                records_per_batch: config.records_per_batch,
            },
        }
    }

    pub fn strategy(&self) -> CalcStrategy {
        self.strategy
    }

    /// Produce the pre-build calculator.
    pub fn build_side_partitioning(&self) -> BuildSidePartitioning {
        BuildSidePartitioning {
            strategy: self.strategy,
            do_calc: self.do_memory_calculation,
            params: self.params,
            num_partitions: 1,
            mem_limit: usize::MAX,
            probe_empty: false,
            build_row_width: 0,
            probe_row_width: 0,
            max_reserved: 0,
        }
    }
}

/// Pre-build calculator: tunes the partition count and reports the memory the
/// chosen layout needs.
#[derive(Debug)]
pub struct BuildSidePartitioning {
    strategy: CalcStrategy,
    do_calc: bool,
    params: CalcParams,

    num_partitions: usize,
    mem_limit: usize,
    probe_empty: bool,
    build_row_width: usize,
    probe_row_width: usize,
    max_reserved: usize,
}

impl BuildSidePartitioning {
    #[allow(clippy::too_many_arguments)]
    pub fn initialize(
        &mut self,
        first_cycle: bool,
        probe_empty: bool,
        mem_limit: usize,
        num_partitions: usize,
        build_types: &[DataType],
        probe_types: &[DataType],
        build_batch: Option<&Batch>,
        probe_batch: Option<&Batch>,
    ) {
        self.num_partitions = num_partitions;
        self.mem_limit = mem_limit;
        self.probe_empty = probe_empty;
        self.build_row_width = observed_row_width(build_batch, build_types);
        self.probe_row_width = observed_row_width(probe_batch, probe_types);
        self.recompute_reserved();

        debug!(
            first_cycle,
            num_partitions,
            build_row_width = self.build_row_width,
            probe_row_width = self.probe_row_width,
            max_reserved = self.max_reserved,
            "initialized build side partitioning"
        );
    }

    fn recompute_reserved(&mut self) {
        if self.strategy == CalcStrategy::BatchCount || !self.do_calc {
            // The batch-count strategy never constrains the layout up front.
            self.max_reserved = 0;
            return;
        }

        let partition_batch =
            self.params.records_per_batch as f64 * self.build_row_width as f64
                * self.params.fragmentation_factor;
        let probe_batch = if self.probe_empty {
            0.0
        } else {
            (self.params.records_per_batch * self.probe_row_width) as f64
        };

        let reserved =
            (self.num_partitions as f64 * partition_batch + probe_batch) * self.params.safety_factor;
        self.max_reserved = reserved as usize;
    }

    /// The tuned partition count.
    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    /// Memory the current layout needs up front.
    pub fn max_reserved_memory(&self) -> usize {
        self.max_reserved
    }

    /// Halve the partition count until the reserved estimate fits the limit.
    ///
    /// Stops at two partitions; if the estimate still exceeds the limit the
    /// caller decides between the fallback path and a resource error.
    pub fn reduce_partitions_to_fit(&mut self) {
        while self.num_partitions > 2 && self.max_reserved > self.mem_limit {
            self.num_partitions /= 2;
            self.recompute_reserved();
        }
        debug!(
            num_partitions = self.num_partitions,
            max_reserved = self.max_reserved,
            "tuned partition count"
        );
    }

    /// Pick a partition to spill if appending another batch would exceed the
    /// budget. Consulted after every consumed build batch.
    pub fn should_spill_during_build(
        &self,
        allocator: &Allocator,
        partitions: &[HashPartition],
    ) -> Option<usize> {
        if !self.do_calc {
            return None;
        }

        let over = match self.strategy {
            CalcStrategy::BatchCount => {
                let total: usize = partitions.iter().map(|p| p.in_memory_batches()).sum();
                total > self.params.max_batches_in_memory
            }
            CalcStrategy::MemoryEstimate => {
                let incoming = (self.params.records_per_batch as f64
                    * self.build_row_width as f64
                    * self.params.fragmentation_factor) as usize;
                allocator.used().saturating_add(incoming) > self.mem_limit
            }
        };
        if !over {
            return None;
        }

        // Spill the largest in-memory partition.
        partitions
            .iter()
            .filter(|p| !p.is_spilled() && p.in_memory_batches() > 0)
            .max_by_key(|p| (p.bytes_in_memory(), p.in_memory_batches()))
            .map(|p| p.idx())
    }

    /// Produce the post-build calculator.
    pub fn post_build_calculations(&self, allocator: &Allocator) -> PostBuildCalculations {
        let probe_reserve = if self.probe_empty {
            0
        } else {
            self.params.records_per_batch * self.probe_row_width
        };

        PostBuildCalculations {
            strategy: self.strategy,
            do_calc: self.do_calc,
            params: self.params,
            mem_limit: self.mem_limit,
            reserved: allocator.used().saturating_add(probe_reserve),
            batches_kept: 0,
        }
    }
}

fn observed_row_width(batch: Option<&Batch>, types: &[DataType]) -> usize {
    match batch {
        Some(batch) if batch.num_rows() > 0 => {
            (batch_byte_size(batch) / batch.num_rows()).max(1)
        }
        _ => row_width(types).max(1),
    }
}

/// Post-build, per-partition spill decisions.
///
/// Stateful: each verdict folds the partition just kept (or spilled) into the
/// running accounting, so later partitions see the memory earlier ones will
/// occupy.
#[derive(Debug)]
pub struct PostBuildCalculations {
    strategy: CalcStrategy,
    do_calc: bool,
    params: CalcParams,
    mem_limit: usize,
    reserved: usize,
    batches_kept: usize,
}

impl PostBuildCalculations {
    pub fn should_spill(&mut self, partition: &HashPartition) -> bool {
        match self.strategy {
            CalcStrategy::BatchCount => {
                let kept = self.batches_kept + partition.in_memory_batches();
                if kept > self.params.max_batches_in_memory {
                    true
                } else {
                    self.batches_kept = kept;
                    false
                }
            }
            CalcStrategy::MemoryEstimate => {
                if !self.do_calc {
                    return false;
                }

                // Keeping a partition costs its hash table on top of the
                // batches it already holds.
                let table = self.params.hash_table_estimate(partition.num_rows());
                let cost = (table * self.params.safety_factor) as usize;

                if self.reserved.saturating_add(cost) > self.mem_limit {
                    true
                } else {
                    self.reserved += cost;
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use morsel_vector::field::DataType;

    fn config(max_batches: usize) -> HashJoinConfig {
        HashJoinConfig {
            max_batches_in_memory: max_batches,
            records_per_batch: 4,
            ..HashJoinConfig::default()
        }
    }

    #[test]
    fn strategy_selection() {
        assert_eq!(
            CalcStrategy::MemoryEstimate,
            MemoryCalculator::new(&config(0), true).strategy()
        );
        assert_eq!(
            CalcStrategy::BatchCount,
            MemoryCalculator::new(&config(8), true).strategy()
        );
    }

    #[test]
    fn partition_reduction_fits_limit() {
        let calc = MemoryCalculator::new(&config(0), true);
        let mut bsp = calc.build_side_partitioning();

        // 32 partitions of 4-row batches of 8-byte rows, fragmentation 1.33:
        // the count halves until the estimate fits the limit.
        bsp.initialize(
            true,
            false,
            256,
            32,
            &[DataType::Int64],
            &[DataType::Int64],
            None,
            None,
        );
        assert!(bsp.max_reserved_memory() > 256);

        bsp.reduce_partitions_to_fit();
        assert_eq!(4, bsp.num_partitions());
        assert!(bsp.max_reserved_memory() <= 256);
    }

    #[test]
    fn large_limit_keeps_partitions() {
        let calc = MemoryCalculator::new(&config(0), true);
        let mut bsp = calc.build_side_partitioning();

        bsp.initialize(
            true,
            false,
            1024 * 1024,
            32,
            &[DataType::Int64],
            &[DataType::Int64],
            None,
            None,
        );
        bsp.reduce_partitions_to_fit();
        assert_eq!(32, bsp.num_partitions());
        assert!(bsp.max_reserved_memory() <= 1024 * 1024);
    }

    #[test]
    fn batch_count_post_build_is_stateful() {
        let calc = MemoryCalculator::new(&config(3), true);
        let mut bsp = calc.build_side_partitioning();
        bsp.initialize(
            true,
            false,
            0,
            4,
            &[DataType::Int64],
            &[DataType::Int64],
            None,
            None,
        );

        let allocator = Allocator::with_limit(0);
        let mut post = bsp.post_build_calculations(&allocator);

        // Two partitions with two in-memory batches each: first fits (2 of
        // 3), second would exceed the flat limit.
        let mut p0 = HashPartition::new(0, &[DataType::Int64], 2);
        let mut p1 = HashPartition::new(1, &[DataType::Int64], 2);
        let col = morsel_vector::array::Array::Int64(
            (0..4).collect::<morsel_vector::array::Int64Array>(),
        );
        for row in 0..4 {
            p0.append_inner_row(&[&col], row, 0, &allocator).unwrap();
            p1.append_inner_row(&[&col], row, 0, &allocator).unwrap();
        }

        assert!(!post.should_spill(&p0));
        assert!(post.should_spill(&p1));
    }

    #[test]
    fn lean_table_estimate_keeps_more_partitions() {
        let mut lean_config = config(0);
        lean_config.hashtable_calc_type = HashTableCalcType::Lean;

        let allocator = Allocator::with_limit(0);
        let mut partition = HashPartition::new(0, &[DataType::Int64], 4);
        let col = morsel_vector::array::Array::Int64(
            (0..4).collect::<morsel_vector::array::Int64Array>(),
        );
        for row in 0..4 {
            partition.append_inner_row(&[&col], row, 0, &allocator).unwrap();
        }

        // 150 bytes fits the table itself (64 bytes) but not the doubled
        // conservative estimate (128 bytes) on top of the reserved batches.
        let keep = |cfg: &HashJoinConfig| {
            let calc = MemoryCalculator::new(cfg, true);
            let mut bsp = calc.build_side_partitioning();
            bsp.initialize(
                true,
                false,
                150,
                2,
                &[DataType::Int64],
                &[DataType::Int64],
                None,
                None,
            );
            !bsp.post_build_calculations(&allocator).should_spill(&partition)
        };

        assert!(!keep(&config(0)));
        assert!(keep(&lean_config));
    }

    #[test]
    fn no_calculation_never_spills() {
        let calc = MemoryCalculator::new(&config(0), false);
        let bsp = calc.build_side_partitioning();

        let allocator = Allocator::with_limit(0);
        let partitions = vec![HashPartition::new(0, &[DataType::Int64], 2)];
        assert_eq!(None, bsp.should_spill_during_build(&allocator, &partitions));

        let mut post = bsp.post_build_calculations(&allocator);
        assert!(!post.should_spill(&partitions[0]));
    }
}
