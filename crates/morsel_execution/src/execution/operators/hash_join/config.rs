use super::runtime_filter::BloomFilterDef;
use std::path::PathBuf;

/// How aggressively hash table growth is accounted for in memory estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashTableCalcType {
    /// Assume tables grow by doubling and reserve for the doubled size.
    Conservative,
    /// Reserve only for the observed row count.
    Lean,
}

/// Option surface for the hash join operator.
///
/// Values are read from session options at plan time and handed to the
/// operator at construction.
#[derive(Debug, Clone)]
pub struct HashJoinConfig {
    /// Initial partition count. Rounded up to a power of two; may be reduced
    /// by memory calculations, or forced to 1 by the fallback path.
    pub num_partitions: usize,

    /// Byte limit for the operator's allocator. 0 inherits the system limit.
    pub max_memory: usize,

    /// Row count for internal per-partition batches.
    pub records_per_batch: usize,

    /// When nonzero, selects the batch-count memory strategy with this flat
    /// limit on in-memory batches.
    pub max_batches_in_memory: usize,

    /// Multiplied into memory estimates to leave headroom.
    pub safety_factor: f64,

    /// Accounts for allocator fragmentation when estimating batch footprints.
    pub fragmentation_factor: f64,

    /// Accounts for hash table growth-by-doubling when estimating table
    /// footprints.
    pub hash_table_doubling_factor: f64,

    /// Selects how hash table growth enters the memory estimates.
    pub hashtable_calc_type: HashTableCalcType,

    /// Allow disabling spilling (single partition, unbounded allocator) when
    /// the memory limit cannot accommodate the partition layout.
    pub fallback_enabled: bool,

    /// Output batch size budget in bytes.
    pub output_batch_size: usize,

    /// Caps the output batch budget at this fraction of `max_memory` when a
    /// memory limit is set.
    pub output_batch_size_mem_factor: f64,

    /// Upper bound on recursive spill cycles before the join is declared
    /// un-partitionable. 0 derives the bound from the partition bit width.
    pub max_spill_cycles: u32,

    /// Runtime filter definitions. Empty disables runtime filter production.
    pub bloom_filters: Vec<BloomFilterDef>,

    /// Base directory for the operator's spill working directory.
    pub spill_directory: PathBuf,
}

impl Default for HashJoinConfig {
    fn default() -> Self {
        HashJoinConfig {
            num_partitions: 32,
            max_memory: 0,
            records_per_batch: 1024,
            max_batches_in_memory: 0,
            safety_factor: 1.0,
            fragmentation_factor: 1.33,
            hash_table_doubling_factor: 2.0,
            hashtable_calc_type: HashTableCalcType::Conservative,
            fallback_enabled: false,
            output_batch_size: 16 * 1024 * 1024,
            output_batch_size_mem_factor: 0.25,
            max_spill_cycles: 0,
            bloom_filters: Vec::new(),
            spill_directory: std::env::temp_dir(),
        }
    }
}

impl HashJoinConfig {
    /// Resolved spill-cycle bound for the given partition bit width.
    ///
    /// The hash-value column stored with spilled rows is 32 bits; once every
    /// bit has been consumed for routing there is no entropy left to
    /// subdivide with.
    pub fn spill_cycle_limit(&self, partition_bits: u32) -> u32 {
        if self.max_spill_cycles > 0 {
            self.max_spill_cycles
        } else {
            (32 / partition_bits.max(1)).max(1)
        }
    }
}
