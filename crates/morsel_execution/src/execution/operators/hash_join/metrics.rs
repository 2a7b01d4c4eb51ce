/// Per-operator metrics, updated in place as the join runs.
#[derive(Debug, Clone, Default)]
pub struct HashJoinMetrics {
    /// Total buckets across all built hash tables.
    pub num_buckets: u64,

    /// Total entries across all built hash tables.
    pub num_entries: u64,

    /// Times a hash table had to grow during construction.
    pub num_resizing: u64,

    /// Time spent growing hash tables.
    pub resizing_time_ms: u64,

    /// Partition count used by the current cycle.
    pub num_partitions: u64,

    /// Partitions spilled across all cycles.
    pub spilled_partitions: u64,

    /// Bytes written to spill files.
    pub spill_bytes: u64,

    /// Highest spill cycle reached.
    pub spill_cycle: u64,

    pub build_batches: u64,
    pub build_rows: u64,
    pub build_bytes: u64,

    pub probe_batches: u64,
    pub probe_rows: u64,
    pub probe_bytes: u64,

    pub output_batches: u64,
    pub output_rows: u64,
}

impl HashJoinMetrics {
    pub fn spill_mb(&self) -> f64 {
        self.spill_bytes as f64 / (1024.0 * 1024.0)
    }
}
