use crate::execution::operators::util::hash::hash_arrays;
use morsel_error::{MorselError, Result};
use morsel_vector::batch::Batch;
use morsel_vector::field::Schema;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, warn};

/// Bloom filter over 64-bit key hashes.
///
/// Uses two derived probe sequences per hash, so inserting and testing only
/// ever needs the one hash the join already computes.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    words: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Create a filter occupying roughly `num_bytes` of bit array.
    pub fn with_num_bytes(num_bytes: usize, num_hashes: u32) -> Self {
        let words = (num_bytes / 8).next_power_of_two().max(1);
        BloomFilter {
            words: vec![0; words],
            num_bits: words as u64 * 64,
            num_hashes: num_hashes.max(1),
        }
    }

    fn bit_for(&self, hash: u64, probe: u32) -> u64 {
        let h2 = hash.rotate_left(32) | 1;
        hash.wrapping_add(u64::from(probe).wrapping_mul(h2)) % self.num_bits
    }

    pub fn insert_hash(&mut self, hash: u64) {
        for probe in 0..self.num_hashes {
            let bit = self.bit_for(hash, probe);
            self.words[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    /// Whether the hash may have been inserted. False positives possible,
    /// false negatives are not.
    pub fn maybe_contains_hash(&self, hash: u64) -> bool {
        (0..self.num_hashes).all(|probe| {
            let bit = self.bit_for(hash, probe);
            self.words[(bit / 64) as usize] & (1 << (bit % 64)) != 0
        })
    }

    pub fn num_bytes(&self) -> usize {
        self.words.len() * 8
    }
}

/// Configuration for one runtime filter: the build-side field to collect and
/// the probe-side field a downstream scan should test.
#[derive(Debug, Clone)]
pub struct BloomFilterDef {
    pub build_field: String,
    pub probe_field: String,
    pub num_bytes: usize,
}

impl BloomFilterDef {
    pub fn new(build_field: impl Into<String>, probe_field: impl Into<String>) -> Self {
        BloomFilterDef {
            build_field: build_field.into(),
            probe_field: probe_field.into(),
            num_bytes: 32 * 1024,
        }
    }
}

/// The filters produced by one operator, sent downstream once the build side
/// has been fully consumed.
#[derive(Debug)]
pub struct RuntimeFilterSet {
    pub operator_id: u32,
    /// Probe-side field name paired with the filter to apply to it.
    pub filters: Vec<(String, BloomFilter)>,
}

/// Transport for emitting runtime filters out-of-band.
pub trait RuntimeFilterSink: Debug + Send + Sync {
    fn send(&self, filters: RuntimeFilterSet) -> Result<()>;
}

/// Sink that hands filters to an in-process consumer. Doubles as the test
/// transport.
#[derive(Debug, Default)]
pub struct CollectingFilterSink {
    pub received: Mutex<Vec<RuntimeFilterSet>>,
}

impl RuntimeFilterSink for CollectingFilterSink {
    fn send(&self, filters: RuntimeFilterSet) -> Result<()> {
        self.received.lock().push(filters);
        Ok(())
    }
}

/// Accumulates bloom filters over build-side keys during the first cycle and
/// emits them exactly once when the build completes.
#[derive(Debug)]
pub struct RuntimeFilterBuilder {
    operator_id: u32,
    sink: Arc<dyn RuntimeFilterSink>,
    /// (build column index, probe field name, filter) per definition.
    filters: Vec<(usize, String, BloomFilter)>,
    enabled: bool,
    emitted: bool,
    scratch: Vec<u64>,
}

impl RuntimeFilterBuilder {
    /// Resolve filter definitions against the build schema.
    ///
    /// Fail-soft: any unresolved build field disables the entire runtime
    /// filter for this query.
    pub fn new(
        defs: &[BloomFilterDef],
        build_schema: &Schema,
        operator_id: u32,
        sink: Arc<dyn RuntimeFilterSink>,
    ) -> Self {
        let mut filters = Vec::with_capacity(defs.len());
        let mut enabled = !defs.is_empty();

        for def in defs {
            match build_schema.field_index(&def.build_field) {
                Some(idx) => filters.push((
                    idx,
                    def.probe_field.clone(),
                    BloomFilter::with_num_bytes(def.num_bytes, 4),
                )),
                None => {
                    warn!(
                        field = %def.build_field,
                        operator_id,
                        "runtime filter field not found in build schema, disabling runtime filter"
                    );
                    enabled = false;
                }
            }
        }

        RuntimeFilterBuilder {
            operator_id,
            sink,
            filters,
            enabled,
            emitted: false,
            scratch: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Fold a build batch's key values into the filters.
    pub fn accumulate(&mut self, batch: &Batch) -> Result<()> {
        if !self.enabled || batch.num_rows() == 0 {
            return Ok(());
        }

        for (col_idx, _, filter) in self.filters.iter_mut() {
            let col = batch
                .column(*col_idx)
                .ok_or_else(|| MorselError::new("Runtime filter column out of bounds"))?;

            self.scratch.clear();
            self.scratch.resize(batch.num_rows(), 0);
            hash_arrays(&[col.as_ref()], &mut self.scratch)?;

            for hash in &self.scratch {
                filter.insert_hash(*hash);
            }
        }

        Ok(())
    }

    /// Send the filter set downstream. Only the first call emits.
    pub fn emit(&mut self) -> Result<()> {
        if !self.enabled || self.emitted {
            return Ok(());
        }
        self.emitted = true;

        let filters = self
            .filters
            .drain(..)
            .map(|(_, probe_field, filter)| (probe_field, filter))
            .collect::<Vec<_>>();

        debug!(operator_id = self.operator_id, count = filters.len(), "emitting runtime filters");
        self.sink.send(RuntimeFilterSet {
            operator_id: self.operator_id,
            filters,
        })
    }
}
