use morsel_error::{MorselError, Result};
use morsel_vector::batch::Batch;
use morsel_vector::ipc;
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Owns the operator's spill working directory.
///
/// Every spill file is created and deleted through the set; closing the set
/// removes any remaining files along with the directory itself. Cleanup is
/// best-effort: failures are logged, not raised.
#[derive(Debug)]
pub struct SpillSet {
    dir: PathBuf,
    live: Vec<PathBuf>,
    next_file_id: u64,
    closed: bool,
}

impl SpillSet {
    pub fn create(base: &Path, operator_id: u32) -> Result<Self> {
        let dir = base.join(format!("hash-join-{operator_id}-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir)
            .map_err(|e| MorselError::io(format!("Failed to create spill directory {dir:?}"), e))?;
        debug!(?dir, "created spill directory");

        Ok(SpillSet {
            dir,
            live: Vec::new(),
            next_file_id: 0,
            closed: false,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Create a new spill file writer.
    ///
    /// The label only aids debugging; a per-set counter keeps names unique.
    pub fn writer(&mut self, label: &str) -> Result<SpillWriter> {
        let id = self.next_file_id;
        self.next_file_id += 1;

        let path = self.dir.join(format!("{id}_{label}.spill"));
        let file = File::create(&path)
            .map_err(|e| MorselError::io(format!("Failed to create spill file {path:?}"), e))?;
        self.live.push(path.clone());

        Ok(SpillWriter {
            path,
            file: BufWriter::new(file),
            batches: 0,
            bytes: 0,
            scratch: Vec::new(),
        })
    }

    /// Delete a spill file whose contents are no longer needed.
    pub fn delete(&mut self, path: &Path) {
        if let Err(e) = fs::remove_file(path) {
            warn!(?path, %e, "failed to delete spill file");
        }
        self.live.retain(|p| p != path);
    }

    /// Delete remaining files and the working directory.
    ///
    /// Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        for path in std::mem::take(&mut self.live) {
            if let Err(e) = fs::remove_file(&path) {
                warn!(?path, %e, "failed to delete spill file during close");
            }
        }
        if let Err(e) = fs::remove_dir(&self.dir) {
            warn!(dir = ?self.dir, %e, "failed to remove spill directory");
        }
        self.closed = true;
    }
}

impl Drop for SpillSet {
    fn drop(&mut self) {
        self.close();
    }
}

/// A fully written spill file.
#[derive(Debug, Clone)]
pub struct SpillFile {
    pub path: PathBuf,
    pub batches: usize,
    pub bytes: u64,
}

/// Writes length-prefixed encoded batches to a spill file.
#[derive(Debug)]
pub struct SpillWriter {
    path: PathBuf,
    file: BufWriter<File>,
    batches: usize,
    bytes: u64,
    scratch: Vec<u8>,
}

impl SpillWriter {
    pub fn write_batch(&mut self, batch: &Batch) -> Result<()> {
        self.scratch.clear();
        ipc::encode_batch(batch, &mut self.scratch);

        let len = self.scratch.len() as u32;
        self.file
            .write_all(&len.to_le_bytes())
            .and_then(|_| self.file.write_all(&self.scratch))
            .map_err(|e| {
                MorselError::io(format!("Failed to write spill file {:?}", self.path), e)
            })?;

        self.batches += 1;
        self.bytes += 4 + u64::from(len);
        Ok(())
    }

    pub fn batches_written(&self) -> usize {
        self.batches
    }

    pub fn finish(mut self) -> Result<SpillFile> {
        self.file.flush().map_err(|e| {
            MorselError::io(format!("Failed to flush spill file {:?}", self.path), e)
        })?;
        Ok(SpillFile {
            path: self.path,
            batches: self.batches,
            bytes: self.bytes,
        })
    }
}

/// Reads batches back out of a spill file.
#[derive(Debug)]
pub struct SpillReader {
    path: PathBuf,
    file: BufReader<File>,
    remaining: usize,
    scratch: Vec<u8>,
}

impl SpillReader {
    pub fn open(spill_file: &SpillFile) -> Result<Self> {
        let file = File::open(&spill_file.path).map_err(|e| {
            MorselError::io(format!("Failed to open spill file {:?}", spill_file.path), e)
        })?;
        Ok(SpillReader {
            path: spill_file.path.clone(),
            file: BufReader::new(file),
            remaining: spill_file.batches,
            scratch: Vec::new(),
        })
    }

    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;

        let mut len_buf = [0u8; 4];
        self.file.read_exact(&mut len_buf).map_err(|e| {
            MorselError::io(format!("Failed to read spill file {:?}", self.path), e)
        })?;
        let len = u32::from_le_bytes(len_buf) as usize;

        self.scratch.resize(len, 0);
        self.file.read_exact(&mut self.scratch).map_err(|e| {
            MorselError::io(format!("Failed to read spill file {:?}", self.path), e)
        })?;

        Ok(Some(ipc::decode_batch(&self.scratch)?))
    }
}

/// A spilled build/probe partition pair awaiting a later cycle.
#[derive(Debug)]
pub struct SpilledPartitionRef {
    /// Cycle at which this pair will be processed.
    pub cycle: u32,

    /// Partition index this pair came from within its producing cycle.
    pub origin_partition: usize,

    /// Origin partition of the pair that produced this one. Lineage only.
    pub prior_origin_partition: usize,

    /// Build-side rows.
    pub inner: SpillFile,

    /// Probe-side rows, populated once the probe phase has run.
    pub outer: Option<SpillFile>,

    /// Whether the outer side has been recorded. Must be true before the
    /// outer file is read.
    pub updated_outer: bool,
}

impl SpilledPartitionRef {
    pub fn new(cycle: u32, origin_partition: usize, prior_origin_partition: usize, inner: SpillFile) -> Self {
        SpilledPartitionRef {
            cycle,
            origin_partition,
            prior_origin_partition,
            inner,
            outer: None,
            updated_outer: false,
        }
    }

    pub fn update_outer(&mut self, outer: Option<SpillFile>) {
        self.outer = outer;
        self.updated_outer = true;
    }

    pub fn outer_batch_count(&self) -> usize {
        self.outer.as_ref().map(|f| f.batches).unwrap_or(0)
    }
}

/// Invoked by the spilled state when its cycle limit is violated.
///
/// The owner supplies the user-visible error so it can attach operator
/// context to it.
pub trait SpilledStateUpdater {
    fn exhaustion_error(&self, cycle: u32) -> MorselError;
}

/// FIFO of spilled partition pairs plus the recursion cycle counter.
#[derive(Debug)]
pub struct SpilledState {
    queue: VecDeque<SpilledPartitionRef>,
    cycle: u32,
    max_cycles: u32,
}

impl SpilledState {
    pub fn new(max_cycles: u32) -> Self {
        SpilledState {
            queue: VecDeque::new(),
            cycle: 0,
            max_cycles,
        }
    }

    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    pub fn set_max_cycles(&mut self, max_cycles: u32) {
        self.max_cycles = max_cycles;
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn enqueue(&mut self, sp: SpilledPartitionRef) {
        self.queue.push_back(sp);
    }

    pub fn dequeue(&mut self) -> Option<SpilledPartitionRef> {
        self.queue.pop_front()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = SpilledPartitionRef> + '_ {
        self.queue.drain(..)
    }

    /// Check that a partition processed at the current cycle is allowed to
    /// spill again.
    ///
    /// Re-spilling at cycle 0 is the normal first-level spill and is always
    /// allowed.
    pub fn check_can_spill(&self, updater: &dyn SpilledStateUpdater) -> Result<()> {
        if self.cycle > 0 && self.cycle + 1 > self.max_cycles {
            return Err(updater.exhaustion_error(self.cycle + 1));
        }
        Ok(())
    }

    /// Advance the cycle counter to the pair about to be processed.
    pub fn update_cycle(
        &mut self,
        sp: &SpilledPartitionRef,
        updater: &dyn SpilledStateUpdater,
    ) -> Result<()> {
        self.cycle = sp.cycle;
        if self.cycle > self.max_cycles {
            return Err(updater.exhaustion_error(self.cycle));
        }
        Ok(())
    }
}
