use morsel_error::{ErrorKind, MorselError, Result};
use std::cell::Cell;

/// Byte-accounted allocator shared by everything inside a single operator.
///
/// Operators run single-threaded under cooperative pull scheduling, so plain
/// cells suffice. A refused reservation is fatal to the operator; spill
/// decisions are expected to keep usage below the limit before reservations
/// start failing.
#[derive(Debug)]
pub struct Allocator {
    limit: Cell<usize>,
    used: Cell<usize>,
    peak: Cell<usize>,
}

impl Allocator {
    /// Create an allocator with the given byte limit. A limit of 0 means
    /// unlimited (inherit from the system).
    pub fn with_limit(limit: usize) -> Self {
        let limit = if limit == 0 { usize::MAX } else { limit };
        Allocator {
            limit: Cell::new(limit),
            used: Cell::new(0),
            peak: Cell::new(0),
        }
    }

    pub fn try_reserve(&self, bytes: usize, context: &str) -> Result<()> {
        let used = self.used.get();
        let new_used = used.saturating_add(bytes);
        if new_used > self.limit.get() {
            return Err(MorselError::with_kind(
                ErrorKind::OutOfMemory,
                format!(
                    "Failed to reserve {bytes} bytes for {context}: {used} of {} bytes in use",
                    self.limit.get()
                ),
            ));
        }
        self.used.set(new_used);
        if new_used > self.peak.get() {
            self.peak.set(new_used);
        }
        Ok(())
    }

    pub fn release(&self, bytes: usize) {
        self.used.set(self.used.get().saturating_sub(bytes));
    }

    pub fn set_limit(&self, limit: usize) {
        let limit = if limit == 0 { usize::MAX } else { limit };
        self.limit.set(limit);
    }

    pub fn limit(&self) -> usize {
        self.limit.get()
    }

    pub fn used(&self) -> usize {
        self.used.get()
    }

    pub fn peak(&self) -> usize {
        self.peak.get()
    }
}
