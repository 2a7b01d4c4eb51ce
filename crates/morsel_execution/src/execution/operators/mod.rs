//! Implementations of physical operators in an execution pipeline.

pub mod hash_join;

pub mod util;

#[cfg(test)]
pub(crate) mod test_util;

use morsel_error::Result;
use morsel_vector::batch::Batch;
use morsel_vector::field::Schema;
use std::fmt::Debug;

/// Result of pulling from an operator.
#[derive(Debug, PartialEq)]
pub enum PollNext {
    /// Schema for the batches this operator will produce.
    ///
    /// Emitted exactly once, before any batch.
    Schema(Schema),

    /// Successfully produced a data batch.
    Batch(Batch),

    /// A batch could not be produced right now because an input is not ready.
    /// The same call should be retried.
    Pending,

    /// The operator has been exhausted.
    Exhausted,
}

/// Result of pulling from an operator input.
#[derive(Debug, PartialEq)]
pub enum StreamPoll {
    /// Successfully received a data batch.
    Batch(Batch),

    /// A batch could not be retrieved right now.
    Pending,

    /// The stream has been exhausted.
    Exhausted,
}

/// A stream of batches feeding an operator.
///
/// Blocking happens upstream; a poll either produces a batch, reports that
/// none is available yet, or reports exhaustion.
pub trait BatchStream: Debug {
    /// Schema of the batches this stream produces.
    fn schema(&self) -> &Schema;

    fn poll_next(&mut self) -> Result<StreamPoll>;

    /// Tell the stream no more batches will be consumed.
    ///
    /// The stream may still produce already-buffered batches; callers drain
    /// until exhaustion.
    fn cancel(&mut self);
}
