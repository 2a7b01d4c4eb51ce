//! Helpers for exercising operators in tests.

use crate::execution::operators::{BatchStream, StreamPoll};
use morsel_error::Result;
use morsel_vector::batch::Batch;
use morsel_vector::field::Schema;
use std::collections::VecDeque;

/// A batch stream over pre-made batches.
#[derive(Debug)]
pub struct BatchesStream {
    schema: Schema,
    batches: VecDeque<Batch>,
    cancelled: bool,
}

impl BatchesStream {
    pub fn new(schema: Schema, batches: impl IntoIterator<Item = Batch>) -> Self {
        BatchesStream {
            schema,
            batches: batches.into_iter().collect(),
            cancelled: false,
        }
    }

    pub fn boxed(schema: Schema, batches: impl IntoIterator<Item = Batch>) -> Box<Self> {
        Box::new(Self::new(schema, batches))
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }
}

impl BatchStream for BatchesStream {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn poll_next(&mut self) -> Result<StreamPoll> {
        if self.cancelled {
            self.batches.clear();
        }
        Ok(match self.batches.pop_front() {
            Some(batch) => StreamPoll::Batch(batch),
            None => StreamPoll::Exhausted,
        })
    }

    fn cancel(&mut self) {
        self.cancelled = true;
    }
}
