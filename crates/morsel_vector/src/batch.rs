use crate::array::Array;
use crate::field::DataType;
use morsel_error::{MorselError, Result};
use std::sync::Arc;

/// A batch of same-length arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Columns that make up this batch.
    cols: Vec<Arc<Array>>,

    /// Number of rows in this batch. Needed to allow for a batch that has no
    /// columns but a non-zero number of rows.
    num_rows: usize,
}

impl Batch {
    pub fn empty() -> Self {
        Batch {
            cols: Vec::new(),
            num_rows: 0,
        }
    }

    pub fn try_new(cols: Vec<Array>) -> Result<Self> {
        let len = match cols.first() {
            Some(arr) => arr.len(),
            None => return Ok(Self::empty()),
        };

        for col in &cols {
            if col.len() != len {
                return Err(MorselError::new(format!(
                    "Expected column length to be {len}, got {}",
                    col.len()
                )));
            }
        }

        let cols = cols.into_iter().map(Arc::new).collect();

        Ok(Batch {
            cols,
            num_rows: len,
        })
    }

    pub fn try_from_arcs(cols: Vec<Arc<Array>>) -> Result<Self> {
        let len = match cols.first() {
            Some(arr) => arr.len(),
            None => return Ok(Self::empty()),
        };

        for col in &cols {
            if col.len() != len {
                return Err(MorselError::new(format!(
                    "Expected column length to be {len}, got {}",
                    col.len()
                )));
            }
        }

        Ok(Batch {
            cols,
            num_rows: len,
        })
    }

    /// Project a batch using the provided indices.
    ///
    /// Panics if any index is out of bounds.
    pub fn project(&self, indices: &[usize]) -> Self {
        let cols = indices.iter().map(|idx| self.cols[*idx].clone()).collect();

        Batch {
            cols,
            num_rows: self.num_rows,
        }
    }

    pub fn column(&self, idx: usize) -> Option<&Arc<Array>> {
        self.cols.get(idx)
    }

    pub fn columns(&self) -> &[Arc<Array>] {
        &self.cols
    }

    pub fn column_types(&self) -> Vec<DataType> {
        self.cols.iter().map(|c| c.datatype()).collect()
    }

    pub fn num_columns(&self) -> usize {
        self.cols.len()
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }
}
