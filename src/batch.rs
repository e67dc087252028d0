//! This module contains the [`Batch`] struct, the unit of work submitted to a [`Context`](crate::model::Context).
use crate::model::Token;

/// One entry of a [`Batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchEntry {
    /// The token to evaluate.
    pub token: Token,
    /// The key-value cache position the token occupies.
    pub position: usize,
    /// The sequence the token belongs to.
    pub sequence_id: u32,
    /// Whether the context should produce logits for this entry.
    pub wants_logits: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
/// The error type for [`Batch`] construction.
pub enum BatchError {
    #[error("The batch is full. Its capacity is {0}.")]
    /// The batch already holds as many entries as its capacity allows.
    BatchFull(usize),
}

/// An ordered, capacity-bounded list of [`BatchEntry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    entries: Vec<BatchEntry>,
    capacity: usize,
}

impl Batch {
    /// The capacity used when nothing else is configured.
    pub const DEFAULT_CAPACITY: usize = 512;

    /// Creates an empty batch that holds at most `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends an entry.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::BatchFull`] when the batch is at capacity. The batch is not modified in this case.
    pub fn push(&mut self, entry: BatchEntry) -> Result<(), BatchError> {
        if self.entries.len() >= self.capacity {
            return Err(BatchError::BatchFull(self.capacity));
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Removes all entries while keeping the allocation.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Gets the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Checks whether the batch has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Gets the maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Gets the entries in submission order.
    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    /// Gets the index of the last entry that requests logits.
    pub fn last_logits_index(&self) -> Option<usize> {
        self.entries.iter().rposition(|e| e.wants_logits)
    }

    /// Counts the entries that request logits.
    pub fn logits_count(&self) -> usize {
        self.entries.iter().filter(|e| e.wants_logits).count()
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }
}
