//! Bounded accumulator between a producer and the upsert writer.

use std::mem;

use async_trait::async_trait;
use estate_core::{Listing, WriteStats};
use estate_storage::{StorageError, UpsertWriter};

/// Receives ownership of each flushed batch.
#[async_trait]
pub trait BatchWriter: Send + Sync {
    async fn write_batch(&self, batch: Vec<Listing>) -> Result<WriteStats, StorageError>;
}

#[async_trait]
impl BatchWriter for UpsertWriter {
    async fn write_batch(&self, batch: Vec<Listing>) -> Result<WriteStats, StorageError> {
        self.write(&batch).await
    }
}

pub struct BatchBuffer<W> {
    writer: W,
    capacity: usize,
    pending: Vec<Listing>,
    totals: WriteStats,
    flushes: usize,
}

impl<W: BatchWriter> BatchBuffer<W> {
    /// A capacity of zero is treated as one.
    pub fn new(writer: W, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            writer,
            capacity,
            pending: Vec::with_capacity(capacity),
            totals: WriteStats::default(),
            flushes: 0,
        }
    }

    /// Appends `listing` and flushes once `capacity` is reached.
    ///
    /// Returns the stats of the automatic flush, if one happened.
    pub async fn add(&mut self, listing: Listing) -> Result<Option<WriteStats>, StorageError> {
        self.pending.push(listing);
        if self.pending.len() >= self.capacity {
            return self.flush().await.map(Some);
        }
        Ok(None)
    }

    /// Hands everything pending to the writer as one batch. No-op when empty.
    ///
    /// The buffer is empty before the writer is awaited, whatever the outcome.
    pub async fn flush(&mut self) -> Result<WriteStats, StorageError> {
        if self.pending.is_empty() {
            return Ok(WriteStats::default());
        }
        let batch = mem::replace(&mut self.pending, Vec::with_capacity(self.capacity));
        self.flushes += 1;
        let stats = self.writer.write_batch(batch).await?;
        self.totals += stats;
        Ok(stats)
    }

    pub fn pending(&self) -> &[Listing] {
        &self.pending
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn totals(&self) -> WriteStats {
        self.totals
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }
}
