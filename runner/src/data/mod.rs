mod loader;
mod shard;

pub use loader::InMemoryLoader;
pub use shard::ShardSpec;

/// A restartable, rank-sharded, lazy sequence of batches.
///
/// Training loaders are built with `repeat` and never run dry; validation
/// loaders are finite and reset once per validation workload.
pub trait DataLoader {
    type Batch;

    /// Returns the next batch for this rank's shard, or `None` if exhausted.
    fn next_batch(&mut self) -> Option<Self::Batch>;

    /// Advances past `n` batches, used to resume mid-epoch after a restart.
    fn skip(&mut self, n: usize);

    /// Batches per epoch for this rank's shard, when finite.
    fn len(&self) -> Option<usize>;

    fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Rewinds to the start of the shard.
    fn reset(&mut self);
}
