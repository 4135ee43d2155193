use std::num::NonZeroUsize;
use std::ops::Range;

/// Shard specification for one data-parallel rank.
///
/// Shards are the contiguous slices between the boundaries
/// `floor(i * total / num_replicas)`, so for any epoch length they are
/// disjoint, cover `[0..total)` in rank order, and differ in size by at
/// most one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    pub rank: usize,
    pub num_replicas: NonZeroUsize,
}

impl ShardSpec {
    pub fn new(rank: usize, num_replicas: NonZeroUsize) -> Self {
        assert!(rank < num_replicas.get(), "rank out of range");
        Self { rank, num_replicas }
    }

    /// The whole sequence as one shard.
    pub fn whole() -> Self {
        Self::new(0, NonZeroUsize::MIN)
    }

    /// This rank's slice of an epoch of `total` batches.
    #[inline]
    pub fn range(self, total: usize) -> Range<usize> {
        self.boundary(self.rank, total)..self.boundary(self.rank + 1, total)
    }

    fn boundary(self, i: usize, total: usize) -> usize {
        i * total / self.num_replicas.get()
    }
}
