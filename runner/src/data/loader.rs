use super::{DataLoader, shard::ShardSpec};

/// Shard-aware loader over pre-formed batches held in memory.
#[derive(Debug, Clone)]
pub struct InMemoryLoader<B> {
    batches: Vec<B>,
    start: usize,
    end: usize,
    cursor: usize, // absolute index into `batches`
    repeat: bool,
}

impl<B: Clone> InMemoryLoader<B> {
    /// # Arguments
    /// * `batches` - The full epoch, in order.
    /// * `shard` - This rank's slice of the epoch.
    /// * `repeat` - Cycle forever (training) instead of running dry
    ///   (validation).
    pub fn new(batches: Vec<B>, shard: ShardSpec, repeat: bool) -> Self {
        let range = shard.range(batches.len());
        Self {
            batches,
            start: range.start,
            end: range.end,
            cursor: range.start,
            repeat,
        }
    }

    fn shard_len(&self) -> usize {
        self.end - self.start
    }
}

impl<B: Clone> DataLoader for InMemoryLoader<B> {
    type Batch = B;

    fn next_batch(&mut self) -> Option<B> {
        if self.cursor >= self.end {
            if !self.repeat || self.shard_len() == 0 {
                return None;
            }
            self.cursor = self.start;
        }

        let batch = self.batches[self.cursor].clone();
        self.cursor += 1;
        Some(batch)
    }

    fn skip(&mut self, n: usize) {
        let len = self.shard_len();
        if self.repeat && len > 0 {
            self.cursor = self.start + (self.cursor - self.start + n) % len;
        } else {
            self.cursor = (self.cursor + n).min(self.end);
        }
    }

    fn len(&self) -> Option<usize> {
        Some(self.shard_len())
    }

    fn reset(&mut self) {
        self.cursor = self.start;
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;

    #[test]
    fn loader_respects_shard_and_repeats() {
        let shard = ShardSpec::new(1, NonZeroUsize::new(3).unwrap()); // 3..6
        let mut loader = InMemoryLoader::new((0..10).collect(), shard, true);

        assert_eq!(loader.len(), Some(3));
        assert_eq!(loader.next_batch(), Some(3));
        assert_eq!(loader.next_batch(), Some(4));
        assert_eq!(loader.next_batch(), Some(5));
        // Wraps around instead of running dry.
        assert_eq!(loader.next_batch(), Some(3));
    }

    #[test]
    fn finite_loader_runs_dry_and_resets() {
        let mut loader = InMemoryLoader::new(vec![1, 2], ShardSpec::whole(), false);

        assert_eq!(loader.next_batch(), Some(1));
        assert_eq!(loader.next_batch(), Some(2));
        assert_eq!(loader.next_batch(), None);

        loader.reset();
        assert_eq!(loader.next_batch(), Some(1));
    }

    #[test]
    fn skip_resumes_mid_epoch() {
        let shard = ShardSpec::new(0, NonZeroUsize::new(2).unwrap()); // 0..3
        let mut loader = InMemoryLoader::new((0..6).collect(), shard, true);

        loader.skip(4); // one full shard epoch plus one batch
        assert_eq!(loader.next_batch(), Some(1));
    }

    #[test]
    fn skip_on_finite_loader_saturates() {
        let mut loader = InMemoryLoader::new(vec![1, 2, 3], ShardSpec::whole(), false);
        loader.skip(10);
        assert_eq!(loader.next_batch(), None);
    }
}
