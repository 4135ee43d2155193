mod error;
mod frame;
mod local;
mod tcp;

pub use error::{CollectiveErr, Result};
pub use local::LocalGroup;
pub use tcp::{ChiefBinding, TcpGroup};

use serde::{Serialize, de::DeserializeOwned};

/// Rank 0 is the chief in every group.
pub const CHIEF_RANK: usize = 0;

/// Synchronous collective primitives over a fixed rank group.
///
/// Every rank must reach the same collective call in the same order; the
/// call-order discipline is part of the protocol contract, and a rank that
/// skips a call deadlocks or desynchronizes the whole group.
pub trait Collective {
    /// This rank's position in the group.
    fn rank(&self) -> usize;

    /// Total number of ranks in the group.
    fn size(&self) -> usize;

    fn is_chief(&self) -> bool {
        self.rank() == CHIEF_RANK
    }

    /// Collects one value from every rank.
    ///
    /// # Returns
    /// On the chief, `Some(values)` indexed by global rank. On every other
    /// rank, `None`.
    fn gather<T>(&self, value: T) -> Result<Option<Vec<T>>>
    where
        T: Serialize + DeserializeOwned;

    /// Distributes the chief's value to every rank.
    ///
    /// The chief must supply `Some(value)`; the value passed on any other
    /// rank is ignored. Every rank returns the chief's value.
    fn broadcast<T>(&self, value: Option<T>) -> Result<T>
    where
        T: Serialize + DeserializeOwned;

    /// Blocks until every rank in the group has arrived.
    fn barrier(&self) -> Result<()> {
        self.gather(())?;
        let value = self.is_chief().then_some(());
        self.broadcast(value)
    }
}
