//! In-process rank group over per-rank channels.
//!
//! Each non-chief rank owns a dedicated channel pair to and from the chief,
//! so a collective call consumes exactly one message per rank per call and
//! calls from different collectives cannot interleave, as long as every rank
//! issues the same call sequence.

use std::sync::{
    Mutex,
    mpsc::{Receiver, Sender, channel},
};

use serde::{Serialize, de::DeserializeOwned};

use crate::{CHIEF_RANK, Collective, CollectiveErr, Result};

enum Links {
    Chief {
        // Indexed by rank - 1.
        from_ranks: Vec<Mutex<Receiver<Vec<u8>>>>,
        to_ranks: Vec<Sender<Vec<u8>>>,
    },
    Member {
        to_chief: Sender<Vec<u8>>,
        from_chief: Mutex<Receiver<Vec<u8>>>,
    },
}

/// One rank's handle into an in-process group.
///
/// Intended for single-machine runs and tests: create the group once and
/// move one handle into each rank's thread.
pub struct LocalGroup {
    rank: usize,
    size: usize,
    links: Links,
}

impl LocalGroup {
    /// Creates the handles for a group of `size` ranks, indexed by rank.
    pub fn group(size: usize) -> Vec<LocalGroup> {
        assert!(size > 0, "group size must be > 0");

        let mut from_ranks = Vec::with_capacity(size - 1);
        let mut to_ranks = Vec::with_capacity(size - 1);
        let mut members = Vec::with_capacity(size - 1);

        for rank in 1..size {
            let (up_tx, up_rx) = channel();
            let (down_tx, down_rx) = channel();

            from_ranks.push(Mutex::new(up_rx));
            to_ranks.push(down_tx);
            members.push(LocalGroup {
                rank,
                size,
                links: Links::Member {
                    to_chief: up_tx,
                    from_chief: Mutex::new(down_rx),
                },
            });
        }

        let chief = LocalGroup {
            rank: CHIEF_RANK,
            size,
            links: Links::Chief {
                from_ranks,
                to_ranks,
            },
        };

        let mut handles = Vec::with_capacity(size);
        handles.push(chief);
        handles.extend(members);
        handles
    }
}

impl Collective for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn gather<T>(&self, value: T) -> Result<Option<Vec<T>>>
    where
        T: Serialize + DeserializeOwned,
    {
        match &self.links {
            Links::Chief { from_ranks, .. } => {
                let mut values = Vec::with_capacity(self.size);
                values.push(value);

                for (idx, rx) in from_ranks.iter().enumerate() {
                    let rank = idx + 1;
                    let rx = rx.lock().unwrap_or_else(|e| e.into_inner());
                    let bytes = rx
                        .recv()
                        .map_err(|_| CollectiveErr::PeerUnavailable { rank })?;
                    values.push(serde_json::from_slice(&bytes)?);
                }

                Ok(Some(values))
            }
            Links::Member { to_chief, .. } => {
                let bytes = serde_json::to_vec(&value)?;
                to_chief
                    .send(bytes)
                    .map_err(|_| CollectiveErr::PeerUnavailable { rank: CHIEF_RANK })?;
                Ok(None)
            }
        }
    }

    fn broadcast<T>(&self, value: Option<T>) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        match &self.links {
            Links::Chief { to_ranks, .. } => {
                let value = value.ok_or(CollectiveErr::MissingChiefValue)?;
                let bytes = serde_json::to_vec(&value)?;

                for (idx, tx) in to_ranks.iter().enumerate() {
                    tx.send(bytes.clone())
                        .map_err(|_| CollectiveErr::PeerUnavailable { rank: idx + 1 })?;
                }

                Ok(value)
            }
            Links::Member { from_chief, .. } => {
                let rx = from_chief.lock().unwrap_or_else(|e| e.into_inner());
                let bytes = rx
                    .recv()
                    .map_err(|_| CollectiveErr::PeerUnavailable { rank: CHIEF_RANK })?;
                Ok(serde_json::from_slice(&bytes)?)
            }
        }
    }
}
