//! Chief-star TCP transport.
//!
//! The chief accepts one connection per peer rank; every collective is a
//! fan-in to or fan-out from the chief over those sockets. The public API is
//! blocking: the group owns a tokio runtime and drives the socket I/O with
//! `block_on`, so callers stay single-threaded per rank.

use std::{net::SocketAddr, sync::Mutex, time::Duration};

use log::{debug, info};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::{
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    runtime::Runtime,
    time::sleep,
};

use crate::{
    CHIEF_RANK, Collective, CollectiveErr, Result,
    frame::{read_frame, write_frame},
};

const CONNECT_ATTEMPTS: usize = 50;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// First frame a joining peer sends so the chief can index it by rank.
#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    rank: usize,
}

struct Peer {
    rx: OwnedReadHalf,
    tx: OwnedWriteHalf,
    rx_buf: Vec<u8>,
    tx_buf: Vec<u8>,
}

impl Peer {
    fn new(stream: TcpStream) -> Self {
        let (rx, tx) = stream.into_split();
        Self {
            rx,
            tx,
            rx_buf: Vec::new(),
            tx_buf: Vec::new(),
        }
    }

    async fn send<T: Serialize>(&mut self, value: &T) -> std::io::Result<()> {
        write_frame(&mut self.tx, &mut self.tx_buf, value).await
    }

    async fn recv<T: DeserializeOwned>(&mut self) -> std::io::Result<T> {
        read_frame(&mut self.rx, &mut self.rx_buf).await
    }
}

enum Links {
    // Indexed by rank - 1.
    Chief(Vec<Peer>),
    Member(Peer),
}

/// A bound-but-not-yet-connected chief endpoint.
///
/// Splitting bind from accept lets callers bind to port 0 and publish the
/// real address to peers before blocking on `accept_peers`.
pub struct ChiefBinding {
    runtime: Runtime,
    listener: TcpListener,
    size: usize,
}

impl ChiefBinding {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Blocks until all `size - 1` peers have connected and announced their
    /// ranks, then returns the chief's group handle.
    pub fn accept_peers(self) -> Result<TcpGroup> {
        let Self {
            runtime,
            listener,
            size,
        } = self;

        let peers = runtime.block_on(async {
            let mut peers: Vec<Option<Peer>> = (1..size).map(|_| None).collect();

            for _ in 1..size {
                let (stream, addr) = listener.accept().await?;
                let mut peer = Peer::new(stream);
                let hello: Hello = peer.recv().await?;
                debug!(peer_rank = hello.rank; "peer connected from {addr}");

                let slot = hello
                    .rank
                    .checked_sub(1)
                    .and_then(|idx| peers.get_mut(idx))
                    .ok_or(CollectiveErr::BadPeerRank {
                        rank: hello.rank,
                        size,
                    })?;
                if slot.is_some() {
                    return Err(CollectiveErr::BadPeerRank {
                        rank: hello.rank,
                        size,
                    });
                }
                *slot = Some(peer);
            }

            // Every slot was filled exactly once above.
            Ok::<_, CollectiveErr>(peers.into_iter().flatten().collect::<Vec<_>>())
        })?;

        info!("rank group complete: {size} ranks");
        Ok(TcpGroup {
            rank: CHIEF_RANK,
            size,
            runtime,
            links: Mutex::new(Links::Chief(peers)),
        })
    }
}

/// One rank's handle into a TCP rank group.
pub struct TcpGroup {
    rank: usize,
    size: usize,
    runtime: Runtime,
    links: Mutex<Links>,
}

impl TcpGroup {
    /// Binds the chief endpoint for a group of `size` ranks.
    pub fn bind(addr: SocketAddr, size: usize) -> Result<ChiefBinding> {
        assert!(size > 0, "group size must be > 0");

        let runtime = Runtime::new()?;
        let listener = runtime.block_on(TcpListener::bind(addr))?;
        Ok(ChiefBinding {
            runtime,
            listener,
            size,
        })
    }

    /// Connects a non-chief rank to the chief at `addr`.
    ///
    /// Retries with a short backoff so peers may start before the chief has
    /// bound its listener.
    pub fn join(addr: SocketAddr, rank: usize, size: usize) -> Result<TcpGroup> {
        assert!(rank > 0 && rank < size, "join is for non-chief ranks");

        let runtime = Runtime::new()?;
        let peer = runtime.block_on(async {
            let mut attempt = 0;
            let stream = loop {
                match TcpStream::connect(addr).await {
                    Ok(stream) => break stream,
                    Err(e) if attempt + 1 < CONNECT_ATTEMPTS => {
                        debug!(rank = rank; "chief not reachable yet ({e}), retrying");
                        attempt += 1;
                        sleep(CONNECT_BACKOFF).await;
                    }
                    Err(e) => return Err(CollectiveErr::from(e)),
                }
            };

            let mut peer = Peer::new(stream);
            peer.send(&Hello { rank }).await?;
            Ok(peer)
        })?;

        Ok(TcpGroup {
            rank,
            size,
            runtime,
            links: Mutex::new(Links::Member(peer)),
        })
    }

    fn peer_err(rank: usize) -> impl FnOnce(std::io::Error) -> CollectiveErr {
        move |_| CollectiveErr::PeerUnavailable { rank }
    }
}

impl Collective for TcpGroup {
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
        let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());

        match &mut *links {
            Links::Chief(peers) => self.runtime.block_on(async {
                let mut values = Vec::with_capacity(self.size);
                values.push(value);

                for (idx, peer) in peers.iter_mut().enumerate() {
                    let received = peer.recv().await.map_err(Self::peer_err(idx + 1))?;
                    values.push(received);
                }

                Ok(Some(values))
            }),
            Links::Member(peer) => self.runtime.block_on(async {
                peer.send(&value)
                    .await
                    .map_err(Self::peer_err(CHIEF_RANK))?;
                Ok(None)
            }),
        }
    }

    fn broadcast<T>(&self, value: Option<T>) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());

        match &mut *links {
            Links::Chief(peers) => {
                let value = value.ok_or(CollectiveErr::MissingChiefValue)?;

                self.runtime.block_on(async {
                    for (idx, peer) in peers.iter_mut().enumerate() {
                        peer.send(&value).await.map_err(Self::peer_err(idx + 1))?;
                    }
                    Ok::<_, CollectiveErr>(())
                })?;

                Ok(value)
            }
            Links::Member(peer) => self.runtime.block_on(async {
                peer.recv().await.map_err(Self::peer_err(CHIEF_RANK))
            }),
        }
    }
}
