use std::{error::Error, fmt, io};

/// The collective module's result type.
pub type Result<T> = std::result::Result<T, CollectiveErr>;

/// Collective transport failures.
///
/// Any peer dying mid-collective is unrecoverable for the run; the variants
/// exist so the caller can name the failure, not so it can continue.
#[derive(Debug)]
pub enum CollectiveErr {
    Io(io::Error),
    Codec(serde_json::Error),
    /// A peer disconnected or never arrived at a collective call.
    PeerUnavailable { rank: usize },
    /// `broadcast` was called on the chief without a value.
    MissingChiefValue,
    /// A joining peer announced a rank outside `0..size` or one already taken.
    BadPeerRank { rank: usize, size: usize },
}

impl fmt::Display for CollectiveErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectiveErr::Io(e) => write!(f, "io error: {e}"),
            CollectiveErr::Codec(e) => write!(f, "codec error: {e}"),
            CollectiveErr::PeerUnavailable { rank } => {
                write!(f, "peer unavailable: rank {rank} left the group mid-collective")
            }
            CollectiveErr::MissingChiefValue => {
                write!(f, "broadcast requires a value on the chief")
            }
            CollectiveErr::BadPeerRank { rank, size } => {
                write!(f, "bad peer rank {rank} for group of size {size}")
            }
        }
    }
}

impl Error for CollectiveErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CollectiveErr::Io(e) => Some(e),
            CollectiveErr::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CollectiveErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for CollectiveErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Codec(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<CollectiveErr> for io::Error {
    fn from(value: CollectiveErr) -> Self {
        match value {
            CollectiveErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
