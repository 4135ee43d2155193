use std::{error::Error, fmt, io};

use collective::CollectiveErr;

/// The runner module's result type.
pub type Result<T> = std::result::Result<T, RunnerErr>;

/// Runner failures.
///
/// Configuration and collective errors are fatal for the run; the
/// invalid-hyperparameter signal is not an error at all (see
/// `trial::StepOutcome::InvalidHp`), and checkpoint-restore gaps are logged
/// warnings rather than variants here.
#[derive(Debug)]
pub enum RunnerErr {
    /// Invalid run configuration, caught as early as possible.
    Config(String),
    /// A collective call failed; the rank group is no longer usable.
    Collective(CollectiveErr),
    Io(io::Error),
    Codec(serde_json::Error),
    /// The external schedule is fully consumed.
    SequencerExhausted,
    /// Validation metric names changed between batches.
    MetricKeyMismatch {
        expected: Vec<String>,
        got: Vec<String>,
    },
    /// A per-metric reducer map does not cover exactly the metric key set.
    ReducerKeyMismatch {
        expected: Vec<String>,
        provided: Vec<String>,
    },
    /// A rank that loads data produced an empty batch.
    EmptyBatch { rank: usize },
}

impl fmt::Display for RunnerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerErr::Config(msg) => write!(f, "invalid configuration: {msg}"),
            RunnerErr::Collective(e) => write!(f, "collective error: {e}"),
            RunnerErr::Io(e) => write!(f, "io error: {e}"),
            RunnerErr::Codec(e) => write!(f, "codec error: {e}"),
            RunnerErr::SequencerExhausted => write!(f, "workload sequencer exhausted"),
            RunnerErr::MetricKeyMismatch { expected, got } => write!(
                f,
                "validation metric names must match across all batches: \
                 expected {expected:?}, got {got:?}"
            ),
            RunnerErr::ReducerKeyMismatch { expected, provided } => write!(
                f,
                "provide a single evaluation reducer or one per validation metric: \
                 expected keys {expected:?}, provided keys {provided:?}"
            ),
            RunnerErr::EmptyBatch { rank } => {
                write!(f, "batch must be non-empty on rank {rank}")
            }
        }
    }
}

impl Error for RunnerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RunnerErr::Collective(e) => Some(e),
            RunnerErr::Io(e) => Some(e),
            RunnerErr::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CollectiveErr> for RunnerErr {
    fn from(value: CollectiveErr) -> Self {
        Self::Collective(value)
    }
}

impl From<io::Error> for RunnerErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for RunnerErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Codec(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<RunnerErr> for io::Error {
    fn from(value: RunnerErr) -> Self {
        match value {
            RunnerErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
