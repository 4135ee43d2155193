pub mod callback;
pub mod checkpoint;
pub mod data;
pub mod error;
pub mod lr_schedule;
pub mod metrics;
pub mod runner;
pub mod sequencer;
pub mod topology;
pub mod trial;
pub mod workload;

pub use callback::Callback;
pub use checkpoint::{LocalStorage, Storage};
pub use error::{Result, RunnerErr};
pub use runner::{BatchRunner, RunnerConfig};
pub use sequencer::{ScheduleOp, SequencerState, WorkloadSequencer};
pub use topology::RankTopology;
pub use trial::{EvaluationMode, StepOutcome, Trial};
pub use workload::{Workload, WorkloadKind, WorkloadResponse};
