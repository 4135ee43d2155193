//! Workload commands and the responses returned to the external orchestrator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::metrics::MetricsMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadKind {
    Train,
    Validate,
    Checkpoint,
}

/// One unit of externally issued work, immutable once issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub kind: WorkloadKind,
    pub step_id: usize,
    pub num_batches: usize,
    pub total_batches_processed: usize,
}

/// The training-step result, only ever constructed on the chief.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReducedMetrics {
    pub avg_metrics: MetricsMap,
    pub batch_metrics: Vec<MetricsMap>,
    pub num_inputs: usize,
}

/// The validation result, same chief-only visibility rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub num_inputs: usize,
    pub validation_metrics: MetricsMap,
}

/// One checkpoint's identity and contents, reported by the chief.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub uuid: String,
    /// Relative path of every file any rank wrote, with its size in bytes.
    pub resources: BTreeMap<String, u64>,
    pub framework: String,
    pub format: String,
}

/// What a workload produced.
///
/// Non-chief ranks always hand `Empty` to the external caller so results are
/// never double-reported; `InvalidHp` is the one recoverable outcome, carried
/// as a value rather than an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkloadResponse {
    Train {
        metrics: ReducedMetrics,
        stop_requested: bool,
    },
    Validate {
        metrics: ValidationResult,
        stop_requested: bool,
    },
    Checkpoint(CheckpointManifest),
    InvalidHp {
        reason: String,
    },
    Empty,
}

impl WorkloadResponse {
    pub fn is_empty(&self) -> bool {
        matches!(self, WorkloadResponse::Empty)
    }
}
