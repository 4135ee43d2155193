//! The pluggable train/evaluate step.
//!
//! The engine only knows "run one batch, get back a metrics record"; the
//! forward/backward pass behind `train_batch` is an opaque blocking call.

use std::path::Path;

use crate::{
    data::DataLoader,
    error::Result,
    metrics::{MetricsMap, Reducer, ReducerSpec},
};

/// What one step produced.
///
/// `InvalidHp` is the single expected/recoverable signal: the current
/// hyperparameters make training impossible. It is carried as a value to the
/// workload boundary, never thrown across layers.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Metrics(MetricsMap),
    /// A bare loss, normalized by the runner into a one-key `loss` map.
    Loss(f64),
    InvalidHp(String),
}

/// How validation metrics are computed. Chosen once at construction; the
/// runner rejects setups whose loaders do not match the declared mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationMode {
    /// Every reporting rank evaluates its shard batch by batch
    /// (parallelizable, recommended).
    PerBatch,
    /// The rank with data-parallel rank 0 evaluates the whole dataset in a
    /// single process.
    FullDataset,
}

/// One rank's slice of the model under training.
pub trait Trial {
    type Batch;

    /// Runs one training batch.
    ///
    /// `batch` is `None` on ranks that build no data loader (intermediate
    /// pipeline stages); such ranks still participate in the step.
    fn train_batch(
        &mut self,
        batch: Option<&Self::Batch>,
        epoch_idx: usize,
        batch_idx: usize,
    ) -> Result<StepOutcome>;

    /// Counts the records in a batch. Must be positive for any rank that
    /// reports metrics.
    fn batch_length(&self, batch: &Self::Batch) -> usize;

    fn evaluation_mode(&self) -> EvaluationMode {
        EvaluationMode::PerBatch
    }

    /// Computes validation metrics for one batch (`PerBatch` mode).
    fn evaluate_batch(
        &mut self,
        batch: Option<&Self::Batch>,
        batch_idx: usize,
    ) -> Result<StepOutcome> {
        let (_, _) = (batch, batch_idx);
        Err(crate::error::RunnerErr::Config(
            "evaluate_batch is not implemented for this trial".to_string(),
        ))
    }

    /// Computes validation metrics over the whole dataset (`FullDataset`
    /// mode).
    fn evaluate_full_dataset(
        &mut self,
        loader: &mut dyn DataLoader<Batch = Self::Batch>,
    ) -> Result<StepOutcome> {
        let _ = loader;
        Err(crate::error::RunnerErr::Config(
            "evaluate_full_dataset is not implemented for this trial".to_string(),
        ))
    }

    /// Reducer(s) for validation metrics.
    fn evaluation_reducer(&self) -> ReducerSpec {
        ReducerSpec::Single(Reducer::Avg)
    }

    /// Steps the scheduler paired with `LrSchedulePolicy` index `index`.
    fn step_lr_scheduler(&mut self, index: usize) {
        let _ = index;
    }

    /// Polled after every train/validate workload.
    fn stop_requested(&self) -> bool {
        false
    }

    /// Tag recorded in checkpoint manifests.
    fn framework(&self) -> &str {
        "custom"
    }

    /// Writes this trial's state under `dir`. Called on the chief during a
    /// checkpoint save; the canonical file is the first entry of
    /// `checkpoint::TRIAL_STATE_PATHS`.
    fn save(&mut self, dir: &Path) -> Result<()> {
        let _ = dir;
        Ok(())
    }

    /// Restores this trial's state from the resolved state file. Called on
    /// every rank during restore.
    fn load(&mut self, state_file: &Path) -> Result<()> {
        let _ = state_file;
        Ok(())
    }
}
