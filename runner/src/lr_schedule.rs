//! Learning-rate step cadence.
//!
//! Cadence is evaluated against the effective optimizer step: with a
//! gradient-accumulation window of `k`, the optimizer only updates on every
//! k-th batch, and schedulers never step on batches where the optimizer does
//! not.

use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrStepMode {
    /// Step once per accumulated batch whose 1-based index is a multiple of
    /// `frequency`.
    EveryBatch,
    /// Step once per optimizer step whose 1-based batch index is a multiple
    /// of `frequency`.
    EveryOptimizerStep,
    /// Step once per epoch boundary the accumulation window crosses,
    /// filtered by `frequency`.
    EveryEpoch,
}

/// When one scheduler steps, relative to the batch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LrSchedulePolicy {
    pub mode: LrStepMode,
    pub frequency: NonZeroUsize,
}

impl LrSchedulePolicy {
    pub fn new(mode: LrStepMode, frequency: NonZeroUsize) -> Self {
        Self { mode, frequency }
    }
}

/// Number of scheduler steps due at `batch_idx`.
///
/// # Arguments
/// * `policy` - The scheduler's cadence.
/// * `batch_idx` - Global batch index being processed.
/// * `window` - Gradient-accumulation window (1 = update every batch).
/// * `epoch_len` - Batches per epoch, when the data source is finite.
pub fn steps_due(
    policy: LrSchedulePolicy,
    batch_idx: usize,
    window: NonZeroUsize,
    epoch_len: Option<NonZeroUsize>,
) -> usize {
    let window = window.get();
    // No optimizer update mid-accumulation-window, so no scheduler step.
    if (batch_idx + 1) % window != 0 {
        return 0;
    }

    let frequency = policy.frequency.get();
    match policy.mode {
        LrStepMode::EveryBatch => {
            let start = (batch_idx + 1).saturating_sub(window);
            (start..=batch_idx).filter(|i| (i + 1) % frequency == 0).count()
        }
        LrStepMode::EveryOptimizerStep => usize::from((batch_idx + 1) % frequency == 0),
        LrStepMode::EveryEpoch => {
            let Some(epoch_len) = epoch_len else {
                return 0;
            };
            let epoch_len = epoch_len.get();
            // Step for every epoch boundary the next optimizer step crosses.
            let epoch_idx = batch_idx / epoch_len;
            let next_batch_epoch_idx = (batch_idx + window) / epoch_len;
            (epoch_idx..next_batch_epoch_idx)
                .filter(|e| (e + 1) % frequency == 0)
                .count()
        }
    }
}
