//! The ordered stream of workload commands for one run.

use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, RunnerErr},
    workload::{Workload, WorkloadKind, WorkloadResponse},
};

/// One entry of the externally supplied schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleOp {
    Train { num_batches: usize },
    Validate,
    Checkpoint,
}

/// The sequencer's whole position, persisted inside checkpoints.
///
/// Every schedule entry consumes one step id, so `last_completed_step_id`
/// alone pins the resume position; `cumulative_batches_processed` supplies
/// `total_batches_processed` for the next training workload. Replay resumes
/// exactly at the next unprocessed batch, never from scratch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencerState {
    pub cumulative_batches_processed: usize,
    pub last_completed_step_id: usize,
}

/// Emits workloads in schedule order, advancing only after the response for
/// the previous workload has been delivered, so a restart from checkpoint
/// never double-counts or skips.
#[derive(Debug)]
pub struct WorkloadSequencer {
    schedule: Vec<ScheduleOp>,
    state: SequencerState,
    outstanding: Option<Workload>,
}

impl WorkloadSequencer {
    pub fn new(schedule: Vec<ScheduleOp>) -> Self {
        Self {
            schedule,
            state: SequencerState::default(),
            outstanding: None,
        }
    }

    /// True once the schedule is fully consumed and acknowledged.
    pub fn is_exhausted(&self) -> bool {
        self.outstanding.is_none() && self.state.last_completed_step_id >= self.schedule.len()
    }

    /// Emits the next workload.
    ///
    /// # Errors
    /// `SequencerExhausted` once the schedule is consumed; a configuration
    /// error if the previous workload was never completed.
    pub fn next(&mut self) -> Result<Workload> {
        if self.outstanding.is_some() {
            return Err(RunnerErr::Config(
                "previous workload has not been completed".to_string(),
            ));
        }

        let idx = self.state.last_completed_step_id;
        let op = self.schedule.get(idx).ok_or(RunnerErr::SequencerExhausted)?;

        let (kind, num_batches) = match op {
            ScheduleOp::Train { num_batches } => (WorkloadKind::Train, *num_batches),
            ScheduleOp::Validate => (WorkloadKind::Validate, 0),
            ScheduleOp::Checkpoint => (WorkloadKind::Checkpoint, 0),
        };

        let workload = Workload {
            kind,
            step_id: idx + 1,
            num_batches,
            total_batches_processed: self.state.cumulative_batches_processed,
        };
        self.outstanding = Some(workload);
        Ok(workload)
    }

    /// Acknowledges the response for the outstanding workload and advances
    /// the counters. Training batches are only counted when the workload ran
    /// to completion; an invalid-hyperparameter response leaves the batch
    /// counter untouched.
    pub fn complete(&mut self, response: &WorkloadResponse) -> Result<()> {
        let workload = self.outstanding.take().ok_or_else(|| {
            RunnerErr::Config("no outstanding workload to complete".to_string())
        })?;

        self.state.last_completed_step_id = workload.step_id;
        if workload.kind == WorkloadKind::Train
            && !matches!(response, WorkloadResponse::InvalidHp { .. })
        {
            self.state.cumulative_batches_processed += workload.num_batches;
        }
        Ok(())
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    /// Restores a persisted position. Fails if a workload is in flight.
    pub fn load_state(&mut self, state: SequencerState) -> Result<()> {
        if self.outstanding.is_some() {
            return Err(RunnerErr::Config(
                "cannot load sequencer state with a workload in flight".to_string(),
            ));
        }
        self.state = state;
        Ok(())
    }
}
