//! The per-rank batch loop: training, validation, and the drive loop that
//! consumes the workload sequencer.

use std::{collections::BTreeMap, num::NonZeroUsize, time::Instant};

use collective::Collective;
use log::{debug, info, warn};
use rand::rngs::StdRng;

use crate::{
    callback::Callback,
    checkpoint::{RngState, Storage},
    data::DataLoader,
    error::{Result, RunnerErr},
    lr_schedule::{LrSchedulePolicy, steps_due},
    metrics::{
        self, MetricValue, MetricsMap, RunnerTimings, combine_across_ranks, prepare_reducers,
        reduce_batches, reduce_ranks, summarize_batches,
    },
    sequencer::{SequencerState, WorkloadSequencer},
    topology::RankTopology,
    trial::{EvaluationMode, StepOutcome, Trial},
    workload::{ReducedMetrics, ValidationResult, WorkloadKind, WorkloadResponse},
};

const LOSS_KEY: &str = "loss";

/// Knobs fixed for the lifetime of a run, identical on every rank.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Gradient-accumulation window: the optimizer updates every n-th batch.
    pub accumulation_window: NonZeroUsize,
    /// Records per batch, used to size full-dataset validation.
    pub per_rank_batch_size: usize,
    /// Rank-average training metrics instead of reporting the chief's own.
    pub average_training_metrics: bool,
    /// One cadence policy per scheduler the trial owns, in index order.
    pub lr_schedules: Vec<LrSchedulePolicy>,
    pub seed: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            accumulation_window: NonZeroUsize::MIN,
            per_rank_batch_size: 1,
            average_training_metrics: true,
            lr_schedules: Vec::new(),
            seed: 0,
        }
    }
}

/// Owns one rank's mutable run state and executes workloads against it.
///
/// Every collective call below is reached by every rank in the same order;
/// that call-order discipline is the protocol, so branches that skip work on
/// some ranks still route those ranks through the same collectives.
pub struct BatchRunner<C: Collective, T: Trial> {
    pub(crate) cfg: RunnerConfig,
    pub(crate) topology: RankTopology,
    pub(crate) channel: C,
    pub(crate) trial: T,
    pub(crate) training_loader: Option<Box<dyn DataLoader<Batch = T::Batch>>>,
    pub(crate) validation_loader: Option<Box<dyn DataLoader<Batch = T::Batch>>>,
    pub(crate) callbacks: Vec<Box<dyn Callback>>,
    pub(crate) timings: RunnerTimings,
    pub(crate) rng: StdRng,
    pub(crate) rng_state: RngState,
    pub(crate) epoch_len: Option<NonZeroUsize>,
}

impl<C: Collective, T: Trial> BatchRunner<C, T> {
    /// Builds a runner, validating the configuration eagerly and agreeing on
    /// the per-rank epoch length across the group. Every rank must construct
    /// its runner together.
    ///
    /// # Errors
    /// Configuration errors: loader presence not matching the topology, a
    /// zero batch size, or a channel that disagrees with the topology.
    pub fn new(
        cfg: RunnerConfig,
        topology: RankTopology,
        channel: C,
        trial: T,
        training_loader: Option<Box<dyn DataLoader<Batch = T::Batch>>>,
        validation_loader: Option<Box<dyn DataLoader<Batch = T::Batch>>>,
        callbacks: Vec<Box<dyn Callback>>,
    ) -> Result<Self> {
        if channel.rank() != topology.global_rank() || channel.size() != topology.global_size() {
            return Err(RunnerErr::Config(format!(
                "collective channel (rank {} of {}) disagrees with topology (rank {} of {})",
                channel.rank(),
                channel.size(),
                topology.global_rank(),
                topology.global_size()
            )));
        }
        if cfg.per_rank_batch_size == 0 {
            return Err(RunnerErr::Config("per_rank_batch_size must be > 0".to_string()));
        }
        if topology.build_data_loader() && training_loader.is_none() {
            return Err(RunnerErr::Config(format!(
                "rank {} builds data loaders but no training loader was supplied",
                topology.global_rank()
            )));
        }
        if !topology.build_data_loader() && training_loader.is_some() {
            return Err(RunnerErr::Config(format!(
                "rank {} must not build data loaders but a training loader was supplied",
                topology.global_rank()
            )));
        }
        match trial.evaluation_mode() {
            EvaluationMode::PerBatch => {
                if topology.build_data_loader() && validation_loader.is_none() {
                    return Err(RunnerErr::Config(format!(
                        "per-batch evaluation needs a validation loader on rank {}",
                        topology.global_rank()
                    )));
                }
            }
            EvaluationMode::FullDataset => {
                let evaluates = topology.data_parallel_rank() == 0 && topology.report_metrics();
                if evaluates && validation_loader.is_none() {
                    return Err(RunnerErr::Config(format!(
                        "full-dataset evaluation needs a validation loader on rank {}",
                        topology.global_rank()
                    )));
                }
            }
        }

        let rng_state = RngState::new(cfg.seed);
        let rng = rng_state.rng();

        let mut runner = Self {
            cfg,
            topology,
            channel,
            trial,
            training_loader,
            validation_loader,
            callbacks,
            timings: RunnerTimings::default(),
            rng,
            rng_state,
            epoch_len: None,
        };
        runner.epoch_len = runner.agree_epoch_length()?;
        if let Some(epoch_len) = runner.epoch_len {
            debug!(epoch_len = epoch_len.get(); "agreed per-rank epoch length");
        }
        Ok(runner)
    }

    /// Gathers each loading rank's epoch length; the chief takes the minimum
    /// and shares it. Mismatching shard lengths are a warning, not an error,
    /// and the shorter length wins so all ranks stay in step.
    fn agree_epoch_length(&self) -> Result<Option<NonZeroUsize>> {
        let local = self.training_loader.as_ref().and_then(|l| l.len());
        if self.topology.global_size() == 1 {
            return Ok(local.and_then(NonZeroUsize::new));
        }

        let gathered = self.channel.gather(local)?;
        let decided = match gathered {
            Some(lengths) => {
                let present: Vec<usize> = lengths.into_iter().flatten().collect();
                let min = present.iter().copied().min();
                if let Some(min) = min
                    && present.iter().any(|l| *l != min)
                {
                    warn!(
                        epoch_len = min;
                        "training shard lengths differ across ranks, using the shortest"
                    );
                }
                Some(min)
            }
            None => None,
        };
        let agreed: Option<usize> = self.channel.broadcast(decided)?;
        Ok(agreed.and_then(NonZeroUsize::new))
    }

    /// Runs one training workload.
    ///
    /// Only the chief returns a populated response; every other rank returns
    /// `Empty` (or `InvalidHp`, which all ranks raise together).
    pub fn run_training_workload(
        &mut self,
        step_id: usize,
        num_batches: usize,
        total_batches_processed: usize,
    ) -> Result<WorkloadResponse> {
        // A zero-batch workload completes without touching the step function
        // or the network.
        if num_batches == 0 {
            return Ok(self.chief_response(WorkloadResponse::Train {
                metrics: ReducedMetrics::default(),
                stop_requested: self.trial.stop_requested(),
            }));
        }

        info!(step_id = step_id, num_batches = num_batches; "running training workload");

        let mut per_batch_metrics: Vec<MetricsMap> = Vec::new();
        let mut num_inputs = 0usize;

        for offset in 0..num_batches {
            let batch_idx = total_batches_processed + offset;
            let epoch_idx = self
                .epoch_len
                .map(|e| batch_idx / e.get())
                .unwrap_or_default();
            if let Some(epoch_len) = self.epoch_len
                && batch_idx % epoch_len.get() == 0
            {
                for cb in &mut self.callbacks {
                    cb.on_training_epoch_start(epoch_idx);
                }
            }

            let started = Instant::now();
            let batch = match &mut self.training_loader {
                Some(loader) => Some(loader.next_batch().ok_or_else(|| {
                    RunnerErr::Config("training data source ran dry mid-workload".to_string())
                })?),
                None => None,
            };
            self.timings.data_time += started.elapsed();

            let local_inputs = batch.as_ref().map(|b| self.trial.batch_length(b));
            let batch_inputs = self.agree_batch_inputs(local_inputs)?;
            num_inputs += batch_inputs;

            let started = Instant::now();
            let outcome = self.trial.train_batch(batch.as_ref(), epoch_idx, batch_idx)?;
            self.timings.step_time += started.elapsed();
            self.timings.bump_batch();
            self.timings.add_samples(batch_inputs);

            match outcome {
                StepOutcome::Metrics(map) => {
                    if self.topology.report_metrics() {
                        per_batch_metrics.push(map);
                    }
                }
                StepOutcome::Loss(loss) => {
                    if self.topology.report_metrics() {
                        let mut map = MetricsMap::new();
                        map.insert(LOSS_KEY.to_string(), MetricValue::Scalar(loss));
                        per_batch_metrics.push(map);
                    }
                }
                StepOutcome::InvalidHp(reason) => {
                    warn!(step_id = step_id, batch_idx = batch_idx, reason = reason.as_str();
                        "trial reported invalid hyperparameters, abandoning workload");
                    return Ok(WorkloadResponse::InvalidHp { reason });
                }
            }

            for (index, policy) in self.cfg.lr_schedules.iter().enumerate() {
                let due = steps_due(*policy, batch_idx, self.cfg.accumulation_window, self.epoch_len);
                for _ in 0..due {
                    self.trial.step_lr_scheduler(index);
                }
            }

            if let Some(epoch_len) = self.epoch_len
                && (batch_idx + 1) % epoch_len.get() == 0
            {
                for cb in &mut self.callbacks {
                    cb.on_training_epoch_end(epoch_idx);
                }
            }
        }

        let started = Instant::now();
        let mut batch_metrics = per_batch_metrics;
        if self.channel.size() > 1 && self.cfg.average_training_metrics {
            let columns = metric_columns(&batch_metrics);
            if let Some((combined, _)) =
                combine_across_ranks(&self.channel, columns, num_batches)?
            {
                batch_metrics = metrics::average_training_metrics(&combined, num_batches);
            }
        }

        let dp_world = self.topology.data_parallel_world_size();
        if dp_world > 1 {
            num_inputs *= dp_world;
        }
        let avg_metrics = summarize_batches(&batch_metrics);
        self.timings.reduce_time += started.elapsed();

        for cb in &mut self.callbacks {
            cb.on_training_workload_end(&avg_metrics, &batch_metrics);
        }

        Ok(self.chief_response(WorkloadResponse::Train {
            metrics: ReducedMetrics {
                avg_metrics,
                batch_metrics,
                num_inputs,
            },
            stop_requested: self.trial.stop_requested(),
        }))
    }

    /// Agrees on the record count of the current batch.
    ///
    /// The chief asserts every loading rank produced a non-empty batch, takes
    /// the first reported length as authoritative, and shares it, so running
    /// totals stay numerically identical on every rank, including ranks with
    /// no local data.
    fn agree_batch_inputs(&self, local: Option<usize>) -> Result<usize> {
        if self.channel.size() == 1 {
            let Some(inputs) = local else {
                return Err(RunnerErr::Config("no rank produced a batch".to_string()));
            };
            if inputs == 0 {
                return Err(RunnerErr::EmptyBatch { rank: 0 });
            }
            return Ok(inputs);
        }

        let gathered = self.channel.gather(local)?;
        let decided = match gathered {
            Some(lengths) => {
                for (rank, inputs) in lengths.iter().enumerate() {
                    if *inputs == Some(0) {
                        return Err(RunnerErr::EmptyBatch { rank });
                    }
                }
                Some(lengths.into_iter().flatten().next().ok_or_else(|| {
                    RunnerErr::Config("no rank produced a batch".to_string())
                })?)
            }
            None => None,
        };
        Ok(self.channel.broadcast(decided)?)
    }

    /// Runs one validation workload in whichever mode the trial declared.
    pub fn run_validation_workload(&mut self) -> Result<WorkloadResponse> {
        for cb in &mut self.callbacks {
            cb.on_validation_start();
        }
        match self.trial.evaluation_mode() {
            EvaluationMode::PerBatch => self.validate_per_batch(),
            EvaluationMode::FullDataset => self.validate_full_dataset(),
        }
    }

    fn validate_per_batch(&mut self) -> Result<WorkloadResponse> {
        let reporting = self.topology.report_metrics();

        let local_len = match &mut self.validation_loader {
            Some(loader) => {
                loader.reset();
                loader.len()
            }
            None => None,
        };
        let num_batches = self.agree_validation_length(local_len)?;

        let mut keys: Option<Vec<String>> = None;
        let mut columns: BTreeMap<String, Vec<MetricValue>> = BTreeMap::new();
        let mut num_inputs = 0usize;
        let mut invalid: Option<String> = None;

        for batch_idx in 0..num_batches {
            let batch = match &mut self.validation_loader {
                Some(loader) => loader.next_batch(),
                None => None,
            };
            if reporting && let Some(b) = &batch {
                num_inputs += self.trial.batch_length(b);
            }

            let outcome = self.trial.evaluate_batch(batch.as_ref(), batch_idx)?;
            let map = match outcome {
                StepOutcome::Metrics(map) => map,
                StepOutcome::Loss(loss) => {
                    let mut map = MetricsMap::new();
                    map.insert(LOSS_KEY.to_string(), MetricValue::Scalar(loss));
                    map
                }
                StepOutcome::InvalidHp(reason) => {
                    invalid = Some(reason);
                    break;
                }
            };
            if !reporting {
                continue;
            }

            let got: Vec<String> = map.keys().cloned().collect();
            match &keys {
                None => keys = Some(got),
                Some(expected) if *expected != got => {
                    return Err(RunnerErr::MetricKeyMismatch {
                        expected: expected.clone(),
                        got,
                    });
                }
                Some(_) => {}
            }
            for (name, value) in map {
                columns.entry(name).or_default().push(value);
            }
        }

        // The invalid-hp signal is deterministic across ranks (every rank
        // evaluated the same batches), so all ranks bail here together.
        if let Some(reason) = invalid {
            warn!(reason = reason.as_str();
                "trial reported invalid hyperparameters during validation");
            return Ok(WorkloadResponse::InvalidHp { reason });
        }

        let agreed_keys = self.agree_metric_keys(keys.unwrap_or_default())?;
        // Resolved on every rank so a reducer misconfiguration fails the
        // whole group, not just the chief.
        let reducers = prepare_reducers(&self.trial.evaluation_reducer(), &agreed_keys)?;

        let mut local_reduced: BTreeMap<String, Option<MetricValue>> = BTreeMap::new();
        for key in &agreed_keys {
            let reduced = match columns.get(key) {
                Some(values) if !values.is_empty() => {
                    Some(reduce_batches(reducers[key], key, values)?)
                }
                _ => None,
            };
            local_reduced.insert(key.clone(), reduced);
        }

        let local_batches = if reporting { num_batches } else { 0 };
        let (validation_metrics, num_inputs) = if self.channel.size() > 1 {
            let gathered = self
                .channel
                .gather((local_reduced, local_batches, num_inputs))?;
            let decided = match gathered {
                Some(all) => {
                    let total_inputs: usize = all.iter().map(|(_, _, n)| *n).sum();
                    let reported: Vec<_> = all
                        .into_iter()
                        .filter(|(m, n, _)| *n > 0 && m.values().any(Option::is_some))
                        .collect();
                    let counts: Vec<usize> = reported.iter().map(|(_, n, _)| *n).collect();

                    let mut reduced = MetricsMap::new();
                    for key in &agreed_keys {
                        let per_rank: Vec<Option<MetricValue>> = reported
                            .iter()
                            .map(|(m, _, _)| m.get(key).cloned().flatten())
                            .collect();
                        if let Some(value) =
                            reduce_ranks(reducers[key], key, &per_rank, &counts)?
                        {
                            reduced.insert(key.clone(), value);
                        }
                    }
                    Some((reduced, total_inputs))
                }
                None => None,
            };
            // Shared with every rank so on_validation_end sees final values.
            self.channel.broadcast(decided)?
        } else {
            let mut reduced = MetricsMap::new();
            for (key, value) in local_reduced {
                if let Some(value) = value {
                    reduced.insert(key, value);
                }
            }
            (reduced, num_inputs)
        };

        for cb in &mut self.callbacks {
            cb.on_validation_end(&validation_metrics);
        }

        Ok(self.chief_response(WorkloadResponse::Validate {
            metrics: ValidationResult {
                num_inputs,
                validation_metrics,
            },
            stop_requested: self.trial.stop_requested(),
        }))
    }

    /// Gathers validation shard lengths, warns on mismatch, and shares the
    /// minimum so every reporting rank evaluates the same number of batches.
    fn agree_validation_length(&self, local: Option<usize>) -> Result<usize> {
        let fail = || {
            RunnerErr::Config(
                "per-batch validation needs a finite loader on some rank".to_string(),
            )
        };
        if self.channel.size() == 1 {
            return local.ok_or_else(fail);
        }

        let gathered = self.channel.gather(local)?;
        let decided = match gathered {
            Some(lengths) => {
                let present: Vec<usize> = lengths.into_iter().flatten().collect();
                let min = present.iter().copied().min().ok_or_else(fail)?;
                if present.iter().any(|l| *l != min) {
                    warn!(num_batches = min;
                        "validation shard lengths differ across ranks, truncating to shortest");
                }
                Some(min)
            }
            None => None,
        };
        Ok(self.channel.broadcast(decided)?)
    }

    /// Agrees on the validation metric key set: the chief takes the first
    /// rank that reported any keys and shares its set.
    fn agree_metric_keys(&self, local: Vec<String>) -> Result<Vec<String>> {
        if self.channel.size() == 1 {
            return Ok(local);
        }
        let gathered = self.channel.gather(local)?;
        let decided =
            gathered.map(|all| all.into_iter().find(|keys| !keys.is_empty()).unwrap_or_default());
        Ok(self.channel.broadcast(decided)?)
    }

    fn validate_full_dataset(&mut self) -> Result<WorkloadResponse> {
        let evaluates =
            self.topology.data_parallel_rank() == 0 && self.topology.report_metrics();

        // (metrics, num_inputs, invalid-hp reason) from the evaluating rank.
        let local: Option<(MetricsMap, usize, Option<String>)> = if evaluates {
            let loader = self.validation_loader.as_mut().ok_or_else(|| {
                RunnerErr::Config("full-dataset evaluation needs a validation loader".to_string())
            })?;
            loader.reset();
            let num_inputs = loader.len().unwrap_or_default() * self.cfg.per_rank_batch_size;
            let outcome = self.trial.evaluate_full_dataset(&mut **loader)?;
            Some(match outcome {
                StepOutcome::Metrics(map) => (map, num_inputs, None),
                StepOutcome::Loss(loss) => {
                    let mut map = MetricsMap::new();
                    map.insert(LOSS_KEY.to_string(), MetricValue::Scalar(loss));
                    (map, num_inputs, None)
                }
                // Carried through the collectives below so the whole group
                // sees the signal, not just the evaluating rank.
                StepOutcome::InvalidHp(reason) => (MetricsMap::new(), 0, Some(reason)),
            })
        } else {
            None
        };

        let (validation_metrics, num_inputs, invalid) = if self.channel.size() > 1 {
            let gathered = self.channel.gather(local)?;
            let decided =
                gathered.map(|all| all.into_iter().flatten().next().unwrap_or_default());
            self.channel.broadcast(decided)?
        } else {
            local.ok_or_else(|| {
                RunnerErr::Config("full-dataset evaluation ran on no rank".to_string())
            })?
        };

        if let Some(reason) = invalid {
            warn!(reason = reason.as_str();
                "trial reported invalid hyperparameters during validation");
            return Ok(WorkloadResponse::InvalidHp { reason });
        }

        for cb in &mut self.callbacks {
            cb.on_validation_end(&validation_metrics);
        }

        Ok(self.chief_response(WorkloadResponse::Validate {
            metrics: ValidationResult {
                num_inputs,
                validation_metrics,
            },
            stop_requested: self.trial.stop_requested(),
        }))
    }

    /// Drives the sequencer to exhaustion, checkpointing through `storage`.
    ///
    /// Returned responses are chief-populated only; non-chief ranks collect
    /// `Empty` entries. A trial's stop request is reported in the responses
    /// and left to the external caller, the schedule itself runs to the end.
    pub fn run<S: Storage>(
        &mut self,
        sequencer: &mut WorkloadSequencer,
        storage: &S,
    ) -> Result<Vec<WorkloadResponse>> {
        for cb in &mut self.callbacks {
            cb.on_training_start();
        }

        let mut responses = Vec::new();
        loop {
            let workload = match sequencer.next() {
                Ok(workload) => workload,
                Err(RunnerErr::SequencerExhausted) => break,
                Err(e) => return Err(e),
            };

            let response = match workload.kind {
                WorkloadKind::Train => self.run_training_workload(
                    workload.step_id,
                    workload.num_batches,
                    workload.total_batches_processed,
                )?,
                WorkloadKind::Validate => self.run_validation_workload()?,
                WorkloadKind::Checkpoint => {
                    // Snapshot the position as of this workload completing,
                    // so a restore resumes after the checkpoint.
                    let snapshot = SequencerState {
                        cumulative_batches_processed: sequencer
                            .state()
                            .cumulative_batches_processed,
                        last_completed_step_id: workload.step_id,
                    };
                    self.run_checkpoint_workload(storage, snapshot)?
                }
            };

            sequencer.complete(&response)?;
            responses.push(if self.topology.is_chief() {
                response
            } else {
                WorkloadResponse::Empty
            });
        }

        for cb in &mut self.callbacks {
            cb.on_trial_shutdown();
        }
        Ok(responses)
    }

    fn chief_response(&self, response: WorkloadResponse) -> WorkloadResponse {
        if self.topology.is_chief() {
            response
        } else {
            WorkloadResponse::Empty
        }
    }

    pub fn topology(&self) -> &RankTopology {
        &self.topology
    }

    pub fn timings(&self) -> &RunnerTimings {
        &self.timings
    }

    pub fn trial(&self) -> &T {
        &self.trial
    }

    pub fn trial_mut(&mut self) -> &mut T {
        &mut self.trial
    }

    /// The run's deterministic RNG, persisted across checkpoints.
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

/// Turns per-batch metric maps into per-name columns, padding batches where
/// a name is absent.
fn metric_columns(batch_metrics: &[MetricsMap]) -> BTreeMap<String, Vec<Option<MetricValue>>> {
    let mut names: Vec<&String> = batch_metrics.iter().flat_map(|m| m.keys()).collect();
    names.sort();
    names.dedup();

    names
        .into_iter()
        .map(|name| {
            let column = batch_metrics.iter().map(|m| m.get(name).cloned()).collect();
            (name.clone(), column)
        })
        .collect()
}
