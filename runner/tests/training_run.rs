//! End-to-end runs over in-process rank groups, one thread per rank.

use std::{env, fs, num::NonZeroUsize, path::PathBuf, thread};

use collective::LocalGroup;
use runner::{
    BatchRunner, LocalStorage, RankTopology, Result, RunnerConfig, RunnerErr, ScheduleOp,
    SequencerState, StepOutcome, Trial, WorkloadResponse, WorkloadSequencer,
    data::{DataLoader, InMemoryLoader, ShardSpec},
    metrics::{MetricValue, MetricsMap},
};

/// Reports a constant per-rank loss so cross-rank averages are predictable.
struct FlatTrial {
    loss: f64,
}

impl Trial for FlatTrial {
    type Batch = Vec<f64>;

    fn train_batch(
        &mut self,
        _batch: Option<&Vec<f64>>,
        _epoch_idx: usize,
        _batch_idx: usize,
    ) -> Result<StepOutcome> {
        Ok(StepOutcome::Loss(self.loss))
    }

    fn evaluate_batch(&mut self, batch: Option<&Vec<f64>>, _batch_idx: usize) -> Result<StepOutcome> {
        let acc = batch
            .map(|b| b.iter().sum::<f64>() / b.len().max(1) as f64)
            .unwrap_or_default();
        let mut map = MetricsMap::new();
        map.insert("acc".to_string(), MetricValue::Scalar(acc));
        Ok(StepOutcome::Metrics(map))
    }

    fn batch_length(&self, batch: &Vec<f64>) -> usize {
        batch.len()
    }
}

fn boxed_loader(batches: Vec<Vec<f64>>, repeat: bool) -> Box<InMemoryLoader<Vec<f64>>> {
    Box::new(InMemoryLoader::new(batches, ShardSpec::whole(), repeat))
}

fn two_rank_runner(
    rank: usize,
    channel: LocalGroup,
    loss: f64,
    batches: Vec<Vec<f64>>,
) -> BatchRunner<LocalGroup, FlatTrial> {
    BatchRunner::new(
        RunnerConfig::default(),
        RankTopology::data_parallel(rank, 2),
        channel,
        FlatTrial { loss },
        Some(boxed_loader(batches.clone(), true)),
        Some(boxed_loader(batches, false)),
        Vec::new(),
    )
    .unwrap()
}

fn temp_root(tag: &str) -> PathBuf {
    let dir = env::temp_dir().join(format!("runner-it-{tag}-{:016x}", rand_suffix()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn rand_suffix() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .subsec_nanos() as u64;
    nanos.wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ std::process::id() as u64
}

#[test]
fn chief_num_inputs_scales_by_data_parallel_world_size() {
    let mut joins = Vec::new();
    for (rank, channel) in LocalGroup::group(2).into_iter().enumerate() {
        joins.push(thread::spawn(move || {
            let loss = if rank == 0 { 1.0 } else { 3.0 };
            let batches = vec![vec![1.0; 3]; 4];
            let mut runner = two_rank_runner(rank, channel, loss, batches);
            runner.run_training_workload(1, 4, 0).unwrap()
        }));
    }

    let responses: Vec<WorkloadResponse> = joins.into_iter().map(|j| j.join().unwrap()).collect();

    match &responses[0] {
        WorkloadResponse::Train { metrics, .. } => {
            // 4 batches of 3 records per rank, times 2 data-parallel ranks.
            assert_eq!(metrics.num_inputs, 24);
            // Losses 1.0 and 3.0 rank-average to 2.0 on every batch.
            assert_eq!(metrics.avg_metrics["loss"], MetricValue::Scalar(2.0));
            assert_eq!(metrics.batch_metrics.len(), 4);
        }
        other => panic!("expected a train response on the chief, got {other:?}"),
    }
    assert_eq!(responses[1], WorkloadResponse::Empty);
}

#[test]
fn validation_weights_ranks_by_batch_count() {
    let mut joins = Vec::new();
    for (rank, channel) in LocalGroup::group(2).into_iter().enumerate() {
        joins.push(thread::spawn(move || {
            // Rank 0 sees accuracy 1.0, rank 1 sees 3.0, over equal shards.
            let value = if rank == 0 { 1.0 } else { 3.0 };
            let batches = vec![vec![value; 2]; 2];
            let mut runner = two_rank_runner(rank, channel, 0.0, batches);
            runner.run_validation_workload().unwrap()
        }));
    }

    let responses: Vec<WorkloadResponse> = joins.into_iter().map(|j| j.join().unwrap()).collect();

    match &responses[0] {
        WorkloadResponse::Validate { metrics, .. } => {
            assert_eq!(metrics.validation_metrics["acc"], MetricValue::Scalar(2.0));
            // 2 batches of 2 records on each of the 2 ranks.
            assert_eq!(metrics.num_inputs, 8);
        }
        other => panic!("expected a validate response on the chief, got {other:?}"),
    }
    assert_eq!(responses[1], WorkloadResponse::Empty);
}

#[test]
fn full_schedule_reports_only_on_the_chief() {
    let root = temp_root("schedule");
    let mut joins = Vec::new();
    for (rank, channel) in LocalGroup::group(2).into_iter().enumerate() {
        let root = root.clone();
        joins.push(thread::spawn(move || {
            let batches = vec![vec![1.0; 2]; 4];
            let mut runner = two_rank_runner(rank, channel, 1.0, batches);
            let mut sequencer = WorkloadSequencer::new(vec![
                ScheduleOp::Train { num_batches: 4 },
                ScheduleOp::Validate,
                ScheduleOp::Checkpoint,
            ]);
            let storage = LocalStorage::new(root);
            runner.run(&mut sequencer, &storage).unwrap()
        }));
    }

    let all: Vec<Vec<WorkloadResponse>> = joins.into_iter().map(|j| j.join().unwrap()).collect();

    assert_eq!(all[0].len(), 3);
    assert!(matches!(all[0][0], WorkloadResponse::Train { .. }));
    assert!(matches!(all[0][1], WorkloadResponse::Validate { .. }));
    match &all[0][2] {
        WorkloadResponse::Checkpoint(manifest) => {
            // Both ranks' state files plus the chief-only sequencer file.
            assert!(manifest.resources.contains_key("run_state_0.json"));
            assert!(manifest.resources.contains_key("run_state_1.json"));
            assert!(manifest.resources.contains_key("workload_sequencer.json"));
        }
        other => panic!("expected a checkpoint response, got {other:?}"),
    }

    assert!(all[1].iter().all(WorkloadResponse::is_empty));
    fs::remove_dir_all(root).unwrap();
}

fn single_rank_runner(batches: Vec<Vec<f64>>) -> BatchRunner<LocalGroup, FlatTrial> {
    let channel = LocalGroup::group(1).remove(0);
    BatchRunner::new(
        RunnerConfig::default(),
        RankTopology::data_parallel(0, 1),
        channel,
        FlatTrial { loss: 1.0 },
        Some(boxed_loader(batches.clone(), true)),
        Some(boxed_loader(batches, false)),
        Vec::new(),
    )
    .unwrap()
}

#[test]
fn restore_resumes_after_the_checkpointed_step() {
    let root = temp_root("restore");
    let schedule = vec![
        ScheduleOp::Train { num_batches: 10 },
        ScheduleOp::Checkpoint,
        ScheduleOp::Train { num_batches: 10 },
    ];
    let batches = vec![vec![1.0; 2]; 5];

    let mut runner = single_rank_runner(batches.clone());
    let mut sequencer = WorkloadSequencer::new(schedule.clone());
    let storage = LocalStorage::new(&root);
    let responses = runner.run(&mut sequencer, &storage).unwrap();

    let WorkloadResponse::Checkpoint(manifest) = &responses[1] else {
        panic!("expected a checkpoint response, got {:?}", responses[1]);
    };
    let dir = root.join(&manifest.uuid);

    let mut restored_runner = single_rank_runner(batches);
    let state = restored_runner.restore(&dir).unwrap();
    assert_eq!(
        state,
        Some(SequencerState {
            cumulative_batches_processed: 10,
            last_completed_step_id: 2,
        })
    );

    let mut restored = WorkloadSequencer::new(schedule);
    restored.load_state(state.unwrap()).unwrap();
    let next = restored.next().unwrap();
    assert_eq!(next.step_id, 3);
    assert_eq!(next.total_batches_processed, 10);

    fs::remove_dir_all(root).unwrap();
}

#[test]
fn restore_from_an_empty_directory_is_a_fresh_start() {
    let root = temp_root("fresh");
    let mut runner = single_rank_runner(vec![vec![1.0; 2]; 3]);

    let state = runner.restore(&root).unwrap();
    assert_eq!(state, None);

    fs::remove_dir_all(root).unwrap();
}

/// Flips its validation key set between batches.
struct DriftingTrial;

impl Trial for DriftingTrial {
    type Batch = Vec<f64>;

    fn train_batch(
        &mut self,
        _batch: Option<&Vec<f64>>,
        _epoch_idx: usize,
        _batch_idx: usize,
    ) -> Result<StepOutcome> {
        Ok(StepOutcome::Loss(0.0))
    }

    fn evaluate_batch(
        &mut self,
        _batch: Option<&Vec<f64>>,
        batch_idx: usize,
    ) -> Result<StepOutcome> {
        let mut map = MetricsMap::new();
        map.insert("acc".to_string(), MetricValue::Scalar(1.0));
        if batch_idx > 0 {
            map.insert("loss".to_string(), MetricValue::Scalar(0.5));
        }
        Ok(StepOutcome::Metrics(map))
    }

    fn batch_length(&self, batch: &Vec<f64>) -> usize {
        batch.len()
    }
}

#[test]
fn drifting_validation_keys_fail_before_reduction() {
    let channel = LocalGroup::group(1).remove(0);
    let batches = vec![vec![1.0; 2]; 2];
    let mut runner = BatchRunner::new(
        RunnerConfig::default(),
        RankTopology::data_parallel(0, 1),
        channel,
        DriftingTrial,
        Some(boxed_loader(batches.clone(), true)),
        Some(boxed_loader(batches, false)),
        Vec::new(),
    )
    .unwrap();

    match runner.run_validation_workload() {
        Err(RunnerErr::MetricKeyMismatch { expected, got }) => {
            assert_eq!(expected, vec!["acc".to_string()]);
            assert_eq!(got, vec!["acc".to_string(), "loss".to_string()]);
        }
        other => panic!("expected MetricKeyMismatch, got {other:?}"),
    }
}

/// Signals invalid hyperparameters on the first training batch.
struct PoisonedTrial;

impl Trial for PoisonedTrial {
    type Batch = Vec<f64>;

    fn train_batch(
        &mut self,
        _batch: Option<&Vec<f64>>,
        _epoch_idx: usize,
        _batch_idx: usize,
    ) -> Result<StepOutcome> {
        Ok(StepOutcome::InvalidHp("learning rate diverged".to_string()))
    }

    fn evaluate_batch(
        &mut self,
        _batch: Option<&Vec<f64>>,
        _batch_idx: usize,
    ) -> Result<StepOutcome> {
        Ok(StepOutcome::Metrics(MetricsMap::new()))
    }

    fn batch_length(&self, batch: &Vec<f64>) -> usize {
        batch.len()
    }
}

#[test]
fn invalid_hp_skips_the_batch_counter_and_continues() {
    let channel = LocalGroup::group(1).remove(0);
    let batches = vec![vec![1.0; 2]; 3];
    let mut runner = BatchRunner::new(
        RunnerConfig::default(),
        RankTopology::data_parallel(0, 1),
        channel,
        PoisonedTrial,
        Some(boxed_loader(batches.clone(), true)),
        Some(boxed_loader(batches, false)),
        Vec::new(),
    )
    .unwrap();

    let mut sequencer = WorkloadSequencer::new(vec![
        ScheduleOp::Train { num_batches: 3 },
        ScheduleOp::Train { num_batches: 3 },
    ]);
    let storage = LocalStorage::new("unused");
    let responses = runner.run(&mut sequencer, &storage).unwrap();

    assert!(matches!(responses[0], WorkloadResponse::InvalidHp { .. }));
    assert!(matches!(responses[1], WorkloadResponse::InvalidHp { .. }));
    assert_eq!(sequencer.state().cumulative_batches_processed, 0);
    assert_eq!(sequencer.state().last_completed_step_id, 2);
}

#[test]
fn pipeline_stage_without_data_still_completes_the_workload() {
    let mut joins = Vec::new();
    for (rank, channel) in LocalGroup::group(2).into_iter().enumerate() {
        joins.push(thread::spawn(move || {
            // Rank 0 is an intermediate stage: no loader, no metrics.
            let topology;
            let mut training: Option<Box<dyn DataLoader<Batch = Vec<f64>>>> = None;
            let mut validation: Option<Box<dyn DataLoader<Batch = Vec<f64>>>> = None;
            if rank == 0 {
                topology = RankTopology::pipeline(0, 2, 0, 1, false, false);
            } else {
                let batches = vec![vec![1.0; 2]; 3];
                topology = RankTopology::pipeline(1, 2, 0, 1, true, true);
                training = Some(boxed_loader(batches.clone(), true));
                validation = Some(boxed_loader(batches, false));
            }
            let mut runner = BatchRunner::new(
                RunnerConfig::default(),
                topology,
                channel,
                FlatTrial { loss: 1.0 },
                training,
                validation,
                Vec::new(),
            )
            .unwrap();
            runner.run_training_workload(1, 3, 0).unwrap()
        }));
    }

    let responses: Vec<WorkloadResponse> = joins.into_iter().map(|j| j.join().unwrap()).collect();

    match &responses[0] {
        WorkloadResponse::Train { metrics, .. } => {
            // One pipeline, so no data-parallel multiplier: 3 batches of 2.
            assert_eq!(metrics.num_inputs, 6);
            assert_eq!(metrics.avg_metrics["loss"], MetricValue::Scalar(1.0));
        }
        other => panic!("expected a train response on the chief, got {other:?}"),
    }
    assert_eq!(responses[1], WorkloadResponse::Empty);
}

#[test]
fn uneven_validation_shards_truncate_to_the_shortest() {
    let mut joins = Vec::new();
    for (rank, channel) in LocalGroup::group(2).into_iter().enumerate() {
        joins.push(thread::spawn(move || {
            // Rank 0 has 3 batches, rank 1 only 2: both evaluate 2.
            let n = if rank == 0 { 3 } else { 2 };
            let batches = vec![vec![2.0; 2]; n];
            let mut runner = two_rank_runner(rank, channel, 0.0, batches);
            runner.run_validation_workload().unwrap()
        }));
    }

    let responses: Vec<WorkloadResponse> = joins.into_iter().map(|j| j.join().unwrap()).collect();

    match &responses[0] {
        WorkloadResponse::Validate { metrics, .. } => {
            assert_eq!(metrics.validation_metrics["acc"], MetricValue::Scalar(2.0));
        }
        other => panic!("expected a validate response on the chief, got {other:?}"),
    }
}

#[test]
fn shard_spec_splits_the_demo_dataset() {
    let total = 10;
    let sizes: Vec<usize> = (0..3)
        .map(|rank| {
            ShardSpec::new(rank, NonZeroUsize::new(3).unwrap())
                .range(total)
                .len()
        })
        .collect();
    assert_eq!(sizes.iter().sum::<usize>(), total);
    assert!(sizes.iter().all(|s| (3..=4).contains(s)));
}
