use std::{env, fs, io, num::NonZeroUsize, path::Path, thread};

use collective::LocalGroup;
use log::info;
use runner::{
    BatchRunner, LocalStorage, RankTopology, Result, RunnerConfig, ScheduleOp, StepOutcome,
    Trial, WorkloadSequencer,
    data::{InMemoryLoader, ShardSpec},
    metrics::{MetricValue, MetricsMap},
};

const DEFAULT_RANKS: usize = 2;

/// Toy trial: one scalar weight chasing the mean of the data.
struct MeanTrial {
    weight: f64,
    lr: f64,
}

impl MeanTrial {
    fn mse(&self, batch: &[f64]) -> f64 {
        let n = batch.len().max(1) as f64;
        batch.iter().map(|x| (self.weight - x).powi(2)).sum::<f64>() / n
    }
}

impl Trial for MeanTrial {
    type Batch = Vec<f64>;

    fn train_batch(
        &mut self,
        batch: Option<&Vec<f64>>,
        _epoch_idx: usize,
        _batch_idx: usize,
    ) -> Result<StepOutcome> {
        let Some(batch) = batch else {
            return Ok(StepOutcome::Loss(0.0));
        };
        let loss = self.mse(batch);
        for x in batch {
            self.weight -= self.lr * 2.0 * (self.weight - x);
        }
        Ok(StepOutcome::Loss(loss))
    }

    fn evaluate_batch(&mut self, batch: Option<&Vec<f64>>, _batch_idx: usize) -> Result<StepOutcome> {
        let mse = batch.map(|b| self.mse(b)).unwrap_or_default();
        let mut map = MetricsMap::new();
        map.insert("mse".to_string(), MetricValue::Scalar(mse));
        Ok(StepOutcome::Metrics(map))
    }

    fn batch_length(&self, batch: &Vec<f64>) -> usize {
        batch.len()
    }

    fn save(&mut self, dir: &Path) -> Result<()> {
        let blob = serde_json::to_vec(&self.weight)?;
        fs::write(dir.join("trial_state.json"), blob)?;
        Ok(())
    }

    fn load(&mut self, state_file: &Path) -> Result<()> {
        self.weight = serde_json::from_slice(&fs::read(state_file)?)?;
        Ok(())
    }
}

fn run_rank(rank: usize, size: NonZeroUsize, channel: LocalGroup, ckpt_root: &str) -> Result<()> {
    let data: Vec<Vec<f64>> = (0..32).map(|i| vec![(i % 7) as f64; 4]).collect();
    let shard = ShardSpec::new(rank, size);
    let training = InMemoryLoader::new(data.clone(), shard, true);
    let validation = InMemoryLoader::new(data, shard, false);

    let cfg = RunnerConfig {
        per_rank_batch_size: 4,
        seed: 17,
        ..RunnerConfig::default()
    };
    let mut runner = BatchRunner::new(
        cfg,
        RankTopology::data_parallel(rank, size.get()),
        channel,
        MeanTrial {
            weight: 0.0,
            lr: 0.05,
        },
        Some(Box::new(training)),
        Some(Box::new(validation)),
        Vec::new(),
    )?;

    let mut sequencer = WorkloadSequencer::new(vec![
        ScheduleOp::Train { num_batches: 8 },
        ScheduleOp::Validate,
        ScheduleOp::Checkpoint,
        ScheduleOp::Train { num_batches: 8 },
        ScheduleOp::Validate,
    ]);
    let storage = LocalStorage::new(ckpt_root);

    let responses = runner.run(&mut sequencer, &storage)?;
    for (step_id, response) in responses.iter().enumerate() {
        if !response.is_empty() {
            info!(step_id = step_id + 1; "completed: {response:?}");
        }
    }
    info!(rank = rank, weight = runner.trial().weight; "rank done");
    Ok(())
}

fn main() -> io::Result<()> {
    env_logger::init();

    let ranks = env::var("RANKS")
        .ok()
        .and_then(|v| v.parse().ok())
        .and_then(NonZeroUsize::new)
        .unwrap_or(NonZeroUsize::new(DEFAULT_RANKS).unwrap_or(NonZeroUsize::MIN));
    let ckpt_root = env::var("CKPT_DIR").unwrap_or_else(|_| "checkpoints".to_string());
    info!(ranks = ranks.get(), ckpt_root = ckpt_root.as_str(); "starting local run");

    let handles: Vec<_> = LocalGroup::group(ranks.get())
        .into_iter()
        .enumerate()
        .map(|(rank, channel)| {
            let root = ckpt_root.clone();
            thread::spawn(move || run_rank(rank, ranks, channel, &root))
        })
        .collect();

    for handle in handles {
        handle
            .join()
            .map_err(|_| io::Error::other("rank thread panicked"))??;
    }
    Ok(())
}
