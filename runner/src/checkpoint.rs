//! Checkpoint save/restore over a pluggable storage collaborator.
//!
//! Save is a collective: the chief picks the location, every rank writes its
//! own state under it, and the chief unions the per-rank manifests. Restore
//! is rank-local file reads against a directory all ranks can see.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use collective::Collective;
use log::{debug, info, warn};
use rand::{SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    runner::BatchRunner,
    sequencer::SequencerState,
    trial::Trial,
    workload::{CheckpointManifest, WorkloadResponse},
};

/// Candidate trial-state files inside a checkpoint, newest layout first.
pub const TRIAL_STATE_PATHS: [&str; 2] = ["trial_state.json", "state.json"];

const SEQUENCER_FILE: &str = "workload_sequencer.json";
const FORMAT_TAG: &str = "json";

/// Where checkpoints live. Implementations hand out fresh locations and list
/// what was written; they never interpret the contents.
pub trait Storage {
    /// Reserves a fresh checkpoint location, returning its identity and the
    /// directory ranks should write under. Called on the chief only.
    fn new_path(&self) -> io::Result<(String, PathBuf)>;

    /// Lists every file under `dir`, keyed by path relative to `dir`, with
    /// sizes in bytes.
    fn list_directory(&self, dir: &Path) -> io::Result<BTreeMap<String, u64>>;
}

/// Checkpoints under a local (or mounted shared) filesystem root.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Storage for LocalStorage {
    fn new_path(&self) -> io::Result<(String, PathBuf)> {
        let uuid = format!("{:032x}", rand::random::<u128>());
        let path = self.root.join(&uuid);
        Ok((uuid, path))
    }

    fn list_directory(&self, dir: &Path) -> io::Result<BTreeMap<String, u64>> {
        let mut resources = BTreeMap::new();
        list_into(dir, dir, &mut resources)?;
        Ok(resources)
    }
}

fn list_into(root: &Path, dir: &Path, out: &mut BTreeMap<String, u64>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;
        if meta.is_dir() {
            list_into(root, &path, out)?;
        } else {
            let relative = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            out.insert(relative, meta.len());
        }
    }
    Ok(())
}

/// Deterministic RNG identity, persisted instead of the raw generator state.
///
/// `reseed_epoch` bumps on every restore so a resumed run draws a fresh
/// stream rather than replaying the one it already consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RngState {
    pub seed: u64,
    pub reseed_epoch: u64,
}

impl RngState {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            reseed_epoch: 0,
        }
    }

    pub fn rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.seed ^ self.reseed_epoch)
    }
}

/// One rank's ambient state inside a checkpoint.
#[derive(Debug, Serialize, Deserialize)]
struct RunState {
    rng: RngState,
    callbacks: BTreeMap<String, serde_json::Value>,
}

fn run_state_file(rank: usize) -> String {
    format!("run_state_{rank}.json")
}

impl<C: Collective, T: Trial> BatchRunner<C, T> {
    /// Runs one checkpoint workload.
    ///
    /// `seq_state` is the sequencer position as of this workload completing;
    /// the chief persists it alongside the trial state so a restore resumes
    /// right after this checkpoint.
    pub fn run_checkpoint_workload<S: Storage>(
        &mut self,
        storage: &S,
        seq_state: SequencerState,
    ) -> Result<WorkloadResponse> {
        // Path selection happens exactly once, on the chief.
        let picked = if self.topology.is_chief() {
            Some(storage.new_path()?)
        } else {
            None
        };
        let (uuid, dir): (String, PathBuf) = self.channel.broadcast(picked)?;

        fs::create_dir_all(&dir)?;
        self.channel.barrier()?;

        if self.topology.is_chief() {
            self.trial.save(&dir)?;
            let blob = serde_json::to_vec_pretty(&seq_state)?;
            fs::write(dir.join(SEQUENCER_FILE), blob)?;
        }

        let run_state = RunState {
            rng: self.rng_state,
            callbacks: self
                .callbacks
                .iter()
                .map(|cb| (cb.name().to_string(), cb.state()))
                .collect(),
        };
        let blob = serde_json::to_vec_pretty(&run_state)?;
        fs::write(dir.join(run_state_file(self.topology.global_rank())), blob)?;

        self.channel.barrier()?;

        let manifest = storage.list_directory(&dir)?;
        let gathered = self.channel.gather(manifest)?;

        for cb in &mut self.callbacks {
            cb.on_checkpoint_write_end(&dir);
        }

        let Some(per_rank) = gathered else {
            return Ok(WorkloadResponse::Empty);
        };
        let mut resources = BTreeMap::new();
        for manifest in per_rank {
            resources.extend(manifest);
        }
        info!(uuid = uuid.as_str(), files = resources.len();
            "checkpoint written");

        Ok(WorkloadResponse::Checkpoint(CheckpointManifest {
            uuid,
            resources,
            framework: self.trial.framework().to_string(),
            format: FORMAT_TAG.to_string(),
        }))
    }

    /// Restores this rank's state from a checkpoint directory.
    ///
    /// Every rank calls this with the same directory before driving any
    /// workloads. Missing components are warnings, not failures: the run
    /// proceeds with default-initialized state for whatever was absent.
    /// Returns the persisted sequencer position when one was found.
    pub fn restore(&mut self, dir: &Path) -> Result<Option<SequencerState>> {
        for cb in &mut self.callbacks {
            cb.on_checkpoint_load_start();
        }

        match TRIAL_STATE_PATHS.iter().map(|p| dir.join(p)).find(|p| p.exists()) {
            Some(state_file) => {
                debug!(path = state_file.to_string_lossy().as_ref(); "loading trial state");
                self.trial.load(&state_file)?;
            }
            None => warn!("checkpoint has no trial state, keeping current weights"),
        }

        let rank_file = dir.join(run_state_file(self.topology.global_rank()));
        match fs::read(&rank_file) {
            Ok(blob) => {
                let mut state: RunState = serde_json::from_slice(&blob)?;
                for cb in &mut self.callbacks {
                    match state.callbacks.remove(cb.name()) {
                        Some(saved) => cb.load_state(saved),
                        None => warn!(callback = cb.name();
                            "checkpoint has no state for callback, keeping defaults"),
                    }
                }
                self.rng_state = state.rng;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(rank = self.topology.global_rank();
                    "checkpoint has no run state for this rank, keeping defaults");
            }
            Err(e) => return Err(e.into()),
        }
        // Fresh stream on resume instead of replaying the consumed one.
        self.rng_state.reseed_epoch += 1;
        self.rng = self.rng_state.rng();

        let seq_file = dir.join(SEQUENCER_FILE);
        let seq_state = match fs::read(&seq_file) {
            Ok(blob) => Some(serde_json::from_slice::<SequencerState>(&blob)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("checkpoint has no sequencer state, starting the schedule over");
                None
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(state) = seq_state
            && let Some(loader) = &mut self.training_loader
        {
            // Resume mid-epoch at the exact next unprocessed batch.
            loader.skip(state.cumulative_batches_processed);
        }

        Ok(seq_state)
    }
}
