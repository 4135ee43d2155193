//! Lifecycle hooks invoked on every rank at fixed points of a run.

use std::path::Path;

use crate::metrics::MetricsMap;

/// Observer of the run's lifecycle.
///
/// Every hook has a no-op default, so implementors pick the few they care
/// about. Hooks run on all ranks; a hook that should act once per cluster
/// must check the topology itself.
pub trait Callback {
    /// Stable key for this callback's state inside checkpoints.
    fn name(&self) -> &str;

    fn on_training_start(&mut self) {}

    fn on_training_epoch_start(&mut self, epoch_idx: usize) {
        let _ = epoch_idx;
    }

    fn on_training_epoch_end(&mut self, epoch_idx: usize) {
        let _ = epoch_idx;
    }

    /// After a train workload's metrics are reduced (chief sees the reduced
    /// values, other ranks see their local ones).
    fn on_training_workload_end(&mut self, avg_metrics: &MetricsMap, batch_metrics: &[MetricsMap]) {
        let (_, _) = (avg_metrics, batch_metrics);
    }

    fn on_validation_start(&mut self) {}

    fn on_validation_end(&mut self, metrics: &MetricsMap) {
        let _ = metrics;
    }

    /// After this rank finished writing its checkpoint files.
    fn on_checkpoint_write_end(&mut self, dir: &Path) {
        let _ = dir;
    }

    fn on_checkpoint_load_start(&mut self) {}

    /// Last hook of a run, fired even when the run ends early.
    fn on_trial_shutdown(&mut self) {}

    /// Snapshot persisted per rank inside checkpoints.
    fn state(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn load_state(&mut self, state: serde_json::Value) {
        let _ = state;
    }
}
