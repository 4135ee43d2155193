//! Metric values and the rank/batch reduction rules.
//!
//! Training metrics are reduced per batch index across ranks (the batch
//! dimension survives); validation metrics are reduced over the batch
//! dimension on each rank and then across ranks, weighted by each rank's
//! batch count. "Missing" entries (ranks that had no value for a batch or a
//! key) are ignored at either level.

use std::{collections::BTreeMap, time::Duration};

use collective::Collective;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RunnerErr};

/// A single metric measurement: a scalar or a flat array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Scalar(f64),
    Array(Vec<f64>),
}

impl MetricValue {
    fn values(&self) -> &[f64] {
        match self {
            MetricValue::Scalar(v) => std::slice::from_ref(v),
            MetricValue::Array(vs) => vs,
        }
    }

    fn is_array(&self) -> bool {
        matches!(self, MetricValue::Array(_))
    }
}

/// Named metrics for one batch or one reduced result.
pub type MetricsMap = BTreeMap<String, MetricValue>;

/// Per-metric reduction over the batch and rank dimensions.
#[derive(Debug, Clone, Copy)]
pub enum Reducer {
    Avg,
    Sum,
    /// Applied to the per-batch scalar values of all reporting ranks,
    /// concatenated in rank order.
    Custom(fn(&[f64]) -> f64),
}

/// A single reducer for every metric, or one per metric name.
#[derive(Debug, Clone)]
pub enum ReducerSpec {
    Single(Reducer),
    PerMetric(BTreeMap<String, Reducer>),
}

/// Resolves a reducer for every metric key.
///
/// # Errors
/// A per-metric map must carry exactly the agreed key set; anything else is
/// a configuration error naming both key sets.
pub fn prepare_reducers(spec: &ReducerSpec, keys: &[String]) -> Result<BTreeMap<String, Reducer>> {
    match spec {
        ReducerSpec::Single(reducer) => {
            Ok(keys.iter().map(|k| (k.clone(), *reducer)).collect())
        }
        ReducerSpec::PerMetric(map) => {
            let mut expected: Vec<String> = keys.to_vec();
            expected.sort();
            let provided: Vec<String> = map.keys().cloned().collect();

            if expected != provided {
                return Err(RunnerErr::ReducerKeyMismatch { expected, provided });
            }
            Ok(map.clone())
        }
    }
}

/// Gathers `(per-metric per-batch values, num_batches)` from every rank.
///
/// The chief drops entries from ranks that reported zero metrics (those are
/// intermediate pipeline stages) and returns, per metric name, one list per
/// remaining rank, alongside each rank's batch count. Non-chief ranks get
/// `None`.
pub fn combine_across_ranks<C: Collective>(
    channel: &C,
    metrics: BTreeMap<String, Vec<Option<MetricValue>>>,
    num_batches: usize,
) -> Result<Option<(BTreeMap<String, Vec<Vec<Option<MetricValue>>>>, Vec<usize>)>> {
    let gathered = channel.gather((metrics, num_batches))?;

    let Some(all) = gathered else {
        return Ok(None);
    };

    let reported: Vec<_> = all.into_iter().filter(|(m, _)| !m.is_empty()).collect();
    let Some((first, _)) = reported.first() else {
        return Ok(Some((BTreeMap::new(), Vec::new())));
    };

    let keys: Vec<String> = first.keys().cloned().collect();
    let counts: Vec<usize> = reported.iter().map(|(_, n)| *n).collect();

    let mut combined = BTreeMap::new();
    for key in keys {
        let columns = reported
            .iter()
            .map(|(m, n)| m.get(&key).cloned().unwrap_or_else(|| vec![None; *n]))
            .collect();
        combined.insert(key, columns);
    }

    Ok(Some((combined, counts)))
}

/// Averages one batch column across ranks, ignoring ranks with no value.
///
/// A metric whose present values are arrays stays array-shaped after the
/// average (a single-element array), matching the non-averaging codepath.
fn average_column<'a, I>(column: I) -> Option<MetricValue>
where
    I: IntoIterator<Item = Option<&'a MetricValue>>,
{
    let present: Vec<&MetricValue> = column.into_iter().flatten().collect();
    let first = *present.first()?;

    let mut sum = 0.0;
    let mut count = 0usize;
    for value in &present {
        for v in value.values() {
            sum += v;
            count += 1;
        }
    }
    if count == 0 {
        return None;
    }

    let mean = sum / count as f64;
    Some(if first.is_array() {
        MetricValue::Array(vec![mean])
    } else {
        MetricValue::Scalar(mean)
    })
}

/// Rank-averages combined training metrics, keeping the batch dimension.
///
/// `combined[name][rank][batch]` comes from `combine_across_ranks`; the
/// result is one metric map per batch index.
pub fn average_training_metrics(
    combined: &BTreeMap<String, Vec<Vec<Option<MetricValue>>>>,
    num_batches: usize,
) -> Vec<MetricsMap> {
    (0..num_batches)
        .map(|batch_idx| {
            let mut map = MetricsMap::new();
            for (name, per_rank) in combined {
                let column = per_rank
                    .iter()
                    .map(|batches| batches.get(batch_idx).and_then(Option::as_ref));
                if let Some(avg) = average_column(column) {
                    map.insert(name.clone(), avg);
                }
            }
            map
        })
        .collect()
}

/// Collapses per-batch metrics into one summary map (flat arithmetic mean
/// per name, skipping batches where the name is absent).
pub fn summarize_batches(per_batch_metrics: &[MetricsMap]) -> MetricsMap {
    let mut keys: Vec<&String> = per_batch_metrics.iter().flat_map(|m| m.keys()).collect();
    keys.sort();
    keys.dedup();

    let mut summary = MetricsMap::new();
    for key in keys {
        let column = per_batch_metrics.iter().map(|m| m.get(key));
        if let Some(avg) = average_column(column) {
            summary.insert(key.clone(), avg);
        }
    }
    summary
}

/// Reduces one rank's per-batch values for a single metric.
///
/// Arrays of equal length reduce element-wise; mixing shapes within one
/// metric is a configuration error.
pub fn reduce_batches(reducer: Reducer, name: &str, values: &[MetricValue]) -> Result<MetricValue> {
    if let Reducer::Custom(f) = reducer {
        let flat: Vec<f64> = values.iter().flat_map(|v| v.values().iter().copied()).collect();
        return Ok(MetricValue::Scalar(f(&flat)));
    }

    let width = uniform_width(name, values.iter())?;
    let mut acc = vec![0.0; width];
    for value in values {
        for (slot, v) in acc.iter_mut().zip(value.values()) {
            *slot += v;
        }
    }

    if matches!(reducer, Reducer::Avg) && !values.is_empty() {
        let n = values.len() as f64;
        for slot in &mut acc {
            *slot /= n;
        }
    }

    Ok(shape_like(values.first(), acc))
}

/// Reduces already batch-reduced values across ranks.
///
/// Avg weights each rank by its batch count; missing entries are skipped
/// along with their weights, and a metric no rank reported reduces to
/// `None` rather than a fabricated zero.
pub fn reduce_ranks(
    reducer: Reducer,
    name: &str,
    values: &[Option<MetricValue>],
    num_batches: &[usize],
) -> Result<Option<MetricValue>> {
    let present: Vec<(&MetricValue, usize)> = values
        .iter()
        .zip(num_batches.iter().copied())
        .filter_map(|(v, n)| v.as_ref().map(|v| (v, n)))
        .collect();
    if present.is_empty() {
        return Ok(None);
    }

    if let Reducer::Custom(f) = reducer {
        let flat: Vec<f64> = present
            .iter()
            .flat_map(|(v, _)| v.values().iter().copied())
            .collect();
        return Ok(Some(MetricValue::Scalar(f(&flat))));
    }

    let width = uniform_width(name, present.iter().map(|(v, _)| *v))?;
    let mut acc = vec![0.0; width];
    let mut total_weight = 0.0;

    for (value, batches) in &present {
        let weight = *batches as f64;
        total_weight += weight;
        for (slot, v) in acc.iter_mut().zip(value.values()) {
            match reducer {
                Reducer::Avg => *slot += v * weight,
                Reducer::Sum => *slot += v,
                Reducer::Custom(_) => unreachable!(),
            }
        }
    }

    if matches!(reducer, Reducer::Avg) && total_weight > 0.0 {
        for slot in &mut acc {
            *slot /= total_weight;
        }
    }

    Ok(Some(shape_like(present.first().map(|(v, _)| *v), acc)))
}

fn uniform_width<'a, I>(name: &str, values: I) -> Result<usize>
where
    I: IntoIterator<Item = &'a MetricValue>,
{
    let mut width = None;
    for value in values {
        let w = value.values().len();
        match width {
            None => width = Some(w),
            Some(prev) if prev != w => {
                return Err(RunnerErr::Config(format!(
                    "metric '{name}' has inconsistent shapes across entries \
                     ({prev} vs {w} elements)"
                )));
            }
            Some(_) => {}
        }
    }
    Ok(width.unwrap_or(0))
}

fn shape_like(template: Option<&MetricValue>, mut acc: Vec<f64>) -> MetricValue {
    match template {
        Some(v) if v.is_array() => MetricValue::Array(acc),
        _ => MetricValue::Scalar(acc.pop().unwrap_or(0.0)),
    }
}

/// Timing hook points around the batch loop. The engine records, the
/// embedder reads; nothing is emitted.
#[derive(Debug, Default, Clone)]
pub struct RunnerTimings {
    pub data_time: Duration,
    pub step_time: Duration,
    pub reduce_time: Duration,

    pub batches: u64,
    pub samples: u64,
}

impl RunnerTimings {
    #[inline]
    pub fn bump_batch(&mut self) {
        self.batches += 1;
    }

    #[inline]
    pub fn add_samples(&mut self, n: usize) {
        self.samples += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalars(vs: &[f64]) -> Vec<Option<MetricValue>> {
        vs.iter().map(|v| Some(MetricValue::Scalar(*v))).collect()
    }

    #[test]
    fn rank_average_keeps_batch_dimension() {
        // Two ranks, three batches: A = [[1,2,3],[3,2,1]] -> [2,2,2].
        let mut combined = BTreeMap::new();
        combined.insert("A".to_string(), vec![scalars(&[1.0, 2.0, 3.0]), scalars(&[3.0, 2.0, 1.0])]);

        let averaged = average_training_metrics(&combined, 3);
        assert_eq!(averaged.len(), 3);
        for map in &averaged {
            assert_eq!(map["A"], MetricValue::Scalar(2.0));
        }
    }

    #[test]
    fn rank_average_ignores_missing_entries() {
        let mut combined = BTreeMap::new();
        combined.insert(
            "loss".to_string(),
            vec![scalars(&[4.0]), vec![None], scalars(&[2.0])],
        );

        let averaged = average_training_metrics(&combined, 1);
        assert_eq!(averaged[0]["loss"], MetricValue::Scalar(3.0));
    }

    #[test]
    fn single_element_arrays_stay_arrays() {
        let mut combined = BTreeMap::new();
        combined.insert(
            "emb".to_string(),
            vec![
                vec![Some(MetricValue::Array(vec![1.0]))],
                vec![Some(MetricValue::Array(vec![3.0]))],
            ],
        );

        let averaged = average_training_metrics(&combined, 1);
        assert_eq!(averaged[0]["emb"], MetricValue::Array(vec![2.0]));
    }

    #[test]
    fn batch_reduction_avg_and_sum() {
        let values = [
            MetricValue::Scalar(1.0),
            MetricValue::Scalar(2.0),
            MetricValue::Scalar(6.0),
        ];
        assert_eq!(
            reduce_batches(Reducer::Avg, "m", &values).unwrap(),
            MetricValue::Scalar(3.0)
        );
        assert_eq!(
            reduce_batches(Reducer::Sum, "m", &values).unwrap(),
            MetricValue::Scalar(9.0)
        );
    }

    #[test]
    fn batch_reduction_is_elementwise_for_arrays() {
        let values = [
            MetricValue::Array(vec![1.0, 10.0]),
            MetricValue::Array(vec![3.0, 20.0]),
        ];
        assert_eq!(
            reduce_batches(Reducer::Avg, "m", &values).unwrap(),
            MetricValue::Array(vec![2.0, 15.0])
        );
    }

    #[test]
    fn mixed_shapes_fail_fast() {
        let values = [MetricValue::Scalar(1.0), MetricValue::Array(vec![1.0, 2.0])];
        assert!(matches!(
            reduce_batches(Reducer::Avg, "m", &values),
            Err(RunnerErr::Config(_))
        ));
    }

    #[test]
    fn rank_reduction_weights_by_batch_count() {
        // Rank 0 averaged 1.0 over 3 batches, rank 1 averaged 5.0 over 1.
        let values = [
            Some(MetricValue::Scalar(1.0)),
            Some(MetricValue::Scalar(5.0)),
        ];
        let reduced = reduce_ranks(Reducer::Avg, "m", &values, &[3, 1]).unwrap();
        assert_eq!(reduced, Some(MetricValue::Scalar(2.0)));
    }

    #[test]
    fn rank_reduction_skips_missing_ranks() {
        let values = [Some(MetricValue::Scalar(4.0)), None];
        let reduced = reduce_ranks(Reducer::Avg, "m", &values, &[2, 2]).unwrap();
        assert_eq!(reduced, Some(MetricValue::Scalar(4.0)));
    }

    #[test]
    fn metric_no_rank_reported_reduces_to_nothing() {
        for reducer in [Reducer::Avg, Reducer::Sum, Reducer::Custom(|vs| vs.len() as f64)] {
            let reduced = reduce_ranks(reducer, "m", &[None, None], &[2, 2]).unwrap();
            assert_eq!(reduced, None);
        }
    }

    #[test]
    fn custom_reducer_sees_concatenated_values() {
        fn max(vs: &[f64]) -> f64 {
            vs.iter().copied().fold(f64::MIN, f64::max)
        }

        let values = [
            Some(MetricValue::Scalar(1.0)),
            Some(MetricValue::Scalar(7.0)),
        ];
        let reduced = reduce_ranks(Reducer::Custom(max), "m", &values, &[1, 1]).unwrap();
        assert_eq!(reduced, Some(MetricValue::Scalar(7.0)));
    }

    #[test]
    fn per_metric_reducers_must_cover_exact_key_set() {
        let mut map = BTreeMap::new();
        map.insert("acc".to_string(), Reducer::Avg);
        let spec = ReducerSpec::PerMetric(map);

        let keys = vec!["acc".to_string(), "loss".to_string()];
        match prepare_reducers(&spec, &keys) {
            Err(RunnerErr::ReducerKeyMismatch { expected, provided }) => {
                assert_eq!(expected, keys);
                assert_eq!(provided, vec!["acc".to_string()]);
            }
            other => panic!("expected ReducerKeyMismatch, got {other:?}"),
        }
    }

    #[test]
    fn summary_skips_absent_names_per_batch() {
        let mut b0 = MetricsMap::new();
        b0.insert("loss".to_string(), MetricValue::Scalar(2.0));
        let mut b1 = MetricsMap::new();
        b1.insert("loss".to_string(), MetricValue::Scalar(4.0));
        b1.insert("aux".to_string(), MetricValue::Scalar(1.0));

        let summary = summarize_batches(&[b0, b1]);
        assert_eq!(summary["loss"], MetricValue::Scalar(3.0));
        assert_eq!(summary["aux"], MetricValue::Scalar(1.0));
    }
}
