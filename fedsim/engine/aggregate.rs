//! Weighted combination of parameter sets, metric maps and losses.

use std::sync::Arc;

use indexmap::IndexMap;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::{
    error::FederationError,
    parameters::ParameterSet,
    scalar::{MetricMap, Scalar},
};

/// Custom reduction over `(example_count, metrics)` contributions.
pub type MetricsAggregationFn = Arc<dyn Fn(&[(u64, MetricMap)]) -> MetricMap + Send + Sync>;

/// Weighted elementwise average: for every position `k`,
/// `sum(w_i * t_ik) / sum(w_i)`.
///
/// Accumulation runs in `f64`. Zero weights are allowed as long as one weight
/// is positive.
pub fn aggregate_parameters<'a, I>(contributions: I) -> Result<ParameterSet, FederationError>
where
    I: IntoIterator<Item = (&'a ParameterSet, f64)>,
{
    let contributions: Vec<(&ParameterSet, f64)> = contributions.into_iter().collect();
    let Some(&(reference, _)) = contributions.first() else {
        return Err(FederationError::EmptyAggregation);
    };
    let mut total = 0.0_f64;
    for (index, &(parameters, weight)) in contributions.iter().enumerate() {
        if !weight.is_finite() || weight < 0.0 {
            return Err(FederationError::InvalidWeight { index, weight });
        }
        reference.ensure_compatible(parameters)?;
        total += weight;
    }
    if total <= 0.0 {
        return Err(FederationError::EmptyAggregation);
    }

    let mut sums: Vec<ArrayD<f64>> = reference
        .tensors()
        .iter()
        .map(|tensor| ArrayD::zeros(tensor.raw_dim()))
        .collect();
    for (parameters, weight) in contributions {
        let share = weight / total;
        for (acc, tensor) in sums.iter_mut().zip(parameters.tensors()) {
            acc.zip_mut_with(tensor, |sum, &value| *sum += share * f64::from(value));
        }
    }
    Ok(ParameterSet::new(
        sums.into_iter().map(|sum| sum.mapv(|v| v as f32)).collect(),
    ))
}

/// Example-weighted mean loss over `(count, loss)` pairs.
pub fn weighted_loss_average(results: &[(u64, f64)]) -> Result<f64, FederationError> {
    let total: u64 = results.iter().map(|(count, _)| count).sum();
    if total == 0 {
        return Err(FederationError::EmptyAggregation);
    }
    let weighted: f64 = results
        .iter()
        .map(|(count, loss)| *count as f64 * loss)
        .sum();
    Ok(weighted / total as f64)
}

/// How one metric key is reduced across participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricReduction {
    /// Mean weighted by example count.
    WeightedMean,
    /// Unweighted mean.
    Mean,
    /// Sum of values.
    Sum,
    /// Smallest value.
    Min,
    /// Largest value.
    Max,
}

impl MetricReduction {
    fn reduce(self, values: &[(u64, f64)]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        match self {
            Self::WeightedMean => {
                let total: u64 = values.iter().map(|(w, _)| w).sum();
                (total > 0).then(|| {
                    values.iter().map(|(w, v)| *w as f64 * v).sum::<f64>() / total as f64
                })
            }
            Self::Mean => Some(values.iter().map(|(_, v)| v).sum::<f64>() / values.len() as f64),
            Self::Sum => Some(values.iter().map(|(_, v)| v).sum()),
            Self::Min => values.iter().map(|(_, v)| *v).reduce(f64::min),
            Self::Max => values.iter().map(|(_, v)| *v).reduce(f64::max),
        }
    }
}

/// Declarative metric policy: only the keys listed are aggregated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsAggregation {
    rules: IndexMap<String, MetricReduction>,
}

impl Default for MetricsAggregation {
    /// `accuracy` as a weighted mean.
    fn default() -> Self {
        Self::none().with("accuracy", MetricReduction::WeightedMean)
    }
}

impl MetricsAggregation {
    /// Policy that aggregates nothing.
    #[must_use]
    pub fn none() -> Self {
        Self {
            rules: IndexMap::new(),
        }
    }

    /// Adds or replaces the rule for `key`.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, reduction: MetricReduction) -> Self {
        self.rules.insert(key.into(), reduction);
        self
    }

    /// Rules in insertion order.
    #[must_use]
    pub const fn rules(&self) -> &IndexMap<String, MetricReduction> {
        &self.rules
    }

    /// True when no key is aggregated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Applies `policy` to `(example_count, metrics)` contributions.
///
/// Contributions lacking a key, or carrying a non-numeric or non-finite value
/// for it, are skipped for that key; a key nobody reports is left out of the
/// result.
#[must_use]
pub fn aggregate_metrics(contributions: &[(u64, MetricMap)], policy: &MetricsAggregation) -> MetricMap {
    let mut out = MetricMap::new();
    for (key, reduction) in &policy.rules {
        let values: Vec<(u64, f64)> = contributions
            .iter()
            .filter_map(|(weight, metrics)| {
                metrics
                    .get(key)
                    .and_then(Scalar::as_f64)
                    .filter(|value| value.is_finite())
                    .map(|value| (*weight, value))
            })
            .collect();
        if let Some(value) = reduction.reduce(&values) {
            out.insert(key.clone(), Scalar::Float(value));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scalar::scalar_map;

    fn set(values: &[f32]) -> ParameterSet {
        ParameterSet::from_flat(vec![
            (vec![values.len()], values.to_vec()),
            (vec![1], vec![values[0] * 2.0]),
        ])
        .unwrap()
    }

    fn flat(parameters: &ParameterSet) -> Vec<f32> {
        parameters.tensors().iter().flat_map(|t| t.iter().copied()).collect()
    }

    #[test]
    fn weighted_average_per_element() {
        let a = set(&[1.0, 2.0]);
        let b = set(&[3.0, 6.0]);
        let out = aggregate_parameters([(&a, 1.0), (&b, 3.0)]).unwrap();
        assert_eq!(flat(&out), vec![2.5, 5.0, 5.0]);
    }

    #[test]
    fn order_does_not_matter() {
        let a = set(&[0.1, -0.7]);
        let b = set(&[0.3, 0.2]);
        let c = set(&[-0.9, 0.05]);
        let forward = aggregate_parameters([(&a, 10.0), (&b, 3.0), (&c, 7.0)]).unwrap();
        let backward = aggregate_parameters([(&c, 7.0), (&a, 10.0), (&b, 3.0)]).unwrap();
        assert!(forward.max_abs_diff(&backward).unwrap() < 1e-6);
    }

    #[test]
    fn single_contribution_is_returned_unchanged() {
        let a = set(&[0.123, -4.5, 1e-7]);
        for weight in [1.0, 0.3, 17.0, 1e6] {
            assert_eq!(aggregate_parameters([(&a, weight)]).unwrap(), a);
        }
    }

    #[test]
    fn equal_weights_give_plain_mean() {
        let a = set(&[1.0, 4.0]);
        let b = set(&[2.0, 0.0]);
        let c = set(&[6.0, 2.0]);
        let out = aggregate_parameters([(&a, 5.0), (&b, 5.0), (&c, 5.0)]).unwrap();
        let expected = [3.0, 2.0, 6.0];
        for (got, want) in flat(&out).iter().zip(expected) {
            assert!((got - want).abs() < 1e-6);
        }
    }

    #[test]
    fn rejects_bad_input() {
        let a = set(&[1.0, 2.0]);
        let b = set(&[1.0, 2.0, 3.0]);
        assert_eq!(
            aggregate_parameters(std::iter::empty()).unwrap_err(),
            FederationError::EmptyAggregation
        );
        assert_eq!(
            aggregate_parameters([(&a, 0.0), (&a, 0.0)]).unwrap_err(),
            FederationError::EmptyAggregation
        );
        assert_eq!(aggregate_parameters([(&a, 1.0), (&b, 1.0)]).unwrap_err().code(), "shape_mismatch");
        assert_eq!(
            aggregate_parameters([(&a, 1.0), (&a, -1.0)]).unwrap_err(),
            FederationError::InvalidWeight { index: 1, weight: -1.0 }
        );
        assert!(aggregate_parameters([(&a, f64::NAN)]).is_err());
    }

    #[test]
    fn zero_weight_contribution_is_ignored() {
        let a = set(&[1.0, 1.0]);
        let b = set(&[9.0, 9.0]);
        let out = aggregate_parameters([(&a, 4.0), (&b, 0.0)]).unwrap();
        assert_eq!(out, a);
    }

    #[test]
    fn accuracy_weighted_mean() {
        let contributions: Vec<(u64, MetricMap)> = vec![
            (10, scalar_map([("accuracy", 0.8)])),
            (5, scalar_map([("accuracy", 0.5)])),
        ];
        let out = aggregate_metrics(&contributions, &MetricsAggregation::default());
        let accuracy = out["accuracy"].as_f64().unwrap();
        assert!((accuracy - 0.733_333).abs() < 1e-5);
    }

    #[test]
    fn reductions_and_skips() {
        let contributions: Vec<(u64, MetricMap)> = vec![
            (2, scalar_map([("loss", Scalar::Float(1.0)), ("tag", Scalar::from("a"))])),
            (6, scalar_map([("loss", Scalar::Float(3.0)), ("tag", Scalar::from("b"))])),
            (4, scalar_map([("other", Scalar::Int(1))])),
        ];
        let policy = MetricsAggregation::none()
            .with("loss", MetricReduction::Sum)
            .with("tag", MetricReduction::Mean)
            .with("missing", MetricReduction::Max);
        let out = aggregate_metrics(&contributions, &policy);
        assert_eq!(out.len(), 1);
        assert_eq!(out["loss"], Scalar::Float(4.0));

        let values: [(u64, f64); 2] = [(1, 2.0), (3, -1.0)];
        assert_eq!(MetricReduction::Min.reduce(&values), Some(-1.0));
        assert_eq!(MetricReduction::Max.reduce(&values), Some(2.0));
        assert_eq!(MetricReduction::Mean.reduce(&values), Some(0.5));
        assert_eq!(MetricReduction::WeightedMean.reduce(&[(0, 1.0)]), None);
        assert!(aggregate_metrics(&contributions, &MetricsAggregation::none()).is_empty());
    }

    #[test]
    fn non_finite_metric_values_are_skipped() {
        let contributions: Vec<(u64, MetricMap)> = vec![
            (10, scalar_map([("accuracy", f64::NAN)])),
            (5, scalar_map([("accuracy", 0.5)])),
            (5, scalar_map([("accuracy", f64::INFINITY)])),
        ];
        let out = aggregate_metrics(&contributions, &MetricsAggregation::default());
        assert_eq!(out["accuracy"], Scalar::Float(0.5));
    }

    #[test]
    fn loss_average_weights_by_count() {
        let loss = weighted_loss_average(&[(10, 0.2), (30, 0.6)]).unwrap();
        assert!((loss - 0.5).abs() < 1e-12);
        assert_eq!(
            weighted_loss_average(&[(0, 1.0)]).unwrap_err(),
            FederationError::EmptyAggregation
        );
    }
}
