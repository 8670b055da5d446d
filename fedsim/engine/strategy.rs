//! Round scheduling: who is sampled, with which config, and how results
//! combine into the next global model.

use std::{fmt, sync::Arc};

use rand::{rngs::SmallRng, seq::index, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{
    aggregate::{
        aggregate_metrics, aggregate_parameters, weighted_loss_average, MetricsAggregation,
        MetricsAggregationFn,
    },
    dataset::Dataset,
    error::FederationError,
    history::CentralizedEvaluation,
    parameters::ParameterSet,
    participant::{EvaluateResult, FitResult, ParticipantFailure, ParticipantId},
    scalar::{scalar_map, ConfigMap, MetricMap},
    trainer::{LocalTrainer, TrainerFactory},
};

/// Centralized evaluation hook: `(round, parameters, config)`.
pub type CentralizedEvaluateFn =
    Arc<dyn Fn(u64, &ParameterSet, &ConfigMap) -> Option<(f64, MetricMap)> + Send + Sync>;

/// Per-round config producer, merged over the static config map.
pub type RoundConfigFn = Arc<dyn Fn(u64) -> ConfigMap + Send + Sync>;

/// One participant call to make in a phase.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    /// Participant to spawn.
    pub participant: ParticipantId,
    /// Instructions for the call.
    pub config: ConfigMap,
}

/// Result of a successful fit aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct FitAggregate {
    /// New global parameters.
    pub parameters: ParameterSet,
    /// Aggregated training metrics.
    pub metrics: MetricMap,
}

/// Result of a successful evaluate aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluateAggregate {
    /// Example-weighted validation loss.
    pub loss: f64,
    /// Aggregated validation metrics.
    pub metrics: MetricMap,
}

/// Round scheduling policy driven by the simulation loop.
pub trait Strategy: Send + Sync {
    /// Short strategy name for logs.
    fn name(&self) -> &str;

    /// Initial global parameters, if the strategy owns them.
    fn initialize_parameters(&self) -> Option<ParameterSet>;

    /// Selects fit participants for `round` among `available`.
    fn configure_fit(
        &self,
        round: u64,
        parameters: &ParameterSet,
        available: &[ParticipantId],
    ) -> Result<Vec<Dispatch>, FederationError>;

    /// Combines the fit results that crossed the barrier.
    fn aggregate_fit(
        &self,
        round: u64,
        results: &[(ParticipantId, FitResult)],
        failures: &[ParticipantFailure],
    ) -> Result<FitAggregate, FederationError>;

    /// Selects evaluate participants; an empty selection skips the phase.
    fn configure_evaluate(
        &self,
        round: u64,
        parameters: &ParameterSet,
        available: &[ParticipantId],
    ) -> Result<Vec<Dispatch>, FederationError>;

    /// Combines the evaluate results that crossed the barrier.
    fn aggregate_evaluate(
        &self,
        round: u64,
        results: &[(ParticipantId, EvaluateResult)],
        failures: &[ParticipantFailure],
    ) -> Result<EvaluateAggregate, FederationError>;

    /// Centralized evaluation of the global parameters; round 0 is the
    /// initial model.
    fn evaluate(&self, round: u64, parameters: &ParameterSet) -> Option<CentralizedEvaluation>;
}

/// Sampling and quorum settings of [`FedAvg`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FedAvgConfig {
    /// Fraction of available participants sampled for fit.
    pub fit_fraction: f64,
    /// Fraction sampled for distributed evaluation; `0` disables the phase.
    pub evaluate_fraction: f64,
    /// Minimum fit sample and fit quorum.
    pub min_fit_participants: usize,
    /// Minimum evaluate sample and evaluate quorum.
    pub min_evaluate_participants: usize,
    /// Participants that must be available before sampling.
    pub min_available_participants: usize,
    /// Aggregate the survivors when some participants failed.
    pub accept_failures: bool,
}

impl Default for FedAvgConfig {
    fn default() -> Self {
        Self {
            fit_fraction: 1.0,
            evaluate_fraction: 0.5,
            min_fit_participants: 10,
            min_evaluate_participants: 5,
            min_available_participants: 10,
            accept_failures: true,
        }
    }
}

impl FedAvgConfig {
    /// Checks fractions and minimums.
    pub fn validate(&self) -> Result<(), FederationError> {
        for (name, value) in [
            ("fit_fraction", self.fit_fraction),
            ("evaluate_fraction", self.evaluate_fraction),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(FederationError::InvalidConfig(format!(
                    "{name} must be in [0, 1], got {value}"
                )));
            }
        }
        if self.min_fit_participants == 0 {
            return Err(FederationError::InvalidConfig(
                "min_fit_participants must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// `max(minimum, ceil(fraction * available))`.
#[must_use]
pub fn sample_size(available: usize, fraction: f64, minimum: usize) -> usize {
    let wanted = (fraction * available as f64).ceil() as usize;
    wanted.max(minimum)
}

#[derive(Clone)]
enum MetricsPolicy {
    Declarative(MetricsAggregation),
    Custom(MetricsAggregationFn),
}

impl MetricsPolicy {
    fn apply(&self, contributions: &[(u64, MetricMap)]) -> MetricMap {
        match self {
            Self::Declarative(policy) => aggregate_metrics(contributions, policy),
            Self::Custom(func) => func(contributions),
        }
    }
}

impl fmt::Debug for MetricsPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Declarative(policy) => f.debug_tuple("Declarative").field(policy).finish(),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

fn round_config(round: u64, base: &ConfigMap, producer: Option<&RoundConfigFn>) -> ConfigMap {
    let mut config = base.clone();
    if let Some(producer) = producer {
        config.extend(producer(round));
    }
    config
}

const FIT_STREAM: u64 = 0x6669_74;
const EVALUATE_STREAM: u64 = 0x6576_616c;

/// Federated averaging: parameters weighted by training example counts.
#[derive(Clone)]
pub struct FedAvg {
    config: FedAvgConfig,
    fit_config: ConfigMap,
    evaluate_config: ConfigMap,
    on_fit_config: Option<RoundConfigFn>,
    on_evaluate_config: Option<RoundConfigFn>,
    centralized: Option<CentralizedEvaluateFn>,
    fit_metrics: MetricsPolicy,
    evaluate_metrics: MetricsPolicy,
    initial_parameters: Option<ParameterSet>,
    seed: u64,
}

impl fmt::Debug for FedAvg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FedAvg")
            .field("config", &self.config)
            .field("fit_config", &self.fit_config)
            .field("evaluate_config", &self.evaluate_config)
            .field("centralized", &self.centralized.is_some())
            .field("fit_metrics", &self.fit_metrics)
            .field("evaluate_metrics", &self.evaluate_metrics)
            .field("seed", &self.seed)
            .finish_non_exhaustive()
    }
}

impl FedAvg {
    /// Starts a builder with default settings.
    #[must_use]
    pub fn builder() -> FedAvgBuilder {
        FedAvgBuilder::default()
    }

    /// Validated settings.
    #[must_use]
    pub const fn config(&self) -> &FedAvgConfig {
        &self.config
    }

    fn sample(
        &self,
        round: u64,
        stream: u64,
        available: &[ParticipantId],
        fraction: f64,
        minimum: usize,
    ) -> Result<Vec<ParticipantId>, FederationError> {
        let total = available.len();
        if total < self.config.min_available_participants {
            return Err(FederationError::InsufficientParticipants {
                available: total,
                required: self.config.min_available_participants,
            });
        }
        let k = sample_size(total, fraction, minimum);
        if k > total {
            return Err(FederationError::InsufficientParticipants {
                available: total,
                required: k,
            });
        }
        // Derived per round so a run never depends on earlier draws.
        let mut rng = SmallRng::seed_from_u64(
            self.seed ^ stream ^ round.wrapping_mul(0x9E37_79B9_7F4A_7C15),
        );
        let mut picked = index::sample(&mut rng, total, k).into_vec();
        picked.sort_unstable();
        Ok(picked.into_iter().map(|i| available[i].clone()).collect())
    }

    fn check_quorum(&self, failures: usize, survivors: usize, minimum: usize) -> Result<(), FederationError> {
        if failures > 0 && !self.config.accept_failures {
            return Err(FederationError::FailuresRejected { failures });
        }
        if survivors < minimum.max(1) {
            return Err(FederationError::InsufficientParticipants {
                available: survivors,
                required: minimum.max(1),
            });
        }
        Ok(())
    }
}

impl Strategy for FedAvg {
    fn name(&self) -> &str {
        "fedavg"
    }

    fn initialize_parameters(&self) -> Option<ParameterSet> {
        self.initial_parameters.clone()
    }

    fn configure_fit(
        &self,
        round: u64,
        _parameters: &ParameterSet,
        available: &[ParticipantId],
    ) -> Result<Vec<Dispatch>, FederationError> {
        let sampled = self.sample(
            round,
            FIT_STREAM,
            available,
            self.config.fit_fraction,
            self.config.min_fit_participants,
        )?;
        let config = round_config(round, &self.fit_config, self.on_fit_config.as_ref());
        Ok(sampled
            .into_iter()
            .map(|participant| Dispatch {
                participant,
                config: config.clone(),
            })
            .collect())
    }

    fn aggregate_fit(
        &self,
        _round: u64,
        results: &[(ParticipantId, FitResult)],
        failures: &[ParticipantFailure],
    ) -> Result<FitAggregate, FederationError> {
        self.check_quorum(failures.len(), results.len(), self.config.min_fit_participants)?;
        let parameters = aggregate_parameters(
            results
                .iter()
                .map(|(_, result)| (&result.parameters, result.num_examples as f64)),
        )?;
        let contributions: Vec<(u64, MetricMap)> = results
            .iter()
            .map(|(_, result)| (result.num_examples, result.metrics.clone()))
            .collect();
        Ok(FitAggregate {
            parameters,
            metrics: self.fit_metrics.apply(&contributions),
        })
    }

    fn configure_evaluate(
        &self,
        round: u64,
        _parameters: &ParameterSet,
        available: &[ParticipantId],
    ) -> Result<Vec<Dispatch>, FederationError> {
        if self.config.evaluate_fraction <= 0.0 {
            return Ok(Vec::new());
        }
        let sampled = self.sample(
            round,
            EVALUATE_STREAM,
            available,
            self.config.evaluate_fraction,
            self.config.min_evaluate_participants,
        )?;
        let config = round_config(round, &self.evaluate_config, self.on_evaluate_config.as_ref());
        Ok(sampled
            .into_iter()
            .map(|participant| Dispatch {
                participant,
                config: config.clone(),
            })
            .collect())
    }

    fn aggregate_evaluate(
        &self,
        _round: u64,
        results: &[(ParticipantId, EvaluateResult)],
        failures: &[ParticipantFailure],
    ) -> Result<EvaluateAggregate, FederationError> {
        self.check_quorum(
            failures.len(),
            results.len(),
            self.config.min_evaluate_participants,
        )?;
        let losses: Vec<(u64, f64)> = results
            .iter()
            .map(|(_, result)| (result.num_examples, result.loss))
            .collect();
        let contributions: Vec<(u64, MetricMap)> = results
            .iter()
            .map(|(_, result)| (result.num_examples, result.metrics.clone()))
            .collect();
        Ok(EvaluateAggregate {
            loss: weighted_loss_average(&losses)?,
            metrics: self.evaluate_metrics.apply(&contributions),
        })
    }

    fn evaluate(&self, round: u64, parameters: &ParameterSet) -> Option<CentralizedEvaluation> {
        let hook = self.centralized.as_ref()?;
        let config = round_config(round, &self.evaluate_config, self.on_evaluate_config.as_ref());
        hook(round, parameters, &config)
            .filter(|(loss, _)| loss.is_finite())
            .map(|(loss, metrics)| CentralizedEvaluation { loss, metrics })
    }
}

/// Builder for [`FedAvg`]; settings are validated in [`FedAvgBuilder::build`].
#[derive(Clone)]
pub struct FedAvgBuilder {
    config: FedAvgConfig,
    fit_config: ConfigMap,
    evaluate_config: ConfigMap,
    on_fit_config: Option<RoundConfigFn>,
    on_evaluate_config: Option<RoundConfigFn>,
    centralized: Option<CentralizedEvaluateFn>,
    fit_metrics: MetricsPolicy,
    evaluate_metrics: MetricsPolicy,
    initial_parameters: Option<ParameterSet>,
    seed: u64,
}

impl Default for FedAvgBuilder {
    fn default() -> Self {
        Self {
            config: FedAvgConfig::default(),
            fit_config: ConfigMap::new(),
            evaluate_config: ConfigMap::new(),
            on_fit_config: None,
            on_evaluate_config: None,
            centralized: None,
            fit_metrics: MetricsPolicy::Declarative(MetricsAggregation::none()),
            evaluate_metrics: MetricsPolicy::Declarative(MetricsAggregation::default()),
            initial_parameters: None,
            seed: 0,
        }
    }
}

impl FedAvgBuilder {
    /// Replaces sampling and quorum settings.
    #[must_use]
    pub fn config(mut self, config: FedAvgConfig) -> Self {
        self.config = config;
        self
    }

    /// Static config sent with every fit call.
    #[must_use]
    pub fn fit_config(mut self, config: ConfigMap) -> Self {
        self.fit_config = config;
        self
    }

    /// Static config sent with every evaluate call and to the centralized hook.
    #[must_use]
    pub fn evaluate_config(mut self, config: ConfigMap) -> Self {
        self.evaluate_config = config;
        self
    }

    /// Per-round fit config, overriding static keys.
    #[must_use]
    pub fn on_fit_config(mut self, producer: RoundConfigFn) -> Self {
        self.on_fit_config = Some(producer);
        self
    }

    /// Per-round evaluate config, overriding static keys.
    #[must_use]
    pub fn on_evaluate_config(mut self, producer: RoundConfigFn) -> Self {
        self.on_evaluate_config = Some(producer);
        self
    }

    /// Centralized evaluation hook.
    #[must_use]
    pub fn centralized_evaluation(mut self, hook: CentralizedEvaluateFn) -> Self {
        self.centralized = Some(hook);
        self
    }

    /// Declarative fit metrics policy (default: none).
    #[must_use]
    pub fn fit_metrics(mut self, policy: MetricsAggregation) -> Self {
        self.fit_metrics = MetricsPolicy::Declarative(policy);
        self
    }

    /// Custom fit metrics reduction.
    #[must_use]
    pub fn fit_metrics_fn(mut self, func: MetricsAggregationFn) -> Self {
        self.fit_metrics = MetricsPolicy::Custom(func);
        self
    }

    /// Declarative evaluate metrics policy (default: weighted accuracy).
    #[must_use]
    pub fn evaluate_metrics(mut self, policy: MetricsAggregation) -> Self {
        self.evaluate_metrics = MetricsPolicy::Declarative(policy);
        self
    }

    /// Custom evaluate metrics reduction.
    #[must_use]
    pub fn evaluate_metrics_fn(mut self, func: MetricsAggregationFn) -> Self {
        self.evaluate_metrics = MetricsPolicy::Custom(func);
        self
    }

    /// Initial global parameters owned by the strategy.
    #[must_use]
    pub fn initial_parameters(mut self, parameters: ParameterSet) -> Self {
        self.initial_parameters = Some(parameters);
        self
    }

    /// Sampling seed.
    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Validates and builds the strategy.
    pub fn build(self) -> Result<FedAvg, FederationError> {
        self.config.validate()?;
        Ok(FedAvg {
            config: self.config,
            fit_config: self.fit_config,
            evaluate_config: self.evaluate_config,
            on_fit_config: self.on_fit_config,
            on_evaluate_config: self.on_evaluate_config,
            centralized: self.centralized,
            fit_metrics: self.fit_metrics,
            evaluate_metrics: self.evaluate_metrics,
            initial_parameters: self.initial_parameters,
            seed: self.seed,
        })
    }
}

/// Centralized evaluation on a held-out dataset no participant can reach.
#[derive(Debug, Clone)]
pub struct HeldOutEvaluator<F> {
    trainers: F,
    data: Dataset,
}

impl<F: TrainerFactory> HeldOutEvaluator<F> {
    /// Pairs a trainer factory with held-out data.
    #[must_use]
    pub const fn new(trainers: F, data: Dataset) -> Self {
        Self { trainers, data }
    }

    /// Loss and accuracy of `parameters` on the held-out data.
    pub fn evaluate(&self, parameters: &ParameterSet) -> Result<(f64, MetricMap), FederationError> {
        let mut trainer = self.trainers.create();
        trainer.set_parameters(parameters)?;
        let summary = trainer.evaluate(&self.data.view())?;
        Ok((summary.loss, scalar_map([("accuracy", summary.accuracy)])))
    }

    /// Wraps the evaluator as a strategy hook. Evaluation errors yield no
    /// centralized result for the round.
    #[must_use]
    pub fn into_hook(self) -> CentralizedEvaluateFn {
        Arc::new(move |_round: u64, parameters: &ParameterSet, _config: &ConfigMap| {
            self.evaluate(parameters).ok()
        })
    }
}
