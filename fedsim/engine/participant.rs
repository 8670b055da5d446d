//! Participant handles and the factories that spawn them.
//!
//! A handle is created for exactly one `fit` or `evaluate` call and dropped
//! afterwards; the only state that survives a round is the global
//! [`ParameterSet`] held by the driver.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    error::FederationError,
    parameters::ParameterSet,
    partition::Split,
    scalar::{scalar_map, ConfigMap, MetricMap},
    trainer::{LocalTrainer, TrainOptions, TrainerFactory},
};

/// Opaque participant identifier; the bundled factories use the decimal
/// partition index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Wraps an identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier of partition `index`.
    #[must_use]
    pub fn from_index(index: usize) -> Self {
        Self(index.to_string())
    }

    /// Raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Partition index encoded in the id.
    pub fn partition_index(&self) -> Result<usize, FederationError> {
        self.0
            .parse()
            .map_err(|_| FederationError::UnknownParticipant(self.0.clone()))
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Output of a local training call.
#[derive(Debug, Clone, PartialEq)]
pub struct FitResult {
    /// Locally updated parameters.
    pub parameters: ParameterSet,
    /// Training examples used; the aggregation weight.
    pub num_examples: u64,
    /// Training metrics.
    pub metrics: MetricMap,
}

/// Output of a local evaluation call.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluateResult {
    /// Mean loss on the validation slice.
    pub loss: f64,
    /// Validation examples seen.
    pub num_examples: u64,
    /// Evaluation metrics.
    pub metrics: MetricMap,
}

/// One dropped contribution.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantFailure {
    /// Participant that failed.
    pub participant: ParticipantId,
    /// Why.
    pub error: FederationError,
}

impl ParticipantFailure {
    /// Pairs a participant with its error.
    #[must_use]
    pub const fn new(participant: ParticipantId, error: FederationError) -> Self {
        Self { participant, error }
    }
}

/// Single-use handle bound to one data slice.
pub trait Participant: Send {
    /// Trains from `parameters` and returns the local update.
    fn fit(&mut self, parameters: ParameterSet, config: &ConfigMap) -> Result<FitResult, FederationError>;

    /// Evaluates `parameters` on local validation data.
    fn evaluate(
        &mut self,
        parameters: ParameterSet,
        config: &ConfigMap,
    ) -> Result<EvaluateResult, FederationError>;
}

/// Produces participant handles on demand.
pub trait ParticipantFactory: Send + Sync {
    /// Builds a fresh handle for `id`.
    fn spawn(&self, id: &ParticipantId) -> Result<Box<dyn Participant>, FederationError>;

    /// Parameters a run starts from when neither the caller nor the strategy
    /// provides any.
    fn initial_parameters(&self) -> Option<ParameterSet> {
        None
    }
}

impl<F> ParticipantFactory for F
where
    F: Fn(&ParticipantId) -> Result<Box<dyn Participant>, FederationError> + Send + Sync,
{
    fn spawn(&self, id: &ParticipantId) -> Result<Box<dyn Participant>, FederationError> {
        self(id)
    }
}

/// Participant training a [`LocalTrainer`] on its split.
pub struct DataParticipant<T> {
    trainer: T,
    split: Split,
    defaults: TrainOptions,
}

impl<T: LocalTrainer> DataParticipant<T> {
    /// Binds a trainer to a split.
    #[must_use]
    pub const fn new(trainer: T, split: Split, defaults: TrainOptions) -> Self {
        Self {
            trainer,
            split,
            defaults,
        }
    }
}

impl<T: LocalTrainer> Participant for DataParticipant<T> {
    fn fit(&mut self, parameters: ParameterSet, config: &ConfigMap) -> Result<FitResult, FederationError> {
        self.trainer.set_parameters(&parameters)?;
        let options = self.defaults.merged(config);
        let summary = self.trainer.train(&self.split.train, &options)?;
        Ok(FitResult {
            parameters: self.trainer.parameters(),
            num_examples: summary.examples as u64,
            metrics: scalar_map([("loss", summary.loss), ("accuracy", summary.accuracy)]),
        })
    }

    fn evaluate(
        &mut self,
        parameters: ParameterSet,
        _config: &ConfigMap,
    ) -> Result<EvaluateResult, FederationError> {
        self.trainer.set_parameters(&parameters)?;
        let summary = self.trainer.evaluate(&self.split.validation)?;
        Ok(EvaluateResult {
            loss: summary.loss,
            num_examples: summary.examples as u64,
            metrics: scalar_map([("accuracy", summary.accuracy)]),
        })
    }
}

/// Factory backing participant `i` with split `i`.
pub struct DataParticipantFactory<F> {
    trainers: F,
    splits: Arc<[Split]>,
    defaults: TrainOptions,
}

impl<F: TrainerFactory> DataParticipantFactory<F> {
    /// Creates a factory over pre-computed splits.
    #[must_use]
    pub fn new(trainers: F, splits: Vec<Split>, defaults: TrainOptions) -> Self {
        Self {
            trainers,
            splits: splits.into(),
            defaults,
        }
    }

    /// Number of participants backed by a split.
    #[must_use]
    pub fn len(&self) -> usize {
        self.splits.len()
    }

    /// True when no split is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.splits.is_empty()
    }

    /// Ids of every backed participant, in index order.
    #[must_use]
    pub fn ids(&self) -> Vec<ParticipantId> {
        (0..self.splits.len()).map(ParticipantId::from_index).collect()
    }
}

impl<F: TrainerFactory> ParticipantFactory for DataParticipantFactory<F> {
    fn spawn(&self, id: &ParticipantId) -> Result<Box<dyn Participant>, FederationError> {
        let index = id.partition_index()?;
        let split = self
            .splits
            .get(index)
            .cloned()
            .ok_or_else(|| FederationError::UnknownParticipant(id.to_string()))?;
        Ok(Box::new(DataParticipant::new(
            self.trainers.create(),
            split,
            self.defaults,
        )))
    }

    fn initial_parameters(&self) -> Option<ParameterSet> {
        Some(self.trainers.initial_parameters())
    }
}
