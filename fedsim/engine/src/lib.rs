#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

//! Fedsim engine – partitions data among simulated participants, dispatches
//! local training in bounded parallel rounds, and combines the results with
//! federated averaging.

/// Errors shared by every component.
#[path = "../error.rs"]
pub mod error;

/// Scalar values and metric/config maps.
#[path = "../scalar.rs"]
pub mod scalar;

/// Model parameter tensors.
#[path = "../parameters.rs"]
pub mod parameters;

/// Labelled datasets, views and synthetic data.
#[path = "../dataset.rs"]
pub mod dataset;

/// Contiguous partitioning and train/validation splits.
#[path = "../partition.rs"]
pub mod partition;

/// Local trainer boundary and the softmax trainer.
#[path = "../trainer.rs"]
pub mod trainer;

/// Participant handles and factories.
#[path = "../participant.rs"]
pub mod participant;

/// Parameter, metric and loss aggregation.
#[path = "../aggregate.rs"]
pub mod aggregate;

/// Round history.
#[path = "../history.rs"]
pub mod history;

/// Sampling and aggregation strategies.
#[path = "../strategy.rs"]
pub mod strategy;

/// Worker pool and resource budget.
#[path = "../pool.rs"]
pub mod pool;

/// Telemetry for the engine.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Simulation loop.
#[path = "../driver.rs"]
pub mod driver;

/// TOML scenario configuration.
#[path = "../config.rs"]
pub mod config;

/// Scenario assembly from configuration.
#[path = "../scenario.rs"]
pub mod scenario;

pub use aggregate::{
    aggregate_metrics, aggregate_parameters, weighted_loss_average, MetricReduction,
    MetricsAggregation, MetricsAggregationFn,
};
pub use config::{DatasetConfig, ResourcesConfig, SimulationConfig, TelemetryConfig};
pub use dataset::{DataSlice, Dataset, Sample, SyntheticBlobs};
pub use driver::{run_simulation, SimulationDriver, SimulationDriverBuilder};
pub use error::FederationError;
pub use history::{CentralizedEvaluation, History, Phase, PhaseSummary, RoundRecord, RoundStatus};
pub use parameters::ParameterSet;
pub use participant::{
    DataParticipant, DataParticipantFactory, EvaluateResult, FitResult, Participant,
    ParticipantFactory, ParticipantFailure, ParticipantId,
};
pub use partition::{federate, partition, split, Partition, Split};
pub use pool::{PhaseOutcome, ResourceBudget, WorkerPool};
pub use scalar::{ConfigMap, MetricMap, Scalar};
pub use scenario::{Scenario, ScenarioData};
pub use strategy::{
    CentralizedEvaluateFn, Dispatch, FedAvg, FedAvgBuilder, FedAvgConfig, HeldOutEvaluator,
    RoundConfigFn, Strategy,
};
pub use telemetry::{FederationTelemetry, FederationTelemetryBuilder};
pub use trainer::{LocalTrainer, SoftmaxTrainer, SoftmaxTrainerFactory, TrainOptions, TrainerFactory};
