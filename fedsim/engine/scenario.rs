//! Assembles a runnable simulation from a [`SimulationConfig`].

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::json;
use shared_event_bus::FileEventPublisher;
use shared_logging::LogLevel;

use crate::{
    aggregate::{MetricReduction, MetricsAggregation},
    config::{DatasetConfig, SimulationConfig},
    dataset::{Dataset, SyntheticBlobs},
    driver::SimulationDriver,
    history::History,
    participant::DataParticipantFactory,
    partition::federate,
    pool::WorkerPool,
    scalar::scalar_map,
    strategy::{FedAvg, HeldOutEvaluator},
    telemetry::FederationTelemetry,
    trainer::SoftmaxTrainerFactory,
};

/// Participant data and the optional held-out set.
#[derive(Debug, Clone)]
pub struct ScenarioData {
    /// Data partitioned among participants.
    pub train: Dataset,
    /// Data only the coordinator evaluates on.
    pub held_out: Option<Dataset>,
}

impl ScenarioData {
    /// Generates or loads the data described by `config`.
    pub fn load(config: &SimulationConfig) -> Result<Self> {
        match &config.dataset {
            DatasetConfig::Synthetic {
                samples,
                held_out,
                features,
                classes,
                spread,
            } => {
                let blobs = SyntheticBlobs::new(*features, *classes, *spread, config.seed)?;
                Ok(Self {
                    train: blobs.sample(*samples, config.seed.wrapping_add(1)),
                    held_out: (*held_out > 0)
                        .then(|| blobs.sample(*held_out, config.seed.wrapping_add(2))),
                })
            }
            DatasetConfig::Jsonl {
                path,
                held_out_path,
            } => {
                let train = Dataset::from_jsonl(path)?;
                let held_out = held_out_path
                    .as_ref()
                    .map(Dataset::from_jsonl)
                    .transpose()?;
                if let Some(held) = &held_out {
                    if !held.is_empty() && held.feature_dim() != train.feature_dim() {
                        bail!(
                            "held-out data has {} features, participant data has {}",
                            held.feature_dim(),
                            train.feature_dim()
                        );
                    }
                }
                Ok(Self { train, held_out })
            }
        }
    }

    /// Classes the model must output.
    #[must_use]
    pub fn num_classes(&self) -> usize {
        let held = self.held_out.as_ref().map_or(0, Dataset::num_classes);
        self.train.num_classes().max(held)
    }
}

/// Telemetry sinks named in `[telemetry]`.
pub fn telemetry_from(config: &SimulationConfig) -> Result<FederationTelemetry> {
    let mut builder = FederationTelemetry::builder("fedsim").min_level(config.telemetry.log_level);
    if let Some(path) = &config.telemetry.log_path {
        builder = builder.log_path(path);
    }
    if let Some(path) = &config.telemetry.event_log {
        builder = builder.event_publisher(Arc::new(FileEventPublisher::new(path)?));
    }
    builder.build()
}

/// Ready-to-run simulation: data partitioned, participants and strategy
/// built, pool sized.
#[derive(Debug)]
pub struct Scenario {
    config: SimulationConfig,
    driver: SimulationDriver,
    train_samples: usize,
    held_out_samples: Option<usize>,
}

impl Scenario {
    /// Builds the scenario with the telemetry sinks named in the config.
    pub fn from_config(config: &SimulationConfig) -> Result<Self> {
        let telemetry = telemetry_from(config)?;
        Self::with_telemetry(config, telemetry)
    }

    /// Builds the scenario with caller-provided telemetry.
    pub fn with_telemetry(config: &SimulationConfig, telemetry: FederationTelemetry) -> Result<Self> {
        config.validate().context("invalid simulation config")?;
        let data = ScenarioData::load(config)?;
        if data.train.is_empty() {
            bail!("participant dataset is empty");
        }
        let splits = federate(&data.train, config.num_participants, config.validation_fraction)?;
        let classes = data.num_classes();
        let trainers = SoftmaxTrainerFactory::new(data.train.feature_dim(), classes, config.seed);
        let options = config.train_options();
        let factory = DataParticipantFactory::new(trainers, splits, options);

        let mut strategy = FedAvg::builder()
            .config(config.strategy.clone())
            .fit_config(scalar_map([
                ("local_epochs", options.epochs),
                ("batch_size", options.batch_size),
            ]))
            .fit_metrics(
                MetricsAggregation::none()
                    .with("loss", MetricReduction::WeightedMean)
                    .with("accuracy", MetricReduction::WeightedMean),
            )
            .on_fit_config(Arc::new(move |_round: u64| {
                scalar_map([("learning_rate", f64::from(options.learning_rate))])
            }))
            .seed(config.seed);
        let held_out_samples = data.held_out.as_ref().map(Dataset::len);
        if config.centralized_evaluation {
            match data.held_out {
                Some(held) if !held.is_empty() => {
                    strategy = strategy
                        .centralized_evaluation(HeldOutEvaluator::new(trainers, held).into_hook());
                }
                _ => {
                    let _ = telemetry.log(
                        LogLevel::Warn,
                        "centralized evaluation requested without held-out data",
                        None,
                        json!({}),
                    );
                }
            }
        }

        let pool = WorkerPool::from_budget(&config.budget()?, config.round_timeout())?;
        let _ = telemetry.log(
            LogLevel::Info,
            "scenario prepared",
            None,
            json!({
                "participants": config.num_participants,
                "train_samples": data.train.len(),
                "held_out_samples": held_out_samples,
                "features": data.train.feature_dim(),
                "classes": classes,
                "parallelism": pool.parallelism(),
            }),
        );
        let driver = SimulationDriver::builder(Arc::new(factory), Arc::new(strategy.build()?))
            .num_participants(config.num_participants)
            .num_rounds(config.num_rounds)
            .pool(pool)
            .telemetry(telemetry)
            .build()?;
        Ok(Self {
            config: config.clone(),
            driver,
            train_samples: data.train.len(),
            held_out_samples,
        })
    }

    /// Configuration the scenario was built from.
    #[must_use]
    pub const fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Underlying driver.
    #[must_use]
    pub const fn driver(&self) -> &SimulationDriver {
        &self.driver
    }

    /// Samples shared among participants.
    #[must_use]
    pub const fn train_samples(&self) -> usize {
        self.train_samples
    }

    /// Held-out samples, if any.
    #[must_use]
    pub const fn held_out_samples(&self) -> Option<usize> {
        self.held_out_samples
    }

    /// Runs every round.
    pub async fn run(&self) -> Result<History> {
        self.driver.run().await.context("simulation aborted")
    }
}
