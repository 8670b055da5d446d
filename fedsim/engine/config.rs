use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shared_logging::LogLevel;

use crate::{
    error::FederationError,
    pool::ResourceBudget,
    strategy::FedAvgConfig,
    trainer::TrainOptions,
};

/// Complete description of one simulation scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    /// Participants, one partition each.
    pub num_participants: usize,
    /// Rounds to run.
    pub num_rounds: u64,
    /// Share of each partition kept for local validation.
    pub validation_fraction: f64,
    /// Local mini-batch size.
    pub batch_size: usize,
    /// Local passes over the train slice per round.
    pub local_epochs: usize,
    /// Local SGD step size.
    pub learning_rate: f64,
    /// Seed for data, initial weights and sampling.
    pub seed: u64,
    /// Per-phase deadline in seconds.
    pub round_timeout_secs: Option<f64>,
    /// Evaluate the global model on held-out data after every fit.
    pub centralized_evaluation: bool,
    /// Sampling and quorum settings.
    pub strategy: FedAvgConfig,
    /// Concurrency budget.
    pub resources: ResourcesConfig,
    /// Data source.
    pub dataset: DatasetConfig,
    /// Log and event sinks.
    pub telemetry: TelemetryConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            num_participants: 10,
            num_rounds: 5,
            validation_fraction: 0.2,
            batch_size: 32,
            local_epochs: 1,
            learning_rate: 0.1,
            seed: 42,
            round_timeout_secs: None,
            centralized_evaluation: true,
            strategy: FedAvgConfig::default(),
            resources: ResourcesConfig::default(),
            dataset: DatasetConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

/// `[resources]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourcesConfig {
    /// Total units; host parallelism when absent.
    pub total: Option<f64>,
    /// Units one running participant holds.
    pub per_participant_resource_cost: f64,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            total: None,
            per_participant_resource_cost: 2.0,
        }
    }
}

/// `[dataset]` table, selected by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum DatasetConfig {
    /// Seeded class-centred clusters.
    Synthetic {
        /// Samples shared among participants.
        #[serde(default = "default_samples")]
        samples: usize,
        /// Samples reserved for centralized evaluation.
        #[serde(default = "default_held_out")]
        held_out: usize,
        /// Feature dimension.
        #[serde(default = "default_features")]
        features: usize,
        /// Number of classes.
        #[serde(default = "default_classes")]
        classes: usize,
        /// Half-width of the uniform noise around each class centre.
        #[serde(default = "default_spread")]
        spread: f32,
    },
    /// `{"features": [...], "label": n}` records, one per line.
    Jsonl {
        /// Participant data.
        path: PathBuf,
        /// Centralized evaluation data.
        #[serde(default)]
        held_out_path: Option<PathBuf>,
    },
}

const fn default_samples() -> usize {
    2000
}

const fn default_held_out() -> usize {
    400
}

const fn default_features() -> usize {
    16
}

const fn default_classes() -> usize {
    10
}

const fn default_spread() -> f32 {
    0.6
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self::Synthetic {
            samples: default_samples(),
            held_out: default_held_out(),
            features: default_features(),
            classes: default_classes(),
            spread: default_spread(),
        }
    }
}

/// `[telemetry]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    /// JSON-lines log file.
    pub log_path: Option<PathBuf>,
    /// JSON-lines event file.
    pub event_log: Option<PathBuf>,
    /// Minimum level written to the log.
    pub log_level: LogLevel,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_path: None,
            event_log: None,
            log_level: LogLevel::Info,
        }
    }
}

impl SimulationConfig {
    /// Loads and validates a TOML file. Relative paths inside it resolve
    /// against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading simulation config {}", path.display()))?;
        let mut config =
            Self::from_toml_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        let base = path.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        config.resolve_paths(&base);
        Ok(config)
    }

    /// Parses and validates TOML text.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes to TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        if let DatasetConfig::Jsonl {
            path,
            held_out_path,
        } = &mut self.dataset
        {
            resolve(path);
            held_out_path.iter_mut().for_each(resolve);
        }
        self.telemetry.log_path.iter_mut().for_each(resolve);
        self.telemetry.event_log.iter_mut().for_each(resolve);
    }

    /// Checks every value that would otherwise fail mid-run.
    pub fn validate(&self) -> Result<(), FederationError> {
        let invalid = |message: String| Err(FederationError::InvalidConfig(message));
        if self.num_participants == 0 {
            return invalid("num_participants must be at least 1".into());
        }
        if self.num_rounds == 0 {
            return invalid("num_rounds must be at least 1".into());
        }
        if !(0.0..1.0).contains(&self.validation_fraction) {
            return invalid(format!(
                "validation_fraction must be in [0, 1), got {}",
                self.validation_fraction
            ));
        }
        if self.local_epochs == 0 {
            return invalid("local_epochs must be at least 1".into());
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1".into());
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return invalid(format!("learning_rate must be positive, got {}", self.learning_rate));
        }
        if let Some(secs) = self.round_timeout_secs {
            if !(secs.is_finite() && secs > 0.0) {
                return invalid(format!("round_timeout_secs must be positive, got {secs}"));
            }
        }
        self.strategy.validate()?;
        self.budget()?;
        if let DatasetConfig::Synthetic {
            samples,
            features,
            classes,
            spread,
            ..
        } = &self.dataset
        {
            if samples % self.num_participants != 0 {
                return Err(FederationError::SizeMismatch {
                    len: *samples,
                    parts: self.num_participants,
                });
            }
            if *features == 0 || *classes < 2 || !(spread.is_finite() && *spread > 0.0) {
                return invalid(format!(
                    "synthetic dataset needs features >= 1, classes >= 2 and spread > 0 (got {features}, {classes}, {spread})"
                ));
            }
        }
        Ok(())
    }

    /// Local training defaults sent with every fit.
    #[must_use]
    pub fn train_options(&self) -> TrainOptions {
        TrainOptions {
            epochs: self.local_epochs,
            batch_size: self.batch_size,
            learning_rate: self.learning_rate as f32,
        }
    }

    /// Per-phase deadline.
    #[must_use]
    pub fn round_timeout(&self) -> Option<Duration> {
        self.round_timeout_secs.map(Duration::from_secs_f64)
    }

    /// Resource budget from `[resources]`.
    pub fn budget(&self) -> Result<ResourceBudget, FederationError> {
        let per = self.resources.per_participant_resource_cost;
        match self.resources.total {
            Some(total) => ResourceBudget::new(total, per),
            None => ResourceBudget::host(per),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_follow_reference_scenario() {
        let config = SimulationConfig::default();
        assert_eq!(config.num_participants, 10);
        assert_eq!(config.num_rounds, 5);
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.strategy.min_evaluate_participants, 5);
        assert!((config.resources.per_participant_resource_cost - 2.0).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let config = SimulationConfig::from_toml_str(
            r#"
            num_rounds = 3
            round_timeout_secs = 1.5

            [strategy]
            evaluate_fraction = 0.0

            [resources]
            total = 4.0

            [dataset]
            kind = "synthetic"
            samples = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.num_rounds, 3);
        assert_eq!(config.num_participants, 10);
        assert_eq!(config.round_timeout(), Some(Duration::from_millis(1500)));
        assert!((config.strategy.fit_fraction - 1.0).abs() < f64::EPSILON);
        assert_eq!(config.budget().unwrap().parallelism(), 2);
        match config.dataset {
            DatasetConfig::Synthetic { samples, classes, .. } => {
                assert_eq!(samples, 500);
                assert_eq!(classes, 10);
            }
            DatasetConfig::Jsonl { .. } => panic!("expected synthetic"),
        }
    }

    #[test]
    fn rejects_unknown_keys_and_bad_values() {
        assert!(SimulationConfig::from_toml_str("num_round = 3").is_err());
        assert!(SimulationConfig::from_toml_str("[strategy]\nfit_fraction = 1.2").is_err());
        assert!(SimulationConfig::from_toml_str("validation_fraction = 1.0").is_err());
        assert!(SimulationConfig::from_toml_str("num_rounds = 0").is_err());
        assert!(SimulationConfig::from_toml_str("local_epochs = 0").is_err());
        assert!(SimulationConfig::from_toml_str("[resources]\ntotal = 1.0").is_err());
        let uneven = SimulationConfig::from_toml_str("num_participants = 7");
        assert!(uneven.unwrap_err().to_string().contains("cannot be split"));
    }

    #[test]
    fn toml_output_parses_back() {
        let config = SimulationConfig {
            round_timeout_secs: Some(30.0),
            ..SimulationConfig::default()
        };
        let text = config.to_toml().unwrap();
        assert!(text.contains("[strategy]"));
        assert_eq!(SimulationConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scenario.toml");
        fs::write(
            &path,
            "[dataset]\nkind = \"jsonl\"\npath = \"data/train.jsonl\"\n\n[telemetry]\nlog_path = \"logs/run.log\"\n",
        )
        .unwrap();
        let config = SimulationConfig::load(&path).unwrap();
        match &config.dataset {
            DatasetConfig::Jsonl { path, held_out_path } => {
                assert_eq!(path, &dir.path().join("data/train.jsonl"));
                assert!(held_out_path.is_none());
            }
            DatasetConfig::Synthetic { .. } => panic!("expected jsonl"),
        }
        assert_eq!(
            config.telemetry.log_path.as_deref(),
            Some(dir.path().join("logs/run.log").as_path())
        );
    }
}
