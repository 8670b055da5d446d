//! Per-round records of a simulation run.

use std::{
    fmt::Write as _,
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::Path,
};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::FederationError,
    scalar::{format_map, MetricMap, Scalar},
};

/// Round phase a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Sampling, dispatch or aggregation of local training.
    Fit,
    /// Sampling, dispatch or aggregation of distributed evaluation.
    Evaluate,
}

/// Outcome of one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RoundStatus {
    /// Every scheduled phase aggregated.
    Completed,
    /// A phase could not aggregate.
    Failed {
        /// Failing phase.
        phase: Phase,
        /// [`FederationError::code`] of the cause.
        code: String,
        /// Human-readable cause.
        reason: String,
    },
}

impl RoundStatus {
    /// Failure status from an error.
    #[must_use]
    pub fn failed(phase: Phase, error: &FederationError) -> Self {
        Self::Failed {
            phase,
            code: error.code().to_string(),
            reason: error.to_string(),
        }
    }
}

/// Participant counts for one phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSummary {
    /// Participants dispatched.
    pub sampled: usize,
    /// Results that reached aggregation.
    pub succeeded: usize,
    /// Failures, timeouts and panics.
    pub failed: usize,
}

/// Loss and metrics computed by the coordinator on its own data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CentralizedEvaluation {
    /// Loss on the held-out data.
    pub loss: f64,
    /// Additional metrics.
    #[serde(default)]
    pub metrics: MetricMap,
}

/// Everything recorded about one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    /// 1-based round index.
    pub round: u64,
    /// Completed or failed.
    pub status: RoundStatus,
    /// Wall-clock start.
    pub started_at: DateTime<Utc>,
    /// Fit phase counts.
    pub fit: PhaseSummary,
    /// Aggregated training metrics.
    #[serde(default)]
    pub fit_metrics: MetricMap,
    /// Evaluate phase counts; `None` when the phase did not run.
    #[serde(default)]
    pub evaluate: Option<PhaseSummary>,
    /// Example-weighted validation loss.
    #[serde(default)]
    pub distributed_loss: Option<f64>,
    /// Aggregated validation metrics.
    #[serde(default)]
    pub distributed_metrics: MetricMap,
    /// Centralized evaluation after the fit barrier.
    #[serde(default)]
    pub centralized: Option<CentralizedEvaluation>,
    /// Round duration.
    pub duration_ms: u64,
}

impl RoundRecord {
    /// Empty record for a round starting now.
    #[must_use]
    pub fn started(round: u64) -> Self {
        Self {
            round,
            status: RoundStatus::Completed,
            started_at: Utc::now(),
            fit: PhaseSummary::default(),
            fit_metrics: MetricMap::new(),
            evaluate: None,
            distributed_loss: None,
            distributed_metrics: MetricMap::new(),
            centralized: None,
            duration_ms: 0,
        }
    }

    /// True when the round completed.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self.status, RoundStatus::Completed)
    }

    /// Error code of a failed round.
    #[must_use]
    pub fn failure_code(&self) -> Option<&str> {
        match &self.status {
            RoundStatus::Completed => None,
            RoundStatus::Failed { code, .. } => Some(code),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum HistoryLine {
    Run {
        run_id: Uuid,
        strategy: String,
        #[serde(default)]
        initial: Option<CentralizedEvaluation>,
    },
    Round(RoundRecord),
}

/// Append-only sequence of round records plus the centralized evaluation of
/// the initial parameters (round 0).
#[derive(Debug, Clone, PartialEq)]
pub struct History {
    run_id: Uuid,
    strategy: String,
    initial: Option<CentralizedEvaluation>,
    records: Vec<RoundRecord>,
}

impl History {
    pub(crate) fn new(run_id: Uuid, strategy: impl Into<String>) -> Self {
        Self {
            run_id,
            strategy: strategy.into(),
            initial: None,
            records: Vec::new(),
        }
    }

    pub(crate) fn set_initial(&mut self, initial: Option<CentralizedEvaluation>) {
        self.initial = initial;
    }

    pub(crate) fn push(&mut self, record: RoundRecord) {
        self.records.push(record);
    }

    /// Identifier of the run.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Name of the strategy that produced the run.
    #[must_use]
    pub fn strategy(&self) -> &str {
        &self.strategy
    }

    /// Centralized evaluation of the initial parameters.
    #[must_use]
    pub const fn initial(&self) -> Option<&CentralizedEvaluation> {
        self.initial.as_ref()
    }

    /// Records in round order.
    #[must_use]
    pub fn records(&self) -> &[RoundRecord] {
        &self.records
    }

    /// Number of rounds recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True before the first round.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Rounds that completed.
    #[must_use]
    pub fn completed_rounds(&self) -> usize {
        self.records.iter().filter(|r| r.is_completed()).count()
    }

    /// `(round, loss)` of distributed evaluation.
    #[must_use]
    pub fn distributed_losses(&self) -> Vec<(u64, f64)> {
        self.records
            .iter()
            .filter_map(|r| r.distributed_loss.map(|loss| (r.round, loss)))
            .collect()
    }

    /// `(round, loss)` of centralized evaluation, round 0 first.
    #[must_use]
    pub fn centralized_losses(&self) -> Vec<(u64, f64)> {
        self.initial
            .iter()
            .map(|eval| (0, eval.loss))
            .chain(
                self.records
                    .iter()
                    .filter_map(|r| r.centralized.as_ref().map(|eval| (r.round, eval.loss))),
            )
            .collect()
    }

    /// `(round, value)` of an aggregated distributed evaluation metric.
    #[must_use]
    pub fn distributed_metric(&self, key: &str) -> Vec<(u64, f64)> {
        self.records
            .iter()
            .filter_map(|r| {
                r.distributed_metrics
                    .get(key)
                    .and_then(Scalar::as_f64)
                    .map(|value| (r.round, value))
            })
            .collect()
    }

    /// `(round, value)` of a centralized metric, round 0 first.
    #[must_use]
    pub fn centralized_metric(&self, key: &str) -> Vec<(u64, f64)> {
        let pick = |round: u64, eval: &CentralizedEvaluation| {
            eval.metrics.get(key).and_then(Scalar::as_f64).map(|v| (round, v))
        };
        self.initial
            .iter()
            .filter_map(|eval| pick(0, eval))
            .chain(
                self.records
                    .iter()
                    .filter_map(|r| r.centralized.as_ref().and_then(|eval| pick(r.round, eval))),
            )
            .collect()
    }

    /// Writes a header line followed by one line per round.
    pub fn write_jsonl(&self, mut writer: impl Write) -> Result<()> {
        let header = HistoryLine::Run {
            run_id: self.run_id,
            strategy: self.strategy.clone(),
            initial: self.initial.clone(),
        };
        serde_json::to_writer(&mut writer, &header)?;
        writer.write_all(b"\n")?;
        for record in &self.records {
            serde_json::to_writer(&mut writer, &HistoryLine::Round(record.clone()))?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Saves the history as JSON lines.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        self.write_jsonl(BufWriter::new(file))
    }

    /// Loads a history written by [`History::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let mut history: Option<Self> = None;
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let parsed: HistoryLine = serde_json::from_str(&line)
                .with_context(|| format!("parsing {} line {}", path.display(), line_no + 1))?;
            match parsed {
                HistoryLine::Run { run_id, strategy, initial } => {
                    if history.is_some() {
                        bail!("{} line {}: second run header", path.display(), line_no + 1);
                    }
                    let mut fresh = Self::new(run_id, strategy);
                    fresh.set_initial(initial);
                    history = Some(fresh);
                }
                HistoryLine::Round(record) => match history.as_mut() {
                    Some(current) => current.push(record),
                    None => bail!("{} line {}: round before run header", path.display(), line_no + 1),
                },
            }
        }
        history.with_context(|| format!("{} holds no run header", path.display()))
    }

    /// Plain-text table, one row per round.
    #[must_use]
    pub fn render_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "run {} ({})", self.run_id, self.strategy);
        if let Some(initial) = &self.initial {
            let _ = writeln!(
                out,
                "initial centralized loss {:.4} {}",
                initial.loss,
                format_map(&initial.metrics)
            );
        }
        let _ = writeln!(
            out,
            "{:>5}  {:<28}  {:>7}  {:>7}  {:>9}  {:>9}  {:>7}  metrics",
            "round", "status", "fit", "eval", "dist_loss", "cent_loss", "ms"
        );
        for record in &self.records {
            let status = match &record.status {
                RoundStatus::Completed => "completed".to_string(),
                RoundStatus::Failed { phase, code, .. } => {
                    format!("failed {} {code}", phase_label(*phase))
                }
            };
            let eval = record
                .evaluate
                .map_or_else(|| "-".to_string(), |s| format!("{}/{}", s.succeeded, s.sampled));
            let dist = record
                .distributed_loss
                .map_or_else(|| "-".to_string(), |l| format!("{l:.4}"));
            let cent = record
                .centralized
                .as_ref()
                .map_or_else(|| "-".to_string(), |c| format!("{:.4}", c.loss));
            let mut metrics = format_map(&record.distributed_metrics);
            if let Some(central) = &record.centralized {
                if !central.metrics.is_empty() {
                    let _ = write!(metrics, " central[{}]", format_map(&central.metrics));
                }
            }
            let _ = writeln!(
                out,
                "{:>5}  {:<28}  {:>7}  {:>7}  {:>9}  {:>9}  {:>7}  {}",
                record.round,
                status,
                format!("{}/{}", record.fit.succeeded, record.fit.sampled),
                eval,
                dist,
                cent,
                record.duration_ms,
                metrics.trim()
            );
        }
        out
    }
}

const fn phase_label(phase: Phase) -> &'static str {
    match phase {
        Phase::Fit => "fit",
        Phase::Evaluate => "evaluate",
    }
}
