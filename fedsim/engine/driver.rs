//! The round loop: sample, dispatch, barrier, aggregate, record.

use std::{fmt, sync::Arc, time::Instant};

use serde_json::{json, Value};
use shared_logging::LogLevel;
use uuid::Uuid;

use crate::{
    error::FederationError,
    history::{History, Phase, PhaseSummary, RoundRecord, RoundStatus},
    parameters::ParameterSet,
    participant::{ParticipantFactory, ParticipantFailure, ParticipantId},
    pool::{ResourceBudget, WorkerPool},
    strategy::Strategy,
    telemetry::FederationTelemetry,
};

/// Runs a fixed number of rounds and owns the global parameters while it
/// does. Each call to [`SimulationDriver::run`] starts from the initial
/// parameters again.
pub struct SimulationDriver {
    factory: Arc<dyn ParticipantFactory>,
    participants: Vec<ParticipantId>,
    strategy: Arc<dyn Strategy>,
    pool: WorkerPool,
    num_rounds: u64,
    initial_parameters: Option<ParameterSet>,
    telemetry: FederationTelemetry,
}

impl fmt::Debug for SimulationDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulationDriver")
            .field("participants", &self.participants.len())
            .field("strategy", &self.strategy.name())
            .field("pool", &self.pool)
            .field("num_rounds", &self.num_rounds)
            .finish_non_exhaustive()
    }
}

/// Builder for [`SimulationDriver`].
pub struct SimulationDriverBuilder {
    factory: Arc<dyn ParticipantFactory>,
    strategy: Arc<dyn Strategy>,
    participants: Vec<ParticipantId>,
    pool: Option<WorkerPool>,
    num_rounds: u64,
    initial_parameters: Option<ParameterSet>,
    telemetry: FederationTelemetry,
}

impl SimulationDriverBuilder {
    /// Starts a builder; participants default to none and rounds to one.
    #[must_use]
    pub fn new(factory: Arc<dyn ParticipantFactory>, strategy: Arc<dyn Strategy>) -> Self {
        Self {
            factory,
            strategy,
            participants: Vec::new(),
            pool: None,
            num_rounds: 1,
            initial_parameters: None,
            telemetry: FederationTelemetry::disabled(),
        }
    }

    /// Explicit participant ids.
    #[must_use]
    pub fn participants(mut self, participants: Vec<ParticipantId>) -> Self {
        self.participants = participants;
        self
    }

    /// Participants `"0"` to `"n-1"`.
    #[must_use]
    pub fn num_participants(mut self, n: usize) -> Self {
        self.participants = (0..n).map(ParticipantId::from_index).collect();
        self
    }

    /// Worker pool; defaults to one slot per host CPU.
    #[must_use]
    pub fn pool(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Number of rounds; must be positive.
    #[must_use]
    pub const fn num_rounds(mut self, rounds: u64) -> Self {
        self.num_rounds = rounds;
        self
    }

    /// Parameters overriding both strategy and factory initialization.
    #[must_use]
    pub fn initial_parameters(mut self, parameters: ParameterSet) -> Self {
        self.initial_parameters = Some(parameters);
        self
    }

    /// Telemetry sinks.
    #[must_use]
    pub fn telemetry(mut self, telemetry: FederationTelemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Validates and builds the driver.
    pub fn build(self) -> Result<SimulationDriver, FederationError> {
        if self.num_rounds == 0 {
            return Err(FederationError::InvalidConfig(
                "num_rounds must be at least 1".into(),
            ));
        }
        let pool = match self.pool {
            Some(pool) => pool,
            None => WorkerPool::from_budget(&ResourceBudget::host(1.0)?, None)?,
        };
        Ok(SimulationDriver {
            factory: self.factory,
            participants: self.participants,
            strategy: self.strategy,
            pool,
            num_rounds: self.num_rounds,
            initial_parameters: self.initial_parameters,
            telemetry: self.telemetry,
        })
    }
}

impl SimulationDriver {
    /// Returns a builder.
    #[must_use]
    pub fn builder(factory: Arc<dyn ParticipantFactory>, strategy: Arc<dyn Strategy>) -> SimulationDriverBuilder {
        SimulationDriverBuilder::new(factory, strategy)
    }

    /// Configured rounds.
    #[must_use]
    pub const fn num_rounds(&self) -> u64 {
        self.num_rounds
    }

    /// Participant ids offered to the strategy each round.
    #[must_use]
    pub fn participants(&self) -> &[ParticipantId] {
        &self.participants
    }

    fn resolve_parameters(&self) -> Result<ParameterSet, FederationError> {
        self.initial_parameters
            .clone()
            .or_else(|| self.strategy.initialize_parameters())
            .or_else(|| self.factory.initial_parameters())
            .ok_or_else(|| {
                FederationError::InvalidConfig(
                    "no initial parameters from caller, strategy or participant factory".into(),
                )
            })
    }

    /// Runs every round and returns the history. Round failures are recorded,
    /// not returned; only setup errors surface here.
    pub async fn run(&self) -> Result<History, FederationError> {
        let mut parameters = self.resolve_parameters()?;
        let mut history = History::new(Uuid::new_v4(), self.strategy.name());
        let started = Instant::now();
        self.note(
            LogLevel::Info,
            "simulation started",
            None,
            json!({
                "run_id": history.run_id(),
                "strategy": self.strategy.name(),
                "participants": self.participants.len(),
                "rounds": self.num_rounds,
                "parallelism": self.pool.parallelism(),
                "tensors": parameters.len(),
                "elements": parameters.num_elements(),
            }),
        );
        self.emit(
            "simulation.started",
            None,
            json!({"run_id": history.run_id(), "rounds": self.num_rounds}),
        )
        .await;

        let initial = self.strategy.evaluate(0, &parameters);
        if let Some(eval) = &initial {
            self.note(
                LogLevel::Info,
                "initial centralized evaluation",
                Some(0),
                json!({"loss": eval.loss, "metrics": eval.metrics}),
            );
        }
        history.set_initial(initial);

        for round in 1..=self.num_rounds {
            let record = self.run_round(round, &mut parameters).await;
            history.push(record);
        }

        let summary = json!({
            "run_id": history.run_id(),
            "completed_rounds": history.completed_rounds(),
            "rounds": history.len(),
            "duration_ms": started.elapsed().as_millis() as u64,
        });
        self.note(LogLevel::Info, "simulation completed", None, summary.clone());
        self.emit("simulation.completed", None, summary).await;
        Ok(history)
    }

    async fn run_round(&self, round: u64, parameters: &mut ParameterSet) -> RoundRecord {
        let started = Instant::now();
        let mut record = RoundRecord::started(round);

        match self.fit_phase(round, parameters, &mut record).await {
            Ok(updated) => *parameters = updated,
            Err(error) => {
                self.fail_round(&mut record, Phase::Fit, &error).await;
                record.duration_ms = started.elapsed().as_millis() as u64;
                return record;
            }
        }

        record.centralized = self.strategy.evaluate(round, parameters);

        if let Err(error) = self.evaluate_phase(round, parameters, &mut record).await {
            self.fail_round(&mut record, Phase::Evaluate, &error).await;
        }
        record.duration_ms = started.elapsed().as_millis() as u64;
        if record.is_completed() {
            self.note(
                LogLevel::Info,
                "round completed",
                Some(round),
                json!({
                    "fit": record.fit,
                    "evaluate": record.evaluate,
                    "distributed_loss": record.distributed_loss,
                    "centralized_loss": record.centralized.as_ref().map(|c| c.loss),
                    "duration_ms": record.duration_ms,
                }),
            );
        }
        record
    }

    async fn fit_phase(
        &self,
        round: u64,
        parameters: &ParameterSet,
        record: &mut RoundRecord,
    ) -> Result<ParameterSet, FederationError> {
        let dispatch = self
            .strategy
            .configure_fit(round, parameters, &self.participants)?;
        let outcome = self.pool.fit(&self.factory, parameters, &dispatch).await;

        let mut failures = outcome.failures;
        let mut results = Vec::with_capacity(outcome.results.len());
        for (participant, result) in outcome.results {
            match parameters.ensure_compatible(&result.parameters) {
                Ok(()) => results.push((participant, result)),
                Err(error) => failures.push(ParticipantFailure::new(participant, error)),
            }
        }
        record.fit.sampled = dispatch.len();
        record.fit.succeeded = results.len();
        record.fit.failed = failures.len();
        self.report_failures(round, Phase::Fit, &failures).await;

        let aggregate = self.strategy.aggregate_fit(round, &results, &failures)?;
        record.fit_metrics = aggregate.metrics;
        self.emit(
            "round.fit.completed",
            Some(round),
            json!({"summary": record.fit, "metrics": record.fit_metrics}),
        )
        .await;
        Ok(aggregate.parameters)
    }

    async fn evaluate_phase(
        &self,
        round: u64,
        parameters: &ParameterSet,
        record: &mut RoundRecord,
    ) -> Result<(), FederationError> {
        let dispatch = self
            .strategy
            .configure_evaluate(round, parameters, &self.participants)?;
        if dispatch.is_empty() {
            return Ok(());
        }
        let outcome = self.pool.evaluate(&self.factory, parameters, &dispatch).await;

        let mut failures = outcome.failures;
        let mut results = Vec::with_capacity(outcome.results.len());
        for (participant, result) in outcome.results {
            if result.loss.is_finite() {
                results.push((participant, result));
            } else {
                let error = FederationError::Participant {
                    participant: participant.to_string(),
                    reason: format!("non-finite evaluation loss {}", result.loss),
                };
                failures.push(ParticipantFailure::new(participant, error));
            }
        }
        record.evaluate = Some(PhaseSummary {
            sampled: dispatch.len(),
            succeeded: results.len(),
            failed: failures.len(),
        });
        self.report_failures(round, Phase::Evaluate, &failures).await;

        let aggregate = self
            .strategy
            .aggregate_evaluate(round, &results, &failures)?;
        record.distributed_loss = Some(aggregate.loss);
        record.distributed_metrics = aggregate.metrics;
        self.emit(
            "round.evaluate.completed",
            Some(round),
            json!({
                "summary": record.evaluate,
                "loss": aggregate.loss,
                "metrics": record.distributed_metrics,
            }),
        )
        .await;
        Ok(())
    }

    async fn fail_round(&self, record: &mut RoundRecord, phase: Phase, error: &FederationError) {
        record.status = RoundStatus::failed(phase, error);
        let payload = json!({
            "phase": phase,
            "code": error.code(),
            "reason": error.to_string(),
        });
        self.note(LogLevel::Warn, "round failed", Some(record.round), payload.clone());
        self.emit("round.failed", Some(record.round), payload).await;
    }

    async fn report_failures(&self, round: u64, phase: Phase, failures: &[ParticipantFailure]) {
        for failure in failures {
            let payload = json!({
                "phase": phase,
                "participant": failure.participant,
                "code": failure.error.code(),
                "reason": failure.error.to_string(),
            });
            self.note(LogLevel::Warn, "participant failed", Some(round), payload.clone());
            self.emit("participant.failed", Some(round), payload).await;
        }
    }

    fn note(&self, level: LogLevel, message: &str, round: Option<u64>, metadata: Value) {
        // Telemetry never fails a round.
        let _ = self.telemetry.log(level, message, round, metadata);
    }

    async fn emit(&self, event_type: &str, round: Option<u64>, payload: Value) {
        let _ = self.telemetry.event(event_type, round, payload).await;
    }
}

/// Runs `num_rounds` rounds over participants `"0"` to
/// `"num_participants-1"` spawned by `client_fn`.
pub async fn run_simulation<F, S>(
    client_fn: F,
    num_participants: usize,
    num_rounds: u64,
    strategy: S,
    resources: ResourceBudget,
) -> Result<History, FederationError>
where
    F: ParticipantFactory + 'static,
    S: Strategy + 'static,
{
    SimulationDriver::builder(Arc::new(client_fn), Arc::new(strategy))
        .num_participants(num_participants)
        .num_rounds(num_rounds)
        .pool(WorkerPool::from_budget(&resources, None)?)
        .build()?
        .run()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        participant::{EvaluateResult, FitResult, Participant},
        scalar::{scalar_map, ConfigMap, MetricMap, Scalar},
        strategy::{CentralizedEvaluateFn, FedAvg, FedAvgConfig},
    };
    use shared_event_bus::MemoryEventBus;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    #[derive(Clone, Default)]
    struct Shift {
        step: f32,
        examples: u64,
        fail_in_round: Option<i64>,
        wrong_shape: bool,
        nan_loss: bool,
        stall: Option<Duration>,
    }

    impl Participant for Shift {
        fn fit(&mut self, parameters: ParameterSet, config: &ConfigMap) -> Result<FitResult, FederationError> {
            if let Some(round) = self.fail_in_round {
                if config.get("round") == Some(&Scalar::Int(round)) {
                    return Err(FederationError::Trainer("scheduled failure".into()));
                }
            }
            if let Some(stall) = self.stall {
                std::thread::sleep(stall);
            }
            let parameters = if self.wrong_shape {
                ParameterSet::from_flat(vec![(vec![3], vec![0.0; 3])])?
            } else {
                ParameterSet::new(
                    parameters
                        .into_tensors()
                        .into_iter()
                        .map(|t| t + self.step)
                        .collect(),
                )
            };
            Ok(FitResult {
                parameters,
                num_examples: self.examples,
                metrics: scalar_map([("loss", 1.0)]),
            })
        }

        fn evaluate(&mut self, parameters: ParameterSet, _: &ConfigMap) -> Result<EvaluateResult, FederationError> {
            Ok(EvaluateResult {
                loss: if self.nan_loss { f64::NAN } else { f64::from(first(&parameters)) },
                num_examples: self.examples,
                metrics: scalar_map([("accuracy", 0.5)]),
            })
        }
    }

    fn first(parameters: &ParameterSet) -> f32 {
        parameters.tensors()[0].iter().next().copied().unwrap_or_default()
    }

    struct Fleet {
        factory: Arc<dyn ParticipantFactory>,
        spawns: Arc<AtomicUsize>,
    }

    fn fleet(make: impl Fn(usize) -> Shift + Send + Sync + 'static) -> Fleet {
        let spawns = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&spawns);
        let factory = move |id: &ParticipantId| -> Result<Box<dyn Participant>, FederationError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(make(id.partition_index()?)))
        };
        Fleet {
            factory: Arc::new(factory),
            spawns,
        }
    }

    fn uniform(step: f32) -> Shift {
        Shift {
            step,
            examples: 10,
            ..Shift::default()
        }
    }

    fn zeros() -> ParameterSet {
        ParameterSet::from_flat(vec![(vec![2], vec![0.0, 0.0])]).unwrap()
    }

    fn central_probe() -> CentralizedEvaluateFn {
        Arc::new(|_round: u64, parameters: &ParameterSet, _: &ConfigMap| {
            Some((f64::from(first(parameters)), MetricMap::new()))
        })
    }

    fn config(n: usize) -> FedAvgConfig {
        FedAvgConfig {
            fit_fraction: 1.0,
            evaluate_fraction: 0.5,
            min_fit_participants: n,
            min_evaluate_participants: 1,
            min_available_participants: n,
            accept_failures: true,
        }
    }

    fn driver(fleet: &Fleet, n: usize, rounds: u64, strategy: FedAvg) -> SimulationDriver {
        SimulationDriver::builder(Arc::clone(&fleet.factory), Arc::new(strategy))
            .num_participants(n)
            .num_rounds(rounds)
            .initial_parameters(zeros())
            .pool(WorkerPool::new(4, Some(Duration::from_millis(300))).unwrap())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn five_rounds_give_five_ordered_records() {
        let fleet = fleet(|_| uniform(1.0));
        let strategy = FedAvg::builder()
            .config(config(4))
            .centralized_evaluation(central_probe())
            .build()
            .unwrap();
        let history = driver(&fleet, 4, 5, strategy).run().await.unwrap();
        let rounds: Vec<u64> = history.records().iter().map(|r| r.round).collect();
        assert_eq!(rounds, vec![1, 2, 3, 4, 5]);
        assert_eq!(history.completed_rounds(), 5);
        assert_eq!(
            history.centralized_losses(),
            vec![(0, 0.0), (1, 1.0), (2, 2.0), (3, 3.0), (4, 4.0), (5, 5.0)]
        );
        let eval = history.records()[0].evaluate.unwrap();
        assert_eq!(eval.sampled, 2);
        // Evaluation sees the parameters aggregated in the same round.
        assert_eq!(history.distributed_losses()[0], (1, 1.0));
        assert_eq!(history.distributed_metric("accuracy").len(), 5);
    }

    #[tokio::test]
    async fn too_few_participants_fail_every_round_without_dispatch() {
        let fleet = fleet(|_| uniform(1.0));
        let strategy = FedAvg::builder()
            .config(FedAvgConfig::default())
            .build()
            .unwrap();
        let history = driver(&fleet, 8, 5, strategy).run().await.unwrap();
        assert_eq!(history.len(), 5);
        for record in history.records() {
            assert_eq!(record.failure_code(), Some("insufficient_participants"));
            assert_eq!(record.fit.sampled, 0);
            assert!(record.evaluate.is_none());
        }
        assert_eq!(fleet.spawns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn aggregation_sees_exactly_what_crossed_the_barrier() {
        let fleet = fleet(|index| Shift {
            stall: (index == 3).then(|| Duration::from_millis(900)),
            ..uniform(index as f32)
        });
        let strategy = FedAvg::builder()
            .config(FedAvgConfig {
                min_fit_participants: 3,
                evaluate_fraction: 0.0,
                ..config(4)
            })
            .fit_metrics_fn(Arc::new(|contributions: &[(u64, MetricMap)]| {
                scalar_map([("contributors", contributions.len())])
            }))
            .centralized_evaluation(central_probe())
            .build()
            .unwrap();
        let history = driver(&fleet, 4, 1, strategy).run().await.unwrap();
        let record = &history.records()[0];
        assert!(record.is_completed());
        assert_eq!(record.fit.sampled, 4);
        assert_eq!(record.fit.succeeded, 3);
        assert_eq!(record.fit.failed, 1);
        assert_eq!(record.fit_metrics["contributors"], Scalar::Int(3));
        // Mean of steps 0, 1 and 2 with equal example counts.
        assert_eq!(history.centralized_losses()[1], (1, 1.0));
        assert!(record.evaluate.is_none());
    }

    #[tokio::test]
    async fn failed_round_keeps_previous_parameters() {
        let fleet = fleet(|index| Shift {
            fail_in_round: (index == 0).then_some(2),
            ..uniform(1.0)
        });
        let strategy = FedAvg::builder()
            .config(FedAvgConfig {
                accept_failures: false,
                ..config(3)
            })
            .on_fit_config(Arc::new(|round: u64| scalar_map([("round", round)])))
            .centralized_evaluation(central_probe())
            .build()
            .unwrap();
        let history = driver(&fleet, 3, 3, strategy).run().await.unwrap();
        assert_eq!(history.records()[1].failure_code(), Some("failures_rejected"));
        assert!(history.records()[1].centralized.is_none());
        assert_eq!(
            history.centralized_losses(),
            vec![(0, 0.0), (1, 1.0), (3, 2.0)]
        );
    }

    #[tokio::test]
    async fn shape_mismatch_drops_only_that_participant() {
        let fleet = fleet(|index| Shift {
            wrong_shape: index == 1,
            ..uniform(2.0)
        });
        let strategy = FedAvg::builder()
            .config(FedAvgConfig {
                min_fit_participants: 2,
                ..config(3)
            })
            .build()
            .unwrap();
        let history = driver(&fleet, 3, 1, strategy).run().await.unwrap();
        let record = &history.records()[0];
        assert!(record.is_completed());
        assert_eq!(record.fit.succeeded, 2);
        assert_eq!(record.fit.failed, 1);
    }

    #[tokio::test]
    async fn non_finite_losses_never_reach_the_history() {
        let fleet = fleet(|index| Shift {
            nan_loss: index == 0,
            ..uniform(1.0)
        });
        let strategy = FedAvg::builder()
            .config(FedAvgConfig {
                evaluate_fraction: 1.0,
                ..config(3)
            })
            .centralized_evaluation(Arc::new(|round: u64, _: &ParameterSet, _: &ConfigMap| {
                (round == 1).then(|| (f64::NAN, scalar_map([("accuracy", f64::NAN)])))
            }))
            .build()
            .unwrap();
        let history = driver(&fleet, 3, 1, strategy).run().await.unwrap();
        let record = &history.records()[0];
        assert!(record.is_completed());
        assert!(record.centralized.is_none());
        assert_eq!(record.evaluate, Some(PhaseSummary { sampled: 3, succeeded: 2, failed: 1 }));
        assert_eq!(record.distributed_loss, Some(1.0));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        history.save(&path).unwrap();
        assert_eq!(History::load(&path).unwrap(), history);
    }

    #[tokio::test]
    async fn evaluate_failure_keeps_new_parameters() {
        let fleet = fleet(|_| uniform(1.0));
        let strategy = FedAvg::builder()
            .config(FedAvgConfig {
                evaluate_fraction: 0.25,
                min_evaluate_participants: 3,
                ..config(2)
            })
            .centralized_evaluation(central_probe())
            .build()
            .unwrap();
        let history = driver(&fleet, 2, 2, strategy).run().await.unwrap();
        for record in history.records() {
            match &record.status {
                RoundStatus::Failed { phase, code, .. } => {
                    assert_eq!(*phase, Phase::Evaluate);
                    assert_eq!(code, "insufficient_participants");
                }
                RoundStatus::Completed => panic!("round {} should fail", record.round),
            }
        }
        assert_eq!(history.centralized_losses(), vec![(0, 0.0), (1, 1.0), (2, 2.0)]);
    }

    #[tokio::test]
    async fn runs_are_restartable() {
        let fleet = fleet(|index| uniform(index as f32 + 0.5));
        let strategy = FedAvg::builder()
            .config(config(2))
            .centralized_evaluation(central_probe())
            .build()
            .unwrap();
        let driver = driver(&fleet, 2, 3, strategy);
        let first = driver.run().await.unwrap();
        let second = driver.run().await.unwrap();
        assert_ne!(first.run_id(), second.run_id());
        assert_eq!(first.centralized_losses(), second.centralized_losses());
    }

    #[tokio::test]
    async fn setup_errors_surface_before_any_round() {
        let fleet = fleet(|_| uniform(1.0));
        let strategy: Arc<dyn Strategy> = Arc::new(FedAvg::builder().build().unwrap());
        let err = SimulationDriver::builder(Arc::clone(&fleet.factory), Arc::clone(&strategy))
            .num_rounds(0)
            .build()
            .unwrap_err();
        assert_eq!(err.code(), "invalid_config");

        let driver = SimulationDriver::builder(Arc::clone(&fleet.factory), strategy)
            .num_participants(10)
            .pool(WorkerPool::new(1, None).unwrap())
            .build()
            .unwrap();
        assert_eq!(driver.run().await.unwrap_err().code(), "invalid_config");
        assert_eq!(fleet.spawns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn run_simulation_accepts_a_client_fn() {
        let client_fn = |_: &ParticipantId| -> Result<Box<dyn Participant>, FederationError> {
            Ok(Box::new(uniform(0.25)))
        };
        let strategy = FedAvg::builder()
            .config(config(10))
            .initial_parameters(zeros())
            .centralized_evaluation(central_probe())
            .build()
            .unwrap();
        let resources = ResourceBudget::new(8.0, 2.0).unwrap();
        let history = run_simulation(client_fn, 10, 4, strategy, resources)
            .await
            .unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history.completed_rounds(), 4);
        assert_eq!(history.centralized_losses().last(), Some(&(4, 1.0)));
    }

    #[tokio::test]
    async fn lifecycle_events_are_published() {
        let bus = Arc::new(MemoryEventBus::new(64));
        let telemetry = FederationTelemetry::builder("driver")
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        let fleet = fleet(|index| Shift {
            fail_in_round: (index == 1).then_some(1),
            ..uniform(1.0)
        });
        let strategy = FedAvg::builder()
            .config(FedAvgConfig {
                min_fit_participants: 1,
                evaluate_fraction: 0.0,
                ..config(2)
            })
            .on_fit_config(Arc::new(|round: u64| scalar_map([("round", round)])))
            .build()
            .unwrap();
        SimulationDriver::builder(Arc::clone(&fleet.factory), Arc::new(strategy))
            .num_participants(2)
            .num_rounds(2)
            .initial_parameters(zeros())
            .telemetry(telemetry)
            .build()
            .unwrap()
            .run()
            .await
            .unwrap();
        assert_eq!(bus.of_type("simulation.started").len(), 1);
        assert_eq!(bus.of_type("round.fit.completed").len(), 2);
        assert_eq!(bus.of_type("simulation.completed").len(), 1);
        let failed = bus.of_type("participant.failed");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].round, Some(1));
        assert_eq!(failed[0].payload["participant"], "1");
    }
}
