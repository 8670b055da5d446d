//! Bounded parallel dispatch of one phase's participant calls.
//!
//! Every call runs on the blocking pool with its own copy of the global
//! parameters and holds one semaphore permit until it returns or the phase
//! deadline passes. A phase returns once every dispatched call produced a
//! result or a failure, or the deadline passed. Calls still outstanding at
//! the deadline are recorded as timed out, their results are discarded and
//! their slots are released.

use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    thread,
    time::Duration,
};

use tokio::{
    sync::Semaphore,
    task::{self, JoinSet},
    time::{self, Instant},
};

use crate::{
    error::FederationError,
    history::PhaseSummary,
    parameters::ParameterSet,
    participant::{
        EvaluateResult, FitResult, Participant, ParticipantFactory, ParticipantFailure,
        ParticipantId,
    },
    scalar::ConfigMap,
    strategy::Dispatch,
};

/// Compute budget shared by concurrently running participants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceBudget {
    total: f64,
    per_participant: f64,
}

impl ResourceBudget {
    /// Budget of `total` units where each participant costs `per_participant`.
    pub fn new(total: f64, per_participant: f64) -> Result<Self, FederationError> {
        if !(per_participant.is_finite() && per_participant > 0.0) {
            return Err(FederationError::InvalidConfig(format!(
                "per-participant resource cost must be positive, got {per_participant}"
            )));
        }
        if !total.is_finite() || total < per_participant {
            return Err(FederationError::InvalidConfig(format!(
                "resource total {total} cannot run a participant costing {per_participant}"
            )));
        }
        Ok(Self {
            total,
            per_participant,
        })
    }

    /// Budget sized to the host's available parallelism, never below the
    /// cost of one participant.
    pub fn host(per_participant: f64) -> Result<Self, FederationError> {
        let cpus = thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get) as f64;
        Self::new(cpus.max(per_participant), per_participant)
    }

    /// Total units.
    #[must_use]
    pub const fn total(&self) -> f64 {
        self.total
    }

    /// Units held by one running participant.
    #[must_use]
    pub const fn per_participant(&self) -> f64 {
        self.per_participant
    }

    /// Participants that may run at once: `floor(total / per_participant)`.
    #[must_use]
    pub fn parallelism(&self) -> usize {
        (self.total / self.per_participant).floor() as usize
    }
}

/// Successful results and failures of one phase, in dispatch order.
#[derive(Debug)]
pub struct PhaseOutcome<T> {
    /// Results that crossed the barrier.
    pub results: Vec<(ParticipantId, T)>,
    /// Dropped contributions.
    pub failures: Vec<ParticipantFailure>,
}

impl<T> PhaseOutcome<T> {
    /// Counts for the round record.
    #[must_use]
    pub fn summary(&self) -> PhaseSummary {
        PhaseSummary {
            sampled: self.results.len() + self.failures.len(),
            succeeded: self.results.len(),
            failed: self.failures.len(),
        }
    }
}

type Call<T> = fn(Box<dyn Participant>, ParameterSet, &ConfigMap) -> Result<T, FederationError>;

/// Semaphore-bounded worker pool with an optional per-phase deadline.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    parallelism: usize,
    timeout: Option<Duration>,
}

impl WorkerPool {
    /// Pool running at most `parallelism` participants at once.
    pub fn new(parallelism: usize, timeout: Option<Duration>) -> Result<Self, FederationError> {
        if parallelism == 0 {
            return Err(FederationError::InvalidConfig(
                "worker pool needs at least one slot".into(),
            ));
        }
        Ok(Self {
            permits: Arc::new(Semaphore::new(parallelism)),
            parallelism,
            timeout,
        })
    }

    /// Pool sized from a resource budget.
    pub fn from_budget(budget: &ResourceBudget, timeout: Option<Duration>) -> Result<Self, FederationError> {
        Self::new(budget.parallelism(), timeout)
    }

    /// Maximum concurrently running participants.
    #[must_use]
    pub const fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Per-phase deadline.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Runs `fit` on every dispatched participant.
    pub async fn fit(
        &self,
        factory: &Arc<dyn ParticipantFactory>,
        parameters: &ParameterSet,
        dispatch: &[Dispatch],
    ) -> PhaseOutcome<FitResult> {
        self.run_phase(factory, parameters, dispatch, |mut handle, parameters, config| {
            handle.fit(parameters, config)
        })
        .await
    }

    /// Runs `evaluate` on every dispatched participant.
    pub async fn evaluate(
        &self,
        factory: &Arc<dyn ParticipantFactory>,
        parameters: &ParameterSet,
        dispatch: &[Dispatch],
    ) -> PhaseOutcome<EvaluateResult> {
        self.run_phase(factory, parameters, dispatch, |mut handle, parameters, config| {
            handle.evaluate(parameters, config)
        })
        .await
    }

    async fn run_phase<T: Send + 'static>(
        &self,
        factory: &Arc<dyn ParticipantFactory>,
        parameters: &ParameterSet,
        dispatch: &[Dispatch],
        call: Call<T>,
    ) -> PhaseOutcome<T> {
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let mut set = JoinSet::new();
        for (position, Dispatch { participant, config }) in dispatch.iter().cloned().enumerate() {
            let factory = Arc::clone(factory);
            let permits = Arc::clone(&self.permits);
            let parameters = parameters.clone();
            set.spawn(async move {
                let Ok(permit) = permits.acquire_owned().await else {
                    return (position, Err(aborted(&participant, "worker pool closed")));
                };
                let id = participant.clone();
                // The permit stays with this task so aborting it at the
                // deadline frees the slot for the next phase.
                let joined = task::spawn_blocking(move || {
                    catch_unwind(AssertUnwindSafe(|| {
                        let handle = factory.spawn(&id)?;
                        call(handle, parameters, &config)
                    }))
                    .unwrap_or_else(|panic| Err(aborted(&id, &panic_message(panic.as_ref()))))
                })
                .await;
                drop(permit);
                let outcome = joined.unwrap_or_else(|err| Err(aborted(&participant, &err.to_string())));
                (position, outcome)
            });
        }

        let mut slots: Vec<Option<Result<T, FederationError>>> =
            dispatch.iter().map(|_| None).collect();
        let mut timed_out = false;
        loop {
            let next = match deadline {
                Some(deadline) => {
                    if let Ok(next) = time::timeout_at(deadline, set.join_next()).await {
                        next
                    } else {
                        set.abort_all();
                        timed_out = true;
                        break;
                    }
                }
                None => set.join_next().await,
            };
            match next {
                Some(Ok((position, outcome))) => slots[position] = Some(outcome),
                Some(Err(_)) => {}
                None => break,
            }
        }

        let mut outcome = PhaseOutcome {
            results: Vec::with_capacity(dispatch.len()),
            failures: Vec::new(),
        };
        for (slot, Dispatch { participant, .. }) in slots.into_iter().zip(dispatch) {
            let result = slot.unwrap_or_else(|| {
                Err(if timed_out {
                    FederationError::ParticipantTimeout(participant.to_string())
                } else {
                    aborted(participant, "worker task cancelled")
                })
            });
            match result {
                Ok(value) => outcome.results.push((participant.clone(), value)),
                Err(error) => outcome
                    .failures
                    .push(ParticipantFailure::new(participant.clone(), error)),
            }
        }
        outcome
    }
}

fn aborted(participant: &ParticipantId, reason: &str) -> FederationError {
    FederationError::Participant {
        participant: participant.to_string(),
        reason: reason.to_string(),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "participant panicked".to_string())
}
