//! The participant coordination loop.
//!
//! Reconciles every participant's observed state with the per-circuit
//! waiting queues: admits participants, enqueues the ready ones, promotes
//! queue heads, hands circuits over when a contribution completes, and
//! evicts contributors that blow their time budget. All decisions and their
//! effects live in one repository transaction, so no two participants can
//! ever be promoted on the same circuit.

use crate::environment::Environment;
use crate::objects::{
    Ceremony, CeremonyState, Circuit, ContributionStep, Participant, ParticipantStatus,
    PendingContribution, TimeoutEntry, TimeoutKind, TimeoutMechanism,
};
use crate::objects::circuit::QueueError;
use crate::s3::BlobError;
use crate::state_machine::{self, Context, Event, TransitionError};
use crate::storage::{Repository, RepositoryTx, StorageError};
use crate::workers::{CommandStatus, WorkerError};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    IllegalTransition(#[from] TransitionError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("local verifier failed: {0}")]
    Verifier(anyhow::Error),
    #[error("ceremony is not open for contributions")]
    CeremonyNotOpen,
    #[error("ceremony is not closed")]
    NotClosed,
    #[error("caller is not the ceremony coordinator")]
    NotCoordinator,
    #[error("circuit {0} is missing its final contribution")]
    MissingFinalContribution(u64),
    #[error("participant {0} has no in-progress contribution fragment")]
    NoInProgressContribution(String),
    #[error("participant {0} is not the current contributor of circuit {1}")]
    NotCurrentContributor(String, u64),
    #[error("object key {0} does not match the expected contribution path")]
    WrongObjectKey(String),
    #[error("no multipart upload session is open")]
    NoUploadSession,
    #[error("verification worker {0} is unavailable")]
    WorkerUnavailable(String),
    #[error("remote verification command ended as {0:?}")]
    WorkerCommand(CommandStatus),
    #[error("the finalization contribution failed verification")]
    FinalContributionInvalid,
    #[error("verification cancelled")]
    Cancelled,
}

/// What the reconciliation pass decided a participant needs, derived purely
/// from their persisted state.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ParticipantClass {
    ReadyForFirstContribution,
    ReadyForNextContribution,
    ResumingAfterTimeout,
    JustCompletedContribution,
    FinishedAll,
    Idle,
}

fn classify(participant: &Participant) -> ParticipantClass {
    use ParticipantStatus as Status;
    match participant.status {
        Status::Ready if participant.contribution_progress == 1
            && participant.timeouts.is_empty() =>
        {
            ParticipantClass::ReadyForFirstContribution
        }
        Status::Ready if !participant.timeouts.is_empty() => {
            ParticipantClass::ResumingAfterTimeout
        }
        Status::Ready => ParticipantClass::ReadyForNextContribution,
        Status::Contributed
            if participant.contribution_step == Some(ContributionStep::Completed) =>
        {
            ParticipantClass::JustCompletedContribution
        }
        Status::Done => ParticipantClass::FinishedAll,
        _ => ParticipantClass::Idle,
    }
}

/// Reconciliation loop and participant-facing progress operations.
pub struct Coordinator<R> {
    repository: Arc<R>,
    environment: Environment,
}

impl<R: Repository> Coordinator<R> {
    pub fn new(repository: Arc<R>, environment: Environment) -> Self {
        Self {
            repository,
            environment,
        }
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repository
    }

    /// Admits or re-admits a participant to a ceremony, returning whether
    /// they may (eventually) contribute.
    ///
    /// For a closed ceremony, the ceremony's coordinator is moved to
    /// `Finalizing` here once they have contributed to every circuit.
    pub fn check_participant(
        &self,
        ceremony_id: u64,
        user_id: &str,
    ) -> Result<bool, CoordinatorError> {
        let now = Utc::now().timestamp_millis();
        self.repository.with_transaction(|tx| {
            let ceremony = tx.ceremony(ceremony_id)?;
            let circuit_count = tx.circuits(ceremony_id)?.len();

            let participant = match tx.participant(user_id, ceremony_id) {
                Ok(participant) => participant,
                Err(StorageError::NotFound(_)) => {
                    if !ceremony.is_open() {
                        return Ok(false);
                    }
                    let participant = Participant::new(user_id, ceremony_id);
                    tx.upsert_participant(participant)?;
                    info!(ceremony = ceremony_id, user = user_id, "participant admitted");
                    return Ok(true);
                }
                Err(error) => return Err(error.into()),
            };

            let ctx = Context {
                now,
                circuit_count,
                is_queue_head: false,
                ceremony_state: ceremony.state,
                is_coordinator: ceremony.is_coordinator(user_id),
                finalizing: false,
            };

            // A coordinator re-admitted into a closed ceremony after
            // contributing everywhere starts finalizing instead.
            if let Ok(outcome) =
                state_machine::apply(&participant, Event::PrepareFinalization, &ctx)
            {
                let mut participant = participant;
                outcome.apply_to(&mut participant, now);
                tx.upsert_participant(participant)?;
                info!(ceremony = ceremony_id, user = user_id, "coordinator prepared for finalization");
                return Ok(true);
            }

            let outcome = state_machine::apply(&participant, Event::Admit, &ctx)?;
            let can_contribute = outcome.can_contribute;
            let mut participant = participant;
            outcome.apply_to(&mut participant, now);
            tx.upsert_participant(participant)?;
            Ok(can_contribute)
        })
    }

    /// `progressToNextCircuit`: moves a participant to `Ready` on the next
    /// circuit in sequence, then immediately reconciles the ceremony so an
    /// empty queue promotes them without waiting for the next tick.
    pub fn progress_to_next_circuit(
        &self,
        ceremony_id: u64,
        user_id: &str,
    ) -> Result<(), CoordinatorError> {
        self.apply_participant_event(ceremony_id, user_id, Event::ProgressToNextCircuit)?;
        self.reconcile_ceremony(ceremony_id)
    }

    /// `resumeAfterTimeout`: an exhumed participant becomes `Ready` again
    /// on the circuit they timed out on.
    pub fn resume_after_timeout(
        &self,
        ceremony_id: u64,
        user_id: &str,
    ) -> Result<(), CoordinatorError> {
        self.apply_participant_event(ceremony_id, user_id, Event::ResumeAfterTimeout)?;
        self.reconcile_ceremony(ceremony_id)
    }

    /// `advanceStep`: moves the current contributor through
    /// DOWNLOADING → COMPUTING → UPLOADING → VERIFYING → COMPLETED.
    pub fn progress_to_next_step(
        &self,
        ceremony_id: u64,
        user_id: &str,
    ) -> Result<Option<ContributionStep>, CoordinatorError> {
        let now = Utc::now().timestamp_millis();
        self.repository.with_transaction(|tx| {
            let circuit_count = tx.circuits(ceremony_id)?.len();
            let ceremony = tx.ceremony(ceremony_id)?;
            let mut participant = tx.participant(user_id, ceremony_id)?;
            let ctx = Context {
                now,
                circuit_count,
                is_queue_head: false,
                ceremony_state: ceremony.state,
                is_coordinator: ceremony.is_coordinator(user_id),
                finalizing: false,
            };
            let outcome = state_machine::apply(&participant, Event::AdvanceStep, &ctx)?;
            outcome.apply_to(&mut participant, now);
            let step = participant.contribution_step;
            tx.upsert_participant(participant)?;
            Ok(step)
        })
    }

    /// Stores the in-progress contribution fragment: the zkey hash and the
    /// self-reported computation time, posted after computing and before
    /// uploading. Finalizing coordinators post theirs the same way.
    pub fn store_contribution_hash(
        &self,
        ceremony_id: u64,
        user_id: &str,
        hash: String,
        computation_time: u64,
    ) -> Result<(), CoordinatorError> {
        self.repository.with_transaction(|tx| {
            let mut participant = tx.participant(user_id, ceremony_id)?;
            let computing = participant.status == ParticipantStatus::Contributing
                && participant.contribution_step == Some(ContributionStep::Computing);
            let finalizing = participant.status == ParticipantStatus::Finalizing;
            if !(computing || finalizing) {
                return Err(CoordinatorError::IllegalTransition(
                    TransitionError::IllegalTransition {
                        event: Event::AdvanceStep,
                        status: participant.status,
                        step: participant.contribution_step,
                    },
                ));
            }
            participant.pending_contribution = Some(PendingContribution {
                hash,
                computation_time,
            });
            tx.upsert_participant(participant)?;
            Ok(())
        })
    }

    fn apply_participant_event(
        &self,
        ceremony_id: u64,
        user_id: &str,
        event: Event,
    ) -> Result<(), CoordinatorError> {
        let now = Utc::now().timestamp_millis();
        self.repository.with_transaction(|tx| {
            let ceremony = tx.ceremony(ceremony_id)?;
            let circuit_count = tx.circuits(ceremony_id)?.len();
            let mut participant = tx.participant(user_id, ceremony_id)?;
            let ctx = Context {
                now,
                circuit_count,
                is_queue_head: false,
                ceremony_state: ceremony.state,
                is_coordinator: ceremony.is_coordinator(user_id),
                finalizing: false,
            };
            let outcome = state_machine::apply(&participant, event, &ctx)?;
            outcome.apply_to(&mut participant, now);
            tx.upsert_participant(participant)?;
            Ok(())
        })
    }

    /// One reconciliation pass over every opened ceremony. Cooperative: the
    /// shutdown signal is honored between ceremonies.
    pub fn reconcile(&self, shutdown: Option<&watch::Receiver<bool>>) -> Result<(), CoordinatorError> {
        let opened: Vec<u64> = self
            .repository
            .with_transaction(|tx| tx.ceremonies_by_state(CeremonyState::Opened))
            .map_err(CoordinatorError::Storage)?
            .into_iter()
            .map(|c| c.id)
            .collect();

        for ceremony_id in opened {
            if shutdown.map(|rx| *rx.borrow()).unwrap_or(false) {
                debug!("reconciliation interrupted by shutdown");
                return Ok(());
            }
            if let Err(error) = self.reconcile_ceremony(ceremony_id) {
                error!(ceremony = ceremony_id, %error, "ceremony reconciliation failed");
            }
        }
        Ok(())
    }

    /// Reconciles one ceremony: evicts over-budget contributors, then
    /// coordinates every participant, one transaction each.
    pub fn reconcile_ceremony(&self, ceremony_id: u64) -> Result<(), CoordinatorError> {
        self.evict_blocking_contributors(ceremony_id)?;

        let user_ids: Vec<String> = self
            .repository
            .with_transaction(|tx| tx.participants(ceremony_id))
            .map_err(CoordinatorError::Storage)?
            .into_iter()
            .map(|p| p.user_id)
            .collect();

        for user_id in user_ids {
            let result =
                self.transact(|tx| self.reconcile_participant(tx, ceremony_id, &user_id));
            if let Err(error) = result {
                error!(
                    ceremony = ceremony_id,
                    user = %user_id,
                    %error,
                    "participant reconciliation failed"
                );
            }
        }
        Ok(())
    }

    /// Runs a transaction, retrying once on a concurrent-modification
    /// conflict; a second conflict surfaces to the caller.
    fn transact<T>(
        &self,
        f: impl Fn(&mut dyn RepositoryTx) -> Result<T, CoordinatorError>,
    ) -> Result<T, CoordinatorError> {
        match self.repository.with_transaction(|tx| f(tx)) {
            Err(CoordinatorError::Storage(StorageError::Conflict)) => {
                warn!("repository conflict, retrying once");
                self.repository.with_transaction(|tx| f(tx))
            }
            result => result,
        }
    }

    fn reconcile_participant(
        &self,
        tx: &mut dyn RepositoryTx,
        ceremony_id: u64,
        user_id: &str,
    ) -> Result<(), CoordinatorError> {
        let now = Utc::now().timestamp_millis();
        let ceremony = tx.ceremony(ceremony_id)?;
        let circuits = tx.circuits(ceremony_id)?;
        let participant = tx.participant(user_id, ceremony_id)?;

        match classify(&participant) {
            class @ (ParticipantClass::ReadyForFirstContribution
            | ParticipantClass::ReadyForNextContribution
            | ParticipantClass::ResumingAfterTimeout) => {
                debug!(ceremony = ceremony_id, user = user_id, ?class, "coordinating participant");
                self.enqueue_participant(tx, &ceremony, &circuits, participant, now)
            }
            ParticipantClass::JustCompletedContribution | ParticipantClass::FinishedAll => {
                self.hand_over(tx, &ceremony, &circuits, &participant, now)
            }
            ParticipantClass::Idle => Ok(()),
        }
    }

    /// Single-participant coordination: enqueue on the target circuit and
    /// promote immediately when the queue was empty.
    fn enqueue_participant(
        &self,
        tx: &mut dyn RepositoryTx,
        ceremony: &Ceremony,
        circuits: &[Circuit],
        mut participant: Participant,
        now: i64,
    ) -> Result<(), CoordinatorError> {
        let Some(circuit) = circuit_at(circuits, participant.contribution_progress) else {
            return Ok(());
        };
        let mut circuit = circuit.clone();

        let is_current = circuit.waiting_queue.enqueue(&participant.user_id);
        if is_current {
            let ctx = Context {
                now,
                circuit_count: circuits.len(),
                is_queue_head: true,
                ceremony_state: ceremony.state,
                is_coordinator: ceremony.is_coordinator(&participant.user_id),
                finalizing: false,
            };
            let outcome =
                state_machine::apply(&participant, Event::BecomeCurrentContributor, &ctx)?;
            outcome.apply_to(&mut participant, now);
            info!(
                ceremony = ceremony.id,
                circuit = circuit.id,
                user = %participant.user_id,
                "participant promoted to current contributor"
            );
        } else {
            // Queued behind the current contributor.
            participant.status = ParticipantStatus::Waiting;
        }

        tx.update_circuit(circuit)?;
        tx.upsert_participant(participant)?;
        Ok(())
    }

    /// Multi-participant handover: the participant that just finished is
    /// dequeued and the new head, if any, promoted in the same transaction.
    fn hand_over(
        &self,
        tx: &mut dyn RepositoryTx,
        ceremony: &Ceremony,
        circuits: &[Circuit],
        participant: &Participant,
        now: i64,
    ) -> Result<(), CoordinatorError> {
        let Some(circuit) = circuit_at(circuits, participant.contribution_progress) else {
            return Ok(());
        };
        // Already dequeued by an earlier pass.
        if circuit.waiting_queue.current_contributor() != Some(participant.user_id.as_str()) {
            return Ok(());
        }
        let mut circuit = circuit.clone();

        let next = circuit.waiting_queue.dequeue(&participant.user_id)?;
        if let Some(next_id) = next {
            let mut next_participant = tx.participant(&next_id, ceremony.id)?;
            let ctx = Context {
                now,
                circuit_count: circuits.len(),
                is_queue_head: true,
                ceremony_state: ceremony.state,
                is_coordinator: ceremony.is_coordinator(&next_id),
                finalizing: false,
            };
            match state_machine::apply(&next_participant, Event::BecomeCurrentContributor, &ctx) {
                Ok(outcome) => {
                    outcome.apply_to(&mut next_participant, now);
                    tx.upsert_participant(next_participant)?;
                    info!(
                        ceremony = ceremony.id,
                        circuit = circuit.id,
                        user = %next_id,
                        "queue head promoted after handover"
                    );
                }
                Err(error) => {
                    warn!(
                        ceremony = ceremony.id,
                        circuit = circuit.id,
                        user = %next_id,
                        %error,
                        "queue head not promotable, leaving at head"
                    );
                }
            }
        }
        tx.update_circuit(circuit)?;
        Ok(())
    }

    /// Evicts current contributors that exceeded the ceremony's time
    /// budget: they are marked `Timedout` with a penalty window, dropped
    /// from the queue, and the next head is promoted.
    fn evict_blocking_contributors(&self, ceremony_id: u64) -> Result<(), CoordinatorError> {
        let now = Utc::now().timestamp_millis();
        self.repository.with_transaction(|tx| {
            let ceremony = tx.ceremony(ceremony_id)?;
            let circuits = tx.circuits(ceremony_id)?;
            let circuit_count = circuits.len();

            for circuit in circuits {
                let Some(current) = circuit.waiting_queue.current_contributor() else {
                    continue;
                };
                let current = current.to_string();
                let participant = tx.participant(&current, ceremony_id)?;

                // Verification is out of the contributor's hands; the
                // verifier advances the queue on its own outcome.
                if participant.contribution_step == Some(ContributionStep::Verifying) {
                    continue;
                }
                let Some(started_at) = participant.contribution_started_at else {
                    continue;
                };
                let Some(budget_ms) = contribution_budget_ms(&ceremony, &circuit) else {
                    continue;
                };
                if started_at + budget_ms >= now {
                    continue;
                }

                let mut participant = participant;
                let mut circuit = circuit;
                participant.status = ParticipantStatus::Timedout;
                participant.contribution_step = None;
                participant.pending_contribution = None;
                participant.temp_contribution_data = None;
                participant.timeouts.push(TimeoutEntry {
                    start_date: now,
                    end_date: now + ceremony.penalty * 1_000,
                    kind: TimeoutKind::BlockingContribution,
                });
                warn!(
                    ceremony = ceremony_id,
                    circuit = circuit.id,
                    user = %current,
                    "contributor timed out, evicting"
                );

                if let Some(next_id) = circuit.waiting_queue.remove(&current) {
                    let mut next_participant = tx.participant(&next_id, ceremony_id)?;
                    let ctx = Context {
                        now,
                        circuit_count,
                        is_queue_head: true,
                        ceremony_state: ceremony.state,
                        is_coordinator: ceremony.is_coordinator(&next_id),
                        finalizing: false,
                    };
                    if let Ok(outcome) =
                        state_machine::apply(&next_participant, Event::BecomeCurrentContributor, &ctx)
                    {
                        outcome.apply_to(&mut next_participant, now);
                        tx.upsert_participant(next_participant)?;
                    }
                }
                tx.update_circuit(circuit)?;
                tx.upsert_participant(participant)?;
            }
            Ok(())
        })
    }

    /// The periodic reconciliation ticker. Runs until the shutdown signal
    /// flips, finishing the in-flight pass first.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let probe = shutdown.clone();
        let mut ticker = tokio::time::interval(self.environment.coordinator_tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            cadence_secs = self.environment.coordinator_tick.as_secs(),
            "participant coordinator started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.reconcile(Some(&probe)) {
                        error!(%error, "reconciliation pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("participant coordinator stopped");
                    return;
                }
            }
        }
    }
}

/// The circuit a 1-based contribution progress designates, if any.
pub(crate) fn circuit_at(circuits: &[Circuit], progress: usize) -> Option<&Circuit> {
    if progress == 0 {
        return None;
    }
    circuits.iter().find(|c| c.sequence_position == progress)
}

/// The contribution time budget for a circuit, or `None` when no budget
/// applies yet (dynamic mechanism without prior valid contributions).
fn contribution_budget_ms(ceremony: &Ceremony, circuit: &Circuit) -> Option<i64> {
    match ceremony.timeout_mechanism_type {
        TimeoutMechanism::Fixed => Some(ceremony.fixed_timeout_window_secs * 1_000),
        TimeoutMechanism::Dynamic => {
            let avg = circuit.avg_timings.full_contribution;
            if avg == 0 {
                return None;
            }
            let tolerance = 100 + circuit.dynamic_threshold_pct;
            Some((avg as i64) * (tolerance as i64) / 100)
        }
    }
}
