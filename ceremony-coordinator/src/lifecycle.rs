//! Ceremony lifecycle: periodic open/close sweeps driven by wall-clock
//! time, and coordinator-driven finalization.

use crate::coordinator::CoordinatorError;
use crate::environment::Environment;
use crate::objects::{
    ArtifactSizes, AvgTimings, Beacon, Ceremony, CeremonyState, CeremonyType, Circuit,
    ParticipantStatus, TimeoutMechanism, VerificationMechanism, WaitingQueue, FINAL_ZKEY_INDEX,
};
use crate::s3::{self, BlobStore};
use crate::storage::{Repository, StorageError};
use crate::verification::blake2b512_hex;
use crate::workers::VerificationWorker;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Everything needed to set up a new ceremony.
#[derive(Debug, Clone)]
pub struct NewCeremony {
    pub prefix: String,
    pub title: String,
    pub description: String,
    pub kind: CeremonyType,
    pub start_date: i64,
    pub end_date: i64,
    pub timeout_mechanism_type: TimeoutMechanism,
    pub penalty: i64,
    pub fixed_timeout_window_secs: i64,
    pub auth_providers: BTreeSet<String>,
}

/// Everything needed to add one circuit to a ceremony.
#[derive(Debug, Clone)]
pub struct NewCircuit {
    pub name: String,
    pub prefix: String,
    pub verification_mechanism: VerificationMechanism,
    pub worker_handle: Option<String>,
    pub pot_filename: String,
    pub bootstrap_script_filename: Option<String>,
    pub artifact_sizes: ArtifactSizes,
    pub dynamic_threshold_pct: u64,
}

pub struct CeremonyLifecycle<R> {
    repository: Arc<R>,
    blob: Arc<dyn BlobStore>,
    worker: Arc<dyn VerificationWorker>,
    environment: Environment,
}

impl<R: Repository> CeremonyLifecycle<R> {
    pub fn new(
        repository: Arc<R>,
        blob: Arc<dyn BlobStore>,
        worker: Arc<dyn VerificationWorker>,
        environment: Environment,
    ) -> Self {
        Self {
            repository,
            blob,
            worker,
            environment,
        }
    }

    /// Creates a scheduled ceremony and provisions its bucket.
    pub async fn create_ceremony(
        &self,
        request: NewCeremony,
        coordinator_id: &str,
    ) -> Result<u64, CoordinatorError> {
        if request.start_date >= request.end_date {
            return Err(CoordinatorError::Validation(
                "ceremony start date must precede its end date".to_string(),
            ));
        }

        let bucket = s3::bucket_name(&request.prefix, &self.environment.bucket_postfix);
        self.blob.create_bucket(&bucket).await?;

        let id = self.repository.with_transaction(|tx| {
            tx.insert_ceremony(Ceremony {
                id: 0,
                prefix: request.prefix.clone(),
                title: request.title.clone(),
                description: request.description.clone(),
                state: CeremonyState::Scheduled,
                kind: request.kind,
                coordinator_id: coordinator_id.to_string(),
                start_date: request.start_date,
                end_date: request.end_date,
                timeout_mechanism_type: request.timeout_mechanism_type,
                penalty: request.penalty,
                fixed_timeout_window_secs: request.fixed_timeout_window_secs,
                auth_providers: request.auth_providers.clone(),
            })
        })?;
        info!(ceremony = id, prefix = %request.prefix, "ceremony created");
        Ok(id)
    }

    /// Creates the ceremony's circuits in request order and warms up the
    /// remote verification workers they reference. Worker startup failure
    /// fails the whole call before anything is persisted.
    pub async fn create_circuits(
        &self,
        ceremony_id: u64,
        caller_user_id: &str,
        requests: Vec<NewCircuit>,
    ) -> Result<Vec<u64>, CoordinatorError> {
        self.repository.with_transaction(|tx| {
            let ceremony = tx.ceremony(ceremony_id)?;
            match ceremony.is_coordinator(caller_user_id) {
                true => Ok(()),
                false => Err(CoordinatorError::NotCoordinator),
            }
        })?;

        for request in &requests {
            if request.verification_mechanism == VerificationMechanism::Remote {
                let handle = request.worker_handle.as_deref().ok_or_else(|| {
                    CoordinatorError::WorkerUnavailable("unassigned".to_string())
                })?;
                self.worker.start(handle).await?;
                info!(worker = handle, "remote verification worker started");
            }
        }

        self.repository.with_transaction(|tx| {
            let ceremony = tx.ceremony(ceremony_id)?;
            if !ceremony.is_coordinator(caller_user_id) {
                return Err(CoordinatorError::NotCoordinator);
            }
            let base = tx.circuits(ceremony_id)?.len();
            let mut ids = Vec::with_capacity(requests.len());
            for (offset, request) in requests.iter().enumerate() {
                let id = tx.insert_circuit(Circuit {
                    id: 0,
                    ceremony_id,
                    prefix: request.prefix.clone(),
                    name: request.name.clone(),
                    sequence_position: base + offset + 1,
                    verification_mechanism: request.verification_mechanism,
                    worker_handle: request.worker_handle.clone(),
                    pot_filename: request.pot_filename.clone(),
                    bootstrap_script_filename: request.bootstrap_script_filename.clone(),
                    artifact_sizes: request.artifact_sizes,
                    dynamic_threshold_pct: request.dynamic_threshold_pct,
                    avg_timings: AvgTimings::default(),
                    waiting_queue: WaitingQueue::default(),
                })?;
                ids.push(id);
            }
            info!(ceremony = ceremony_id, circuits = ids.len(), "circuits created");
            Ok(ids)
        })
    }

    /// Opens every scheduled ceremony whose start date has passed. Returns
    /// how many were opened.
    pub fn open_sweep(&self) -> Result<usize, CoordinatorError> {
        let now = Utc::now().timestamp_millis();
        self.repository.with_transaction(|tx| {
            let due = tx.ceremonies_by_state(CeremonyState::Scheduled)?;
            let mut opened = 0;
            for mut ceremony in due {
                if ceremony.start_date <= now {
                    ceremony.state = CeremonyState::Opened;
                    info!(ceremony = ceremony.id, "ceremony opened");
                    tx.update_ceremony(ceremony)?;
                    opened += 1;
                }
            }
            Ok(opened)
        })
    }

    /// Closes every opened ceremony whose end date has passed. Returns how
    /// many were closed.
    pub fn close_sweep(&self) -> Result<usize, CoordinatorError> {
        let now = Utc::now().timestamp_millis();
        self.repository.with_transaction(|tx| {
            let due = tx.ceremonies_by_state(CeremonyState::Opened)?;
            let mut closed = 0;
            for mut ceremony in due {
                if ceremony.end_date <= now {
                    ceremony.state = CeremonyState::Closed;
                    info!(ceremony = ceremony.id, "ceremony closed");
                    tx.update_ceremony(ceremony)?;
                    closed += 1;
                }
            }
            Ok(closed)
        })
    }

    /// Seals a closed ceremony: requires the caller to be its coordinator
    /// and every circuit to carry exactly one `"final"` contribution.
    /// Remote verification workers are stopped afterwards, warn-only.
    pub async fn finalize(
        &self,
        ceremony_id: u64,
        caller_user_id: &str,
    ) -> Result<(), CoordinatorError> {
        let remote_handles: Vec<String> = self.repository.with_transaction(|tx| {
            let mut ceremony = tx.ceremony(ceremony_id)?;
            if ceremony.state != CeremonyState::Closed {
                return Err(CoordinatorError::NotClosed);
            }
            if !ceremony.is_coordinator(caller_user_id) {
                return Err(CoordinatorError::NotCoordinator);
            }

            let circuits = tx.circuits(ceremony_id)?;
            let mut handles = Vec::new();
            for circuit in &circuits {
                match tx.contribution(ceremony_id, circuit.id, FINAL_ZKEY_INDEX) {
                    Ok(_) => {}
                    Err(StorageError::NotFound(_)) => {
                        return Err(CoordinatorError::MissingFinalContribution(circuit.id));
                    }
                    Err(error) => return Err(error.into()),
                }
                if circuit.verification_mechanism == VerificationMechanism::Remote {
                    if let Some(handle) = &circuit.worker_handle {
                        handles.push(handle.clone());
                    }
                }
            }

            ceremony.state = CeremonyState::Finalized;
            tx.update_ceremony(ceremony)?;
            info!(ceremony = ceremony_id, "ceremony finalized");
            Ok(handles)
        })?;

        for handle in remote_handles {
            if let Err(error) = self.worker.stop(&handle).await {
                warn!(worker = %handle, %error, "failed to stop verification worker");
            }
        }
        Ok(())
    }

    /// Stamps the finalization beacon onto a circuit's `"final"`
    /// contribution. Once every circuit of the ceremony carries its beacon,
    /// the finalizing coordinator becomes `Finalized`.
    pub fn finalize_circuit(
        &self,
        ceremony_id: u64,
        circuit_id: u64,
        caller_user_id: &str,
        beacon_value: String,
    ) -> Result<(), CoordinatorError> {
        self.repository.with_transaction(|tx| {
            let ceremony = tx.ceremony(ceremony_id)?;
            if ceremony.state != CeremonyState::Closed {
                return Err(CoordinatorError::NotClosed);
            }
            if !ceremony.is_coordinator(caller_user_id) {
                return Err(CoordinatorError::NotCoordinator);
            }
            let mut participant = tx.participant(caller_user_id, ceremony_id)?;
            if participant.status != ParticipantStatus::Finalizing {
                return Err(CoordinatorError::IllegalTransition(
                    crate::state_machine::TransitionError::IllegalTransition {
                        event: crate::state_machine::Event::PrepareFinalization,
                        status: participant.status,
                        step: participant.contribution_step,
                    },
                ));
            }

            let mut contribution = match tx.contribution(ceremony_id, circuit_id, FINAL_ZKEY_INDEX)
            {
                Ok(contribution) => contribution,
                Err(StorageError::NotFound(_)) => {
                    return Err(CoordinatorError::MissingFinalContribution(circuit_id));
                }
                Err(error) => return Err(error.into()),
            };
            contribution.beacon = Some(Beacon {
                hash: blake2b512_hex(beacon_value.as_bytes()),
                value: beacon_value,
            });
            tx.update_contribution(contribution)?;
            info!(ceremony = ceremony_id, circuit = circuit_id, "final contribution sealed");

            // The coordinator is done once every circuit is sealed.
            let circuits = tx.circuits(ceremony_id)?;
            let all_sealed = circuits.iter().all(|circuit| {
                tx.contribution(ceremony_id, circuit.id, FINAL_ZKEY_INDEX)
                    .map(|c| c.beacon.is_some())
                    .unwrap_or(false)
            });
            if all_sealed {
                participant.status = ParticipantStatus::Finalized;
                tx.upsert_participant(participant)?;
                info!(ceremony = ceremony_id, "all circuits sealed, coordinator finalized");
            }
            Ok(())
        })
    }

    /// The periodic lifecycle ticker: one open sweep and one close sweep
    /// per tick, cooperative with shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.environment.ceremony_tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            cadence_secs = self.environment.ceremony_tick.as_secs(),
            "ceremony lifecycle started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.open_sweep() {
                        error!(%error, "open sweep failed");
                    }
                    if let Err(error) = self.close_sweep() {
                        error!(%error, "close sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("ceremony lifecycle stopped");
                    return;
                }
            }
        }
    }
}
