//! Contribution verification, end to end.
//!
//! One verification task covers: deriving the artifact paths, running the
//! cryptographic check either in-process or on a remote worker, recording
//! the contribution, folding circuit statistics, and advancing the waiting
//! queue. The cryptography itself stays behind [`LocalVerifier`] and the
//! remote worker's command; this module only orchestrates.

use crate::coordinator::{Coordinator, CoordinatorError};
use crate::environment::Environment;
use crate::objects::{
    format_zkey_index, Ceremony, CeremonyState, Circuit, Contribution, ContributionFiles,
    ContributionStep, ParticipantStatus, VerificationMechanism, FINAL_ZKEY_INDEX,
};
use crate::s3::{self, BlobStore};
use crate::state_machine::{self, Context, Event};
use crate::storage::Repository;
use crate::workers::{CommandStatus, VerificationWorker};
use async_trait::async_trait;
use blake2::{Blake2b512, Digest};
use chrono::Utc;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// The literal token a verification transcript must carry for the
/// contribution to be accepted.
const VALID_TRANSCRIPT_TOKEN: &str = "ZKey Ok!";

/// Result of one cryptographic verification run.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub valid: bool,
    pub transcript: String,
    /// Hex digest of the verified zkey; present only on valid runs.
    pub last_zkey_hash: Option<String>,
}

/// In-process verifier over locally downloaded artifacts. Side-effect-free
/// on storage.
#[async_trait]
pub trait LocalVerifier: Send + Sync {
    async fn verify(
        &self,
        pot_path: &Path,
        initial_zkey_path: &Path,
        last_zkey_path: &Path,
    ) -> Result<Verdict, anyhow::Error>;
}

/// Everything resolved about the task before any blob or worker traffic.
struct VerificationTask {
    ceremony: Ceremony,
    circuit: Circuit,
    bucket: String,
    zkey_index: String,
    last_zkey_key: String,
    transcript_key: String,
    finalizing: bool,
}

/// Orchestrates single verification tasks end to end.
pub struct ContributionVerifier<R> {
    repository: Arc<R>,
    blob: Arc<dyn BlobStore>,
    worker: Arc<dyn VerificationWorker>,
    local: Arc<dyn LocalVerifier>,
    coordinator: Arc<Coordinator<R>>,
    environment: Environment,
    /// Flipped on server shutdown; remote polling honors it cooperatively.
    cancel: Option<watch::Receiver<bool>>,
}

impl<R: Repository> ContributionVerifier<R> {
    pub fn new(
        repository: Arc<R>,
        blob: Arc<dyn BlobStore>,
        worker: Arc<dyn VerificationWorker>,
        local: Arc<dyn LocalVerifier>,
        coordinator: Arc<Coordinator<R>>,
        environment: Environment,
    ) -> Self {
        Self {
            repository,
            blob,
            worker,
            local,
            coordinator,
            environment,
            cancel: None,
        }
    }

    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Verifies the contribution the given participant claims to have just
    /// uploaded to the given circuit, records the outcome and advances the
    /// queue. Returns whether the contribution was valid.
    pub async fn verify_contribution(
        &self,
        ceremony_id: u64,
        circuit_id: u64,
        user_id: &str,
        contributor_identifier: &str,
    ) -> Result<bool, CoordinatorError> {
        let task = self.resolve_task(ceremony_id, circuit_id, user_id, contributor_identifier)?;
        info!(
            ceremony = ceremony_id,
            circuit = circuit_id,
            user = user_id,
            zkey_index = %task.zkey_index,
            "starting contribution verification"
        );

        let timer = Instant::now();
        let verdict = match task.circuit.verification_mechanism {
            VerificationMechanism::Remote => self.run_remote(&task).await,
            VerificationMechanism::Local => self.run_local(&task).await,
        };
        let verify_compute_ms = timer.elapsed().as_millis() as u64;

        // The worker is stopped no matter how the run went; failures here
        // must never mask the verification outcome.
        if task.circuit.verification_mechanism == VerificationMechanism::Remote {
            if let Some(handle) = task.circuit.worker_handle.as_deref() {
                if let Err(error) = self.worker.stop(handle).await {
                    warn!(worker = handle, %error, "failed to stop verification worker");
                }
            }
        }

        let verdict = verdict?;

        if !verdict.valid {
            // Best effort: the rejected zkey has no business staying in the
            // bucket.
            if let Err(error) = self.blob.delete_object(&task.bucket, &task.last_zkey_key).await {
                warn!(key = %task.last_zkey_key, %error, "failed to delete rejected zkey");
            }
        }

        let valid = verdict.valid;
        self.record_outcome(&task, user_id, verdict, verify_compute_ms)?;

        if !task.finalizing {
            if let Err(error) = self.coordinator.reconcile_ceremony(ceremony_id) {
                warn!(ceremony = ceremony_id, %error, "post-verification reconciliation failed");
            }
        }
        Ok(valid)
    }

    /// Loads and validates everything the task needs, in one transaction.
    fn resolve_task(
        &self,
        ceremony_id: u64,
        circuit_id: u64,
        user_id: &str,
        contributor_identifier: &str,
    ) -> Result<VerificationTask, CoordinatorError> {
        self.repository.with_transaction(|tx| {
            let ceremony = tx.ceremony(ceremony_id)?;
            let circuit = tx.circuit(ceremony_id, circuit_id)?;
            let participant = tx.participant(user_id, ceremony_id)?;

            let finalizing = ceremony.state == CeremonyState::Closed
                && ceremony.is_coordinator(user_id)
                && participant.status == ParticipantStatus::Finalizing;
            if !finalizing {
                let verifying = participant.status == ParticipantStatus::Contributing
                    && participant.contribution_step == Some(ContributionStep::Verifying);
                if !verifying {
                    return Err(CoordinatorError::IllegalTransition(
                        crate::state_machine::TransitionError::IllegalTransition {
                            event: Event::RecordValidContribution,
                            status: participant.status,
                            step: participant.contribution_step,
                        },
                    ));
                }
                if circuit.waiting_queue.current_contributor() != Some(user_id) {
                    return Err(CoordinatorError::NotCurrentContributor(
                        user_id.to_string(),
                        circuit_id,
                    ));
                }
            }

            let zkey_index = if finalizing {
                FINAL_ZKEY_INDEX.to_string()
            } else {
                format_zkey_index(circuit.waiting_queue.completed_contributions + 1)
            };
            let bucket = s3::bucket_name(&ceremony.prefix, &self.environment.bucket_postfix);
            let last_zkey_key = s3::zkey_key(&circuit.prefix, &zkey_index);
            let transcript_key =
                s3::transcript_key(&circuit.prefix, &zkey_index, contributor_identifier);

            Ok(VerificationTask {
                ceremony,
                circuit,
                bucket,
                zkey_index,
                last_zkey_key,
                transcript_key,
                finalizing,
            })
        })
    }

    /// Drives a remote worker through one verification command.
    ///
    /// A non-success command outcome fails the contribution, not the
    /// request: the participant gets an invalid record and the queue moves
    /// on.
    async fn run_remote(&self, task: &VerificationTask) -> Result<Verdict, CoordinatorError> {
        let handle = task
            .circuit
            .worker_handle
            .as_deref()
            .ok_or_else(|| CoordinatorError::WorkerUnavailable("unassigned".to_string()))?;

        self.worker.start(handle).await?;
        tokio::time::sleep(self.environment.worker_startup_wait).await;
        let mut running = self.worker.is_running(handle).await.unwrap_or(false);
        let mut probes = 0;
        while !running && probes < self.environment.worker_startup_retries {
            tokio::time::sleep(self.environment.worker_startup_wait).await;
            running = self.worker.is_running(handle).await.unwrap_or(false);
            probes += 1;
        }
        if !running {
            return Err(CoordinatorError::WorkerUnavailable(handle.to_string()));
        }

        let command = verification_command(&task.bucket, &task.last_zkey_key, &task.transcript_key);
        let command_id = self.worker.run(handle, &command).await?;
        debug!(worker = handle, command = %command_id, "verification command dispatched");

        loop {
            if self.cancelled() {
                return Err(CoordinatorError::Cancelled);
            }
            tokio::time::sleep(self.environment.worker_poll_interval).await;
            let status = self.worker.poll_status(handle, &command_id).await?;
            match status {
                CommandStatus::Success => break,
                status if status.is_in_flight() => continue,
                status => {
                    warn!(worker = handle, ?status, "verification command did not succeed");
                    return Ok(Verdict {
                        valid: false,
                        transcript: String::new(),
                        last_zkey_hash: None,
                    });
                }
            }
        }

        // The worker wrote its transcript to the bucket; judge it there.
        let scratch = self.scratch_dir(task).await?;
        let transcript_path = scratch.join("verification_transcript.log");
        self.blob
            .download_to_path(&task.bucket, &task.transcript_key, &transcript_path)
            .await?;
        let transcript = tokio::fs::read_to_string(&transcript_path).await?;

        let valid = transcript.contains(VALID_TRANSCRIPT_TOKEN);
        if !valid {
            return Ok(Verdict {
                valid: false,
                transcript,
                last_zkey_hash: None,
            });
        }

        let transcript = strip_ansi(&transcript);
        self.blob
            .upload_from_string(&task.bucket, &task.transcript_key, transcript.clone())
            .await?;

        let output = self.worker.fetch_output(handle, &command_id).await?;
        let last_zkey_hash = first_hex_digest(&output);
        Ok(Verdict {
            valid: true,
            transcript,
            last_zkey_hash,
        })
    }

    /// Downloads the artifacts and verifies in-process.
    async fn run_local(&self, task: &VerificationTask) -> Result<Verdict, CoordinatorError> {
        let scratch = self.scratch_dir(task).await?;
        let pot_path = scratch.join(&task.circuit.pot_filename);
        let initial_zkey_path = scratch.join("initial.zkey");
        let last_zkey_path = scratch.join("last.zkey");

        self.blob
            .download_to_path(
                &task.bucket,
                &s3::pot_key(&task.circuit.pot_filename),
                &pot_path,
            )
            .await?;
        self.blob
            .download_to_path(
                &task.bucket,
                &s3::zkey_key(&task.circuit.prefix, &format_zkey_index(0)),
                &initial_zkey_path,
            )
            .await?;
        self.blob
            .download_to_path(&task.bucket, &task.last_zkey_key, &last_zkey_path)
            .await?;

        let verdict = self
            .local
            .verify(&pot_path, &initial_zkey_path, &last_zkey_path)
            .await
            .map_err(CoordinatorError::Verifier)?;

        if verdict.valid {
            self.blob
                .upload_from_string(&task.bucket, &task.transcript_key, verdict.transcript.clone())
                .await?;
        }
        Ok(verdict)
    }

    /// Persists the outcome: the contribution record, the circuit counters
    /// and averages, and the participant's transition, atomically.
    fn record_outcome(
        &self,
        task: &VerificationTask,
        user_id: &str,
        verdict: Verdict,
        verify_compute_ms: u64,
    ) -> Result<(), CoordinatorError> {
        let now = Utc::now().timestamp_millis();
        self.repository.with_transaction(|tx| {
            let circuits = tx.circuits(task.ceremony.id)?;
            let mut circuit = tx.circuit(task.ceremony.id, task.circuit.id)?;
            let mut participant = tx.participant(user_id, task.ceremony.id)?;

            let ctx = Context {
                now,
                circuit_count: circuits.len(),
                is_queue_head: false,
                ceremony_state: task.ceremony.state,
                is_coordinator: task.ceremony.is_coordinator(user_id),
                finalizing: task.finalizing,
            };

            if verdict.valid {
                let pending = participant.pending_contribution.clone().ok_or_else(|| {
                    CoordinatorError::NoInProgressContribution(user_id.to_string())
                })?;
                let transcript_hash = blake2b512_hex(verdict.transcript.as_bytes());

                let id = tx.insert_contribution(Contribution {
                    id: 0,
                    participant_user_id: user_id.to_string(),
                    ceremony_id: task.ceremony.id,
                    circuit_id: task.circuit.id,
                    zkey_index: task.zkey_index.clone(),
                    contribution_computation_time: pending.computation_time,
                    verification_computation_time: verify_compute_ms,
                    files: ContributionFiles {
                        transcript_path: Some(task.transcript_key.clone()),
                        last_zkey_path: Some(task.last_zkey_key.clone()),
                        transcript_hash: Some(transcript_hash),
                        last_zkey_hash: verdict.last_zkey_hash.clone(),
                    },
                    verification_software: self.environment.verification_software.clone(),
                    valid: true,
                    beacon: None,
                })?;
                participant.contributions.push(id);

                if !task.finalizing {
                    let full_ms = participant
                        .contribution_started_at
                        .map(|started| (now - started).max(0) as u64)
                        .unwrap_or(0);
                    let prior = circuit.waiting_queue.completed_contributions;
                    circuit
                        .avg_timings
                        .fold(prior, pending.computation_time, full_ms, verify_compute_ms);
                    circuit.waiting_queue.completed_contributions += 1;
                }

                let outcome =
                    state_machine::apply(&participant, Event::RecordValidContribution, &ctx)?;
                outcome.apply_to(&mut participant, now);

                tx.update_circuit(circuit)?;
                tx.upsert_participant(participant)?;
                info!(
                    ceremony = task.ceremony.id,
                    circuit = task.circuit.id,
                    user = user_id,
                    zkey_index = %task.zkey_index,
                    "valid contribution recorded"
                );
                Ok(())
            } else {
                if task.finalizing {
                    // A failed sealing run records nothing: the "final"
                    // index must only ever hold a valid contribution, and
                    // the coordinator retries.
                    return Err(CoordinatorError::FinalContributionInvalid);
                }
                let computation_time = participant
                    .pending_contribution
                    .as_ref()
                    .map(|p| p.computation_time)
                    .unwrap_or(0);
                let id = tx.insert_contribution(Contribution {
                    id: 0,
                    participant_user_id: user_id.to_string(),
                    ceremony_id: task.ceremony.id,
                    circuit_id: task.circuit.id,
                    zkey_index: task.zkey_index.clone(),
                    contribution_computation_time: computation_time,
                    verification_computation_time: verify_compute_ms,
                    files: ContributionFiles {
                        transcript_path: Some(task.transcript_key.clone()),
                        last_zkey_path: Some(task.last_zkey_key.clone()),
                        transcript_hash: None,
                        last_zkey_hash: None,
                    },
                    verification_software: self.environment.verification_software.clone(),
                    valid: false,
                    beacon: None,
                })?;
                participant.contributions.push(id);
                circuit.waiting_queue.failed_contributions += 1;

                // The attempt is over either way: the participant may move
                // on to the next circuit while the queue advances.
                participant.status = ParticipantStatus::Contributed;
                participant.contribution_step = Some(ContributionStep::Completed);
                participant.pending_contribution = None;
                participant.temp_contribution_data = None;

                tx.update_circuit(circuit)?;
                tx.upsert_participant(participant)?;
                warn!(
                    ceremony = task.ceremony.id,
                    circuit = task.circuit.id,
                    user = user_id,
                    zkey_index = %task.zkey_index,
                    "invalid contribution recorded"
                );
                Ok(())
            }
        })
    }

    async fn scratch_dir(&self, task: &VerificationTask) -> Result<PathBuf, CoordinatorError> {
        let dir = std::env::temp_dir().join(format!(
            "ceremony_{}_circuit_{}_{}",
            task.ceremony.id, task.circuit.id, task.zkey_index
        ));
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }
}

/// The shell command a remote worker runs for one verification.
pub fn verification_command(bucket: &str, last_zkey_key: &str, transcript_key: &str) -> String {
    format!("verify {} {} {}", bucket, last_zkey_key, transcript_key)
}

/// [`LocalVerifier`] shelling out to the snarkjs CLI, the same tool the
/// contributors run. The combined process output is the transcript.
pub struct SnarkjsCliVerifier {
    pub snarkjs_binary: String,
}

#[async_trait]
impl LocalVerifier for SnarkjsCliVerifier {
    async fn verify(
        &self,
        pot_path: &Path,
        initial_zkey_path: &Path,
        last_zkey_path: &Path,
    ) -> Result<Verdict, anyhow::Error> {
        let output = tokio::process::Command::new(&self.snarkjs_binary)
            .arg("zkvi")
            .arg(initial_zkey_path)
            .arg(pot_path)
            .arg(last_zkey_path)
            .output()
            .await?;

        let mut transcript = String::from_utf8_lossy(&output.stdout).into_owned();
        transcript.push_str(&String::from_utf8_lossy(&output.stderr));
        let transcript = strip_ansi(&transcript);
        let valid = transcript.contains(VALID_TRANSCRIPT_TOKEN);

        let last_zkey_hash = match valid {
            true => {
                let bytes = tokio::fs::read(last_zkey_path).await?;
                Some(blake2b512_hex(&bytes))
            }
            false => None,
        };
        Ok(Verdict {
            valid,
            transcript,
            last_zkey_hash,
        })
    }
}

/// Drops ANSI escape sequences from a worker transcript.
fn strip_ansi(text: &str) -> String {
    // The worker logs through a terminal-colored CLI.
    let pattern = Regex::new("\u{1b}\\[[0-9;]*[A-Za-z]").unwrap();
    pattern.replace_all(text, "").into_owned()
}

/// First 64-hex-char run in the worker output, i.e. the zkey digest.
fn first_hex_digest(output: &str) -> Option<String> {
    let pattern = Regex::new("[0-9a-fA-F]{64}").ok()?;
    pattern
        .find(output)
        .map(|m| m.as_str().to_lowercase())
}

/// Blake2b-512 digest, hex encoded.
pub fn blake2b512_hex(bytes: &[u8]) -> String {
    let mut hasher = Blake2b512::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
