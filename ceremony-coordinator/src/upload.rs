//! Multipart upload sessions.
//!
//! A contributor uploads their zkey straight to the bucket through
//! presigned part URLs; the coordinator only tracks the session (upload id
//! plus chunk tags) on the participant record so an interrupted upload can
//! resume, and validates that the object key is exactly the zkey path the
//! contributor is entitled to write.

use crate::coordinator::{circuit_at, CoordinatorError};
use crate::environment::Environment;
use crate::objects::{
    format_zkey_index, ChunkTag, Circuit, ContributionStep, ParticipantStatus, TempContributionData,
};
use crate::s3::{self, BlobStore, ObjectAcl};
use crate::storage::{Repository, RepositoryTx};
use std::sync::Arc;
use tracing::{debug, info};

pub struct UploadSessionManager<R> {
    repository: Arc<R>,
    blob: Arc<dyn BlobStore>,
    environment: Environment,
}

/// The only key a circuit's current contributor may upload to next.
fn expected_upload_key(circuit: &Circuit) -> String {
    let zkey_index = format_zkey_index(circuit.waiting_queue.completed_contributions + 1);
    s3::zkey_key(&circuit.prefix, &zkey_index)
}

impl<R: Repository> UploadSessionManager<R> {
    pub fn new(repository: Arc<R>, blob: Arc<dyn BlobStore>, environment: Environment) -> Self {
        Self {
            repository,
            blob,
            environment,
        }
    }

    /// Checks that the participant is mid-upload on the circuit designated
    /// by their progress, is that circuit's current contributor, and that
    /// `object_key` is exactly the next zkey path. Returns the bucket name.
    fn validate_upload(
        &self,
        tx: &mut dyn RepositoryTx,
        ceremony_id: u64,
        user_id: &str,
        object_key: &str,
    ) -> Result<String, CoordinatorError> {
        let ceremony = tx.ceremony(ceremony_id)?;
        let circuits = tx.circuits(ceremony_id)?;
        let participant = tx.participant(user_id, ceremony_id)?;

        let uploading = participant.status == ParticipantStatus::Contributing
            && participant.contribution_step == Some(ContributionStep::Uploading);
        let finalizing = participant.status == ParticipantStatus::Finalizing;
        if !(uploading || finalizing) {
            return Err(CoordinatorError::IllegalTransition(
                crate::state_machine::TransitionError::IllegalTransition {
                    event: crate::state_machine::Event::AdvanceStep,
                    status: participant.status,
                    step: participant.contribution_step,
                },
            ));
        }

        if finalizing {
            // The coordinator seals circuits one by one; any circuit's
            // "final" zkey path is a legitimate target.
            let sealing = circuits.iter().any(|circuit| {
                object_key == s3::zkey_key(&circuit.prefix, crate::objects::FINAL_ZKEY_INDEX)
            });
            if !sealing {
                return Err(CoordinatorError::WrongObjectKey(object_key.to_string()));
            }
        } else {
            let circuit = circuit_at(&circuits, participant.contribution_progress)
                .ok_or(crate::storage::StorageError::NotFound("circuit"))?;
            if circuit.waiting_queue.current_contributor() != Some(user_id) {
                return Err(CoordinatorError::NotCurrentContributor(
                    user_id.to_string(),
                    circuit.id,
                ));
            }
            let expected = expected_upload_key(circuit);
            if object_key != expected {
                debug!(expected = %expected, got = %object_key, "upload key mismatch");
                return Err(CoordinatorError::WrongObjectKey(object_key.to_string()));
            }
        }

        Ok(s3::bucket_name(&ceremony.prefix, &self.environment.bucket_postfix))
    }

    /// Opens a multipart upload for the participant's next zkey and pins
    /// the session to their record.
    pub async fn open(
        &self,
        ceremony_id: u64,
        user_id: &str,
        object_key: &str,
    ) -> Result<String, CoordinatorError> {
        let bucket = self.repository.with_transaction(|tx| {
            self.validate_upload(tx, ceremony_id, user_id, object_key)
        })?;

        let upload_id = self
            .blob
            .open_multipart(&bucket, object_key, ObjectAcl::Private)
            .await?;

        self.repository.with_transaction(|tx| {
            self.validate_upload(tx, ceremony_id, user_id, object_key)?;
            let mut participant = tx.participant(user_id, ceremony_id)?;
            participant.temp_contribution_data =
                Some(TempContributionData::new(upload_id.clone()));
            tx.upsert_participant(participant)?;
            Ok::<_, CoordinatorError>(())
        })?;

        info!(ceremony = ceremony_id, user = user_id, key = %object_key, "multipart upload opened");
        Ok(upload_id)
    }

    /// Presigns `number_of_parts` PUT URLs for the open session, part
    /// numbers 1..=n.
    pub async fn presign_parts(
        &self,
        ceremony_id: u64,
        user_id: &str,
        object_key: &str,
        upload_id: &str,
        number_of_parts: u32,
    ) -> Result<Vec<String>, CoordinatorError> {
        let bucket = self.repository.with_transaction(|tx| {
            let bucket = self.validate_upload(tx, ceremony_id, user_id, object_key)?;
            let participant = tx.participant(user_id, ceremony_id)?;
            match participant.temp_contribution_data {
                Some(session) if session.upload_id == upload_id => Ok(bucket),
                _ => Err(CoordinatorError::NoUploadSession),
            }
        })?;

        let mut urls = Vec::with_capacity(number_of_parts as usize);
        for part_number in 1..=number_of_parts {
            let url = self
                .blob
                .presigned_part_url(
                    &bucket,
                    object_key,
                    upload_id,
                    part_number,
                    self.environment.presigned_url_ttl,
                )
                .await?;
            urls.push(url);
        }
        Ok(urls)
    }

    /// Records an uploaded chunk's ETag. Idempotent on the part number.
    pub fn record_chunk(
        &self,
        ceremony_id: u64,
        user_id: &str,
        chunk: ChunkTag,
    ) -> Result<(), CoordinatorError> {
        self.repository.with_transaction(|tx| {
            let participant = tx.participant(user_id, ceremony_id)?;
            let uploading = participant.contribution_step == Some(ContributionStep::Uploading)
                || participant.status == ParticipantStatus::Finalizing;
            if !uploading {
                return Err(CoordinatorError::IllegalTransition(
                    crate::state_machine::TransitionError::IllegalTransition {
                        event: crate::state_machine::Event::AdvanceStep,
                        status: participant.status,
                        step: participant.contribution_step,
                    },
                ));
            }
            let mut participant = participant;
            let session = participant
                .temp_contribution_data
                .as_mut()
                .ok_or(CoordinatorError::NoUploadSession)?;
            session.record_chunk(chunk);
            tx.upsert_participant(participant)?;
            Ok(())
        })
    }

    /// Completes the multipart upload with the recorded chunks in
    /// part-number-ascending order and clears the session.
    pub async fn complete(
        &self,
        ceremony_id: u64,
        user_id: &str,
        object_key: &str,
        upload_id: &str,
        parts: Vec<ChunkTag>,
    ) -> Result<(), CoordinatorError> {
        let (bucket, chunks) = self.repository.with_transaction(|tx| {
            let bucket = self.validate_upload(tx, ceremony_id, user_id, object_key)?;
            let mut participant = tx.participant(user_id, ceremony_id)?;
            let session = participant
                .temp_contribution_data
                .as_mut()
                .ok_or(CoordinatorError::NoUploadSession)?;
            if session.upload_id != upload_id {
                return Err(CoordinatorError::NoUploadSession);
            }
            // Late tags supplied with the completion call still count.
            for chunk in parts {
                session.record_chunk(chunk);
            }
            let chunks = session.sorted_chunks();
            tx.upsert_participant(participant)?;
            Ok::<_, CoordinatorError>((bucket, chunks))
        })?;

        self.blob
            .complete_multipart(&bucket, object_key, upload_id, &chunks)
            .await?;

        self.repository.with_transaction(|tx| {
            let mut participant = tx.participant(user_id, ceremony_id)?;
            participant.temp_contribution_data = None;
            tx.upsert_participant(participant)?;
            Ok::<_, CoordinatorError>(())
        })?;

        info!(ceremony = ceremony_id, user = user_id, key = %object_key, "multipart upload completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{ArtifactSizes, AvgTimings, VerificationMechanism, WaitingQueue};

    fn circuit() -> Circuit {
        let mut queue = WaitingQueue::default();
        queue.enqueue("u1");
        queue.completed_contributions = 2;
        Circuit {
            id: 10,
            ceremony_id: 1,
            prefix: "mult2".to_string(),
            name: "Multiplier2".to_string(),
            sequence_position: 1,
            verification_mechanism: VerificationMechanism::Local,
            worker_handle: None,
            pot_filename: "pot.ptau".to_string(),
            bootstrap_script_filename: None,
            artifact_sizes: ArtifactSizes::default(),
            dynamic_threshold_pct: 100,
            avg_timings: AvgTimings::default(),
            waiting_queue: queue,
        }
    }

    #[test]
    fn expected_key_points_at_the_next_zkey() {
        assert_eq!(
            expected_upload_key(&circuit()),
            "circuits/mult2/contributions/mult2_00003.zkey"
        );
    }

    #[test]
    fn recorded_chunks_come_back_sorted() {
        let mut session = TempContributionData::new("upload-1".to_string());
        for part_number in [3, 1, 2] {
            session.record_chunk(ChunkTag {
                etag: format!("etag-{}", part_number),
                part_number,
            });
        }
        // Last write wins on a repeated part number.
        session.record_chunk(ChunkTag {
            etag: "etag-2-final".to_string(),
            part_number: 2,
        });
        let sorted = session.sorted_chunks();
        assert_eq!(
            sorted.iter().map(|c| c.part_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(sorted[1].etag, "etag-2-final");
    }
}
