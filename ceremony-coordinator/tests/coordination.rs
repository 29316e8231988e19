//! End-to-end coordination scenarios over the in-memory repository and
//! fake collaborators: admission, promotion, serialization, timeouts,
//! verification outcomes, uploads and finalization.

mod common;

use ceremony_coordinator::objects::{
    CeremonyState, ChunkTag, Contribution, ContributionFiles, ContributionStep,
    ParticipantStatus, TimeoutEntry, TimeoutKind, VerificationMechanism, VerificationSoftware,
    FINAL_ZKEY_INDEX,
};
use ceremony_coordinator::s3::{transcript_key, zkey_key};
use ceremony_coordinator::storage::{Repository, StorageError};
use ceremony_coordinator::verification::Verdict;
use ceremony_coordinator::workers::CommandStatus;
use ceremony_coordinator::CoordinatorError;
use common::*;

#[tokio::test]
async fn single_contributor_local_circuit_valid_contribution() {
    let world = world();
    let (ceremony_id, circuit_ids) = seed(
        &world,
        ceremony_fixture(CeremonyState::Opened),
        vec![circuit_fixture(0, 1, VerificationMechanism::Local)],
    );
    seed_artifacts(&world, "p1", "circuit1");

    assert!(world.coordinator.check_participant(ceremony_id, "u1").unwrap());
    drive_to_verifying(&world, ceremony_id, "u1");

    // The upload placed the zkey where verification expects it.
    let bucket = "p1-ph2-ceremony";
    world.blob.put(bucket, &zkey_key("circuit1", "00001"), b"zkey v1");

    let valid = world
        .verifier
        .verify_contribution(ceremony_id, circuit_ids[0], "u1", "u1")
        .await
        .unwrap();
    assert!(valid);

    let (participant, circuit, contribution) = world
        .repository
        .with_transaction(|tx| {
            Ok::<_, StorageError>((
                tx.participant("u1", ceremony_id)?,
                tx.circuit(ceremony_id, circuit_ids[0])?,
                tx.contribution(ceremony_id, circuit_ids[0], "00001")?,
            ))
        })
        .unwrap();

    assert!(contribution.valid);
    assert_eq!(contribution.zkey_index, "00001");
    assert!(contribution.files.last_zkey_hash.is_some());
    assert!(contribution.files.transcript_hash.is_some());
    assert_eq!(contribution.contribution_computation_time, 1_200);

    assert_eq!(participant.status, ParticipantStatus::Done);
    assert_eq!(participant.contribution_progress, 1);
    assert_eq!(participant.contribution_step, Some(ContributionStep::Completed));
    assert_eq!(participant.contributions, vec![contribution.id]);
    assert!(participant.pending_contribution.is_none());

    assert_eq!(circuit.waiting_queue.completed_contributions, 1);
    assert_eq!(circuit.waiting_queue.current_contributor(), None);
    assert!(circuit.waiting_queue.contributors().is_empty());
    assert!(circuit.avg_timings.verify_compute < 60_000);
    assert_eq!(circuit.avg_timings.contribution_computation, 1_200);
}

#[tokio::test]
async fn two_contributors_are_serialized_on_one_circuit() {
    let world = world();
    let (ceremony_id, circuit_ids) = seed(
        &world,
        ceremony_fixture(CeremonyState::Opened),
        vec![circuit_fixture(0, 1, VerificationMechanism::Local)],
    );
    seed_artifacts(&world, "p1", "circuit1");

    assert!(world.coordinator.check_participant(ceremony_id, "u1").unwrap());
    world.coordinator.progress_to_next_circuit(ceremony_id, "u1").unwrap();
    assert!(world.coordinator.check_participant(ceremony_id, "u2").unwrap());
    world.coordinator.progress_to_next_circuit(ceremony_id, "u2").unwrap();

    let (u1, u2, circuit) = world
        .repository
        .with_transaction(|tx| {
            Ok::<_, StorageError>((
                tx.participant("u1", ceremony_id)?,
                tx.participant("u2", ceremony_id)?,
                tx.circuit(ceremony_id, circuit_ids[0])?,
            ))
        })
        .unwrap();
    assert_eq!(u1.status, ParticipantStatus::Contributing);
    assert_eq!(u2.status, ParticipantStatus::Waiting);
    assert_eq!(
        circuit.waiting_queue.contributors(),
        &["u1".to_string(), "u2".to_string()]
    );
    assert_eq!(circuit.waiting_queue.current_contributor(), Some("u1"));

    // u1 walks through the steps and verifies valid; the nudge after
    // verification hands the circuit to u2.
    world.coordinator.progress_to_next_step(ceremony_id, "u1").unwrap();
    world
        .coordinator
        .store_contribution_hash(ceremony_id, "u1", "beef".repeat(16), 900)
        .unwrap();
    world.coordinator.progress_to_next_step(ceremony_id, "u1").unwrap();
    world.coordinator.progress_to_next_step(ceremony_id, "u1").unwrap();
    world
        .blob
        .put("p1-ph2-ceremony", &zkey_key("circuit1", "00001"), b"zkey v1");
    assert!(world
        .verifier
        .verify_contribution(ceremony_id, circuit_ids[0], "u1", "u1")
        .await
        .unwrap());

    let (u1, u2, circuit) = world
        .repository
        .with_transaction(|tx| {
            Ok::<_, StorageError>((
                tx.participant("u1", ceremony_id)?,
                tx.participant("u2", ceremony_id)?,
                tx.circuit(ceremony_id, circuit_ids[0])?,
            ))
        })
        .unwrap();
    assert_eq!(u1.status, ParticipantStatus::Done);
    assert_eq!(u2.status, ParticipantStatus::Contributing);
    assert_eq!(u2.contribution_step, Some(ContributionStep::Downloading));
    assert_eq!(circuit.waiting_queue.current_contributor(), Some("u2"));

    // Valid non-final contributions match the completed counter.
    let contributions = world
        .repository
        .with_transaction(|tx| tx.circuit_contributions(ceremony_id, circuit_ids[0]))
        .unwrap();
    let valid_count = contributions
        .iter()
        .filter(|c| c.valid && c.zkey_index != FINAL_ZKEY_INDEX)
        .count() as u64;
    assert_eq!(circuit.waiting_queue.completed_contributions, valid_count);
}

#[tokio::test]
async fn timed_out_participant_is_exhumed_and_resumes() {
    let world = world();
    let (ceremony_id, circuit_ids) = seed(
        &world,
        ceremony_fixture(CeremonyState::Opened),
        vec![circuit_fixture(0, 1, VerificationMechanism::Local)],
    );

    assert!(world.coordinator.check_participant(ceremony_id, "u1").unwrap());
    world.coordinator.progress_to_next_circuit(ceremony_id, "u1").unwrap();

    // An external watchdog flips the participant to TIMEDOUT with an
    // already-expired ban and drops them from the queue.
    let now = chrono::Utc::now().timestamp_millis();
    world
        .repository
        .with_transaction(|tx| {
            let mut participant = tx.participant("u1", ceremony_id)?;
            participant.status = ParticipantStatus::Timedout;
            participant.timeouts.push(TimeoutEntry {
                start_date: now - 10_000,
                end_date: now - 1,
                kind: TimeoutKind::BlockingContribution,
            });
            tx.upsert_participant(participant)?;
            let mut circuit = tx.circuit(ceremony_id, circuit_ids[0])?;
            circuit.waiting_queue.remove("u1");
            tx.update_circuit(circuit)?;
            Ok::<_, StorageError>(())
        })
        .unwrap();

    // Re-admission exhumes, resumption re-queues and re-promotes.
    assert!(world.coordinator.check_participant(ceremony_id, "u1").unwrap());
    let participant = world
        .repository
        .with_transaction(|tx| tx.participant("u1", ceremony_id))
        .unwrap();
    assert_eq!(participant.status, ParticipantStatus::Exhumed);
    assert_eq!(participant.contribution_step, Some(ContributionStep::Downloading));
    assert!(participant.pending_contribution.is_none());

    world.coordinator.resume_after_timeout(ceremony_id, "u1").unwrap();
    let participant = world
        .repository
        .with_transaction(|tx| tx.participant("u1", ceremony_id))
        .unwrap();
    assert_eq!(participant.status, ParticipantStatus::Contributing);
    assert_eq!(participant.contribution_progress, 1);
}

#[tokio::test]
async fn blocking_contributor_is_evicted_and_next_head_promoted() {
    let world = world();
    let (ceremony_id, circuit_ids) = seed(
        &world,
        ceremony_fixture(CeremonyState::Opened),
        vec![circuit_fixture(0, 1, VerificationMechanism::Local)],
    );

    assert!(world.coordinator.check_participant(ceremony_id, "u1").unwrap());
    world.coordinator.progress_to_next_circuit(ceremony_id, "u1").unwrap();
    assert!(world.coordinator.check_participant(ceremony_id, "u2").unwrap());
    world.coordinator.progress_to_next_circuit(ceremony_id, "u2").unwrap();

    // Shrink the budget to zero once u1 holds the circuit: the next pass
    // finds them overdue.
    world
        .repository
        .with_transaction(|tx| {
            let mut ceremony = tx.ceremony(ceremony_id)?;
            ceremony.fixed_timeout_window_secs = 0;
            tx.update_ceremony(ceremony)?;
            Ok::<_, StorageError>(())
        })
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    world.coordinator.reconcile_ceremony(ceremony_id).unwrap();

    let (u1, u2, circuit) = world
        .repository
        .with_transaction(|tx| {
            Ok::<_, StorageError>((
                tx.participant("u1", ceremony_id)?,
                tx.participant("u2", ceremony_id)?,
                tx.circuit(ceremony_id, circuit_ids[0])?,
            ))
        })
        .unwrap();
    assert_eq!(u1.status, ParticipantStatus::Timedout);
    assert_eq!(u1.timeouts.len(), 1);
    assert_eq!(u1.timeouts[0].kind, TimeoutKind::BlockingContribution);
    assert_eq!(u2.status, ParticipantStatus::Contributing);
    assert_eq!(circuit.waiting_queue.current_contributor(), Some("u2"));
    assert!(!circuit.waiting_queue.contains("u1"));

    // The ban is still running, so re-admission denies contribution.
    assert!(!world.coordinator.check_participant(ceremony_id, "u1").unwrap());
}

#[tokio::test]
async fn invalid_contribution_is_recorded_and_cleaned_up() {
    let world = world_with(FakeWorker::default(), FakeLocalVerifier::returning(false));
    let (ceremony_id, circuit_ids) = seed(
        &world,
        ceremony_fixture(CeremonyState::Opened),
        vec![
            circuit_fixture(0, 1, VerificationMechanism::Local),
            circuit_fixture(0, 2, VerificationMechanism::Local),
        ],
    );
    seed_artifacts(&world, "p1", "circuit1");

    assert!(world.coordinator.check_participant(ceremony_id, "u1").unwrap());
    drive_to_verifying(&world, ceremony_id, "u1");
    let zkey = zkey_key("circuit1", "00001");
    world.blob.put("p1-ph2-ceremony", &zkey, b"corrupt zkey");

    let valid = world
        .verifier
        .verify_contribution(ceremony_id, circuit_ids[0], "u1", "u1")
        .await
        .unwrap();
    assert!(!valid);

    assert_eq!(world.blob.deleted.lock().unwrap().clone(), vec![zkey.clone()]);

    let (participant, circuit, contribution) = world
        .repository
        .with_transaction(|tx| {
            Ok::<_, StorageError>((
                tx.participant("u1", ceremony_id)?,
                tx.circuit(ceremony_id, circuit_ids[0])?,
                tx.contribution(ceremony_id, circuit_ids[0], "00001")?,
            ))
        })
        .unwrap();
    assert!(!contribution.valid);
    assert!(contribution.files.last_zkey_hash.is_none());
    assert_eq!(circuit.waiting_queue.failed_contributions, 1);
    assert_eq!(circuit.waiting_queue.completed_contributions, 0);
    assert_eq!(circuit.avg_timings.full_contribution, 0);
    assert_eq!(participant.status, ParticipantStatus::Contributed);
    assert_eq!(participant.contribution_step, Some(ContributionStep::Completed));

    // The failed attempt does not block moving on to the next circuit.
    world.coordinator.progress_to_next_circuit(ceremony_id, "u1").unwrap();
    let participant = world
        .repository
        .with_transaction(|tx| tx.participant("u1", ceremony_id))
        .unwrap();
    assert_eq!(participant.contribution_progress, 2);
}

#[tokio::test]
async fn remote_worker_timeout_fails_the_contribution() {
    let worker = FakeWorker::scripted(
        &[
            CommandStatus::InProgress,
            CommandStatus::InProgress,
            CommandStatus::TimedOut,
        ],
        "",
    );
    let world = world_with(worker, FakeLocalVerifier::returning(true));
    let (ceremony_id, circuit_ids) = seed(
        &world,
        ceremony_fixture(CeremonyState::Opened),
        vec![circuit_fixture(0, 1, VerificationMechanism::Remote)],
    );

    assert!(world.coordinator.check_participant(ceremony_id, "u1").unwrap());
    drive_to_verifying(&world, ceremony_id, "u1");

    let valid = world
        .verifier
        .verify_contribution(ceremony_id, circuit_ids[0], "u1", "u1")
        .await
        .unwrap();
    assert!(!valid);
    assert!(world.worker.stop_count() >= 1);

    let (participant, circuit) = world
        .repository
        .with_transaction(|tx| {
            Ok::<_, StorageError>((
                tx.participant("u1", ceremony_id)?,
                tx.circuit(ceremony_id, circuit_ids[0])?,
            ))
        })
        .unwrap();
    assert_eq!(participant.status, ParticipantStatus::Contributed);
    assert_eq!(circuit.waiting_queue.failed_contributions, 1);
}

#[tokio::test]
async fn remote_verification_reads_the_worker_transcript() {
    let digest = "5e".repeat(32);
    let worker = FakeWorker::scripted(
        &[CommandStatus::InProgress, CommandStatus::Success],
        &format!("verified, zkey digest {}", digest),
    );
    let world = world_with(worker, FakeLocalVerifier::returning(true));
    let (ceremony_id, circuit_ids) = seed(
        &world,
        ceremony_fixture(CeremonyState::Opened),
        vec![circuit_fixture(0, 1, VerificationMechanism::Remote)],
    );

    assert!(world.coordinator.check_participant(ceremony_id, "u1").unwrap());
    drive_to_verifying(&world, ceremony_id, "u1");

    // The worker leaves a terminal-colored transcript in the bucket.
    let transcript = transcript_key("circuit1", "00001", "u1");
    world.blob.put(
        "p1-ph2-ceremony",
        &transcript,
        "checking...\n\u{1b}[32mZKey Ok!\u{1b}[0m\n".as_bytes(),
    );

    let valid = world
        .verifier
        .verify_contribution(ceremony_id, circuit_ids[0], "u1", "u1")
        .await
        .unwrap();
    assert!(valid);

    let contribution = world
        .repository
        .with_transaction(|tx| tx.contribution(ceremony_id, circuit_ids[0], "00001"))
        .unwrap();
    assert_eq!(contribution.files.last_zkey_hash, Some(digest));

    // The re-uploaded transcript is stripped of escape sequences.
    let stored = world
        .blob
        .objects
        .lock()
        .unwrap()
        .get(&("p1-ph2-ceremony".to_string(), transcript))
        .cloned()
        .unwrap();
    let stored = String::from_utf8(stored).unwrap();
    assert!(stored.contains("ZKey Ok!"));
    assert!(!stored.contains('\u{1b}'));
}

#[tokio::test]
async fn multipart_upload_round_trip_orders_parts() {
    let world = world();
    let (ceremony_id, _) = seed(
        &world,
        ceremony_fixture(CeremonyState::Opened),
        vec![circuit_fixture(0, 1, VerificationMechanism::Local)],
    );

    assert!(world.coordinator.check_participant(ceremony_id, "u1").unwrap());
    world.coordinator.progress_to_next_circuit(ceremony_id, "u1").unwrap();
    world.coordinator.progress_to_next_step(ceremony_id, "u1").unwrap();
    world
        .coordinator
        .store_contribution_hash(ceremony_id, "u1", "dead".repeat(16), 700)
        .unwrap();
    world.coordinator.progress_to_next_step(ceremony_id, "u1").unwrap();

    let zkey = zkey_key("circuit1", "00001");
    assert!(matches!(
        world.uploads.open(ceremony_id, "u1", "circuits/other/contributions/other_00001.zkey").await,
        Err(CoordinatorError::WrongObjectKey(_))
    ));

    let upload_id = world.uploads.open(ceremony_id, "u1", &zkey).await.unwrap();
    let urls = world
        .uploads
        .presign_parts(ceremony_id, "u1", &zkey, &upload_id, 3)
        .await
        .unwrap();
    assert_eq!(urls.len(), 3);

    for part_number in [3u32, 1, 2] {
        world
            .uploads
            .record_chunk(
                ceremony_id,
                "u1",
                ChunkTag {
                    etag: format!("etag-{}", part_number),
                    part_number,
                },
            )
            .unwrap();
    }
    world
        .uploads
        .complete(ceremony_id, "u1", &zkey, &upload_id, Vec::new())
        .await
        .unwrap();

    let completed = world.blob.completed_parts.lock().unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(
        completed[0].iter().map(|c| c.part_number).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    drop(completed);

    let participant = world
        .repository
        .with_transaction(|tx| tx.participant("u1", ceremony_id))
        .unwrap();
    assert!(participant.temp_contribution_data.is_none());
}

#[tokio::test]
async fn lifecycle_sweeps_open_and_close_on_schedule() {
    let world = world();
    let now = chrono::Utc::now().timestamp_millis();

    let mut due_to_open = ceremony_fixture(CeremonyState::Scheduled);
    due_to_open.prefix = "opening".to_string();
    let mut not_due = ceremony_fixture(CeremonyState::Scheduled);
    not_due.prefix = "later".to_string();
    not_due.start_date = now + 3_600_000;
    not_due.end_date = now + 7_200_000;
    let mut due_to_close = ceremony_fixture(CeremonyState::Opened);
    due_to_close.prefix = "closing".to_string();
    due_to_close.end_date = now - 1;

    let (open_id, _) = seed(&world, due_to_open, vec![]);
    let (later_id, _) = seed(&world, not_due, vec![]);
    let (close_id, _) = seed(&world, due_to_close, vec![]);

    assert_eq!(world.lifecycle.open_sweep().unwrap(), 1);
    assert_eq!(world.lifecycle.close_sweep().unwrap(), 1);

    let states = world
        .repository
        .with_transaction(|tx| {
            Ok::<_, StorageError>((
                tx.ceremony(open_id)?.state,
                tx.ceremony(later_id)?.state,
                tx.ceremony(close_id)?.state,
            ))
        })
        .unwrap();
    assert_eq!(states.0, CeremonyState::Opened);
    assert_eq!(states.1, CeremonyState::Scheduled);
    assert_eq!(states.2, CeremonyState::Closed);
}

fn final_contribution(ceremony_id: u64, circuit_id: u64) -> Contribution {
    Contribution {
        id: 0,
        participant_user_id: "coordinator".to_string(),
        ceremony_id,
        circuit_id,
        zkey_index: FINAL_ZKEY_INDEX.to_string(),
        contribution_computation_time: 100,
        verification_computation_time: 100,
        files: ContributionFiles {
            transcript_path: Some("transcript".to_string()),
            last_zkey_path: Some("zkey".to_string()),
            transcript_hash: Some("aa".repeat(64)),
            last_zkey_hash: Some("bb".repeat(32)),
        },
        verification_software: VerificationSoftware {
            name: "snarkjs".to_string(),
            version: "0.7.0".to_string(),
            commit_hash: String::new(),
        },
        valid: true,
        beacon: None,
    }
}

#[tokio::test]
async fn finalize_requires_every_final_contribution() {
    let world = world();
    let (ceremony_id, circuit_ids) = seed(
        &world,
        ceremony_fixture(CeremonyState::Closed),
        vec![
            circuit_fixture(0, 1, VerificationMechanism::Remote),
            circuit_fixture(0, 2, VerificationMechanism::Local),
        ],
    );

    // Only the first circuit is sealed: finalization must refuse.
    world
        .repository
        .with_transaction(|tx| tx.insert_contribution(final_contribution(ceremony_id, circuit_ids[0])))
        .unwrap();
    let error = world
        .lifecycle
        .finalize(ceremony_id, "coordinator")
        .await
        .unwrap_err();
    assert!(matches!(error, CoordinatorError::MissingFinalContribution(id) if id == circuit_ids[1]));
    let state = world
        .repository
        .with_transaction(|tx| Ok::<_, StorageError>(tx.ceremony(ceremony_id)?.state))
        .unwrap();
    assert_eq!(state, CeremonyState::Closed);

    // Sealing the second circuit lets finalization through; the remote
    // circuit's worker is stopped exactly once.
    world
        .repository
        .with_transaction(|tx| tx.insert_contribution(final_contribution(ceremony_id, circuit_ids[1])))
        .unwrap();
    assert!(matches!(
        world.lifecycle.finalize(ceremony_id, "intruder").await,
        Err(CoordinatorError::NotCoordinator)
    ));
    world.lifecycle.finalize(ceremony_id, "coordinator").await.unwrap();

    let state = world
        .repository
        .with_transaction(|tx| Ok::<_, StorageError>(tx.ceremony(ceremony_id)?.state))
        .unwrap();
    assert_eq!(state, CeremonyState::Finalized);
    assert_eq!(world.worker.stop_count(), 1);
}

#[tokio::test]
async fn coordinator_finalizes_circuits_with_beacons() {
    let world = world();
    let (ceremony_id, circuit_ids) = seed(
        &world,
        ceremony_fixture(CeremonyState::Closed),
        vec![
            circuit_fixture(0, 1, VerificationMechanism::Local),
            circuit_fixture(0, 2, VerificationMechanism::Local),
        ],
    );
    seed_artifacts(&world, "p1", "circuit1");
    seed_artifacts(&world, "p1", "circuit2");

    // The coordinator already contributed everywhere while the ceremony
    // was open.
    world
        .repository
        .with_transaction(|tx| {
            let mut participant =
                ceremony_coordinator::objects::Participant::new("coordinator", ceremony_id);
            participant.status = ParticipantStatus::Done;
            participant.contribution_progress = 2;
            participant.contribution_step = Some(ContributionStep::Completed);
            tx.upsert_participant(participant)?;
            Ok::<_, StorageError>(())
        })
        .unwrap();

    // Re-admission against the closed ceremony flips them to FINALIZING.
    assert!(world
        .coordinator
        .check_participant(ceremony_id, "coordinator")
        .unwrap());
    let participant = world
        .repository
        .with_transaction(|tx| tx.participant("coordinator", ceremony_id))
        .unwrap();
    assert_eq!(participant.status, ParticipantStatus::Finalizing);

    // Seal both circuits: hash fragment, final zkey upload, verification.
    for (position, circuit_id) in circuit_ids.iter().enumerate() {
        let prefix = format!("circuit{}", position + 1);
        world
            .coordinator
            .store_contribution_hash(ceremony_id, "coordinator", "f00d".repeat(16), 300)
            .unwrap();
        world.blob.put(
            "p1-ph2-ceremony",
            &zkey_key(&prefix, FINAL_ZKEY_INDEX),
            b"final zkey",
        );
        world.local.push(Verdict {
            valid: true,
            transcript: "ZKey Ok!".to_string(),
            last_zkey_hash: Some("cd".repeat(32)),
        });
        assert!(world
            .verifier
            .verify_contribution(ceremony_id, *circuit_id, "coordinator", "coordinator")
            .await
            .unwrap());
        world
            .lifecycle
            .finalize_circuit(ceremony_id, *circuit_id, "coordinator", "beacon-value".to_string())
            .unwrap();
    }

    // Every circuit carries a beacon-stamped final record; the coordinator
    // is done and the ceremony can seal.
    let participant = world
        .repository
        .with_transaction(|tx| tx.participant("coordinator", ceremony_id))
        .unwrap();
    assert_eq!(participant.status, ParticipantStatus::Finalized);

    for circuit_id in &circuit_ids {
        let contribution = world
            .repository
            .with_transaction(|tx| tx.contribution(ceremony_id, *circuit_id, FINAL_ZKEY_INDEX))
            .unwrap();
        assert!(contribution.valid);
        assert!(contribution.beacon.is_some());
    }

    world.lifecycle.finalize(ceremony_id, "coordinator").await.unwrap();
    let state = world
        .repository
        .with_transaction(|tx| Ok::<_, StorageError>(tx.ceremony(ceremony_id)?.state))
        .unwrap();
    assert_eq!(state, CeremonyState::Finalized);
}
