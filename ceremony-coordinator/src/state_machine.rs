//! Pure transition rules for `ParticipantStatus × ContributionStep`.
//!
//! The functions here never touch storage: they take a participant snapshot
//! plus a [`Context`] of facts established by the caller's transaction, and
//! return the [`Outcome`] to persist, or reject. All persistence is the
//! caller's job, inside the same transaction that produced the inputs.

use crate::objects::{CeremonyState, ContributionStep, Participant, ParticipantStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum TransitionError {
    #[error("illegal transition: {event:?} from status {status:?} step {step:?}")]
    IllegalTransition {
        event: Event,
        status: ParticipantStatus,
        step: Option<ContributionStep>,
    },
}

/// The events a participant record can be driven by.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    /// Admission / re-admission check.
    Admit,
    /// Move on to the next circuit in sequence.
    ProgressToNextCircuit,
    /// Leave the `Exhumed` state after an expired timeout.
    ResumeAfterTimeout,
    /// Advance within the current circuit's contribution steps.
    AdvanceStep,
    /// A verified-valid contribution was recorded.
    RecordValidContribution,
    /// Promoted to the head of the target circuit's queue.
    BecomeCurrentContributor,
    /// A coordinator of a closed ceremony starts finalizing.
    PrepareFinalization,
}

/// Facts about the surrounding world, established inside the caller's
/// transaction.
#[derive(Debug, Clone, Copy)]
pub struct Context {
    /// Epoch milliseconds.
    pub now: i64,
    /// Number of circuits in the ceremony.
    pub circuit_count: usize,
    /// Whether the participant is the head of the target circuit's queue.
    pub is_queue_head: bool,
    pub ceremony_state: CeremonyState,
    /// Whether the participant is the ceremony's coordinator.
    pub is_coordinator: bool,
    /// Whether the current verification run seals the circuit.
    pub finalizing: bool,
}

/// The state to persist after a successful transition, plus the side
/// effects the caller must apply in the same transaction.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Outcome {
    pub status: ParticipantStatus,
    pub step: Option<ContributionStep>,
    pub contribution_progress: usize,
    pub start_contribution_timer: bool,
    pub start_verification_timer: bool,
    pub clear_pending_contribution: bool,
    pub clear_temp_contribution_data: bool,
    /// For [`Event::Admit`]: whether the participant may (eventually)
    /// contribute.
    pub can_contribute: bool,
}

impl Outcome {
    /// An outcome that changes nothing about the participant.
    fn keep(participant: &Participant) -> Self {
        Self {
            status: participant.status,
            step: participant.contribution_step,
            contribution_progress: participant.contribution_progress,
            start_contribution_timer: false,
            start_verification_timer: false,
            clear_pending_contribution: false,
            clear_temp_contribution_data: false,
            can_contribute: true,
        }
    }

    /// Writes this outcome back onto the participant record.
    pub fn apply_to(&self, participant: &mut Participant, now: i64) {
        participant.status = self.status;
        participant.contribution_step = self.step;
        participant.contribution_progress = self.contribution_progress;
        if self.start_contribution_timer {
            participant.contribution_started_at = Some(now);
        }
        if self.start_verification_timer {
            participant.verification_started_at = Some(now);
        }
        if self.clear_pending_contribution {
            participant.pending_contribution = None;
        }
        if self.clear_temp_contribution_data {
            participant.temp_contribution_data = None;
        }
    }
}

/// Applies `event` to a participant snapshot under `ctx`.
///
/// Rejections leave no trace: the caller must not mutate the participant
/// when this returns an error.
pub fn apply(
    participant: &Participant,
    event: Event,
    ctx: &Context,
) -> Result<Outcome, TransitionError> {
    use ContributionStep as Step;
    use ParticipantStatus as Status;

    let reject = || TransitionError::IllegalTransition {
        event,
        status: participant.status,
        step: participant.contribution_step,
    };

    match event {
        Event::Admit => match participant.status {
            // Contributed everywhere: nothing left to do in this ceremony.
            Status::Done if participant.contribution_progress == ctx.circuit_count => {
                Ok(Outcome {
                    can_contribute: false,
                    ..Outcome::keep(participant)
                })
            }
            Status::Timedout => {
                if participant.has_active_timeout(ctx.now) {
                    Ok(Outcome {
                        can_contribute: false,
                        ..Outcome::keep(participant)
                    })
                } else {
                    Ok(Outcome {
                        status: Status::Exhumed,
                        step: Some(Step::Downloading),
                        clear_pending_contribution: true,
                        clear_temp_contribution_data: true,
                        ..Outcome::keep(participant)
                    })
                }
            }
            // Re-admission of an already active participant is a no-op.
            _ => Ok(Outcome::keep(participant)),
        },

        Event::ProgressToNextCircuit => {
            let first = participant.status == Status::Waiting && participant.contribution_progress == 0;
            let next = participant.status == Status::Contributed
                && participant.contribution_step == Some(Step::Completed)
                && participant.contribution_progress > 0;
            if !(first || next) || participant.contribution_progress >= ctx.circuit_count {
                return Err(reject());
            }
            Ok(Outcome {
                status: Status::Ready,
                step: None,
                contribution_progress: participant.contribution_progress + 1,
                ..Outcome::keep(participant)
            })
        }

        Event::ResumeAfterTimeout => match participant.status {
            Status::Exhumed => Ok(Outcome {
                status: Status::Ready,
                step: None,
                ..Outcome::keep(participant)
            }),
            _ => Err(reject()),
        },

        Event::AdvanceStep => {
            if participant.status != Status::Contributing {
                return Err(reject());
            }
            match participant.contribution_step {
                Some(Step::Downloading) => Ok(Outcome {
                    step: Some(Step::Computing),
                    ..Outcome::keep(participant)
                }),
                Some(Step::Computing) => Ok(Outcome {
                    step: Some(Step::Uploading),
                    ..Outcome::keep(participant)
                }),
                Some(Step::Uploading) => Ok(Outcome {
                    step: Some(Step::Verifying),
                    start_verification_timer: true,
                    ..Outcome::keep(participant)
                }),
                Some(Step::Verifying) => Ok(Outcome {
                    step: Some(Step::Completed),
                    ..Outcome::keep(participant)
                }),
                _ => Err(reject()),
            }
        }

        Event::RecordValidContribution => {
            if ctx.finalizing {
                // The coordinator's sealing contribution leaves its record
                // untouched; the ceremony transition happens elsewhere.
                if participant.status != Status::Finalizing {
                    return Err(reject());
                }
                return Ok(Outcome {
                    clear_pending_contribution: true,
                    ..Outcome::keep(participant)
                });
            }
            if participant.status != Status::Contributing
                || participant.contribution_step != Some(Step::Verifying)
            {
                return Err(reject());
            }
            let status = if participant.contribution_progress < ctx.circuit_count {
                Status::Contributed
            } else {
                Status::Done
            };
            Ok(Outcome {
                status,
                step: Some(Step::Completed),
                clear_pending_contribution: true,
                clear_temp_contribution_data: true,
                ..Outcome::keep(participant)
            })
        }

        Event::BecomeCurrentContributor => {
            // Ready at enqueue time, or Waiting when a handover makes the
            // participant the new queue head.
            let promotable =
                matches!(participant.status, Status::Ready | Status::Waiting) && ctx.is_queue_head;
            if !promotable {
                return Err(reject());
            }
            Ok(Outcome {
                status: Status::Contributing,
                step: Some(Step::Downloading),
                start_contribution_timer: true,
                ..Outcome::keep(participant)
            })
        }

        Event::PrepareFinalization => {
            let eligible = ctx.ceremony_state == CeremonyState::Closed
                && participant.status == Status::Done
                && ctx.is_coordinator
                && participant.contribution_progress == ctx.circuit_count;
            if !eligible {
                return Err(reject());
            }
            Ok(Outcome {
                status: Status::Finalizing,
                ..Outcome::keep(participant)
            })
        }
    }
}
