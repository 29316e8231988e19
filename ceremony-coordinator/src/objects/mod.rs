//! The persisted data model of the ceremony coordinator: ceremonies,
//! circuits, participants and contributions.

pub mod ceremony;
pub mod circuit;
pub mod contribution;
pub mod participant;

pub use ceremony::{Ceremony, CeremonyState, CeremonyType, TimeoutMechanism};
pub use circuit::{ArtifactSizes, AvgTimings, Circuit, VerificationMechanism, WaitingQueue};
pub use contribution::{
    format_zkey_index, Beacon, Contribution, ContributionFiles, VerificationSoftware,
    FINAL_ZKEY_INDEX,
};
pub use participant::{
    ChunkTag, ContributionStep, Participant, ParticipantStatus, PendingContribution,
    TempContributionData, TimeoutEntry, TimeoutKind,
};
