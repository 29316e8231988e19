use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The lifecycle state of a ceremony.
///
/// Transitions are monotone through the enum, except that a ceremony may be
/// paused from `Opened` and resumed back to `Opened`. Once `Finalized` a
/// ceremony is immutable.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CeremonyState {
    Scheduled,
    Opened,
    Paused,
    Closed,
    Finalized,
}

/// Which phase of the setup a ceremony coordinates.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CeremonyType {
    Phase1,
    Phase2,
}

/// How contributor time budgets are computed for this ceremony.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeoutMechanism {
    /// Budget derived from the circuit's running average contribution time.
    Dynamic,
    /// Budget fixed by [`Ceremony::fixed_timeout_window_secs`].
    Fixed,
}

/// A coordination unit: one trusted-setup ceremony over an ordered set of
/// circuits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ceremony {
    pub id: u64,
    /// Short slug, used as the blob-store namespace for this ceremony.
    pub prefix: String,
    pub title: String,
    pub description: String,
    pub state: CeremonyState,
    #[serde(rename = "type")]
    pub kind: CeremonyType,
    pub coordinator_id: String,
    /// Epoch milliseconds.
    pub start_date: i64,
    /// Epoch milliseconds. Always strictly greater than `start_date`.
    pub end_date: i64,
    pub timeout_mechanism_type: TimeoutMechanism,
    /// Duration of the ban applied to a timed-out contributor, in seconds.
    pub penalty: i64,
    /// Contribution time budget when `timeout_mechanism_type` is `Fixed`,
    /// in seconds.
    pub fixed_timeout_window_secs: i64,
    /// Authentication providers accepted by this ceremony. The reputation
    /// predicate itself is enforced by the authentication layer.
    pub auth_providers: BTreeSet<String>,
}

impl Ceremony {
    /// Returns `true` if the ceremony currently accepts contributions.
    pub fn is_open(&self) -> bool {
        self.state == CeremonyState::Opened
    }

    /// Returns `true` if the given user is the ceremony's coordinator.
    pub fn is_coordinator(&self, user_id: &str) -> bool {
        self.coordinator_id == user_id
    }
}
