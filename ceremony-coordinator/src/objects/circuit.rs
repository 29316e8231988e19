use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by [`WaitingQueue`] mutations.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum QueueError {
    #[error("participant {0} is not the current contributor")]
    NotCurrentContributor(String),
}

/// How contributions to a circuit are verified.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationMechanism {
    /// In-process verification on the coordinator host.
    Local,
    /// Verification dispatched to a remote worker.
    Remote,
}

/// Sizes of the artifacts a contributor must handle for this circuit, in
/// bytes. Advertised to clients so they can show progress bars and reject
/// undersized uploads early.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSizes {
    pub pot_bytes: u64,
    pub initial_zkey_bytes: u64,
    pub zkey_bytes: u64,
}

/// Running means over the valid contributions of a circuit, in milliseconds.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvgTimings {
    pub contribution_computation: u64,
    pub full_contribution: u64,
    pub verify_compute: u64,
}

impl AvgTimings {
    /// Folds one valid contribution's timings into the running means,
    /// weighting by the number of valid contributions recorded so far
    /// (before this one).
    pub fn fold(&mut self, prior_count: u64, computation: u64, full: u64, verify: u64) {
        let mean = |avg: u64, sample: u64| (avg * prior_count + sample) / (prior_count + 1);
        self.contribution_computation = mean(self.contribution_computation, computation);
        self.full_contribution = mean(self.full_contribution, full);
        self.verify_compute = mean(self.verify_compute, verify);
    }
}

/// The per-circuit FIFO of participants waiting to contribute, plus the
/// circuit's contribution counters.
///
/// Invariants: `current_contributor`, when set, equals `contributors[0]`;
/// every user id appears at most once.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingQueue {
    contributors: Vec<String>,
    current_contributor: Option<String>,
    pub completed_contributions: u64,
    pub failed_contributions: u64,
}

impl WaitingQueue {
    /// Appends the participant if absent. If the queue was empty, the
    /// participant immediately becomes the current contributor.
    ///
    /// Returns `true` if the participant is now the current contributor.
    pub fn enqueue(&mut self, user_id: &str) -> bool {
        if !self.contributors.iter().any(|c| c == user_id) {
            self.contributors.push(user_id.to_string());
        }
        if self.current_contributor.is_none() {
            self.current_contributor = Some(self.contributors[0].clone());
        }
        self.current_contributor.as_deref() == Some(user_id)
    }

    /// Removes the current contributor from the front of the queue. The new
    /// head, if any, becomes the current contributor and is returned.
    ///
    /// Fails if `user_id` is not the current contributor.
    pub fn dequeue(&mut self, user_id: &str) -> Result<Option<String>, QueueError> {
        if self.current_contributor.as_deref() != Some(user_id) {
            return Err(QueueError::NotCurrentContributor(user_id.to_string()));
        }
        self.contributors.remove(0);
        self.current_contributor = self.contributors.first().cloned();
        Ok(self.current_contributor.clone())
    }

    /// Unconditional removal from any position, used on timeout. If the
    /// removed participant was the current contributor, the new head (if
    /// any) is promoted and returned in the same way as [`Self::dequeue`].
    pub fn remove(&mut self, user_id: &str) -> Option<String> {
        let was_current = self.current_contributor.as_deref() == Some(user_id);
        self.contributors.retain(|c| c != user_id);
        if was_current {
            self.current_contributor = self.contributors.first().cloned();
            return self.current_contributor.clone();
        }
        None
    }

    /// The current contributor and the queue length.
    pub fn peek(&self) -> (Option<&str>, usize) {
        (self.current_contributor.as_deref(), self.contributors.len())
    }

    pub fn current_contributor(&self) -> Option<&str> {
        self.current_contributor.as_deref()
    }

    pub fn contributors(&self) -> &[String] {
        &self.contributors
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.contributors.iter().any(|c| c == user_id)
    }
}

/// One zero-knowledge circuit within a ceremony; the unit of serialization
/// for contributions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Circuit {
    pub id: u64,
    pub ceremony_id: u64,
    /// Slug used in blob-store paths for this circuit's artifacts.
    pub prefix: String,
    pub name: String,
    /// 1-based position of this circuit in the ceremony's contribution
    /// order.
    pub sequence_position: usize,
    pub verification_mechanism: VerificationMechanism,
    /// Handle of the remote verification worker, set only when
    /// `verification_mechanism` is `Remote`.
    pub worker_handle: Option<String>,
    /// Filename of the powers-of-tau file this circuit verifies against,
    /// stored under `pot/` in the ceremony bucket.
    pub pot_filename: String,
    /// Bootstrap script filename for the remote worker, stored under
    /// `circuits/<name>/`.
    pub bootstrap_script_filename: Option<String>,
    pub artifact_sizes: ArtifactSizes,
    /// Tolerance over the average full-contribution time before a dynamic
    /// timeout triggers, as a percentage (100 = twice the average).
    pub dynamic_threshold_pct: u64,
    pub avg_timings: AvgTimings,
    pub waiting_queue: WaitingQueue,
}
