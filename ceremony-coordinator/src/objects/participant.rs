use serde::{Deserialize, Serialize};

/// Where a participant stands in the ceremony as a whole.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantStatus {
    /// Admitted, queued behind another contributor.
    Waiting,
    /// Cleared to be enqueued on the next circuit.
    Ready,
    /// Current contributor of exactly one circuit.
    Contributing,
    /// Finished a circuit, not yet progressed to the next one.
    Contributed,
    /// Contributed to every circuit of the ceremony.
    Done,
    /// Evicted for exceeding the contribution time budget.
    Timedout,
    /// Re-admitted after an expired timeout, pending resumption.
    Exhumed,
    /// Coordinator producing the final contributions of a closed ceremony.
    Finalizing,
    /// Coordinator whose final contributions are all recorded and sealed.
    Finalized,
}

/// Where a contributing participant stands within the current circuit.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContributionStep {
    Downloading,
    Computing,
    Uploading,
    Verifying,
    Completed,
}

/// Why a timeout was applied to a participant.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeoutKind {
    /// The contributor blocked a circuit's queue past its time budget.
    BlockingContribution,
    /// The verification of the contribution never came back.
    BlockingVerification,
}

/// A ban window attached to a participant. Active while `end_date >= now`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutEntry {
    pub start_date: i64,
    pub end_date: i64,
    pub kind: TimeoutKind,
}

/// The in-progress contribution fragment: hash and computation time posted
/// by the contributor before verification assigns a contribution id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingContribution {
    pub hash: String,
    /// Milliseconds spent computing the new zkey, self-reported.
    pub computation_time: u64,
}

/// One uploaded chunk of a multipart upload.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChunkTag {
    #[serde(rename = "ETag")]
    pub etag: String,
    #[serde(rename = "PartNumber")]
    pub part_number: u32,
}

/// A participant's in-flight multipart upload, so an interrupted upload can
/// be resumed. Present only while `contribution_step` is `Uploading`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TempContributionData {
    pub upload_id: String,
    pub chunks: Vec<ChunkTag>,
}

impl TempContributionData {
    pub fn new(upload_id: String) -> Self {
        Self {
            upload_id,
            chunks: Vec::new(),
        }
    }

    /// Records a chunk tag, idempotent on the part number (last write
    /// wins).
    pub fn record_chunk(&mut self, chunk: ChunkTag) {
        match self
            .chunks
            .iter_mut()
            .find(|c| c.part_number == chunk.part_number)
        {
            Some(existing) => *existing = chunk,
            None => self.chunks.push(chunk),
        }
    }

    /// Chunks in part-number-ascending order, as the blob store's complete
    /// call requires.
    pub fn sorted_chunks(&self) -> Vec<ChunkTag> {
        let mut chunks = self.chunks.clone();
        chunks.sort_by_key(|c| c.part_number);
        chunks
    }
}

/// A `(user, ceremony)` pair and everything the coordinator tracks about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    pub ceremony_id: u64,
    /// 1-based sequence position of the circuit currently being contributed
    /// to; 0 before the first `progressToNextCircuit`.
    pub contribution_progress: usize,
    pub status: ParticipantStatus,
    /// `None` outside of an active contribution round.
    pub contribution_step: Option<ContributionStep>,
    /// Ids of the contribution records for circuits already attempted.
    pub contributions: Vec<u64>,
    /// See [`PendingContribution`]; either empty or set, never more than
    /// one.
    pub pending_contribution: Option<PendingContribution>,
    pub contribution_started_at: Option<i64>,
    pub verification_started_at: Option<i64>,
    pub temp_contribution_data: Option<TempContributionData>,
    pub timeouts: Vec<TimeoutEntry>,
}

impl Participant {
    /// A freshly admitted participant, waiting to be coordinated.
    pub fn new(user_id: &str, ceremony_id: u64) -> Self {
        Self {
            user_id: user_id.to_string(),
            ceremony_id,
            contribution_progress: 0,
            status: ParticipantStatus::Waiting,
            contribution_step: None,
            contributions: Vec::new(),
            pending_contribution: None,
            contribution_started_at: None,
            verification_started_at: None,
            temp_contribution_data: None,
            timeouts: Vec::new(),
        }
    }

    /// Returns `true` if any attached timeout is still running at `now`.
    pub fn has_active_timeout(&self, now: i64) -> bool {
        self.timeouts.iter().any(|t| t.end_date >= now)
    }
}
