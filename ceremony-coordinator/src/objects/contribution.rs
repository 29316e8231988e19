use serde::{Deserialize, Serialize};

/// Sentinel zkey index of the coordinator's finalization contribution.
pub const FINAL_ZKEY_INDEX: &str = "final";

/// Formats a contribution number as the fixed-width zkey index used in
/// storage paths: `1` becomes `"00001"`. Index `0` is the genesis zkey.
pub fn format_zkey_index(index: u64) -> String {
    format!("{:05}", index)
}

/// Paths and digests of the artifacts produced by one contribution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributionFiles {
    pub transcript_path: Option<String>,
    pub last_zkey_path: Option<String>,
    pub transcript_hash: Option<String>,
    pub last_zkey_hash: Option<String>,
}

/// Descriptor of the software that verified a contribution, stamped into
/// the record for auditability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationSoftware {
    pub name: String,
    pub version: String,
    pub commit_hash: String,
}

/// The public random value a coordinator commits to at finalization time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Beacon {
    pub value: String,
    pub hash: String,
}

/// The immutable record of one attempted contribution by one participant to
/// one circuit. Effectively keyed by `(ceremony_id, circuit_id, zkey_index)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contribution {
    pub id: u64,
    pub participant_user_id: String,
    pub ceremony_id: u64,
    pub circuit_id: u64,
    /// Fixed-width numeric string (`"00001"`), or [`FINAL_ZKEY_INDEX`] for
    /// the coordinator's sealing contribution.
    pub zkey_index: String,
    /// Milliseconds.
    pub contribution_computation_time: u64,
    /// Milliseconds.
    pub verification_computation_time: u64,
    pub files: ContributionFiles,
    pub verification_software: VerificationSoftware,
    pub valid: bool,
    /// Set only on the coordinator's finalization record.
    pub beacon: Option<Beacon>,
}

impl Contribution {
    pub fn is_final(&self) -> bool {
        self.zkey_index == FINAL_ZKEY_INDEX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zkey_index_is_fixed_width() {
        assert_eq!(format_zkey_index(0), "00000");
        assert_eq!(format_zkey_index(1), "00001");
        assert_eq!(format_zkey_index(12345), "12345");
        assert_eq!(format_zkey_index(123456), "123456");
    }
}
