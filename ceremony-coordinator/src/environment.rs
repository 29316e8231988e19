//! Typed runtime configuration.
//!
//! Every subsystem receives this record at construction; nothing reads
//! process environment variables after startup.

use crate::objects::VerificationSoftware;
use std::env;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct Environment {
    /// Appended to a ceremony's prefix to form its bucket name.
    pub bucket_postfix: String,
    pub presigned_url_ttl: Duration,
    /// Stamped into every contribution record.
    pub verification_software: VerificationSoftware,
    /// Cadence of the participant reconciliation loop.
    pub coordinator_tick: Duration,
    /// Cadence of the ceremony open/close sweeps.
    pub ceremony_tick: Duration,
    /// Cadence of remote worker command polling.
    pub worker_poll_interval: Duration,
    /// Wait before the first remote-worker liveness probe.
    pub worker_startup_wait: Duration,
    /// Liveness probes after the initial wait before giving up.
    pub worker_startup_retries: u32,
    /// Secret handed to the authentication collaborator.
    pub jwt_secret: String,
    /// Control-plane endpoint of the remote verification worker fleet.
    pub worker_control_url: Option<Url>,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            bucket_postfix: "-ph2-ceremony".to_string(),
            presigned_url_ttl: Duration::from_secs(900),
            verification_software: VerificationSoftware {
                name: "snarkjs".to_string(),
                version: "0.7.0".to_string(),
                commit_hash: String::new(),
            },
            coordinator_tick: Duration::from_secs(30),
            ceremony_tick: Duration::from_secs(600),
            worker_poll_interval: Duration::from_secs(60),
            worker_startup_wait: Duration::from_secs(60),
            worker_startup_retries: 5,
            jwt_secret: String::new(),
            worker_control_url: None,
        }
    }
}

fn secs(var: &str, default: Duration) -> Duration {
    env::var(var)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

impl Environment {
    /// Builds the configuration from process environment variables,
    /// falling back to defaults for everything optional.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bucket_postfix: env::var("BUCKET_POSTFIX").unwrap_or(defaults.bucket_postfix),
            presigned_url_ttl: secs("PRESIGNED_URL_TTL_SECONDS", defaults.presigned_url_ttl),
            verification_software: VerificationSoftware {
                name: env::var("CUSTOM_CONTRIBUTION_VERIFICATION_SOFTWARE_NAME")
                    .unwrap_or(defaults.verification_software.name),
                version: env::var("CUSTOM_CONTRIBUTION_VERIFICATION_SOFTWARE_VERSION")
                    .unwrap_or(defaults.verification_software.version),
                commit_hash: env::var("CUSTOM_CONTRIBUTION_VERIFICATION_SOFTWARE_COMMIT_HASH")
                    .unwrap_or(defaults.verification_software.commit_hash),
            },
            coordinator_tick: secs("COORDINATOR_TICK_SECONDS", defaults.coordinator_tick),
            ceremony_tick: secs("CEREMONY_TICK_SECONDS", defaults.ceremony_tick),
            worker_poll_interval: secs("WORKER_POLL_INTERVAL_SECONDS", defaults.worker_poll_interval),
            worker_startup_wait: secs("WORKER_STARTUP_WAIT_SECONDS", defaults.worker_startup_wait),
            worker_startup_retries: env::var("WORKER_STARTUP_RETRIES")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.worker_startup_retries),
            jwt_secret: env::var("JWT_SECRET").unwrap_or_default(),
            worker_control_url: env::var("WORKER_CONTROL_URL")
                .ok()
                .and_then(|raw| Url::parse(&raw).ok()),
        }
    }
}
