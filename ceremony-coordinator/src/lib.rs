//! Coordination server for zero-knowledge trusted-setup ceremonies.
//!
//! Many mutually-distrusting contributors take turns transforming a
//! sequence of proving-key files, each building on the previous
//! contributor's output; a coordinator later finalizes the ceremony. The
//! cryptographic artifacts are produced and verified by external tooling;
//! this crate is the server that decides who contributes next, tracks
//! per-circuit progress, enforces time budgets, records verified
//! contributions, and drives externally-hosted verification workers.

pub mod coordinator;
pub mod environment;
pub mod lifecycle;
pub mod objects;
pub mod rest;
pub mod s3;
pub mod state_machine;
pub mod storage;
pub mod upload;
pub mod verification;
pub mod workers;

pub use coordinator::{Coordinator, CoordinatorError};
pub use environment::Environment;
pub use lifecycle::CeremonyLifecycle;
pub use upload::UploadSessionManager;
pub use verification::{ContributionVerifier, LocalVerifier, Verdict};
pub use workers::{CommandStatus, VerificationWorker};
