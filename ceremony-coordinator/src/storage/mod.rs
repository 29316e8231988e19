//! Transactional persistence of ceremonies, circuits, participants and
//! contributions.
//!
//! The coordinator is forbidden from caching state outside the repository:
//! every decision is made on reads performed inside the same transaction
//! that persists its effects.

mod memory;

pub use memory::InMemoryRepository;

use crate::objects::{Ceremony, CeremonyState, Circuit, Contribution, Participant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("concurrent modification conflict")]
    Conflict,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// A transactional view over the persisted tables.
///
/// Reads see a consistent snapshot; writes become visible to later reads in
/// the same transaction and are atomically committed or rolled back as a
/// whole.
pub trait RepositoryTx {
    fn ceremony(&self, id: u64) -> Result<Ceremony, StorageError>;
    fn ceremonies(&self) -> Result<Vec<Ceremony>, StorageError>;
    fn ceremonies_by_state(&self, state: CeremonyState) -> Result<Vec<Ceremony>, StorageError>;
    /// Circuits of a ceremony, ordered by sequence position.
    fn circuits(&self, ceremony_id: u64) -> Result<Vec<Circuit>, StorageError>;
    fn circuit(&self, ceremony_id: u64, circuit_id: u64) -> Result<Circuit, StorageError>;
    fn participant(&self, user_id: &str, ceremony_id: u64) -> Result<Participant, StorageError>;
    fn participants(&self, ceremony_id: u64) -> Result<Vec<Participant>, StorageError>;
    fn contribution(
        &self,
        ceremony_id: u64,
        circuit_id: u64,
        zkey_index: &str,
    ) -> Result<Contribution, StorageError>;
    fn circuit_contributions(
        &self,
        ceremony_id: u64,
        circuit_id: u64,
    ) -> Result<Vec<Contribution>, StorageError>;

    /// Inserts a ceremony, assigning and returning its id.
    fn insert_ceremony(&mut self, ceremony: Ceremony) -> Result<u64, StorageError>;
    fn update_ceremony(&mut self, ceremony: Ceremony) -> Result<(), StorageError>;
    /// Inserts a circuit, assigning and returning its id.
    fn insert_circuit(&mut self, circuit: Circuit) -> Result<u64, StorageError>;
    fn update_circuit(&mut self, circuit: Circuit) -> Result<(), StorageError>;
    fn upsert_participant(&mut self, participant: Participant) -> Result<(), StorageError>;
    /// Inserts a contribution, assigning and returning its id. The logical
    /// key `(ceremony, circuit, zkeyIndex)` must be free, otherwise
    /// [`StorageError::Conflict`].
    fn insert_contribution(&mut self, contribution: Contribution) -> Result<u64, StorageError>;
    fn update_contribution(&mut self, contribution: Contribution) -> Result<(), StorageError>;
}

/// The persistence contract of the coordinator.
pub trait Repository: Send + Sync + 'static {
    /// Runs `f` against a serializable transactional view. The transaction
    /// commits when `f` returns `Ok` and rolls every write back otherwise;
    /// the closure's error is returned unchanged.
    fn with_transaction<T, E>(
        &self,
        f: impl FnOnce(&mut dyn RepositoryTx) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StorageError>,
        Self: Sized;
}
