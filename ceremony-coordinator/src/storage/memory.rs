//! An in-memory repository.
//!
//! Transactions run against a cloned snapshot under a mutex: every
//! transaction is trivially serializable, commits by swapping the snapshot
//! back in, and rolls back by dropping it.

use super::{Repository, RepositoryTx, StorageError};
use crate::objects::{Ceremony, CeremonyState, Circuit, Contribution, Participant};
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Default)]
struct Store {
    ceremonies: BTreeMap<u64, Ceremony>,
    circuits: BTreeMap<u64, Circuit>,
    // Keyed by (ceremony id, user id).
    participants: BTreeMap<(u64, String), Participant>,
    contributions: BTreeMap<u64, Contribution>,
    next_ceremony_id: u64,
    next_circuit_id: u64,
    next_contribution_id: u64,
}

#[derive(Debug, Default)]
pub struct InMemoryRepository {
    store: Mutex<Store>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Repository for InMemoryRepository {
    fn with_transaction<T, E>(
        &self,
        f: impl FnOnce(&mut dyn RepositoryTx) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        let mut store = self
            .store
            .lock()
            .map_err(|_| StorageError::Backend(anyhow::anyhow!("repository lock poisoned")))?;
        let mut snapshot = store.clone();
        let value = f(&mut snapshot)?;
        *store = snapshot;
        Ok(value)
    }
}

impl RepositoryTx for Store {
    fn ceremony(&self, id: u64) -> Result<Ceremony, StorageError> {
        self.ceremonies
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound("ceremony"))
    }

    fn ceremonies(&self) -> Result<Vec<Ceremony>, StorageError> {
        Ok(self.ceremonies.values().cloned().collect())
    }

    fn ceremonies_by_state(&self, state: CeremonyState) -> Result<Vec<Ceremony>, StorageError> {
        Ok(self
            .ceremonies
            .values()
            .filter(|c| c.state == state)
            .cloned()
            .collect())
    }

    fn circuits(&self, ceremony_id: u64) -> Result<Vec<Circuit>, StorageError> {
        let mut circuits: Vec<Circuit> = self
            .circuits
            .values()
            .filter(|c| c.ceremony_id == ceremony_id)
            .cloned()
            .collect();
        circuits.sort_by_key(|c| c.sequence_position);
        Ok(circuits)
    }

    fn circuit(&self, ceremony_id: u64, circuit_id: u64) -> Result<Circuit, StorageError> {
        self.circuits
            .get(&circuit_id)
            .filter(|c| c.ceremony_id == ceremony_id)
            .cloned()
            .ok_or(StorageError::NotFound("circuit"))
    }

    fn participant(&self, user_id: &str, ceremony_id: u64) -> Result<Participant, StorageError> {
        self.participants
            .get(&(ceremony_id, user_id.to_string()))
            .cloned()
            .ok_or(StorageError::NotFound("participant"))
    }

    fn participants(&self, ceremony_id: u64) -> Result<Vec<Participant>, StorageError> {
        Ok(self
            .participants
            .iter()
            .filter(|((cid, _), _)| *cid == ceremony_id)
            .map(|(_, p)| p.clone())
            .collect())
    }

    fn contribution(
        &self,
        ceremony_id: u64,
        circuit_id: u64,
        zkey_index: &str,
    ) -> Result<Contribution, StorageError> {
        self.contributions
            .values()
            .find(|c| {
                c.ceremony_id == ceremony_id
                    && c.circuit_id == circuit_id
                    && c.zkey_index == zkey_index
            })
            .cloned()
            .ok_or(StorageError::NotFound("contribution"))
    }

    fn circuit_contributions(
        &self,
        ceremony_id: u64,
        circuit_id: u64,
    ) -> Result<Vec<Contribution>, StorageError> {
        Ok(self
            .contributions
            .values()
            .filter(|c| c.ceremony_id == ceremony_id && c.circuit_id == circuit_id)
            .cloned()
            .collect())
    }

    fn insert_ceremony(&mut self, mut ceremony: Ceremony) -> Result<u64, StorageError> {
        self.next_ceremony_id += 1;
        ceremony.id = self.next_ceremony_id;
        let id = ceremony.id;
        self.ceremonies.insert(id, ceremony);
        Ok(id)
    }

    fn update_ceremony(&mut self, ceremony: Ceremony) -> Result<(), StorageError> {
        match self.ceremonies.contains_key(&ceremony.id) {
            true => {
                self.ceremonies.insert(ceremony.id, ceremony);
                Ok(())
            }
            false => Err(StorageError::NotFound("ceremony")),
        }
    }

    fn insert_circuit(&mut self, mut circuit: Circuit) -> Result<u64, StorageError> {
        self.next_circuit_id += 1;
        circuit.id = self.next_circuit_id;
        let id = circuit.id;
        self.circuits.insert(id, circuit);
        Ok(id)
    }

    fn update_circuit(&mut self, circuit: Circuit) -> Result<(), StorageError> {
        match self.circuits.contains_key(&circuit.id) {
            true => {
                self.circuits.insert(circuit.id, circuit);
                Ok(())
            }
            false => Err(StorageError::NotFound("circuit")),
        }
    }

    fn upsert_participant(&mut self, participant: Participant) -> Result<(), StorageError> {
        self.participants.insert(
            (participant.ceremony_id, participant.user_id.clone()),
            participant,
        );
        Ok(())
    }

    fn insert_contribution(&mut self, mut contribution: Contribution) -> Result<u64, StorageError> {
        let taken = self.contributions.values().any(|c| {
            c.ceremony_id == contribution.ceremony_id
                && c.circuit_id == contribution.circuit_id
                && c.zkey_index == contribution.zkey_index
        });
        if taken {
            return Err(StorageError::Conflict);
        }
        self.next_contribution_id += 1;
        contribution.id = self.next_contribution_id;
        let id = contribution.id;
        self.contributions.insert(id, contribution);
        Ok(id)
    }

    fn update_contribution(&mut self, contribution: Contribution) -> Result<(), StorageError> {
        match self.contributions.contains_key(&contribution.id) {
            true => {
                self.contributions.insert(contribution.id, contribution);
                Ok(())
            }
            false => Err(StorageError::NotFound("contribution")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{CeremonyType, TimeoutMechanism};
    use std::collections::BTreeSet;

    fn ceremony() -> Ceremony {
        Ceremony {
            id: 0,
            prefix: "p1".to_string(),
            title: "test".to_string(),
            description: String::new(),
            state: CeremonyState::Scheduled,
            kind: CeremonyType::Phase2,
            coordinator_id: "coord".to_string(),
            start_date: 0,
            end_date: 1,
            timeout_mechanism_type: TimeoutMechanism::Fixed,
            penalty: 60,
            fixed_timeout_window_secs: 3_600,
            auth_providers: BTreeSet::new(),
        }
    }

    #[test]
    fn commits_on_ok() {
        let repo = InMemoryRepository::new();
        let id = repo
            .with_transaction(|tx| tx.insert_ceremony(ceremony()))
            .unwrap();
        let loaded = repo.with_transaction(|tx| tx.ceremony(id)).unwrap();
        assert_eq!(loaded.prefix, "p1");
    }

    #[test]
    fn rolls_back_on_err() {
        let repo = InMemoryRepository::new();
        let result = repo.with_transaction(|tx| {
            tx.insert_ceremony(ceremony())?;
            Err::<(), StorageError>(StorageError::Conflict)
        });
        assert!(matches!(result, Err(StorageError::Conflict)));
        let all = repo.with_transaction(|tx| tx.ceremonies()).unwrap();
        assert!(all.is_empty());
    }

    #[test]
    fn contribution_key_is_unique() {
        let repo = InMemoryRepository::new();
        let result = repo.with_transaction(|tx| {
            let contribution = Contribution {
                id: 0,
                participant_user_id: "u1".to_string(),
                ceremony_id: 1,
                circuit_id: 1,
                zkey_index: "00001".to_string(),
                contribution_computation_time: 0,
                verification_computation_time: 0,
                files: Default::default(),
                verification_software: crate::objects::VerificationSoftware {
                    name: "verifier".to_string(),
                    version: "0.1.0".to_string(),
                    commit_hash: "deadbeef".to_string(),
                },
                valid: true,
                beacon: None,
            };
            tx.insert_contribution(contribution.clone())?;
            tx.insert_contribution(contribution)
        });
        assert!(matches!(result, Err(StorageError::Conflict)));
    }
}
