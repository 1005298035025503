//! Ballot box: one vote per verified citizen

use chrono::Utc;
use serde::{Deserialize, Serialize};
use setu_liveness::Outcome;
use tracing::{info, warn};

use crate::ballot::{BallotPayload, BallotReceipt};
use crate::repository::{participation_key, KeyValueRepository};
use crate::{BallotStore, StoreError, StoreResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: u32,
    pub name: String,
}

pub struct BallotBox<R: KeyValueRepository> {
    store: BallotStore,
    registry: R,
}

impl<R: KeyValueRepository> BallotBox<R> {
    pub fn new(store: BallotStore, registry: R) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &BallotStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut BallotStore {
        &mut self.store
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn has_voted(&self, citizen_id: &str) -> StoreResult<bool> {
        self.registry.contains(&participation_key(citizen_id))
    }

    /// Receipt of the citizen's ballot, if they have voted
    pub fn receipt_for(&self, citizen_id: &str) -> StoreResult<Option<String>> {
        self.registry.get(&participation_key(citizen_id))
    }

    /// Cast a ballot for `candidate`.
    ///
    /// Refused unless `verified` is true and the citizen has not voted.
    /// Participation is claimed before the ballot is written and released
    /// again if the write fails.
    pub fn cast(
        &mut self,
        citizen_id: &str,
        candidate: &Candidate,
        verified: bool,
    ) -> StoreResult<BallotReceipt> {
        if !verified {
            warn!(citizen = citizen_id, "ballot refused: liveness not verified");
            return Err(StoreError::NotVerified);
        }

        let key = participation_key(citizen_id);
        if self.registry.contains(&key)? {
            warn!(citizen = citizen_id, "ballot refused: already voted");
            return Err(StoreError::AlreadyVoted {
                citizen: citizen_id.to_string(),
            });
        }
        self.registry.put(&key, "pending")?;

        let payload = BallotPayload {
            citizen_id: citizen_id.to_string(),
            candidate_id: candidate.id,
            candidate_name: candidate.name.clone(),
            cast_at: Utc::now(),
        };
        let receipt = match self.store.record_vote(&payload) {
            Ok(receipt) => receipt,
            Err(e) => {
                self.registry.remove(&key)?;
                return Err(e);
            }
        };

        self.registry.put(&key, &receipt.receipt)?;
        info!(ballot_id = receipt.ballot_id, "ballot cast");
        Ok(receipt)
    }

    /// Cast using a liveness session outcome as the verification gate
    pub fn cast_with_outcome(
        &mut self,
        citizen_id: &str,
        candidate: &Candidate,
        outcome: &Outcome,
    ) -> StoreResult<BallotReceipt> {
        self.cast(citizen_id, candidate, outcome.is_verified())
    }

    /// Forget a citizen's participation. Their ballot stays in the log.
    pub fn reset_participation(&self, citizen_id: &str) -> StoreResult<bool> {
        self.registry.remove(&participation_key(citizen_id))
    }

    pub fn into_parts(self) -> (BallotStore, R) {
        (self.store, self.registry)
    }
}
