//! Encrypted SQLite ballot store with anonymized tallies.
//!
//! A cast ballot lands in two places inside one transaction: an anonymized
//! tally entry (candidate only, no voter identity) and a sealed ballot whose
//! payload is readable only with the store master key. Participation is
//! tracked separately through a [`KeyValueRepository`].

use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub mod ballot;
pub mod ballot_box;
pub mod migration;
pub mod repository;
pub mod tally;

pub use ballot::{BallotPayload, BallotReceipt, BallotStats, HourlyCount, RedactedBallot};
pub use ballot_box::{BallotBox, Candidate};
pub use repository::{participation_key, KeyValueRepository, MemoryRepository, SqliteRepository};
pub use tally::{CandidateTally, TallyEntry};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("crypto error: {0}")]
    CryptoError(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("repository lock poisoned")]
    LockPoisoned,
    #[error("liveness verification is required before casting a ballot")]
    NotVerified,
    #[error("citizen {citizen} has already voted")]
    AlreadyVoted { citizen: String },
}

/// 32-byte key all ballot keys are derived from. Wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        MasterKey(bytes)
    }

    /// Parse a 64-character hex string
    pub fn from_hex(s: &str) -> StoreResult<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut bytes)
            .map_err(|e| StoreError::CryptoError(format!("invalid master key: {}", e)))?;
        Ok(MasterKey(bytes))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

pub struct BallotStore {
    conn: Connection,
    master_key: MasterKey,
}

impl BallotStore {
    pub fn open<P: AsRef<Path>>(path: P, master_key: MasterKey) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::with_connection(conn, master_key)
    }

    /// Store that lives only as long as the process
    pub fn open_in_memory(master_key: MasterKey) -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, master_key)
    }

    fn with_connection(conn: Connection, master_key: MasterKey) -> StoreResult<Self> {
        migration::migrate_to_current(&conn)?;
        Ok(BallotStore { conn, master_key })
    }

    pub fn schema_version(&self) -> StoreResult<i32> {
        migration::get_schema_version(&self.conn)
    }
}
