//! Anonymized tallies
//!
//! Entries carry the candidate and a timestamp, never the voter.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::{BallotStore, StoreResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateTally {
    pub candidate_id: u32,
    pub candidate_name: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyEntry {
    pub id: i64,
    pub candidate_id: u32,
    pub candidate_name: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl BallotStore {
    /// Record one anonymized vote and bump the candidate's tally atomically.
    /// A tally keeps the first non-empty candidate name it sees.
    pub fn append_anonymized_entry(
        &mut self,
        candidate_id: u32,
        candidate_name: Option<&str>,
        recorded_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        insert_entry(&tx, candidate_id, candidate_name, recorded_at)?;
        tx.commit()?;
        Ok(())
    }

    /// Per-candidate counts, ordered by candidate id
    pub fn tallies(&self) -> StoreResult<Vec<CandidateTally>> {
        let mut stmt = self.conn.prepare(
            "SELECT candidate_id, candidate_name, count FROM tallies ORDER BY candidate_id",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(CandidateTally {
                candidate_id: r.get(0)?,
                candidate_name: r.get(1)?,
                count: r.get::<_, i64>(2)? as u64,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Anonymized entries in insertion order
    pub fn entries(&self) -> StoreResult<Vec<TallyEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, candidate_id, candidate_name, recorded_at_us FROM tally_entries ORDER BY id",
        )?;
        let rows = stmt.query_map([], |r| {
            let recorded_at_us: i64 = r.get(3)?;
            Ok(TallyEntry {
                id: r.get(0)?,
                candidate_id: r.get(1)?,
                candidate_name: r.get(2)?,
                recorded_at: from_micros(recorded_at_us),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Drop every tally and entry in one transaction
    pub fn clear_all(&mut self) -> StoreResult<()> {
        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM tallies", [])?;
        tx.execute("DELETE FROM tally_entries", [])?;
        tx.commit()?;
        Ok(())
    }
}

pub(crate) fn insert_entry(
    conn: &Connection,
    candidate_id: u32,
    candidate_name: Option<&str>,
    recorded_at: DateTime<Utc>,
) -> StoreResult<()> {
    let name = candidate_name.filter(|n| !n.is_empty());
    conn.execute(
        "INSERT INTO tally_entries (candidate_id, candidate_name, recorded_at_us) VALUES (?1, ?2, ?3)",
        params![candidate_id, name, recorded_at.timestamp_micros()],
    )?;
    conn.execute(
        "INSERT INTO tallies (candidate_id, candidate_name, count) VALUES (?1, ?2, 1)
         ON CONFLICT(candidate_id) DO UPDATE SET
            count = count + 1,
            candidate_name = CASE
                WHEN tallies.candidate_name = '' THEN excluded.candidate_name
                ELSE tallies.candidate_name
            END",
        params![candidate_id, name.unwrap_or("")],
    )?;
    Ok(())
}

/// Microseconds since the epoch to UTC, clamping out-of-range values to the epoch
pub(crate) fn from_micros(us: i64) -> DateTime<Utc> {
    let secs = us.div_euclid(1_000_000);
    let nanos = (us.rem_euclid(1_000_000) * 1_000) as u32;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .unwrap_or_default()
}
