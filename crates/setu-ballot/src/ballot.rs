//! Sealed ballot log
//!
//! Each ballot is encrypted with XChaCha20-Poly1305 under its own key,
//! derived by HKDF-SHA256 from the store master key and a random per-ballot
//! salt. The receipt time is bound as associated data, so moving a ballot to
//! another time slot breaks authentication.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use chrono::{DateTime, Timelike, Utc};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::tally::{from_micros, insert_entry};
use crate::{BallotStore, MasterKey, StoreError, StoreResult};

const SEAL_INFO: &[u8] = b"setu-ballot-seal-v1";
const PREVIEW_CHARS: usize = 50;

/// Nonce counter shared by every store in the process, starting at 1
static NONCE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// 8-byte monotonic counter followed by 16 random bytes
fn next_nonce() -> [u8; 24] {
    let mut nonce = [0u8; 24];
    let ctr = NONCE_COUNTER.fetch_add(1, Ordering::Relaxed);
    nonce[..8].copy_from_slice(&ctr.to_le_bytes());
    OsRng.fill_bytes(&mut nonce[8..]);
    nonce
}

/// Plaintext of a sealed ballot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotPayload {
    pub citizen_id: String,
    pub candidate_id: u32,
    pub candidate_name: String,
    pub cast_at: DateTime<Utc>,
}

/// Handed back to the voter after a ballot is stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotReceipt {
    pub ballot_id: i64,
    /// blake3 of the ciphertext, hex encoded
    pub receipt: String,
    pub received_at: DateTime<Utc>,
}

/// Ballot listing that never exposes the full ciphertext
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedactedBallot {
    pub id: i64,
    pub received_at: DateTime<Utc>,
    pub nonce: String,
    pub ciphertext_preview: String,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HourlyCount {
    pub hour: u32,
    pub votes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BallotStats {
    pub total: u64,
    pub first_received_at: Option<DateTime<Utc>>,
    pub last_received_at: Option<DateTime<Utc>>,
    /// Hours of the day (UTC) with at least one ballot, ascending
    pub votes_per_hour: Vec<HourlyCount>,
}

struct Sealed {
    salt: [u8; 16],
    nonce: [u8; 24],
    ciphertext: Vec<u8>,
}

fn ballot_aead(master_key: &MasterKey, salt: &[u8; 16]) -> StoreResult<XChaCha20Poly1305> {
    let hk = Hkdf::<Sha256>::new(Some(&salt[..]), master_key.as_bytes());
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(SEAL_INFO, &mut okm[..])
        .map_err(|e| StoreError::CryptoError(format!("hkdf expand failed: {:?}", e)))?;
    Ok(XChaCha20Poly1305::new(Key::from_slice(&okm[..])))
}

fn seal(master_key: &MasterKey, plaintext: &[u8], received_at_us: i64) -> StoreResult<Sealed> {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    let nonce = next_nonce();
    let aad = received_at_us.to_le_bytes();

    let ciphertext = ballot_aead(master_key, &salt)?
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|e| StoreError::CryptoError(format!("ballot encrypt failed: {:?}", e)))?;

    Ok(Sealed {
        salt,
        nonce,
        ciphertext,
    })
}

fn unseal(
    master_key: &MasterKey,
    salt: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
    received_at_us: i64,
) -> StoreResult<Zeroizing<Vec<u8>>> {
    let salt: [u8; 16] = salt
        .try_into()
        .map_err(|_| StoreError::CryptoError(format!("bad salt length {}", salt.len())))?;
    if nonce.len() != 24 {
        return Err(StoreError::CryptoError(format!(
            "bad nonce length {}",
            nonce.len()
        )));
    }
    let aad = received_at_us.to_le_bytes();

    let plaintext = ballot_aead(master_key, &salt)?
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| StoreError::CryptoError("ballot decryption failed".into()))?;
    Ok(Zeroizing::new(plaintext))
}

/// Encrypt and insert one ballot on `conn` (which may be a transaction)
fn insert_ballot(
    conn: &Connection,
    master_key: &MasterKey,
    payload: &BallotPayload,
    received_at: DateTime<Utc>,
) -> StoreResult<BallotReceipt> {
    let received_at_us = received_at.timestamp_micros();
    let plaintext = Zeroizing::new(serde_json::to_vec(payload)?);
    let sealed = seal(master_key, &plaintext, received_at_us)?;
    let receipt = blake3::hash(&sealed.ciphertext).to_hex().to_string();

    conn.execute(
        "INSERT INTO ballots (received_at_us, salt, nonce, ciphertext, receipt) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            received_at_us,
            &sealed.salt[..],
            &sealed.nonce[..],
            sealed.ciphertext,
            receipt
        ],
    )?;

    Ok(BallotReceipt {
        ballot_id: conn.last_insert_rowid(),
        receipt,
        received_at: from_micros(received_at_us),
    })
}

impl BallotStore {
    /// Seal `payload` and append it to the ballot log
    pub fn seal_ballot(&self, payload: &BallotPayload) -> StoreResult<BallotReceipt> {
        let receipt = insert_ballot(&self.conn, &self.master_key, payload, Utc::now())?;
        debug!(ballot_id = receipt.ballot_id, "sealed ballot stored");
        Ok(receipt)
    }

    /// Store a sealed ballot and its anonymized tally entry in one
    /// transaction. Neither is written if either fails.
    pub fn record_vote(&mut self, payload: &BallotPayload) -> StoreResult<BallotReceipt> {
        let received_at = Utc::now();
        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        insert_entry(
            &tx,
            payload.candidate_id,
            Some(payload.candidate_name.as_str()),
            received_at,
        )?;
        let receipt = insert_ballot(&tx, &self.master_key, payload, received_at)?;
        tx.commit()?;

        info!(
            ballot_id = receipt.ballot_id,
            candidate_id = payload.candidate_id,
            "vote recorded"
        );
        Ok(receipt)
    }

    /// Decrypt one ballot. Fails on any tampering with the stored row.
    pub fn open_ballot(&self, id: i64) -> StoreResult<BallotPayload> {
        let row: Option<(i64, Vec<u8>, Vec<u8>, Vec<u8>)> = self
            .conn
            .query_row(
                "SELECT received_at_us, salt, nonce, ciphertext FROM ballots WHERE id = ?1",
                params![id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?;
        let (received_at_us, salt, nonce, ciphertext) =
            row.ok_or_else(|| StoreError::NotFound(format!("ballot {}", id)))?;

        let plaintext = unseal(&self.master_key, &salt, &nonce, &ciphertext, received_at_us)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// All ballots with the ciphertext cut to a short hex preview
    pub fn list_redacted(&self) -> StoreResult<Vec<RedactedBallot>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, received_at_us, nonce, ciphertext FROM ballots ORDER BY id")?;
        let rows = stmt.query_map([], |r| {
            let received_at_us: i64 = r.get(1)?;
            let nonce: Vec<u8> = r.get(2)?;
            let ciphertext: Vec<u8> = r.get(3)?;
            Ok(RedactedBallot {
                id: r.get(0)?,
                received_at: from_micros(received_at_us),
                nonce: hex::encode(nonce),
                ciphertext_preview: preview(&ciphertext),
                size: ciphertext.len(),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn stats(&self) -> StoreResult<BallotStats> {
        let mut stmt = self
            .conn
            .prepare("SELECT received_at_us FROM ballots ORDER BY received_at_us, id")?;
        let times = stmt
            .query_map([], |r| r.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut per_hour: BTreeMap<u32, u64> = BTreeMap::new();
        for &us in &times {
            *per_hour.entry(from_micros(us).hour()).or_insert(0) += 1;
        }

        Ok(BallotStats {
            total: times.len() as u64,
            first_received_at: times.first().map(|&us| from_micros(us)),
            last_received_at: times.last().map(|&us| from_micros(us)),
            votes_per_hour: per_hour
                .into_iter()
                .map(|(hour, votes)| HourlyCount { hour, votes })
                .collect(),
        })
    }

    /// Delete every sealed ballot. Returns how many were removed.
    pub fn clear_ballots(&mut self) -> StoreResult<usize> {
        let removed = self.conn.execute("DELETE FROM ballots", [])?;
        info!(removed, "ballot log cleared");
        Ok(removed)
    }
}

fn preview(ciphertext: &[u8]) -> String {
    let mut hex = hex::encode(ciphertext);
    if hex.len() > PREVIEW_CHARS {
        hex.truncate(PREVIEW_CHARS);
        hex.push_str("...");
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> BallotStore {
        BallotStore::open_in_memory(MasterKey::new([42u8; 32])).unwrap()
    }

    fn payload(citizen: &str, candidate_id: u32) -> BallotPayload {
        BallotPayload {
            citizen_id: citizen.to_string(),
            candidate_id,
            candidate_name: format!("Candidate {}", candidate_id),
            cast_at: Utc::now(),
        }
    }

    #[test]
    fn test_seal_and_open() {
        let s = store();
        let p = payload("CIT-001", 3);
        let receipt = s.seal_ballot(&p).unwrap();
        assert_eq!(receipt.receipt.len(), 64);
        assert_eq!(s.open_ballot(receipt.ballot_id).unwrap(), p);
    }

    #[test]
    fn test_wrong_master_key_cannot_open() {
        let tf = tempfile::NamedTempFile::new().unwrap();
        let id = {
            let s = BallotStore::open(tf.path(), MasterKey::new([1u8; 32])).unwrap();
            s.seal_ballot(&payload("CIT-002", 1)).unwrap().ballot_id
        };
        let other = BallotStore::open(tf.path(), MasterKey::new([2u8; 32])).unwrap();
        assert!(matches!(
            other.open_ballot(id),
            Err(StoreError::CryptoError(_))
        ));
    }

    #[test]
    fn test_missing_ballot() {
        assert!(matches!(store().open_ballot(99), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_nonces_are_unique() {
        let a = next_nonce();
        let b = next_nonce();
        assert_ne!(a, b);
        let ca = u64::from_le_bytes(a[..8].try_into().unwrap());
        let cb = u64::from_le_bytes(b[..8].try_into().unwrap());
        assert!(cb > ca);
    }

    #[test]
    fn test_preview_truncates() {
        let long = preview(&[0xab; 40]);
        assert_eq!(long.len(), PREVIEW_CHARS + 3);
        assert!(long.ends_with("..."));
        assert_eq!(preview(&[0x01, 0x02]), "0102");
    }

    #[test]
    fn test_record_vote_updates_tally_and_log() {
        let mut s = store();
        s.record_vote(&payload("CIT-003", 2)).unwrap();
        s.record_vote(&payload("CIT-004", 2)).unwrap();

        assert_eq!(s.tallies().unwrap()[0].count, 2);
        assert_eq!(s.list_redacted().unwrap().len(), 2);
        // the anonymized side never sees the citizen
        assert!(s.entries().unwrap().iter().all(|e| e.candidate_id == 2));
    }

    #[test]
    fn test_stats_empty_and_filled() {
        let mut s = store();
        let empty = s.stats().unwrap();
        assert_eq!(empty.total, 0);
        assert!(empty.first_received_at.is_none());
        assert!(empty.votes_per_hour.is_empty());

        s.record_vote(&payload("CIT-005", 1)).unwrap();
        s.record_vote(&payload("CIT-006", 1)).unwrap();
        let stats = s.stats().unwrap();
        assert_eq!(stats.total, 2);
        assert!(stats.first_received_at <= stats.last_received_at);
        assert_eq!(
            stats.votes_per_hour.iter().map(|h| h.votes).sum::<u64>(),
            2
        );
    }

    #[test]
    fn test_clear_ballots() {
        let mut s = store();
        s.seal_ballot(&payload("CIT-007", 1)).unwrap();
        assert_eq!(s.clear_ballots().unwrap(), 1);
        assert_eq!(s.stats().unwrap().total, 0);
    }
}
