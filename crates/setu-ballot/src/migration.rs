//! Schema versioning for the ballot database
//!
//! Every table is created by a numbered migration; the version reached is
//! recorded in the `metadata` table.

use crate::{StoreError, StoreResult};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

pub const CURRENT_SCHEMA_VERSION: i32 = 2;

pub fn init_metadata_table(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;
    Ok(())
}

/// Recorded schema version, 0 for an empty database
pub fn get_schema_version(conn: &Connection) -> StoreResult<i32> {
    let version: Option<String> = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = 'schema_version'",
            [],
            |r| r.get(0),
        )
        .optional()?;

    match version {
        Some(v) => v
            .parse::<i32>()
            .map_err(|_| StoreError::Schema(format!("invalid schema version {:?}", v))),
        None => Ok(0),
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> StoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
        params![version.to_string()],
    )?;
    Ok(())
}

pub fn needs_migration(conn: &Connection) -> StoreResult<bool> {
    init_metadata_table(conn)?;
    Ok(get_schema_version(conn)? < CURRENT_SCHEMA_VERSION)
}

pub fn migrate_to_current(conn: &Connection) -> StoreResult<()> {
    init_metadata_table(conn)?;
    let mut version = get_schema_version(conn)?;

    if version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::Schema(format!(
            "database version {} is newer than supported version {}",
            version, CURRENT_SCHEMA_VERSION
        )));
    }

    if version < 1 {
        migrate_v0_to_v1(conn)?;
        version = 1;
        set_schema_version(conn, version)?;
    }

    if version < 2 {
        migrate_v1_to_v2(conn)?;
        version = 2;
        set_schema_version(conn, version)?;
        info!(version, "ballot schema migrated");
    }

    Ok(())
}

/// v1: tallies, anonymized entries, sealed ballots
fn migrate_v0_to_v1(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "BEGIN IMMEDIATE;
        CREATE TABLE IF NOT EXISTS tallies (
            candidate_id INTEGER PRIMARY KEY,
            candidate_name TEXT NOT NULL,
            count INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS tally_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            candidate_id INTEGER NOT NULL,
            candidate_name TEXT,
            recorded_at_us INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS ballots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            received_at_us INTEGER NOT NULL,
            salt BLOB NOT NULL,
            nonce BLOB NOT NULL,
            ciphertext BLOB NOT NULL
        );
        COMMIT;",
    )?;
    Ok(())
}

/// v2: voter receipts and a receipt-time index for stats
fn migrate_v1_to_v2(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "BEGIN IMMEDIATE;
        ALTER TABLE ballots ADD COLUMN receipt TEXT NOT NULL DEFAULT '';
        CREATE INDEX IF NOT EXISTS ballots_received_idx ON ballots(received_at_us);
        COMMIT;",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_fresh_db_migrates_to_current() {
        let tf = NamedTempFile::new().unwrap();
        let conn = Connection::open(tf.path()).unwrap();

        assert!(needs_migration(&conn).unwrap());
        migrate_to_current(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
        assert!(!needs_migration(&conn).unwrap());

        // idempotent
        migrate_to_current(&conn).unwrap();
    }

    #[test]
    fn test_v1_gains_receipt_column() {
        let tf = NamedTempFile::new().unwrap();
        let conn = Connection::open(tf.path()).unwrap();
        init_metadata_table(&conn).unwrap();
        migrate_v0_to_v1(&conn).unwrap();
        set_schema_version(&conn, 1).unwrap();
        conn.execute(
            "INSERT INTO ballots (received_at_us, salt, nonce, ciphertext) VALUES (1, x'00', x'00', x'00')",
            [],
        )
        .unwrap();

        migrate_to_current(&conn).unwrap();

        let receipt: String = conn
            .query_row("SELECT receipt FROM ballots WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(receipt, "");
    }

    #[test]
    fn test_future_version_error() {
        let tf = NamedTempFile::new().unwrap();
        let conn = Connection::open(tf.path()).unwrap();

        init_metadata_table(&conn).unwrap();
        set_schema_version(&conn, 999).unwrap();

        assert!(matches!(
            migrate_to_current(&conn),
            Err(StoreError::Schema(_))
        ));
    }
}
