//! SQLite persistence for tracks, their shared metadata, provider credentials
//! and playlist preferences.
//!
//! All access goes through one connection guarded by a mutex, and every
//! multi-statement operation runs inside an immediate transaction, so a
//! read-check-write on a single row is never interleaved with another writer.

mod credentials;
mod preferences;
mod tracks;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, ErrorCode, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};
use vault_core::{Result, VaultError};

const DB_SCHEMA: &str = r#"
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS track_metadata (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        external_id TEXT NOT NULL UNIQUE,
        title TEXT NOT NULL,
        artist TEXT NOT NULL,
        album TEXT NOT NULL,
        preview_url TEXT,
        image_url TEXT,
        release_date TEXT
    );

    CREATE TABLE IF NOT EXISTS tracks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        metadata_id INTEGER NOT NULL REFERENCES track_metadata(id) ON DELETE RESTRICT,
        status TEXT NOT NULL DEFAULT 'active',
        locked_at INTEGER,
        available_at INTEGER,
        revealed_at INTEGER,
        created_at INTEGER NOT NULL,
        UNIQUE (user_id, metadata_id)
    );

    CREATE INDEX IF NOT EXISTS idx_tracks_user_status ON tracks(user_id, status);
    CREATE INDEX IF NOT EXISTS idx_tracks_metadata ON tracks(metadata_id);

    CREATE TABLE IF NOT EXISTS credentials (
        user_id INTEGER PRIMARY KEY,
        access_token TEXT NOT NULL,
        refresh_token TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS playlist_preferences (
        user_id INTEGER PRIMARY KEY,
        playlist_id TEXT NOT NULL,
        playlist_name TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
"#;

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(db_err)?;
        let store = Self::init(conn)?;
        info!(path = %path.as_ref().display(), "opened vault database");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(DB_SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Recovers from a poisoned lock: every write is transactional, so a
    /// panicking holder cannot leave a half-applied change behind.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("database mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

pub(crate) fn db_err(err: rusqlite::Error) -> VaultError {
    VaultError::Storage(err.to_string())
}

pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

pub(crate) fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

pub(crate) fn opt_time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let ms: Option<i64> = row.get(idx)?;
    ms.map(|ms| {
        Utc.timestamp_millis_opt(ms)
            .single()
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
    })
    .transpose()
}
