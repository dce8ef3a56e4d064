use crate::{db_err, is_constraint_violation, millis, opt_time_at, time_at, Store};
use chrono::{DateTime, Duration, Utc};
use rusqlite::types::{ToSql, Type};
use rusqlite::{params, OptionalExtension, Row, Transaction, TransactionBehavior};
use vault_core::{
    NewTrackMetadata, Resource, Result, Track, TrackFilter, TrackId, TrackMetadata, TrackPatch,
    TrackStatus, UserId, VaultError,
};

const TRACK_SELECT: &str = "SELECT t.id, t.user_id, t.status, t.locked_at, t.available_at,
        t.revealed_at, t.created_at, m.id, m.external_id, m.title, m.artist, m.album,
        m.preview_url, m.image_url, m.release_date
    FROM tracks t JOIN track_metadata m ON m.id = t.metadata_id";

fn track_from_row(row: &Row<'_>) -> rusqlite::Result<Track> {
    let status: String = row.get(2)?;
    let status = status
        .parse::<TrackStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    Ok(Track {
        id: row.get(0)?,
        user_id: row.get(1)?,
        status,
        locked_at: opt_time_at(row, 3)?,
        available_at: opt_time_at(row, 4)?,
        revealed_at: opt_time_at(row, 5)?,
        created_at: time_at(row, 6)?,
        metadata: TrackMetadata {
            id: row.get(7)?,
            external_id: row.get(8)?,
            title: row.get(9)?,
            artist: row.get(10)?,
            album: row.get(11)?,
            preview_url: row.get(12)?,
            image_url: row.get(13)?,
            release_date: row.get(14)?,
        },
    })
}

fn limit_param(limit: Option<usize>) -> i64 {
    // SQLite treats a negative LIMIT as "no limit".
    limit.and_then(|l| i64::try_from(l).ok()).unwrap_or(-1)
}

fn load_track(tx: &Transaction<'_>, user_id: UserId, track_id: TrackId) -> Result<Track> {
    tx.query_row(
        &format!("{TRACK_SELECT} WHERE t.id = ?1 AND t.user_id = ?2"),
        params![track_id, user_id],
        track_from_row,
    )
    .optional()
    .map_err(db_err)?
    .ok_or(VaultError::NotFound(Resource::Track(track_id)))
}

/// Get-or-create by external id. The unique constraint makes concurrent
/// creators converge on the first row written.
fn upsert_metadata_in(tx: &Transaction<'_>, meta: &NewTrackMetadata) -> Result<TrackMetadata> {
    tx.execute(
        "INSERT INTO track_metadata (
            external_id, title, artist, album, preview_url, image_url, release_date
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(external_id) DO NOTHING",
        params![
            meta.external_id,
            meta.title,
            meta.artist,
            meta.album,
            meta.preview_url,
            meta.image_url,
            meta.release_date
        ],
    )
    .map_err(db_err)?;

    tx.query_row(
        "SELECT id, external_id, title, artist, album, preview_url, image_url, release_date
         FROM track_metadata WHERE external_id = ?1",
        params![meta.external_id],
        |row| {
            Ok(TrackMetadata {
                id: row.get(0)?,
                external_id: row.get(1)?,
                title: row.get(2)?,
                artist: row.get(3)?,
                album: row.get(4)?,
                preview_url: row.get(5)?,
                image_url: row.get(6)?,
                release_date: row.get(7)?,
            })
        },
    )
    .map_err(db_err)
}

impl Store {
    /// Reuses (or creates) the metadata row for `meta.external_id` and inserts
    /// a track for `user_id` in the state described by `initial`, all in one
    /// transaction.
    pub fn create_track(
        &self,
        user_id: UserId,
        meta: &NewTrackMetadata,
        initial: TrackPatch,
        now: DateTime<Utc>,
    ) -> Result<Track> {
        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let metadata = upsert_metadata_in(&tx, meta)?;
        let inserted = tx.execute(
            "INSERT INTO tracks (
                user_id, metadata_id, status, locked_at, available_at, revealed_at, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                user_id,
                metadata.id,
                initial.status.as_str(),
                initial.locked_at.map(millis),
                initial.available_at.map(millis),
                initial.revealed_at.map(millis),
                millis(now)
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(err) if is_constraint_violation(&err) => {
                return Err(VaultError::Conflict(format!(
                    "track {} already exists in your vault",
                    meta.external_id
                )));
            }
            Err(err) => return Err(db_err(err)),
        }

        let track = load_track(&tx, user_id, tx.last_insert_rowid())?;
        tx.commit().map_err(db_err)?;
        Ok(track)
    }

    pub fn get_track(&self, user_id: UserId, track_id: TrackId) -> Result<Track> {
        let conn = self.conn();
        conn.query_row(
            &format!("{TRACK_SELECT} WHERE t.id = ?1 AND t.user_id = ?2"),
            params![track_id, user_id],
            track_from_row,
        )
        .optional()
        .map_err(db_err)?
        .ok_or(VaultError::NotFound(Resource::Track(track_id)))
    }

    /// Reads the track, asks `plan` for the new lifecycle fields and writes
    /// them back, all under one immediate transaction. If `plan` fails the
    /// row is left untouched.
    pub fn apply_transition<F>(&self, user_id: UserId, track_id: TrackId, plan: F) -> Result<Track>
    where
        F: FnOnce(&Track) -> Result<TrackPatch>,
    {
        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let current = load_track(&tx, user_id, track_id)?;
        let patch = plan(&current)?;
        tx.execute(
            "UPDATE tracks
             SET status = ?1, locked_at = ?2, available_at = ?3, revealed_at = ?4
             WHERE id = ?5",
            params![
                patch.status.as_str(),
                patch.locked_at.map(millis),
                patch.available_at.map(millis),
                patch.revealed_at.map(millis),
                track_id
            ],
        )
        .map_err(db_err)?;

        let updated = load_track(&tx, user_id, track_id)?;
        tx.commit().map_err(db_err)?;
        Ok(updated)
    }

    /// Newest first, optionally filtered by status and truncated.
    pub fn list_tracks(&self, user_id: UserId, filter: &TrackFilter) -> Result<Vec<Track>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached(&format!(
                "{TRACK_SELECT} WHERE t.user_id = ?1 AND (?2 IS NULL OR t.status = ?2)
                 ORDER BY t.created_at DESC, t.id DESC LIMIT ?3"
            ))
            .map_err(db_err)?;
        let tracks = stmt
            .query_map(
                params![
                    user_id,
                    filter.status.map(|s| s.as_str()),
                    limit_param(filter.limit)
                ],
                track_from_row,
            )
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(tracks)
    }

    /// Tracks whose status is `available` *and* whose `available_at` has
    /// passed, soonest first.
    pub fn available_tracks(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<Track>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached(&format!(
                "{TRACK_SELECT} WHERE t.user_id = ?1 AND t.status = 'available'
                   AND t.available_at IS NOT NULL AND t.available_at <= ?2
                 ORDER BY t.available_at ASC, t.id ASC LIMIT ?3"
            ))
            .map_err(db_err)?;
        let tracks = stmt
            .query_map(
                params![user_id, millis(now), limit_param(limit)],
                track_from_row,
            )
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(tracks)
    }

    pub fn revealed_tracks(&self, user_id: UserId, limit: Option<usize>) -> Result<Vec<Track>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached(&format!(
                "{TRACK_SELECT} WHERE t.user_id = ?1 AND t.status = 'revealed'
                 ORDER BY t.revealed_at DESC, t.id DESC LIMIT ?2"
            ))
            .map_err(db_err)?;
        let tracks = stmt
            .query_map(params![user_id, limit_param(limit)], track_from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(tracks)
    }

    /// Single set-based promotion of elapsed pending tracks, for one user or
    /// for everyone. Returns the number of rows promoted.
    pub fn promote_elapsed(&self, user_id: Option<UserId>, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn();
        conn.execute(
            "UPDATE tracks SET status = 'available'
             WHERE status = 'pending'
               AND available_at IS NOT NULL AND available_at <= ?1
               AND (?2 IS NULL OR user_id = ?2)",
            params![millis(now), user_id],
        )
        .map_err(db_err)
    }

    /// Fills `available_at` for pending rows that were locked but never got
    /// an unlock time.
    pub fn backfill_available_at(&self, wait: Duration) -> Result<usize> {
        let conn = self.conn();
        conn.execute(
            "UPDATE tracks SET available_at = locked_at + ?1
             WHERE status = 'pending' AND available_at IS NULL AND locked_at IS NOT NULL",
            params![wait.num_milliseconds()],
        )
        .map_err(db_err)
    }

    /// External ids from `external_ids` that `user_id` already has a track for.
    pub fn locked_external_ids(
        &self,
        user_id: UserId,
        external_ids: &[String],
    ) -> Result<Vec<String>> {
        if external_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; external_ids.len()].join(", ");
        let sql = format!(
            "SELECT m.external_id FROM tracks t JOIN track_metadata m ON m.id = t.metadata_id
             WHERE t.user_id = ? AND m.external_id IN ({placeholders})"
        );
        let mut args: Vec<&dyn ToSql> = Vec::with_capacity(external_ids.len() + 1);
        args.push(&user_id);
        for id in external_ids {
            args.push(id);
        }

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let found = stmt
            .query_map(args.as_slice(), |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(found)
    }

    pub fn status_counts(&self) -> Result<Vec<(TrackStatus, i64)>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM tracks GROUP BY status ORDER BY status")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        rows.into_iter()
            .map(|(status, count)| Ok((status.parse::<TrackStatus>()?, count)))
            .collect()
    }

    pub fn find_metadata(&self, external_id: &str) -> Result<Option<TrackMetadata>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, external_id, title, artist, album, preview_url, image_url, release_date
             FROM track_metadata WHERE external_id = ?1",
            params![external_id],
            |row| {
                Ok(TrackMetadata {
                    id: row.get(0)?,
                    external_id: row.get(1)?,
                    title: row.get(2)?,
                    artist: row.get(3)?,
                    album: row.get(4)?,
                    preview_url: row.get(5)?,
                    image_url: row.get(6)?,
                    release_date: row.get(7)?,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    /// Removes an unreferenced metadata row. Refused with `Conflict` while
    /// any track still points at it.
    pub fn delete_metadata(&self, metadata_id: i64) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let references: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM tracks WHERE metadata_id = ?1",
                params![metadata_id],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        if references > 0 {
            return Err(VaultError::Conflict(format!(
                "track metadata {metadata_id} is still referenced by {references} track(s)"
            )));
        }

        let deleted = tx
            .execute(
                "DELETE FROM track_metadata WHERE id = ?1",
                params![metadata_id],
            )
            .map_err(|err| {
                if is_constraint_violation(&err) {
                    VaultError::Conflict(format!("track metadata {metadata_id} is still referenced"))
                } else {
                    db_err(err)
                }
            })?;
        if deleted == 0 {
            return Err(VaultError::NotFound(Resource::Metadata(metadata_id)));
        }
        tx.commit().map_err(db_err)
    }
}
