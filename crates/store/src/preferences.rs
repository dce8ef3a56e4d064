use crate::{db_err, millis, time_at, Store};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use vault_core::{PlaylistPreference, Result, UserId};

impl Store {
    pub fn get_playlist_preference(&self, user_id: UserId) -> Result<Option<PlaylistPreference>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT user_id, playlist_id, playlist_name, updated_at
             FROM playlist_preferences WHERE user_id = ?1",
            params![user_id],
            |row| {
                Ok(PlaylistPreference {
                    user_id: row.get(0)?,
                    playlist_id: row.get(1)?,
                    playlist_name: row.get(2)?,
                    updated_at: time_at(row, 3)?,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    pub fn set_playlist_preference(
        &self,
        user_id: UserId,
        playlist_id: &str,
        playlist_name: &str,
        now: DateTime<Utc>,
    ) -> Result<PlaylistPreference> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO playlist_preferences
                (user_id, playlist_id, playlist_name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                playlist_id = excluded.playlist_id,
                playlist_name = excluded.playlist_name,
                updated_at = excluded.updated_at",
            params![user_id, playlist_id, playlist_name, millis(now)],
        )
        .map_err(db_err)?;

        Ok(PlaylistPreference {
            user_id,
            playlist_id: playlist_id.to_string(),
            playlist_name: playlist_name.to_string(),
            updated_at: now,
        })
    }

    pub fn clear_playlist_preference(&self, user_id: UserId) -> Result<bool> {
        let conn = self.conn();
        let deleted = conn
            .execute(
                "DELETE FROM playlist_preferences WHERE user_id = ?1",
                params![user_id],
            )
            .map_err(db_err)?;
        Ok(deleted > 0)
    }
}
