use crate::{db_err, millis, time_at, Store};
use rusqlite::{params, OptionalExtension};
use vault_core::{Credential, Result, UserId};

impl Store {
    pub fn get_credential(&self, user_id: UserId) -> Result<Option<Credential>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT user_id, access_token, refresh_token, expires_at
             FROM credentials WHERE user_id = ?1",
            params![user_id],
            |row| {
                Ok(Credential {
                    user_id: row.get(0)?,
                    access_token: row.get(1)?,
                    refresh_token: row.get(2)?,
                    expires_at: time_at(row, 3)?,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    /// Insert or overwrite the user's credential (successful authorization).
    pub fn save_credential(&self, credential: &Credential) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO credentials (user_id, access_token, refresh_token, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at",
            params![
                credential.user_id,
                credential.access_token,
                credential.refresh_token,
                millis(credential.expires_at)
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Persists a refreshed token pair only if the row still holds the
    /// refresh token the refresh was performed with. Returns `false` when a
    /// concurrent refresh or a disconnect got there first.
    pub fn replace_tokens(&self, refreshed: &Credential, used_refresh_token: &str) -> Result<bool> {
        let conn = self.conn();
        let updated = conn
            .execute(
                "UPDATE credentials
                 SET access_token = ?1, refresh_token = ?2, expires_at = ?3
                 WHERE user_id = ?4 AND refresh_token = ?5",
                params![
                    refreshed.access_token,
                    refreshed.refresh_token,
                    millis(refreshed.expires_at),
                    refreshed.user_id,
                    used_refresh_token
                ],
            )
            .map_err(db_err)?;
        Ok(updated == 1)
    }

    /// Returns whether a row was removed.
    pub fn delete_credential(&self, user_id: UserId) -> Result<bool> {
        let conn = self.conn();
        let deleted = conn
            .execute("DELETE FROM credentials WHERE user_id = ?1", params![user_id])
            .map_err(db_err)?;
        Ok(deleted > 0)
    }
}
