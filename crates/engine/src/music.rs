use crate::freshness::CredentialGuard;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use vault_core::{PlaylistPreference, Resource, Result, UserId, VaultError};
use vault_providers::{MusicProvider, PlayedTrack, ProviderPlaylist, ProviderTrack};
use vault_store::Store;

pub const SEARCH_LIMIT: u32 = 15;
pub const RECENTLY_PLAYED_LIMIT: u32 = 6;
pub const RECOMMENDATION_LIMIT: u32 = 20;
pub const MAX_SEEDS: usize = 3;
pub const DEFAULT_PLAYLIST_NAME: &str = "My Vault Playlist";

/// Provider-backed browsing on behalf of a user. Every call goes through
/// `CredentialGuard::ensure_valid` first.
pub struct MusicService {
    store: Store,
    guard: Arc<CredentialGuard>,
    provider: Arc<dyn MusicProvider>,
}

impl MusicService {
    pub fn new(store: Store, guard: Arc<CredentialGuard>, provider: Arc<dyn MusicProvider>) -> Self {
        Self {
            store,
            guard,
            provider,
        }
    }

    async fn token(&self, user_id: UserId, now: DateTime<Utc>) -> Result<String> {
        Ok(self.guard.ensure_valid(user_id, now).await?.access_token)
    }

    pub async fn search(&self, user_id: UserId, query: &str, now: DateTime<Utc>) -> Result<Vec<ProviderTrack>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(VaultError::Validation("search query is required".to_string()));
        }
        let token = self.token(user_id, now).await?;
        self.provider
            .search_tracks(&token, query, SEARCH_LIMIT)
            .await
            .map_err(VaultError::upstream)
    }

    pub async fn playlists(&self, user_id: UserId, now: DateTime<Utc>) -> Result<Vec<ProviderPlaylist>> {
        let token = self.token(user_id, now).await?;
        self.provider.playlists(&token).await.map_err(VaultError::upstream)
    }

    pub async fn create_playlist(
        &self,
        user_id: UserId,
        name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ProviderPlaylist> {
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_PLAYLIST_NAME);
        let token = self.token(user_id, now).await?;
        self.provider
            .create_playlist(&token, name)
            .await
            .map_err(VaultError::upstream)
    }

    pub async fn add_to_playlist(
        &self,
        user_id: UserId,
        playlist_id: &str,
        track_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let playlist_id = playlist_id.trim();
        if playlist_id.is_empty() {
            return Err(VaultError::Validation("playlist id is required".to_string()));
        }
        let track_ids: Vec<String> = track_ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        if track_ids.is_empty() {
            return Err(VaultError::Validation("at least one track id is required".to_string()));
        }

        let token = self.token(user_id, now).await?;
        self.provider
            .add_tracks_to_playlist(&token, playlist_id, &track_ids)
            .await
            .map_err(VaultError::upstream)
    }

    pub async fn recently_played(&self, user_id: UserId, now: DateTime<Utc>) -> Result<Vec<PlayedTrack>> {
        let token = self.token(user_id, now).await?;
        self.provider
            .recently_played(&token, RECENTLY_PLAYED_LIMIT)
            .await
            .map_err(VaultError::upstream)
    }

    /// Suggestions seeded from the user's top tracks, or their saved tracks
    /// when they have no listening history yet. Tracks already in the vault
    /// are left out.
    pub async fn recommendations(&self, user_id: UserId, now: DateTime<Utc>) -> Result<Vec<ProviderTrack>> {
        let token = self.token(user_id, now).await?;

        let mut seeds = self
            .provider
            .top_tracks(&token, MAX_SEEDS as u32)
            .await
            .map_err(VaultError::upstream)?;
        if seeds.is_empty() {
            seeds = self
                .provider
                .saved_tracks(&token, MAX_SEEDS as u32)
                .await
                .map_err(VaultError::upstream)?;
        }
        let seed_ids: Vec<String> = seeds.into_iter().take(MAX_SEEDS).map(|t| t.id).collect();
        if seed_ids.is_empty() {
            return Err(VaultError::Validation(
                "no listening history to base recommendations on".to_string(),
            ));
        }

        let suggested = self
            .provider
            .recommendations(&token, &seed_ids, RECOMMENDATION_LIMIT)
            .await
            .map_err(VaultError::upstream)?;

        let candidate_ids: Vec<String> = suggested.iter().map(|t| t.id.clone()).collect();
        let vaulted: HashSet<String> = self
            .store
            .locked_external_ids(user_id, &candidate_ids)?
            .into_iter()
            .collect();
        debug!(user_id, seeds = seed_ids.len(), excluded = vaulted.len(), "recommendations fetched");

        Ok(suggested
            .into_iter()
            .filter(|t| !vaulted.contains(&t.id))
            .collect())
    }

    pub fn playlist_preference(&self, user_id: UserId) -> Result<PlaylistPreference> {
        self.store
            .get_playlist_preference(user_id)?
            .ok_or(VaultError::NotFound(Resource::PlaylistPreference))
    }

    /// Sets the default playlist. Both fields blank clears the preference and
    /// returns `None`; exactly one blank is rejected.
    pub fn set_playlist_preference(
        &self,
        user_id: UserId,
        playlist_id: &str,
        playlist_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PlaylistPreference>> {
        match (playlist_id.trim(), playlist_name.trim()) {
            ("", "") => {
                self.store.clear_playlist_preference(user_id)?;
                Ok(None)
            }
            ("", _) | (_, "") => Err(VaultError::Validation(
                "playlist id and name must be given together".to_string(),
            )),
            (id, name) => {
                self.store.set_playlist_preference(user_id, id, name, now)?;
                self.playlist_preference(user_id).map(Some)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MusicService, DEFAULT_PLAYLIST_NAME, MAX_SEEDS};
    use crate::freshness::CredentialGuard;
    use crate::test_support::{t0, StubProvider};
    use chrono::Duration;
    use std::sync::Arc;
    use vault_core::{Credential, NewTrackMetadata, Resource, TrackPatch, TrackStatus, VaultError};
    use vault_store::Store;

    fn service(provider: Arc<StubProvider>) -> (MusicService, Store) {
        let store = Store::open_in_memory().unwrap();
        store
            .save_credential(&Credential {
                user_id: 1,
                access_token: "access".to_string(),
                refresh_token: "refresh".to_string(),
                expires_at: t0() + Duration::hours(1),
            })
            .unwrap();
        let guard = Arc::new(CredentialGuard::new(store.clone(), provider.clone()));
        (MusicService::new(store.clone(), guard, provider), store)
    }

    fn vault(store: &Store, external_id: &str) {
        let meta = NewTrackMetadata {
            external_id: external_id.to_string(),
            title: "T".to_string(),
            artist: "A".to_string(),
            album: "B".to_string(),
            preview_url: None,
            image_url: None,
            release_date: None,
        };
        let patch = TrackPatch {
            status: TrackStatus::Pending,
            locked_at: Some(t0()),
            available_at: Some(t0() + Duration::days(1)),
            revealed_at: None,
        };
        store.create_track(1, &meta, patch, t0()).unwrap();
    }

    #[tokio::test]
    async fn recommendations_fall_back_to_saved_tracks_and_skip_vaulted() {
        let provider = Arc::new(StubProvider::default());
        provider.set_saved(vec!["s1", "s2", "s3", "s4"]);
        provider.set_recommended(vec!["r1", "r2", "r3"]);
        let (svc, store) = service(provider.clone());
        vault(&store, "r2");

        let ids: Vec<String> = svc
            .recommendations(1, t0())
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec!["r1", "r3"]);
        assert_eq!(provider.last_seeds(), vec!["s1", "s2", "s3"]);
        assert!(provider.last_seeds().len() <= MAX_SEEDS);
    }

    #[tokio::test]
    async fn recommendations_prefer_top_tracks() {
        let provider = Arc::new(StubProvider::default());
        provider.set_top(vec!["t1"]);
        provider.set_saved(vec!["s1"]);
        provider.set_recommended(vec!["r1"]);
        let (svc, _store) = service(provider.clone());

        svc.recommendations(1, t0()).await.unwrap();
        assert_eq!(provider.last_seeds(), vec!["t1"]);
    }

    #[tokio::test]
    async fn recommendations_need_some_history() {
        let (svc, _store) = service(Arc::new(StubProvider::default()));
        assert!(matches!(
            svc.recommendations(1, t0()).await,
            Err(VaultError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn provider_errors_are_upstream_failures() {
        let (svc, _store) = service(Arc::new(StubProvider::failing()));
        assert!(matches!(
            svc.search(1, "daft punk", t0()).await,
            Err(VaultError::UpstreamFailure(_))
        ));
        assert!(matches!(
            svc.search(1, "  ", t0()).await,
            Err(VaultError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn playlist_name_defaults() {
        let (svc, _store) = service(Arc::new(StubProvider::default()));
        let created = svc.create_playlist(1, Some(" "), t0()).await.unwrap();
        assert_eq!(created.name, DEFAULT_PLAYLIST_NAME);
        let named = svc.create_playlist(1, Some("Road trip"), t0()).await.unwrap();
        assert_eq!(named.name, "Road trip");
    }

    #[test]
    fn playlist_preference_set_clear_and_half_blank() {
        let (svc, _store) = service(Arc::new(StubProvider::default()));
        assert!(matches!(
            svc.playlist_preference(1),
            Err(VaultError::NotFound(Resource::PlaylistPreference))
        ));

        let pref = svc.set_playlist_preference(1, "pl1", "Mine", t0()).unwrap().unwrap();
        assert_eq!(pref.playlist_id, "pl1");
        assert!(matches!(
            svc.set_playlist_preference(1, "pl2", " ", t0()),
            Err(VaultError::Validation(_))
        ));
        assert_eq!(svc.playlist_preference(1).unwrap().playlist_id, "pl1");

        assert_eq!(svc.set_playlist_preference(1, "", "", t0()).unwrap(), None);
        assert!(svc.playlist_preference(1).is_err());
    }
}
