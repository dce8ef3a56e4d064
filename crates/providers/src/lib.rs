use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Token pair returned by the provider's token endpoint. Refresh responses
/// may omit `refresh_token`, in which case the old one stays valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime of `access_token` in seconds.
    pub expires_in: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderTrack {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub image_url: Option<String>,
    pub preview_url: Option<String>,
    pub release_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderPlaylist {
    pub id: String,
    pub name: String,
    pub image_url: Option<String>,
    pub track_count: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayedTrack {
    #[serde(flatten)]
    pub track: ProviderTrack,
    pub played_at: DateTime<Utc>,
}

/// The external music provider. Every call is a single bounded request whose
/// failure is reported to the caller; nothing is retried here.
#[async_trait]
pub trait MusicProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Consent URL the user is sent to when connecting an account.
    fn authorize_url(&self, state: &str) -> String;

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant>;
    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant>;
    async fn revoke(&self, access_token: &str) -> Result<()>;

    async fn search_tracks(
        &self,
        access_token: &str,
        query: &str,
        limit: u32,
    ) -> Result<Vec<ProviderTrack>>;
    async fn playlists(&self, access_token: &str) -> Result<Vec<ProviderPlaylist>>;
    async fn create_playlist(&self, access_token: &str, name: &str) -> Result<ProviderPlaylist>;
    async fn add_tracks_to_playlist(
        &self,
        access_token: &str,
        playlist_id: &str,
        track_ids: &[String],
    ) -> Result<()>;
    async fn recently_played(&self, access_token: &str, limit: u32) -> Result<Vec<PlayedTrack>>;
    async fn top_tracks(&self, access_token: &str, limit: u32) -> Result<Vec<ProviderTrack>>;
    async fn saved_tracks(&self, access_token: &str, limit: u32) -> Result<Vec<ProviderTrack>>;
    async fn recommendations(
        &self,
        access_token: &str,
        seed_track_ids: &[String],
        limit: u32,
    ) -> Result<Vec<ProviderTrack>>;
}

/// Stand-in used when no provider account is configured: authorization can
/// never succeed, so every call fails.
pub struct NullProvider;

#[async_trait]
impl MusicProvider for NullProvider {
    fn name(&self) -> &'static str {
        "null"
    }

    fn authorize_url(&self, _state: &str) -> String {
        String::new()
    }

    async fn exchange_code(&self, _code: &str) -> Result<TokenGrant> {
        bail!("no music provider configured")
    }

    async fn refresh_token(&self, _refresh_token: &str) -> Result<TokenGrant> {
        bail!("no music provider configured")
    }

    async fn revoke(&self, _access_token: &str) -> Result<()> {
        bail!("no music provider configured")
    }

    async fn search_tracks(&self, _: &str, _: &str, _: u32) -> Result<Vec<ProviderTrack>> {
        bail!("no music provider configured")
    }

    async fn playlists(&self, _: &str) -> Result<Vec<ProviderPlaylist>> {
        bail!("no music provider configured")
    }

    async fn create_playlist(&self, _: &str, _: &str) -> Result<ProviderPlaylist> {
        bail!("no music provider configured")
    }

    async fn add_tracks_to_playlist(&self, _: &str, _: &str, _: &[String]) -> Result<()> {
        bail!("no music provider configured")
    }

    async fn recently_played(&self, _: &str, _: u32) -> Result<Vec<PlayedTrack>> {
        bail!("no music provider configured")
    }

    async fn top_tracks(&self, _: &str, _: u32) -> Result<Vec<ProviderTrack>> {
        bail!("no music provider configured")
    }

    async fn saved_tracks(&self, _: &str, _: u32) -> Result<Vec<ProviderTrack>> {
        bail!("no music provider configured")
    }

    async fn recommendations(&self, _: &str, _: &[String], _: u32) -> Result<Vec<ProviderTrack>> {
        bail!("no music provider configured")
    }
}

#[cfg(test)]
mod tests {
    use super::{MusicProvider, NullProvider, TokenGrant};

    #[test]
    fn refresh_grant_without_refresh_token_parses() {
        let grant: TokenGrant = serde_json::from_str(
            r#"{"access_token":"a","token_type":"Bearer","expires_in":3600,"scope":"user-top-read"}"#,
        )
        .unwrap();
        assert_eq!(grant.refresh_token, None);
        assert_eq!(grant.expires_in, 3600);
    }

    #[tokio::test]
    async fn null_provider_never_authorizes() {
        let provider = NullProvider;
        assert!(provider.exchange_code("code").await.is_err());
        assert!(provider.refresh_token("r").await.is_err());
        assert_eq!(provider.name(), "null");
    }
}
