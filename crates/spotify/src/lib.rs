use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;
use vault_core::urls::{path_segment, spotify_authorize_url, spotify_track_uri};
use vault_core::SpotifyConfig;
use vault_providers::{MusicProvider, PlayedTrack, ProviderPlaylist, ProviderTrack, TokenGrant};

const API_BASE: &str = "https://api.spotify.com/v1";
const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const REVOKE_URL: &str = "https://accounts.spotify.com/api/token/revoke";

const MAX_SEED_TRACKS: usize = 5;
const PLAYLIST_PAGE: u32 = 50;
const DEFAULT_PLAYLIST_DESCRIPTION: &str = "Created by Vault - your personal music time capsule";

pub struct SpotifyClient {
    http: Client,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    scopes: Vec<String>,
}

impl SpotifyClient {
    pub fn new(cfg: &SpotifyConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()
            .context("failed to build spotify http client")?;
        Ok(Self {
            http,
            client_id: cfg.client_id.clone(),
            client_secret: cfg.client_secret.clone(),
            redirect_uri: cfg.redirect_uri.clone(),
            scopes: cfg.scopes.clone(),
        })
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenGrant> {
        let req = self.http.post(TOKEN_URL).form(form);
        send_json(req, "token").await
    }

    async fn get<T: DeserializeOwned>(
        &self,
        access_token: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let req = self
            .http
            .get(format!("{API_BASE}{path}"))
            .bearer_auth(access_token)
            .query(query);
        send_json(req, path).await
    }
}

async fn send_json<T: DeserializeOwned>(req: RequestBuilder, what: &str) -> Result<T> {
    let resp = req
        .send()
        .await
        .with_context(|| format!("spotify {what} request failed"))?;
    let status = resp.status();
    let body = resp
        .text()
        .await
        .with_context(|| format!("failed reading spotify {what} response"))?;
    if !status.is_success() {
        return Err(api_error(status.as_u16(), &body));
    }
    debug!(endpoint = what, status = status.as_u16(), "spotify request ok");
    serde_json::from_str(&body).with_context(|| format!("malformed spotify {what} response"))
}

/// Spotify reports errors either as `{"error": {"status", "message"}}` (Web
/// API) or `{"error": "...", "error_description": "..."}` (accounts service).
fn api_error(status: u16, body: &str) -> anyhow::Error {
    let value: serde_json::Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return anyhow!("spotify returned {status}"),
    };

    let error = value.get("error");
    let message = error
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .or_else(|| value.get("error_description").and_then(|d| d.as_str()))
        .or_else(|| error.and_then(|e| e.as_str()))
        .unwrap_or("unknown spotify error");
    anyhow!("spotify returned {status}: {message}")
}

#[derive(Debug, Deserialize)]
struct WireArtist {
    name: String,
}

#[derive(Debug, Deserialize)]
struct WireImage {
    url: String,
}

#[derive(Debug, Deserialize)]
struct WireAlbum {
    name: String,
    #[serde(default)]
    images: Vec<WireImage>,
    #[serde(default)]
    release_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireTrack {
    /// Null for local files in a user's library.
    id: Option<String>,
    name: String,
    #[serde(default)]
    artists: Vec<WireArtist>,
    album: WireAlbum,
    #[serde(default)]
    preview_url: Option<String>,
}

impl WireTrack {
    fn into_track(self) -> Option<ProviderTrack> {
        let id = self.id?;
        let artist = self
            .artists
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        Some(ProviderTrack {
            id,
            title: self.name,
            artist,
            album: self.album.name,
            image_url: self.album.images.into_iter().next().map(|i| i.url),
            preview_url: self.preview_url,
            release_date: self.album.release_date,
        })
    }
}

#[derive(Debug, Deserialize)]
struct Paging<T> {
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    tracks: Paging<WireTrack>,
}

#[derive(Debug, Deserialize)]
struct SavedTrack {
    track: WireTrack,
}

#[derive(Debug, Deserialize)]
struct PlayHistory {
    track: WireTrack,
    played_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct Recommendations {
    tracks: Vec<WireTrack>,
}

#[derive(Debug, Deserialize)]
struct WireTotal {
    total: u32,
}

#[derive(Debug, Deserialize)]
struct WirePlaylist {
    id: String,
    name: String,
    #[serde(default)]
    images: Option<Vec<WireImage>>,
    #[serde(default)]
    tracks: Option<WireTotal>,
}

impl From<WirePlaylist> for ProviderPlaylist {
    fn from(p: WirePlaylist) -> Self {
        ProviderPlaylist {
            id: p.id,
            name: p.name,
            image_url: p
                .images
                .and_then(|images| images.into_iter().next())
                .map(|i| i.url),
            track_count: p.tracks.map(|t| t.total),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Me {
    id: String,
}

fn tracks(items: impl IntoIterator<Item = WireTrack>) -> Vec<ProviderTrack> {
    items.into_iter().filter_map(WireTrack::into_track).collect()
}

#[async_trait]
impl MusicProvider for SpotifyClient {
    fn name(&self) -> &'static str {
        "spotify"
    }

    fn authorize_url(&self, state: &str) -> String {
        spotify_authorize_url(&self.client_id, &self.redirect_uri, &self.scopes, state)
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ])
        .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ])
        .await
    }

    async fn revoke(&self, access_token: &str) -> Result<()> {
        let resp = self
            .http
            .post(REVOKE_URL)
            .form(&[
                ("token", access_token),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .context("spotify revoke request failed")?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(api_error(status.as_u16(), &body))
    }

    async fn search_tracks(
        &self,
        access_token: &str,
        query: &str,
        limit: u32,
    ) -> Result<Vec<ProviderTrack>> {
        let resp: SearchResponse = self
            .get(
                access_token,
                "/search",
                &[
                    ("q", query.to_string()),
                    ("type", "track".to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        Ok(tracks(resp.tracks.items))
    }

    async fn playlists(&self, access_token: &str) -> Result<Vec<ProviderPlaylist>> {
        let page: Paging<Option<WirePlaylist>> = self
            .get(
                access_token,
                "/me/playlists",
                &[("limit", PLAYLIST_PAGE.to_string())],
            )
            .await?;
        Ok(page.items.into_iter().flatten().map(Into::into).collect())
    }

    async fn create_playlist(&self, access_token: &str, name: &str) -> Result<ProviderPlaylist> {
        let me: Me = self.get(access_token, "/me", &[]).await?;
        let req = self
            .http
            .post(format!("{API_BASE}/users/{}/playlists", path_segment(&me.id)))
            .bearer_auth(access_token)
            .json(&json!({
                "name": name,
                "description": DEFAULT_PLAYLIST_DESCRIPTION,
                "public": false,
            }));
        let playlist: WirePlaylist = send_json(req, "create playlist").await?;
        Ok(playlist.into())
    }

    async fn add_tracks_to_playlist(
        &self,
        access_token: &str,
        playlist_id: &str,
        track_ids: &[String],
    ) -> Result<()> {
        let uris: Vec<String> = track_ids.iter().map(|id| spotify_track_uri(id)).collect();
        let req = self
            .http
            .post(format!(
                "{API_BASE}/playlists/{}/tracks",
                path_segment(playlist_id)
            ))
            .bearer_auth(access_token)
            .json(&json!({ "uris": uris }));
        let _: serde_json::Value = send_json(req, "add playlist tracks").await?;
        Ok(())
    }

    async fn recently_played(&self, access_token: &str, limit: u32) -> Result<Vec<PlayedTrack>> {
        let page: Paging<PlayHistory> = self
            .get(
                access_token,
                "/me/player/recently-played",
                &[("limit", limit.to_string())],
            )
            .await?;
        Ok(page
            .items
            .into_iter()
            .filter_map(|item| {
                let played_at = item.played_at;
                item.track
                    .into_track()
                    .map(|track| PlayedTrack { track, played_at })
            })
            .collect())
    }

    async fn top_tracks(&self, access_token: &str, limit: u32) -> Result<Vec<ProviderTrack>> {
        let page: Paging<WireTrack> = self
            .get(
                access_token,
                "/me/top/tracks",
                &[
                    ("limit", limit.to_string()),
                    ("time_range", "medium_term".to_string()),
                ],
            )
            .await?;
        Ok(tracks(page.items))
    }

    async fn saved_tracks(&self, access_token: &str, limit: u32) -> Result<Vec<ProviderTrack>> {
        let page: Paging<SavedTrack> = self
            .get(access_token, "/me/tracks", &[("limit", limit.to_string())])
            .await?;
        Ok(tracks(page.items.into_iter().map(|s| s.track)))
    }

    async fn recommendations(
        &self,
        access_token: &str,
        seed_track_ids: &[String],
        limit: u32,
    ) -> Result<Vec<ProviderTrack>> {
        let seeds = seed_track_ids
            .iter()
            .take(MAX_SEED_TRACKS)
            .cloned()
            .collect::<Vec<_>>()
            .join(",");
        let resp: Recommendations = self
            .get(
                access_token,
                "/recommendations",
                &[("seed_tracks", seeds), ("limit", limit.to_string())],
            )
            .await?;
        Ok(tracks(resp.tracks))
    }
}

#[cfg(test)]
mod tests {
    use super::{api_error, tracks, Paging, PlayHistory, SearchResponse, SpotifyClient, WirePlaylist};
    use vault_core::SpotifyConfig;
    use vault_providers::{MusicProvider, ProviderPlaylist};

    const SEARCH: &str = r#"{
        "tracks": {
            "items": [
                {
                    "id": "3n3Ppam7vgaVa1iaRUc9Lp",
                    "name": "Mr. Brightside",
                    "artists": [{"name": "The Killers"}, {"name": "Guest"}],
                    "album": {
                        "name": "Hot Fuss",
                        "images": [{"url": "https://i.scdn.co/image/large"}, {"url": "https://i.scdn.co/image/small"}],
                        "release_date": "2004-06-07"
                    },
                    "preview_url": null
                },
                {
                    "id": null,
                    "name": "local file",
                    "artists": [],
                    "album": {"name": "", "images": []}
                }
            ]
        }
    }"#;

    #[test]
    fn search_items_map_to_provider_tracks() {
        let resp: SearchResponse = serde_json::from_str(SEARCH).unwrap();
        let found = tracks(resp.tracks.items);

        assert_eq!(found.len(), 1);
        let track = &found[0];
        assert_eq!(track.id, "3n3Ppam7vgaVa1iaRUc9Lp");
        assert_eq!(track.artist, "The Killers, Guest");
        assert_eq!(track.image_url.as_deref(), Some("https://i.scdn.co/image/large"));
        assert_eq!(track.release_date.as_deref(), Some("2004-06-07"));
        assert_eq!(track.preview_url, None);
    }

    #[test]
    fn play_history_keeps_played_at() {
        let raw = r#"{"items": [{
            "played_at": "2026-03-01T10:15:00.000Z",
            "track": {"id": "t1", "name": "Song", "artists": [{"name": "A"}], "album": {"name": "B"}}
        }]}"#;
        let page: Paging<PlayHistory> = serde_json::from_str(raw).unwrap();
        assert_eq!(page.items[0].played_at.to_rfc3339(), "2026-03-01T10:15:00+00:00");
    }

    #[test]
    fn playlists_take_first_image_and_total() {
        let raw = r#"{"id": "p1", "name": "Vault", "images": [{"url": "https://img/1"}], "tracks": {"total": 12}}"#;
        let playlist: ProviderPlaylist = serde_json::from_str::<WirePlaylist>(raw).unwrap().into();
        assert_eq!(playlist.image_url.as_deref(), Some("https://img/1"));
        assert_eq!(playlist.track_count, Some(12));
    }

    #[test]
    fn error_bodies_surface_provider_messages() {
        let web = api_error(401, r#"{"error": {"status": 401, "message": "The access token expired"}}"#);
        assert_eq!(web.to_string(), "spotify returned 401: The access token expired");

        let accounts = api_error(
            400,
            r#"{"error": "invalid_grant", "error_description": "Refresh token revoked"}"#,
        );
        assert_eq!(accounts.to_string(), "spotify returned 400: Refresh token revoked");

        assert_eq!(api_error(502, "<html>").to_string(), "spotify returned 502");
    }

    #[test]
    fn authorize_url_uses_configured_client() {
        let cfg = SpotifyConfig {
            client_id: "client-123".to_string(),
            ..SpotifyConfig::default()
        };
        let client = SpotifyClient::new(&cfg).unwrap();
        let url = client.authorize_url("vault");
        assert!(url.contains("client_id=client-123"));
        assert!(url.contains("state=vault"));
    }
}
