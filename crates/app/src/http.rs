use axum::extract::{FromRequest, FromRequestParts, Path, Query, Request, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, warn};
use vault_core::{
    NewTrackMetadata, PlaylistPreference, Resource, Track, TrackFilter, TrackId, TrackStatus,
    UserId, VaultError,
};
use vault_engine::{AvailableTracks, ConnectionStatus, CredentialGuard, MusicService, TrackService};
use vault_providers::{PlayedTrack, ProviderPlaylist, ProviderTrack};

pub const USER_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub tracks: Arc<TrackService>,
    pub guard: Arc<CredentialGuard>,
    pub music: Arc<MusicService>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/tracks", get(list_tracks).post(create_track))
        .route("/tracks/available", get(available_tracks))
        .route("/tracks/revealed", get(revealed_tracks))
        .route("/tracks/check", get(check_tracks))
        .route("/tracks/:id", get(get_track))
        .route("/tracks/:id/lock", post(lock_track))
        .route("/tracks/:id/make_available", post(make_available))
        .route("/tracks/:id/reveal", post(reveal_track))
        .route("/spotify/auth", get(auth_url))
        .route("/spotify/callback", post(callback))
        .route("/spotify/status", get(connection_status))
        .route("/spotify/disconnect", delete(disconnect))
        .route("/spotify/search", get(search))
        .route("/spotify/playlists", get(playlists).post(create_playlist))
        .route("/spotify/playlists/:id/tracks", post(add_to_playlist))
        .route("/spotify/recently-played", get(recently_played))
        .route("/spotify/recommendations", get(recommendations))
        .route(
            "/spotify/playlist-settings",
            get(playlist_settings).post(update_playlist_settings),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            sweep_on_request,
        ))
        .with_state(state)
}

// =============================================================================
// Errors and extractors
// =============================================================================

#[derive(Debug)]
pub enum ApiError {
    Unauthenticated,
    Vault(VaultError),
}

impl From<VaultError> for ApiError {
    fn from(err: VaultError) -> Self {
        ApiError::Vault(err)
    }
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::Vault(err) => match err {
                VaultError::InvalidTransition { .. }
                | VaultError::Conflict(_)
                | VaultError::Validation(_) => StatusCode::BAD_REQUEST,
                // a missing credential means the provider is not connected
                VaultError::NotFound(Resource::Credential) | VaultError::CredentialInvalid(_) => {
                    StatusCode::FORBIDDEN
                }
                VaultError::NotFound(_) => StatusCode::NOT_FOUND,
                VaultError::UpstreamFailure(_) => StatusCode::BAD_GATEWAY,
                VaultError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let (detail, kind) = match &self {
            ApiError::Unauthenticated => (format!("missing {USER_HEADER} header"), "unauthenticated"),
            ApiError::Vault(VaultError::NotFound(Resource::Credential)) => {
                ("provider not connected".to_string(), "not_connected")
            }
            ApiError::Vault(VaultError::Storage(reason)) => {
                error!(%reason, "storage failure");
                ("internal server error".to_string(), "storage")
            }
            ApiError::Vault(err) => (err.to_string(), err.kind()),
        };
        (status, Json(json!({ "detail": detail, "kind": kind }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Runs a store-bound call on the blocking pool so SQLite work never stalls
/// the async workers.
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> vault_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| ApiError::Vault(VaultError::Storage(format!("blocking task failed: {err}"))))?
        .map_err(ApiError::from)
}

/// JSON body whose rejections use the same error envelope as everything else.
pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        Json::<T>::from_request(req, state)
            .await
            .map(|Json(value)| ApiJson(value))
            .map_err(|rejection| ApiError::Vault(VaultError::Validation(rejection.body_text())))
    }
}

/// The authenticated user, as asserted by the fronting auth layer.
pub struct CurrentUser(pub UserId);

fn user_from_parts(parts: &Parts) -> Option<UserId> {
    parts
        .headers
        .get(USER_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        user_from_parts(parts)
            .map(CurrentUser)
            .ok_or(ApiError::Unauthenticated)
    }
}

/// Promotes the caller's elapsed pending tracks before the request is
/// handled, at most once per sweep interval.
async fn sweep_on_request(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let (parts, body) = request.into_parts();
    if let Some(user_id) = user_from_parts(&parts) {
        let tracks = state.tracks.clone();
        if let Err(err) = blocking(move || tracks.sweep_if_due(user_id, Utc::now())).await {
            warn!(user_id, error = ?err, "request-triggered sweep failed");
        }
    }
    next.run(Request::from_parts(parts, body)).await
}

// =============================================================================
// Tracks
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ListTracksQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CheckQuery {
    pub spotify_ids: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub locked_ids: Vec<String>,
}

async fn create_track(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    ApiJson(body): ApiJson<NewTrackMetadata>,
) -> ApiResult<(StatusCode, Json<Track>)> {
    let tracks = state.tracks;
    let track = blocking(move || tracks.create(user_id, body, Utc::now())).await?;
    Ok((StatusCode::CREATED, Json(track)))
}

async fn list_tracks(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Query(query): Query<ListTracksQuery>,
) -> ApiResult<Json<Vec<Track>>> {
    let status = match query.status.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(raw.parse::<TrackStatus>()?),
    };
    let filter = TrackFilter {
        status,
        limit: query.limit,
    };
    let tracks = state.tracks;
    Ok(Json(blocking(move || tracks.list(user_id, &filter)).await?))
}

async fn available_tracks(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<AvailableTracks>> {
    let tracks = state.tracks;
    Ok(Json(
        blocking(move || tracks.available(user_id, Utc::now(), query.limit)).await?,
    ))
}

async fn revealed_tracks(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<Track>>> {
    let tracks = state.tracks;
    Ok(Json(blocking(move || tracks.revealed(user_id, query.limit)).await?))
}

async fn check_tracks(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Query(query): Query<CheckQuery>,
) -> ApiResult<Json<CheckResponse>> {
    let ids: Vec<String> = query
        .spotify_ids
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::to_string)
        .collect();
    if ids.iter().all(|id| id.trim().is_empty()) {
        return Err(VaultError::Validation("no spotify_ids provided".to_string()).into());
    }
    let tracks = state.tracks;
    let locked_ids = blocking(move || tracks.check_external_ids(user_id, &ids)).await?;
    Ok(Json(CheckResponse { locked_ids }))
}

async fn get_track(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(track_id): Path<TrackId>,
) -> ApiResult<Json<Track>> {
    let tracks = state.tracks;
    Ok(Json(blocking(move || tracks.get(user_id, track_id)).await?))
}

async fn lock_track(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(track_id): Path<TrackId>,
) -> ApiResult<Json<Track>> {
    let tracks = state.tracks;
    Ok(Json(blocking(move || tracks.lock(user_id, track_id, Utc::now())).await?))
}

async fn make_available(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(track_id): Path<TrackId>,
) -> ApiResult<Json<Track>> {
    let tracks = state.tracks;
    Ok(Json(blocking(move || tracks.make_available(user_id, track_id, Utc::now())).await?))
}

async fn reveal_track(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(track_id): Path<TrackId>,
) -> ApiResult<Json<Track>> {
    let tracks = state.tracks;
    Ok(Json(blocking(move || tracks.reveal(user_id, track_id, Utc::now())).await?))
}

// =============================================================================
// Provider connection
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CallbackRequest {
    #[serde(default)]
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

async fn auth_url(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Json<serde_json::Value> {
    let auth_url = state.guard.authorize_url(&format!("vault-{user_id}"));
    Json(json!({ "auth_url": auth_url }))
}

async fn callback(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    ApiJson(body): ApiJson<CallbackRequest>,
) -> ApiResult<Json<StatusResponse>> {
    let credential = state.guard.connect(user_id, &body.code, Utc::now()).await?;
    Ok(Json(StatusResponse {
        connected: true,
        expires_at: Some(credential.expires_at),
    }))
}

async fn connection_status(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> ApiResult<Json<StatusResponse>> {
    let response = match state.guard.status(user_id, Utc::now()).await? {
        ConnectionStatus::Connected { expires_at } => StatusResponse {
            connected: true,
            expires_at: Some(expires_at),
        },
        ConnectionStatus::NotConnected => StatusResponse {
            connected: false,
            expires_at: None,
        },
    };
    Ok(Json(response))
}

async fn disconnect(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> ApiResult<Json<StatusResponse>> {
    state.guard.disconnect(user_id).await?;
    Ok(Json(StatusResponse {
        connected: false,
        expires_at: None,
    }))
}

// =============================================================================
// Provider-backed browsing
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
}

#[derive(Debug, Deserialize)]
pub struct CreatePlaylistRequest {
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddTracksRequest {
    pub track_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct PlaylistSettingsRequest {
    #[serde(default)]
    pub playlist_id: String,
    #[serde(default)]
    pub playlist_name: String,
}

async fn search(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<Vec<ProviderTrack>>> {
    Ok(Json(state.music.search(user_id, &query.q, Utc::now()).await?))
}

async fn playlists(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> ApiResult<Json<Vec<ProviderPlaylist>>> {
    Ok(Json(state.music.playlists(user_id, Utc::now()).await?))
}

async fn create_playlist(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    ApiJson(body): ApiJson<CreatePlaylistRequest>,
) -> ApiResult<(StatusCode, Json<ProviderPlaylist>)> {
    let playlist = state
        .music
        .create_playlist(user_id, body.name.as_deref(), Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(playlist)))
}

async fn add_to_playlist(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(playlist_id): Path<String>,
    ApiJson(body): ApiJson<AddTracksRequest>,
) -> ApiResult<StatusCode> {
    state
        .music
        .add_to_playlist(user_id, &playlist_id, &body.track_ids, Utc::now())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn recently_played(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> ApiResult<Json<Vec<PlayedTrack>>> {
    Ok(Json(state.music.recently_played(user_id, Utc::now()).await?))
}

async fn recommendations(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> ApiResult<Json<Vec<ProviderTrack>>> {
    Ok(Json(state.music.recommendations(user_id, Utc::now()).await?))
}

async fn playlist_settings(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> ApiResult<Json<PlaylistPreference>> {
    let music = state.music;
    Ok(Json(blocking(move || music.playlist_preference(user_id)).await?))
}

async fn update_playlist_settings(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    ApiJson(body): ApiJson<PlaylistSettingsRequest>,
) -> ApiResult<Json<Option<PlaylistPreference>>> {
    let music = state.music;
    let pref = blocking(move || {
        music.set_playlist_preference(user_id, &body.playlist_id, &body.playlist_name, Utc::now())
    })
    .await?;
    Ok(Json(pref))
}

#[cfg(test)]
mod tests {
    use super::{blocking, router, ApiError, AppState, USER_HEADER};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;
    use vault_core::{LockConfig, SweepConfig, VaultError};
    use vault_engine::{CredentialGuard, MusicService, TrackService};
    use vault_providers::{MusicProvider, NullProvider};
    use vault_store::Store;

    fn app() -> Router {
        let store = Store::open_in_memory().unwrap();
        let provider: Arc<dyn MusicProvider> = Arc::new(NullProvider);
        let guard = Arc::new(CredentialGuard::new(store.clone(), provider.clone()));
        let state = AppState {
            tracks: Arc::new(TrackService::new(
                store.clone(),
                LockConfig::default(),
                &SweepConfig::default(),
            )),
            music: Arc::new(MusicService::new(store, guard.clone(), provider)),
            guard,
        };
        router(state)
    }

    async fn call(app: &Router, method: &str, uri: &str, user: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(USER_HEADER, user);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn track_body(external_id: &str) -> Value {
        json!({
            "external_id": external_id,
            "title": "Windowlicker",
            "artist": "Aphex Twin",
            "album": "Windowlicker",
            "image_url": "https://i.scdn.co/image/cover"
        })
    }

    #[tokio::test]
    async fn requests_without_a_user_are_rejected() {
        let app = app();
        let (status, body) = call(&app, "GET", "/tracks", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["kind"], "unauthenticated");
    }

    #[tokio::test]
    async fn create_then_duplicate_then_reveal() {
        let app = app();
        let (status, track) = call(&app, "POST", "/tracks", Some("7"), Some(track_body("abc"))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(track["status"], "pending");
        assert!(track["available_at"].is_string());

        let (status, body) = call(&app, "POST", "/tracks", Some("7"), Some(track_body("abc"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "conflict");

        let uri = format!("/tracks/{}/reveal", track["id"]);
        let (status, revealed) = call(&app, "POST", &uri, Some("7"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(revealed["status"], "revealed");

        let (status, body) = call(&app, "POST", &uri, Some("7"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "invalid_transition");
    }

    #[tokio::test]
    async fn other_users_tracks_are_not_found() {
        let app = app();
        let (_, track) = call(&app, "POST", "/tracks", Some("1"), Some(track_body("abc"))).await;
        let uri = format!("/tracks/{}", track["id"]);
        let (status, body) = call(&app, "GET", &uri, Some("2"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");
    }

    #[tokio::test]
    async fn check_reports_locked_ids_and_needs_input() {
        let app = app();
        call(&app, "POST", "/tracks", Some("1"), Some(track_body("x"))).await;

        let (status, body) = call(&app, "GET", "/tracks/check?spotify_ids=x,y,", Some("1"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["locked_ids"], json!(["x"]));

        let (status, _) = call(&app, "GET", "/tracks/check?spotify_ids=", Some("1"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn listing_filters_by_status() {
        let app = app();
        call(&app, "POST", "/tracks", Some("1"), Some(track_body("x"))).await;

        let (status, body) = call(&app, "GET", "/tracks?status=pending&limit=5", Some("1"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().map(Vec::len), Some(1));

        let (status, _) = call(&app, "GET", "/tracks?status=buried", Some("1"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, available) = call(&app, "GET", "/tracks/available", Some("1"), None).await;
        assert_eq!(available["tracks"], json!([]));
        assert_eq!(available["locked_time"]["days"], 28);
    }

    #[tokio::test]
    async fn provider_routes_need_a_connection() {
        let app = app();
        let (status, body) = call(&app, "GET", "/spotify/search?q=boards", Some("1"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["kind"], "not_connected");

        let (status, body) = call(&app, "GET", "/spotify/status", Some("1"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "connected": false }));

        let (status, _) = call(&app, "DELETE", "/spotify/disconnect", Some("1"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(&app, "POST", "/spotify/callback", Some("1"), Some(json!({ "code": "abc" }))).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["kind"], "upstream_failure");
    }

    #[tokio::test]
    async fn playlist_settings_round_trip() {
        let app = app();
        let (status, _) = call(&app, "GET", "/spotify/playlist-settings", Some("1"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let body = json!({ "playlist_id": "pl1", "playlist_name": "Vault" });
        let (status, pref) = call(&app, "POST", "/spotify/playlist-settings", Some("1"), Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pref["playlist_id"], "pl1");

        let half = json!({ "playlist_id": "pl2" });
        let (status, _) = call(&app, "POST", "/spotify/playlist-settings", Some("1"), Some(half)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_bodies_use_the_error_envelope() {
        let app = app();
        let missing_album = json!({ "external_id": "x", "title": "t", "artist": "a" });
        let (status, body) = call(&app, "POST", "/tracks", Some("1"), Some(missing_album)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");
        assert!(body["detail"].as_str().unwrap().contains("album"));

        let request = Request::builder()
            .method("POST")
            .uri("/spotify/callback")
            .header(USER_HEADER, "1")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let (status, body) = call(&app, "GET", "/tracks", Some("1"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn store_calls_leave_the_async_worker() {
        let worker = std::thread::current().id();
        let ran_on = blocking(|| Ok(std::thread::current().id())).await.unwrap();
        assert_ne!(ran_on, worker);

        let err = blocking(|| -> vault_core::Result<()> { Err(VaultError::Conflict("taken".to_string())) })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Vault(VaultError::Conflict(_))));
    }
}
