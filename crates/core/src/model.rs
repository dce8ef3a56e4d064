use crate::error::VaultError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

pub type UserId = i64;
pub type TrackId = i64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TrackStatus {
    Active,
    Pending,
    Available,
    Revealed,
}

impl TrackStatus {
    pub const ALL: [TrackStatus; 4] = [
        TrackStatus::Active,
        TrackStatus::Pending,
        TrackStatus::Available,
        TrackStatus::Revealed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TrackStatus::Active => "active",
            TrackStatus::Pending => "pending",
            TrackStatus::Available => "available",
            TrackStatus::Revealed => "revealed",
        }
    }
}

impl fmt::Display for TrackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackStatus {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(TrackStatus::Active),
            "pending" => Ok(TrackStatus::Pending),
            "available" => Ok(TrackStatus::Available),
            "revealed" => Ok(TrackStatus::Revealed),
            other => Err(VaultError::Validation(format!("unknown track status '{other}'"))),
        }
    }
}

/// A piece of music as the external provider describes it. Shared by every
/// user's locked copy of the same external id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackMetadata {
    pub id: i64,
    pub external_id: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub preview_url: Option<String>,
    pub image_url: Option<String>,
    pub release_date: Option<String>,
}

/// Client-supplied description used to get-or-create a `TrackMetadata` row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewTrackMetadata {
    pub external_id: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    #[serde(default)]
    pub preview_url: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub release_date: Option<String>,
}

impl NewTrackMetadata {
    /// Trims every field, turns blank optionals into `None` and rejects
    /// missing required fields or malformed URLs.
    pub fn normalized(self) -> Result<Self, VaultError> {
        let required = |name: &str, value: String| {
            let value = value.trim().to_string();
            if value.is_empty() {
                Err(VaultError::Validation(format!("{name} is required")))
            } else {
                Ok(value)
            }
        };

        let normalized = Self {
            external_id: required("external_id", self.external_id)?,
            title: required("title", self.title)?,
            artist: required("artist", self.artist)?,
            album: required("album", self.album)?,
            preview_url: optional_url("preview_url", self.preview_url)?,
            image_url: optional_url("image_url", self.image_url)?,
            release_date: blank_to_none(self.release_date),
        };

        if let Some(date) = &normalized.release_date {
            if date.len() > 10 {
                return Err(VaultError::Validation(format!(
                    "release_date '{date}' is longer than YYYY-MM-DD"
                )));
            }
        }

        Ok(normalized)
    }
}

fn blank_to_none(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn optional_url(name: &str, value: Option<String>) -> Result<Option<String>, VaultError> {
    let Some(raw) = blank_to_none(value) else {
        return Ok(None);
    };
    match Url::parse(&raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(Some(raw)),
        _ => Err(VaultError::Validation(format!("{name} must be an http(s) URL"))),
    }
}

/// One user's locked instance of a piece of music.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Track {
    pub id: TrackId,
    pub user_id: UserId,
    pub metadata: TrackMetadata,
    pub status: TrackStatus,
    pub locked_at: Option<DateTime<Utc>>,
    pub available_at: Option<DateTime<Utc>>,
    pub revealed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// The complete set of fields a lifecycle transition may write. The store
/// applies a patch verbatim; nothing else on a track row is mutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackPatch {
    pub status: TrackStatus,
    pub locked_at: Option<DateTime<Utc>>,
    pub available_at: Option<DateTime<Utc>>,
    pub revealed_at: Option<DateTime<Utc>>,
}

impl TrackPatch {
    /// Patch that leaves `track` exactly as it is.
    pub fn unchanged(track: &Track) -> Self {
        Self {
            status: track.status,
            locked_at: track.locked_at,
            available_at: track.available_at,
            revealed_at: track.revealed_at,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackFilter {
    pub status: Option<TrackStatus>,
    pub limit: Option<usize>,
}

/// Cached provider access token pair. One per user.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub user_id: UserId,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user_id", &self.user_id)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlaylistPreference {
    pub user_id: UserId,
    pub playlist_id: String,
    pub playlist_name: String,
    pub updated_at: DateTime<Utc>,
}
