pub mod config;
pub mod error;
pub mod model;
pub mod urls;

pub use config::{AppConfig, LockConfig, SpotifyConfig, SweepConfig};
pub use error::{Resource, Result, VaultError};
pub use model::{
    Credential, NewTrackMetadata, PlaylistPreference, Track, TrackFilter, TrackId, TrackMetadata,
    TrackPatch, TrackStatus, UserId,
};
