pub mod freshness;
pub mod lifecycle;
pub mod music;
pub mod sweep;
pub mod tracks;

pub use freshness::{ConnectionStatus, CredentialGuard};
pub use music::MusicService;
pub use tracks::{AvailableTrack, AvailableTracks, LockWindow, TrackService};
