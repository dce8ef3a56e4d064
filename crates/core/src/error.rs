use crate::model::{TrackId, TrackStatus};
use std::fmt;
use thiserror::Error;

/// What a `NotFound` error was looking for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Track(TrackId),
    Metadata(i64),
    Credential,
    PlaylistPreference,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Track(id) => write!(f, "track {id}"),
            Resource::Metadata(id) => write!(f, "track metadata {id}"),
            Resource::Credential => f.write_str("provider credential"),
            Resource::PlaylistPreference => f.write_str("playlist preference"),
        }
    }
}

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("cannot {action} a track that is {from}")]
    InvalidTransition {
        from: TrackStatus,
        action: &'static str,
    },

    #[error("{0}")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(Resource),

    #[error("provider request failed: {0}")]
    UpstreamFailure(String),

    #[error("provider credential could not be refreshed: {0}")]
    CredentialInvalid(String),

    #[error("{0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl VaultError {
    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            VaultError::InvalidTransition { .. } => "invalid_transition",
            VaultError::Conflict(_) => "conflict",
            VaultError::NotFound(_) => "not_found",
            VaultError::UpstreamFailure(_) => "upstream_failure",
            VaultError::CredentialInvalid(_) => "credential_invalid",
            VaultError::Validation(_) => "validation",
            VaultError::Storage(_) => "storage",
        }
    }

    pub fn upstream(err: impl fmt::Display) -> Self {
        VaultError::UpstreamFailure(err.to_string())
    }
}

pub type Result<T, E = VaultError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::{Resource, VaultError};
    use crate::model::TrackStatus;

    #[test]
    fn messages_name_the_offending_state() {
        let err = VaultError::InvalidTransition {
            from: TrackStatus::Revealed,
            action: "reveal",
        };
        assert_eq!(err.to_string(), "cannot reveal a track that is revealed");
        assert_eq!(err.kind(), "invalid_transition");

        let missing = VaultError::NotFound(Resource::Track(42));
        assert_eq!(missing.to_string(), "track 42 not found");
    }
}
