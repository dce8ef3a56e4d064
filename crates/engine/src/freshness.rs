use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use vault_core::{Credential, Resource, Result, UserId, VaultError};
use vault_providers::{MusicProvider, TokenGrant};
use vault_store::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected { expires_at: DateTime<Utc> },
    NotConnected,
}

/// Keeps each user's provider credential usable.
///
/// Two failure policies apply to a refresh that the provider rejects:
/// operations that need a token (`ensure_valid`) report `CredentialInvalid`
/// and leave the row alone, while the passive `status` check deletes it so
/// the user is shown as disconnected and asked to reconnect.
pub struct CredentialGuard {
    store: Store,
    provider: Arc<dyn MusicProvider>,
}

impl CredentialGuard {
    pub fn new(store: Store, provider: Arc<dyn MusicProvider>) -> Self {
        Self { store, provider }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub fn authorize_url(&self, state: &str) -> String {
        self.provider.authorize_url(state)
    }

    /// Exchanges an authorization code and stores the resulting credential,
    /// replacing any previous one for the user.
    pub async fn connect(&self, user_id: UserId, code: &str, now: DateTime<Utc>) -> Result<Credential> {
        let code = code.trim();
        if code.is_empty() {
            return Err(VaultError::Validation("authorization code is required".to_string()));
        }
        let grant = self
            .provider
            .exchange_code(code)
            .await
            .map_err(VaultError::upstream)?;
        let Some(refresh_token) = grant.refresh_token.clone() else {
            return Err(VaultError::UpstreamFailure(
                "token exchange returned no refresh token".to_string(),
            ));
        };

        let credential = Credential {
            user_id,
            expires_at: expiry(now, grant.expires_in)?,
            access_token: grant.access_token,
            refresh_token,
        };
        self.store.save_credential(&credential)?;
        info!(user_id, provider = self.provider.name(), "provider account connected");
        Ok(credential)
    }

    /// Returns a credential whose access token is unexpired at `now`,
    /// refreshing it first if needed. Makes no provider call otherwise.
    pub async fn ensure_valid(&self, user_id: UserId, now: DateTime<Utc>) -> Result<Credential> {
        let credential = self
            .store
            .get_credential(user_id)?
            .ok_or(VaultError::NotFound(Resource::Credential))?;
        if !credential.is_expired(now) {
            return Ok(credential);
        }

        match self.refresh(&credential, now).await {
            Ok(refreshed) => Ok(refreshed),
            Err(RefreshError::Rejected(reason)) => {
                warn!(user_id, %reason, "token refresh rejected");
                Err(VaultError::CredentialInvalid(reason))
            }
            Err(RefreshError::Vault(err)) => Err(err),
        }
    }

    /// Passive check. An expired token is refreshed; if the provider rejects
    /// the refresh the stored credential is removed.
    pub async fn status(&self, user_id: UserId, now: DateTime<Utc>) -> Result<ConnectionStatus> {
        let Some(credential) = self.store.get_credential(user_id)? else {
            return Ok(ConnectionStatus::NotConnected);
        };
        if !credential.is_expired(now) {
            return Ok(ConnectionStatus::Connected {
                expires_at: credential.expires_at,
            });
        }

        match self.refresh(&credential, now).await {
            Ok(refreshed) => Ok(ConnectionStatus::Connected {
                expires_at: refreshed.expires_at,
            }),
            Err(RefreshError::Rejected(reason)) => {
                warn!(user_id, %reason, "token refresh rejected, dropping credential");
                self.store.delete_credential(user_id)?;
                Ok(ConnectionStatus::NotConnected)
            }
            Err(RefreshError::Vault(VaultError::NotFound(_))) => Ok(ConnectionStatus::NotConnected),
            Err(RefreshError::Vault(err)) => Err(err),
        }
    }

    /// Revokes upstream on a best-effort basis, then always forgets the
    /// credential locally.
    pub async fn disconnect(&self, user_id: UserId) -> Result<()> {
        let credential = self
            .store
            .get_credential(user_id)?
            .ok_or(VaultError::NotFound(Resource::Credential))?;

        if let Err(err) = self.provider.revoke(&credential.access_token).await {
            warn!(user_id, error = %err, "token revocation failed, removing credential anyway");
        }
        self.store.delete_credential(user_id)?;
        info!(user_id, "provider account disconnected");
        Ok(())
    }

    async fn refresh(
        &self,
        credential: &Credential,
        now: DateTime<Utc>,
    ) -> Result<Credential, RefreshError> {
        let grant = self
            .provider
            .refresh_token(&credential.refresh_token)
            .await
            .map_err(|err| RefreshError::Rejected(err.to_string()))?;
        let refreshed = refreshed_credential(credential, grant, now)?;

        if self
            .store
            .replace_tokens(&refreshed, &credential.refresh_token)?
        {
            info!(user_id = credential.user_id, expires_at = %refreshed.expires_at, "access token refreshed");
            return Ok(refreshed);
        }

        // Another refresh or a disconnect won the race; the stored row is
        // authoritative.
        self.store
            .get_credential(credential.user_id)?
            .ok_or(RefreshError::Vault(VaultError::NotFound(Resource::Credential)))
    }
}

/// Absolute expiry for a token granted at `now`. A lifetime that is negative
/// or out of range is the provider's fault.
fn expiry(now: DateTime<Utc>, expires_in: i64) -> Result<DateTime<Utc>> {
    let lifetime = if expires_in >= 0 {
        Duration::try_seconds(expires_in)
    } else {
        None
    };
    lifetime
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or_else(|| {
            VaultError::UpstreamFailure(format!("provider granted a token with expires_in={expires_in}"))
        })
}

fn refreshed_credential(
    previous: &Credential,
    grant: TokenGrant,
    now: DateTime<Utc>,
) -> Result<Credential> {
    Ok(Credential {
        user_id: previous.user_id,
        expires_at: expiry(now, grant.expires_in)?,
        access_token: grant.access_token,
        refresh_token: grant
            .refresh_token
            .unwrap_or_else(|| previous.refresh_token.clone()),
    })
}

enum RefreshError {
    Rejected(String),
    Vault(VaultError),
}

impl From<VaultError> for RefreshError {
    fn from(err: VaultError) -> Self {
        RefreshError::Vault(err)
    }
}
