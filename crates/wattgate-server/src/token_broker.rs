//! Shared machine credential for the metering upstream.
//!
//! One credential row exists per scope. It is created on first demand and
//! replaced wholesale once expired. Within one process, a refresh lock makes
//! concurrent callers wait for a single issuance. Across processes, the
//! storage uniqueness constraint (insert) or the expiry compare-and-swap
//! (replace) picks the winner, and the loser re-reads the winner's row once.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use wattgate_core::{Credential, DynCredentialStorage, NewCredential, StorageError};

use crate::metrics;
use crate::upstream::UpstreamError;

/// Something that can mint a fresh shared credential.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    /// Identifier of the credential row this issuer fills.
    fn scope(&self) -> &str;

    async fn issue(&self) -> Result<NewCredential, UpstreamError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("credential issuance failed: {0}")]
    Issuance(#[from] UpstreamError),

    #[error("credential storage failed: {0}")]
    Storage(#[from] StorageError),

    /// Lost the race to another writer and its row was not usable either.
    #[error("concurrent refresh of scope '{0}' left no valid credential")]
    ConflictUnresolved(String),
}

pub struct TokenBroker {
    storage: DynCredentialStorage,
    issuer: Arc<dyn CredentialIssuer>,
    refresh_lock: Mutex<()>,
}

impl std::fmt::Debug for TokenBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBroker")
            .field("scope", &self.issuer.scope())
            .finish_non_exhaustive()
    }
}

impl TokenBroker {
    pub fn new(storage: DynCredentialStorage, issuer: Arc<dyn CredentialIssuer>) -> Self {
        Self {
            storage,
            issuer,
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn scope(&self) -> &str {
        self.issuer.scope()
    }

    /// Returns a bearer token that is valid right now.
    pub async fn get_valid_token(&self) -> Result<String, TokenError> {
        self.get_valid_credential()
            .await
            .map(|credential| credential.access_token)
    }

    #[instrument(skip(self), fields(scope = %self.scope()))]
    pub async fn get_valid_credential(&self) -> Result<Credential, TokenError> {
        let scope = self.issuer.scope();

        if let Some(credential) = self.storage.find_credential(scope).await?
            && credential.is_valid_at(Utc::now())
        {
            return Ok(credential);
        }

        let _guard = self.refresh_lock.lock().await;

        // Another task may have refreshed while this one waited.
        let existing = self.storage.find_credential(scope).await?;
        if let Some(credential) = &existing
            && credential.is_valid_at(Utc::now())
        {
            debug!("credential refreshed by a concurrent caller");
            return Ok(credential.clone());
        }

        let fresh = self.issuer.issue().await.inspect_err(|e| {
            warn!(error = %e, "shared credential issuance failed");
        })?;
        metrics::record_token_issued(scope);

        let stored = match existing {
            None => match self.storage.insert_credential(&fresh).await {
                Ok(credential) => Some(credential),
                Err(e) if e.is_already_exists() => None,
                Err(e) => return Err(e.into()),
            },
            Some(expired) => {
                self.storage
                    .replace_credential(expired.expires_at, &fresh)
                    .await?
            }
        };

        match stored {
            Some(credential) => {
                info!(expires_at = %credential.expires_at, "shared credential stored");
                Ok(credential)
            }
            None => {
                metrics::record_token_conflict(scope);
                debug!("lost credential race, using the winner's row");
                self.reread_winner(scope).await
            }
        }
    }

    async fn reread_winner(&self, scope: &str) -> Result<Credential, TokenError> {
        match self.storage.find_credential(scope).await? {
            Some(credential) if credential.is_valid_at(Utc::now()) => Ok(credential),
            _ => Err(TokenError::ConflictUnresolved(scope.to_string())),
        }
    }
}
