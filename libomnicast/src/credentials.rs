//! Credential cache with proactive token refresh
//!
//! Tokens are read through [`CredentialCache::get_valid_token`], which
//! refreshes the access token when it is within the refresh margin of its
//! expiry. The database row is the source of truth; the in-memory map only
//! saves a round trip. Writes are last-write-wins.

use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::api::{TokenApi, TokenGrant};
use crate::db::Database;
use crate::error::{OmnicastError, PlatformError, Result};
use crate::types::{Credential, Destination};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Ok,
    Expired,
}

/// Result of a cheap authorization check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthCheck {
    pub status: AuthStatus,
    /// How long the current authorization remains usable
    pub retry_after: Option<Duration>,
}

impl AuthCheck {
    pub fn expired() -> Self {
        Self {
            status: AuthStatus::Expired,
            retry_after: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == AuthStatus::Ok
    }
}

type CacheKey = (String, Destination);

pub struct CredentialCache {
    db: Database,
    token_apis: HashMap<Destination, Arc<dyn TokenApi>>,
    refresh_margin: Duration,
    cache: RwLock<HashMap<CacheKey, Arc<Credential>>>,
    refresh_lock: Mutex<()>,
}

impl CredentialCache {
    pub fn new(db: Database, refresh_margin: Duration) -> Self {
        Self {
            db,
            token_apis: HashMap::new(),
            refresh_margin,
            cache: RwLock::new(HashMap::new()),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Register the refresh endpoint for a destination
    pub fn with_token_api(mut self, destination: Destination, api: Arc<dyn TokenApi>) -> Self {
        self.token_apis.insert(destination, api);
        self
    }

    /// An access token that stays valid for at least the refresh margin
    pub async fn get_valid_token(&self, account_id: &str, destination: Destination) -> Result<SecretString> {
        let credential = self.load(account_id, destination).await?;
        if credential.remaining_secs(now()) > self.margin_secs() {
            return Ok(credential.access_token());
        }

        debug!(account_id, destination = %destination, "Access token within refresh margin");
        self.refresh(account_id, destination, None).await
    }

    /// Refresh after the destination rejected `rejected` with 401
    ///
    /// If another caller already replaced that token, the replacement is
    /// returned without another refresh.
    pub async fn force_refresh(
        &self,
        account_id: &str,
        destination: Destination,
        rejected: &SecretString,
    ) -> Result<SecretString> {
        self.invalidate(account_id, destination).await;
        self.refresh(account_id, destination, Some(rejected)).await
    }

    async fn refresh(
        &self,
        account_id: &str,
        destination: Destination,
        rejected: Option<&SecretString>,
    ) -> Result<SecretString> {
        let _guard = self.refresh_lock.lock().await;
        let now = now();

        // Re-read under the lock: a concurrent caller may have refreshed already
        let current = self
            .db
            .get_credential(account_id, destination)
            .await?
            .ok_or_else(|| auth_expired(account_id, destination))?;

        let replaced = rejected.map_or(true, |token| {
            token.expose_secret() != current.access_token.expose_secret()
        });
        if replaced && current.remaining_secs(now) > self.margin_secs() {
            let token = current.access_token();
            self.remember(Arc::new(current)).await;
            return Ok(token);
        }

        if !current.can_refresh(now) {
            warn!(account_id, destination = %destination, "No usable refresh token");
            return Err(auth_expired(account_id, destination));
        }

        let api = self
            .token_apis
            .get(&destination)
            .ok_or_else(|| auth_expired(account_id, destination))?;

        let refresh_token = current
            .refresh_token
            .as_ref()
            .ok_or_else(|| auth_expired(account_id, destination))?;

        let grant = match api.refresh_token(refresh_token).await {
            Ok(grant) => grant,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                warn!(account_id, destination = %destination, error = %e, "Token refresh failed");
                return Err(auth_expired(account_id, destination));
            }
        };

        let kept_refresh = current
            .refresh_token
            .as_ref()
            .map(|t| t.expose_secret().to_string());
        let credential = credential_from_grant(account_id, destination, grant, kept_refresh, now);
        self.db.upsert_credential(&credential).await?;
        let token = credential.access_token();
        self.remember(Arc::new(credential)).await;

        info!(account_id, destination = %destination, "Access token refreshed");
        Ok(token)
    }

    /// Run `op` with a valid token; on a 401 refresh once and run it again
    pub async fn with_token<T, F, Fut>(&self, account_id: &str, destination: Destination, op: F) -> Result<T>
    where
        F: Fn(SecretString) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let token = self.get_valid_token(account_id, destination).await?;
        let rejected = SecretString::from(token.expose_secret().to_string());

        match op(token).await {
            Err(OmnicastError::Platform(PlatformError::Authentication(message))) => {
                warn!(account_id, destination = %destination, %message, "Token rejected, refreshing once");
                let token = self.force_refresh(account_id, destination, &rejected).await?;
                op(token).await
            }
            other => other,
        }
    }

    /// Store a fresh grant from an authorization flow
    pub async fn store_grant(&self, account_id: &str, destination: Destination, grant: TokenGrant) -> Result<()> {
        let credential = credential_from_grant(account_id, destination, grant, None, now());
        self.db.upsert_credential(&credential).await?;
        self.remember(Arc::new(credential)).await;
        Ok(())
    }

    /// Drop the in-memory copy; the next read goes to the database
    pub async fn invalidate(&self, account_id: &str, destination: Destination) {
        self.cache
            .write()
            .await
            .remove(&(account_id.to_string(), destination));
    }

    /// Forget the credential entirely. Returns false if none was stored.
    pub async fn revoke(&self, account_id: &str, destination: Destination) -> Result<bool> {
        self.invalidate(account_id, destination).await;
        self.db.delete_credential(account_id, destination).await
    }

    /// Is there an authorization that works now or can be refreshed?
    pub async fn auth_status(&self, account_id: &str, destination: Destination) -> Result<AuthCheck> {
        let credential = match self.load(account_id, destination).await {
            Ok(credential) => credential,
            Err(OmnicastError::Platform(PlatformError::AuthExpired { .. })) => {
                return Ok(AuthCheck::expired())
            }
            Err(e) => return Err(e),
        };

        let now = now();
        let remaining = credential.remaining_secs(now);
        if remaining > 0 {
            return Ok(AuthCheck {
                status: AuthStatus::Ok,
                retry_after: Some(Duration::from_secs(remaining as u64)),
            });
        }

        if credential.can_refresh(now) && self.token_apis.contains_key(&destination) {
            return Ok(AuthCheck {
                status: AuthStatus::Ok,
                retry_after: credential
                    .refresh_expires_at
                    .map(|at| Duration::from_secs((at - now).max(0) as u64)),
            });
        }

        Ok(AuthCheck::expired())
    }

    async fn load(&self, account_id: &str, destination: Destination) -> Result<Arc<Credential>> {
        let key = (account_id.to_string(), destination);
        if let Some(credential) = self.cache.read().await.get(&key) {
            return Ok(credential.clone());
        }

        let credential = self
            .db
            .get_credential(account_id, destination)
            .await?
            .ok_or_else(|| auth_expired(account_id, destination))?;
        let credential = Arc::new(credential);
        self.remember(credential.clone()).await;
        Ok(credential)
    }

    async fn remember(&self, credential: Arc<Credential>) {
        let key = (credential.account_id.clone(), credential.destination);
        self.cache.write().await.insert(key, credential);
    }

    fn margin_secs(&self) -> i64 {
        self.refresh_margin.as_secs() as i64
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn auth_expired(account_id: &str, destination: Destination) -> OmnicastError {
    PlatformError::AuthExpired {
        destination: destination.to_string(),
        account_id: account_id.to_string(),
    }
    .into()
}

fn credential_from_grant(
    account_id: &str,
    destination: Destination,
    grant: TokenGrant,
    previous_refresh: Option<String>,
    now: i64,
) -> Credential {
    Credential {
        account_id: account_id.to_string(),
        destination,
        access_token: SecretString::from(grant.access_token),
        refresh_token: grant
            .refresh_token
            .or(previous_refresh)
            .map(SecretString::from),
        expires_at: now + grant.expires_in,
        refresh_expires_at: grant.refresh_expires_in.map(|secs| now + secs),
        updated_at: now,
    }
}
