pub mod device_code;
pub mod host_session;
pub mod prompt;
pub mod store;

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::AuthError;
use device_code::{DeviceCodeAcquisition, DeviceCodeFlow};
use host_session::HostSession;
use prompt::{Prompter, SignInMethod};
use store::SecretStore;

pub const SECRET_KEY: &str = "azureDevOpsToken";

/// Tokens closer than this many minutes to expiry are treated as expired.
pub const VALIDITY_MARGIN_MINUTES: i64 = 5;

/// A bearer token and the instant it stops working.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    access_token: String,
    expires_on: DateTime<Utc>,
}

impl Token {
    pub fn new(access_token: String, expires_on: DateTime<Utc>) -> Self {
        Self {
            access_token,
            expires_on,
        }
    }

    /// Providers that don't report an expiry get one hour.
    pub fn default_expiry(now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::hours(1)
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn expires_on(&self) -> DateTime<Utc> {
        self.expires_on
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now + Duration::minutes(VALIDITY_MARGIN_MINUTES) < self.expires_on
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// How far `get_token` may go when the cache can't answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Existing host session only; never prompts.
    Silent,
    /// Silent host session, then ask the user which interactive method to use.
    Auto,
    /// Interactive host sign-in.
    HostInteractive,
    /// Device-code flow, skipping the method choice.
    DeviceCode,
}

/// Anything that can hand out bearer tokens.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self, mode: AcquireMode) -> Result<String, AuthError>;

    /// `Authorization` header value for an API call.
    async fn bearer_header(&self) -> Result<String, AuthError> {
        let token = self.token(AcquireMode::Auto).await?;
        Ok(format!("Bearer {token}"))
    }
}

#[derive(Default)]
struct CacheState {
    loaded: bool,
    token: Option<Token>,
}

/// Owns the cached token and decides which acquisition strategy runs.
///
/// The cache lock is held for the whole read, validate, acquire and write
/// sequence, so concurrent callers that find the token expired wait for one
/// acquisition instead of each prompting the user.
pub struct CredentialManager {
    store: Arc<dyn SecretStore>,
    host: Arc<dyn HostSession>,
    device: Arc<dyn DeviceCodeFlow>,
    prompter: Arc<dyn Prompter>,
    cache: Mutex<CacheState>,
}

impl CredentialManager {
    pub fn new(
        store: Arc<dyn SecretStore>,
        host: Arc<dyn HostSession>,
        device: Arc<dyn DeviceCodeFlow>,
        prompter: Arc<dyn Prompter>,
    ) -> Self {
        Self {
            store,
            host,
            device,
            prompter,
            cache: Mutex::new(CacheState::default()),
        }
    }

    pub async fn get_token(&self, mode: AcquireMode) -> Result<String, AuthError> {
        let mut cache = self.cache.lock().await;
        if let Some(token) = self.valid_cached(&mut cache).await {
            return Ok(token.access_token);
        }

        let token = match self.acquire(mode).await {
            Ok(token) => token,
            Err(err) if err.is_cancellation() => {
                tracing::info!(?mode, error = %err, "sign-in abandoned");
                return Err(err);
            }
            Err(err) => {
                tracing::warn!(?mode, error = %err, "token acquisition failed");
                return Err(err);
            }
        };
        tracing::info!(?mode, expires_on = %token.expires_on, "acquired Azure DevOps token");
        self.remember(&mut cache, token.clone()).await;
        Ok(token.access_token)
    }

    /// Valid cache, or an existing host session. Never prompts and never
    /// changes the cache.
    pub async fn is_authenticated(&self) -> bool {
        {
            let mut cache = self.cache.lock().await;
            if self.valid_cached(&mut cache).await.is_some() {
                return true;
            }
        }
        match self.host.session(false).await {
            Ok(session) => session.is_some(),
            Err(err) => {
                tracing::debug!(error = %err, "host session probe failed");
                false
            }
        }
    }

    /// Forget the cached token everywhere. Cleanup failures are logged and
    /// otherwise ignored, so calling this twice is harmless.
    pub async fn sign_out(&self) {
        let mut cache = self.cache.lock().await;
        cache.token = None;
        cache.loaded = true;

        if let Err(err) = self.store.delete(SECRET_KEY).await {
            tracing::warn!(error = %err, "failed to delete stored token");
        }
        if let Err(err) = self.device.clear_accounts().await {
            tracing::warn!(error = %err, "failed to clear cached accounts");
        }
        tracing::info!("signed out of Azure DevOps");
    }

    async fn valid_cached(&self, cache: &mut CacheState) -> Option<Token> {
        if !cache.loaded {
            cache.token = self.load_stored().await;
            cache.loaded = true;
        }
        cache
            .token
            .as_ref()
            .filter(|token| token.is_valid_at(Utc::now()))
            .cloned()
    }

    async fn load_stored(&self) -> Option<Token> {
        let raw = match self.store.get(SECRET_KEY).await {
            Ok(raw) => raw?,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read stored token");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(token) => Some(token),
            Err(err) => {
                // The message can quote the input, so only the position is logged.
                tracing::warn!(
                    line = err.line(),
                    column = err.column(),
                    "ignoring unreadable stored token"
                );
                None
            }
        }
    }

    // Persisting is best effort: the caller already has a working token.
    async fn remember(&self, cache: &mut CacheState, token: Token) {
        let persisted = serde_json::to_string(&token)
            .map_err(|e| AuthError::Store(e.to_string()));
        cache.token = Some(token);
        cache.loaded = true;
        let result = match persisted {
            Ok(json) => self.store.set(SECRET_KEY, &json).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            tracing::warn!(error = %err, "failed to persist token; keeping it in memory only");
        }
    }

    async fn acquire(&self, mode: AcquireMode) -> Result<Token, AuthError> {
        match mode {
            AcquireMode::Silent => self.host_silent().await.ok_or(AuthError::NoSession),
            AcquireMode::Auto => {
                if let Some(token) = self.host_silent().await {
                    return Ok(token);
                }
                match self.prompter.choose_sign_in_method().await {
                    Some(SignInMethod::HostSession) => self.host_interactive().await,
                    Some(SignInMethod::DeviceCode) => self.device_code().await,
                    None => Err(AuthError::Cancelled),
                }
            }
            AcquireMode::HostInteractive => self.host_interactive().await,
            AcquireMode::DeviceCode => self.device_code().await,
        }
    }

    async fn host_silent(&self) -> Option<Token> {
        match self.host.session(false).await {
            Ok(token) => token,
            Err(err) => {
                tracing::debug!(error = %err, "silent host session failed");
                None
            }
        }
    }

    async fn host_interactive(&self) -> Result<Token, AuthError> {
        let session = tokio::select! {
            session = self.host.session(true) => session?,
            _ = self.prompter.cancelled() => return Err(AuthError::Cancelled),
        };
        session.ok_or_else(|| {
            AuthError::Provider("Failed to acquire access token via host session".into())
        })
    }

    async fn device_code(&self) -> Result<Token, AuthError> {
        match self.device.refresh_silent().await {
            Ok(Some(token)) => return Ok(token),
            Ok(None) => {}
            Err(err) => {
                tracing::debug!(error = %err, "silent refresh failed, using device code flow");
            }
        }

        let DeviceCodeAcquisition {
            verification,
            cancel,
            task,
        } = self.device.start();
        let flow = async {
            let mut task = task;
            tokio::select! {
                prompt = verification => {
                    if let Ok(prompt) = prompt {
                        self.prompter.show_verification(&prompt).await;
                    }
                }
                joined = &mut task => return flatten_join(joined),
            }
            flatten_join(task.await)
        };
        tokio::select! {
            result = flow => result,
            _ = self.prompter.cancelled() => {
                let _ = cancel.send(true);
                Err(AuthError::Cancelled)
            }
        }
    }
}

fn flatten_join(
    joined: Result<Result<Token, AuthError>, tokio::task::JoinError>,
) -> Result<Token, AuthError> {
    joined.unwrap_or_else(|e| Err(AuthError::Provider(format!("device code task failed: {e}"))))
}

#[async_trait]
impl TokenSource for CredentialManager {
    async fn token(&self, mode: AcquireMode) -> Result<String, AuthError> {
        self.get_token(mode).await
    }
}
