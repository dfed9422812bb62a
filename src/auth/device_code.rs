use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::Token;
use crate::error::AuthError;
use crate::util::text::truncate_chars;

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);

/// What the user needs to finish a device-code sign-in elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationPrompt {
    pub verification_uri: String,
    pub user_code: String,
    pub expires_in_secs: u64,
}

impl VerificationPrompt {
    pub fn expires_in_minutes(&self) -> u64 {
        self.expires_in_secs / 60
    }

    pub fn instructions(&self) -> String {
        format!(
            "To sign in to Azure DevOps:\n\n1. Go to: {}\n2. Enter code: {}\n\nThis code expires in {} minutes.",
            self.verification_uri,
            self.user_code,
            self.expires_in_minutes()
        )
    }
}

/// A device-code sign-in running on its own task.
///
/// `verification` yields once, before the flow can complete. Sending `true`
/// on `cancel`, or dropping it, makes the task give up with
/// [`AuthError::Cancelled`].
pub struct DeviceCodeAcquisition {
    pub verification: oneshot::Receiver<VerificationPrompt>,
    pub cancel: watch::Sender<bool>,
    pub task: JoinHandle<Result<Token, AuthError>>,
}

impl DeviceCodeAcquisition {
    pub fn spawn<F, Fut>(flow: F) -> Self
    where
        F: FnOnce(oneshot::Sender<VerificationPrompt>, watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = Result<Token, AuthError>> + Send + 'static,
    {
        let (prompt_tx, prompt_rx) = oneshot::channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(flow(prompt_tx, cancel_rx));
        Self {
            verification: prompt_rx,
            cancel: cancel_tx,
            task,
        }
    }
}

#[async_trait]
pub trait DeviceCodeFlow: Send + Sync {
    /// Redeem the provider's cached account without user interaction.
    async fn refresh_silent(&self) -> Result<Option<Token>, AuthError>;

    fn start(&self) -> DeviceCodeAcquisition;

    /// Forget every cached account.
    async fn clear_accounts(&self) -> Result<(), AuthError>;
}

/// OAuth 2.0 device authorization grant against an Azure AD authority.
pub struct OAuthDeviceCodeFlow {
    inner: Arc<FlowInner>,
}

struct FlowInner {
    http: reqwest::Client,
    authority: String,
    client_id: String,
    scope: String,
    // Refresh token from the last grant; never persisted.
    account: Mutex<Option<String>>,
}

impl OAuthDeviceCodeFlow {
    pub fn new(http: reqwest::Client, authority: &str, client_id: &str, resource: &str) -> Self {
        Self {
            inner: Arc::new(FlowInner {
                http,
                authority: authority.trim_end_matches('/').to_string(),
                client_id: client_id.to_string(),
                scope: format!("{resource}/.default offline_access"),
                account: Mutex::new(None),
            }),
        }
    }
}

#[derive(Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    expires_in: u64,
    #[serde(default = "default_interval")]
    interval: u64,
}

fn default_interval() -> u64 {
    5
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
}

#[derive(Deserialize)]
struct OAuthErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

enum Poll {
    Granted(Token),
    Pending,
    SlowDown,
}

impl FlowInner {
    fn endpoint(&self, name: &str) -> String {
        format!("{}/oauth2/v2.0/{name}", self.authority)
    }

    async fn request_device_code(&self) -> Result<DeviceCodeResponse, AuthError> {
        let response = self
            .http
            .post(self.endpoint("devicecode"))
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("scope", self.scope.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AuthError::Provider(format!("device code request failed: {}", e.without_url())))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Provider(format!(
                "device code request failed: {status} {}",
                describe_oauth_error(&body)
            )));
        }
        response
            .json()
            .await
            .map_err(|e| AuthError::Provider(format!("unexpected device code response: {e}")))
    }

    async fn redeem(&self, params: &[(&str, &str)]) -> Result<Poll, AuthError> {
        let response = self
            .http
            .post(self.endpoint("token"))
            .form(params)
            .send()
            .await
            .map_err(|e| AuthError::Provider(format!("token request failed: {}", e.without_url())))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Provider(format!("token response unreadable: {e}")))?;

        if status.is_success() {
            let granted: TokenResponse = serde_json::from_str(&body)
                .map_err(|e| AuthError::Provider(format!("unexpected token response: {e}")))?;
            if let Some(refresh) = granted.refresh_token {
                if let Ok(mut account) = self.account.lock() {
                    *account = Some(refresh);
                }
            }
            let expires_on = match granted.expires_in {
                Some(secs) => Utc::now() + chrono::Duration::seconds(secs),
                None => Token::default_expiry(Utc::now()),
            };
            return Ok(Poll::Granted(Token::new(granted.access_token, expires_on)));
        }

        match serde_json::from_str::<OAuthErrorResponse>(&body) {
            Ok(err) => match err.error.as_str() {
                "authorization_pending" => Ok(Poll::Pending),
                "slow_down" => Ok(Poll::SlowDown),
                "authorization_declined" | "access_denied" => Err(AuthError::Declined),
                "expired_token" => Err(AuthError::Expired),
                _ => Err(AuthError::Provider(format!(
                    "token request failed: {status} {}",
                    describe_oauth_error(&body)
                ))),
            },
            Err(_) => Err(AuthError::Provider(format!(
                "token request failed: {status} {}",
                truncate_chars(&body, 200)
            ))),
        }
    }

    async fn poll_for_token(
        &self,
        code: &DeviceCodeResponse,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<Token, AuthError> {
        let deadline = Instant::now() + Duration::from_secs(code.expires_in);
        let mut interval = Duration::from_secs(code.interval);
        let params = [
            ("grant_type", DEVICE_CODE_GRANT),
            ("client_id", self.client_id.as_str()),
            ("device_code", code.device_code.as_str()),
        ];
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        return Err(AuthError::Cancelled);
                    }
                    continue;
                }
            }
            if Instant::now() >= deadline {
                return Err(AuthError::Expired);
            }
            match self.redeem(&params).await? {
                Poll::Granted(token) => return Ok(token),
                Poll::Pending => {}
                Poll::SlowDown => interval += SLOW_DOWN_STEP,
            }
        }
    }
}

// Only the error code and description; the raw body is never surfaced.
fn describe_oauth_error(body: &str) -> String {
    match serde_json::from_str::<OAuthErrorResponse>(body) {
        Ok(err) => {
            let description = err
                .error_description
                .as_deref()
                .and_then(|d| d.lines().next())
                .unwrap_or_default();
            let summary = format!("{} {description}", err.error);
            truncate_chars(summary.trim(), 200)
        }
        Err(_) => truncate_chars(body, 200),
    }
}

#[async_trait]
impl DeviceCodeFlow for OAuthDeviceCodeFlow {
    async fn refresh_silent(&self) -> Result<Option<Token>, AuthError> {
        let refresh = match self.inner.account.lock() {
            Ok(account) => account.clone(),
            Err(_) => None,
        };
        let Some(refresh) = refresh else {
            return Ok(None);
        };
        let params = [
            ("grant_type", "refresh_token"),
            ("client_id", self.inner.client_id.as_str()),
            ("refresh_token", refresh.as_str()),
            ("scope", self.inner.scope.as_str()),
        ];
        match self.inner.redeem(&params).await? {
            Poll::Granted(token) => Ok(Some(token)),
            Poll::Pending | Poll::SlowDown => Ok(None),
        }
    }

    fn start(&self) -> DeviceCodeAcquisition {
        let inner = Arc::clone(&self.inner);
        DeviceCodeAcquisition::spawn(move |prompt_tx, cancel_rx| async move {
            let code = inner.request_device_code().await?;
            tracing::info!(
                expires_in_secs = code.expires_in,
                "device code issued; waiting for user authorization"
            );
            let _ = prompt_tx.send(VerificationPrompt {
                verification_uri: code.verification_uri.clone(),
                user_code: code.user_code.clone(),
                expires_in_secs: code.expires_in,
            });
            inner.poll_for_token(&code, cancel_rx).await
        })
    }

    async fn clear_accounts(&self) -> Result<(), AuthError> {
        let mut account = self
            .inner
            .account
            .lock()
            .map_err(|_| AuthError::Provider("account cache lock poisoned".into()))?;
        *account = None;
        Ok(())
    }
}
