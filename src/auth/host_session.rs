use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::Token;
use crate::error::AuthError;
use crate::util::jwt::expiry_from_jwt;

/// A session owned by some other signed-in tool on this machine.
#[async_trait]
pub trait HostSession: Send + Sync {
    /// With `interactive == false` this must never prompt; `Ok(None)` means
    /// no session exists.
    async fn session(&self, interactive: bool) -> Result<Option<Token>, AuthError>;
}

/// Borrows the Azure CLI's signed-in account.
pub struct AzureCliSession {
    program: String,
    resource: String,
}

impl AzureCliSession {
    pub fn new(resource: String) -> Self {
        Self {
            program: "az".into(),
            resource,
        }
    }

    async fn login(&self) -> Result<(), AuthError> {
        // stdout carries tool output in serve mode; the CLI's prompts go to stderr.
        let status = tokio::process::Command::new(&self.program)
            .args(["login", "--allow-no-subscriptions", "--output", "none"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| AuthError::Provider(format!("Failed to run {} login: {e}", self.program)))?;
        if !status.success() {
            return Err(AuthError::Provider(format!(
                "{} login exited with {status}",
                self.program
            )));
        }
        Ok(())
    }

    async fn current_token(&self) -> Result<Option<Token>, AuthError> {
        let output = match tokio::process::Command::new(&self.program)
            .args([
                "account",
                "get-access-token",
                "--resource",
                &self.resource,
                "--output",
                "json",
            ])
            .stdin(Stdio::null())
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("azure cli not installed; no host session");
                return Ok(None);
            }
            Err(e) => {
                return Err(AuthError::Provider(format!(
                    "Failed to run {}: {e}",
                    self.program
                )))
            }
        };

        if !output.status.success() {
            // Not signed in, or consent missing. stderr never carries the token.
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::debug!(stderr = %stderr.trim(), "azure cli has no usable session");
            return Ok(None);
        }

        parse_cli_token(&output.stdout, Utc::now()).map(Some)
    }
}

#[async_trait]
impl HostSession for AzureCliSession {
    async fn session(&self, interactive: bool) -> Result<Option<Token>, AuthError> {
        if interactive {
            self.login().await?;
        }
        self.current_token().await
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliToken {
    access_token: String,
    #[serde(rename = "expires_on")]
    expires_on_epoch: Option<i64>,
}

/// Decode `az account get-access-token` output. Expiry prefers the epoch
/// field, then the JWT `exp` claim, then one hour from `now`.
pub(crate) fn parse_cli_token(stdout: &[u8], now: DateTime<Utc>) -> Result<Token, AuthError> {
    let parsed: CliToken = serde_json::from_slice(stdout)
        .map_err(|e| {
            AuthError::Provider(format!(
                "unexpected azure cli output ({:?} error at line {} column {})",
                e.classify(),
                e.line(),
                e.column()
            ))
        })?;
    if parsed.access_token.is_empty() {
        return Err(AuthError::Provider(
            "azure cli returned an empty access token".into(),
        ));
    }
    let expires_on = parsed
        .expires_on_epoch
        .and_then(|epoch| DateTime::from_timestamp(epoch, 0))
        .or_else(|| expiry_from_jwt(&parsed.access_token))
        .unwrap_or_else(|| Token::default_expiry(now));
    Ok(Token::new(parsed.access_token, expires_on))
}
