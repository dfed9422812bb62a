use thiserror::Error;

/// Failures surfaced by the credential manager and its acquisition strategies.
///
/// Variants only ever carry message strings. Provider errors can embed tokens,
/// so they are reduced to their message before being wrapped here.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authentication cancelled by user")]
    Cancelled,
    #[error("no existing session is available")]
    NoSession,
    #[error("authorization was declined")]
    Declined,
    #[error("the device code expired before sign-in completed")]
    Expired,
    #[error("credential store error: {0}")]
    Store(String),
    #[error("{0}")]
    Provider(String),
}

impl AuthError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, AuthError::Cancelled | AuthError::Declined)
    }
}

#[derive(Debug, Error)]
pub enum AdoError {
    #[error("Organization URL not set. Run `ado-work set-org <url>` to configure your Azure DevOps organization first.")]
    Configuration,
    #[error("{0}")]
    Validation(String),
    #[error("Cannot {operation}: Readonly mode is enabled. Run `ado-work readonly off` to disable it.")]
    Readonly { operation: &'static str },
    #[error("Authentication failed: {0}")]
    Authentication(#[from] AuthError),
    #[error("Azure DevOps returned {status} while trying to {action}: {body}")]
    Remote {
        action: &'static str,
        status: u16,
        body: String,
    },
    #[error("request to {action} failed: {message}")]
    Transport {
        action: &'static str,
        message: String,
    },
    #[error("Unexpected response format from Azure DevOps API: {0}")]
    InvalidResponse(String),
}

impl AdoError {
    pub fn validation(message: impl Into<String>) -> Self {
        AdoError::Validation(message.into())
    }

    pub(crate) fn transport(action: &'static str, err: reqwest::Error) -> Self {
        // reqwest errors carry the URL but never request headers.
        AdoError::Transport {
            action,
            message: err.without_url().to_string(),
        }
    }
}

pub type AdoResult<T> = std::result::Result<T, AdoError>;
