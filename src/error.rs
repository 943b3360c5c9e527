//! Error taxonomy shared by the key store, the secret sinks and the rotation engine.

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

/// Failure of a single call to an external collaborator (IAM, GitHub, Secret Manager).
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("quota exceeded: {0}")]
    Quota(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("encoding error: {0}")]
    Encoding(String),
}

#[derive(Debug, Deserialize)]
struct GoogleErrorBody {
    error: GoogleErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GoogleErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

impl ProviderError {
    /// Classify a non-success HTTP response.
    ///
    /// Google APIs put a canonical code in `error.status`; it takes precedence
    /// over the HTTP status where the two disagree (IAM reports the per-account
    /// key limit as `FAILED_PRECONDITION`, for instance).
    pub fn from_response(status: StatusCode, body: &str) -> Self {
        let google = serde_json::from_str::<GoogleErrorBody>(body).ok();
        let message = match &google {
            Some(b) if !b.error.message.is_empty() => format!("{}: {}", status, b.error.message),
            _ if body.trim().is_empty() => status.to_string(),
            _ => format!("{}: {}", status, body.trim()),
        };
        let canonical = google.map(|b| b.error.status).unwrap_or_default();

        match canonical.as_str() {
            "RESOURCE_EXHAUSTED" => return Self::Quota(message),
            "FAILED_PRECONDITION" if message.to_lowercase().contains("maximum number of keys") => {
                return Self::Quota(message)
            }
            "UNAUTHENTICATED" | "PERMISSION_DENIED" => return Self::Auth(message),
            _ => {}
        }

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Self::Auth(message),
            StatusCode::NOT_FOUND => Self::NotFound(message),
            StatusCode::TOO_MANY_REQUESTS => Self::Quota(message),
            _ => Self::Transport(message),
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

/// Pass a successful response through, classify anything else.
pub(crate) async fn check_response(
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::from_response(status, &body))
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Encoding(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Invalid or incomplete process configuration.
#[derive(Debug, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// Raised only when the caller asked for retire failures to fail the run.
#[derive(Debug, Error)]
#[error("new key published but old key {key} could not be retired: {error}")]
pub struct RetireFailedError {
    pub key: String,
    pub error: String,
}

/// Why a rotation attempt stopped before reaching `Done`.
#[derive(Debug, Error)]
pub enum RotationError {
    #[error(
        "{account} has {} user-managed keys ({}); refusing to guess which one to retire, delete the stale key(s) manually",
        keys.len(),
        keys.join(", ")
    )]
    ConflictingState { account: String, keys: Vec<String> },

    #[error("failed to list keys for {account}")]
    Inspect {
        account: String,
        #[source]
        source: ProviderError,
    },

    #[error("failed to create a key for {account}")]
    Create {
        account: String,
        #[source]
        source: ProviderError,
    },

    #[error("failed to serialize credential for key {key}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(
        "key {new_key} was published to [{}] but writing {failed} failed; old key kept, new key left for manual cleanup",
        published.join(", ")
    )]
    PartialPublish {
        new_key: String,
        published: Vec<String>,
        failed: String,
        skipped: Vec<String>,
        #[source]
        source: ProviderError,
    },
}

impl RotationError {
    /// Engine state in which the run stopped.
    pub fn state(&self) -> &'static str {
        match self {
            Self::ConflictingState { .. } | Self::Inspect { .. } => "inspect",
            Self::Create { .. } => "create",
            Self::Serialize { .. } => "publish",
            Self::PartialPublish { .. } => "partial-publish",
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            Self::ConflictingState { .. } => exit_code::CONFLICTING_STATE,
            Self::PartialPublish { .. } => exit_code::PARTIAL_PUBLISH,
            Self::Inspect { source, .. } | Self::Create { source, .. } if source.is_auth() => {
                exit_code::AUTH
            }
            _ => exit_code::FAILURE,
        }
    }
}

/// Process exit statuses.
pub mod exit_code {
    pub const FAILURE: u8 = 1;
    pub const CONFIG: u8 = 2;
    pub const AUTH: u8 = 3;
    pub const CONFLICTING_STATE: u8 = 4;
    pub const PARTIAL_PUBLISH: u8 = 5;
    pub const RETIRE_FAILED: u8 = 6;
}

/// Map any error chain produced by the CLI to an exit status.
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(rotation) = cause.downcast_ref::<RotationError>() {
            return rotation.exit_code();
        }
        if cause.downcast_ref::<ConfigError>().is_some() {
            return exit_code::CONFIG;
        }
        if cause.downcast_ref::<RetireFailedError>().is_some() {
            return exit_code::RETIRE_FAILED;
        }
        if let Some(provider) = cause.downcast_ref::<ProviderError>() {
            if provider.is_auth() {
                return exit_code::AUTH;
            }
        }
    }
    exit_code::FAILURE
}
