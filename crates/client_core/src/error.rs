use shared::error::{ApiError, ErrorCode};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("not signed in")]
    NotSignedIn,
    #[error("no active room selected")]
    NoActiveRoom,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("request rejected with status {status}: {message}")]
    Rejected {
        status: u16,
        code: ErrorCode,
        message: String,
    },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("credential unavailable: {0}")]
    CredentialUnavailable(String),
    #[error("message draft is empty")]
    EmptyDraft,
    #[error("failed to send message: {source}")]
    SendFailed {
        draft: String,
        #[source]
        source: Box<ClientError>,
    },
    #[error("local store failure: {0}")]
    LocalStore(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            code: ErrorCode::from_status(status),
            message: message.into(),
        }
    }

    pub fn from_api_error(status: u16, error: ApiError) -> Self {
        Self::Rejected {
            status,
            code: error.code,
            message: error.message,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            Self::SendFailed { source, .. } => source.status(),
            _ => None,
        }
    }

    pub fn is_benign_conflict(&self) -> bool {
        matches!(self, Self::Rejected { code, .. } if code.is_benign_conflict())
    }

    /// Draft text to restore after a failed send.
    pub fn draft(&self) -> Option<&str> {
        match self {
            Self::SendFailed { draft, .. } => Some(draft),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            Self::rejected(status.as_u16(), err.to_string())
        } else if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<url::ParseError> for ClientError {
    fn from(err: url::ParseError) -> Self {
        Self::Config(err.to_string())
    }
}
