use thiserror::Error;

/// The identity authority could not produce a credential.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    /// No principal is signed in, so there is nothing to refresh.
    #[error("no signed-in principal")]
    NotSignedIn,
    /// The authority reports the principal as signed out (revoked, disabled, expired).
    #[error("principal signed out: {0}")]
    SignedOut(String),
    /// The authority was unreachable or answered with an unexpected failure.
    #[error("identity authority failure: {0}")]
    Authority(String),
}

impl CredentialError {
    /// Terminal errors mean the cached credential can no longer be trusted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::NotSignedIn | Self::SignedOut(_))
    }
}

/// Network or HTTP-level failure while talking to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Network(String),
    #[error("backend answered {status}: {message}")]
    Status { status: u16, message: String },
    #[error("response body failed: {0}")]
    Body(String),
    #[error("invalid request: {0}")]
    Request(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_body() || err.is_decode() {
            Self::Body(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// The response body could not be decoded into stream events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("stream ended inside a frame ({pending} bytes pending)")]
    Truncated { pending: usize },
    #[error("stream ended without a terminal frame")]
    MissingTerminalFrame,
}

/// The backend kept rejecting the credential after the single permitted retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("authorization expired: {reason}")]
pub struct AuthExpiredError {
    pub reason: String,
}

impl AuthExpiredError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Failure of a single authenticated request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    AuthExpired(#[from] AuthExpiredError),
}

/// A conversation session could not be created; chat dispatch is blocked.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to create chat session: {cause}")]
pub struct SessionCreationError {
    #[source]
    pub cause: RequestError,
}

impl From<RequestError> for SessionCreationError {
    fn from(cause: RequestError) -> Self {
        Self { cause }
    }
}

/// Cause handed to `Observer::error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error(transparent)]
    Credential(CredentialError),
    #[error(transparent)]
    SessionCreation(SessionCreationError),
    #[error(transparent)]
    Transport(TransportError),
    #[error(transparent)]
    Decode(DecodeError),
    #[error(transparent)]
    AuthExpired(AuthExpiredError),
}

impl From<RequestError> for ChatError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::Credential(err) => Self::Credential(err),
            RequestError::Transport(err) => Self::Transport(err),
            RequestError::AuthExpired(err) => Self::AuthExpired(err),
        }
    }
}

impl From<SessionCreationError> for ChatError {
    fn from(err: SessionCreationError) -> Self {
        Self::SessionCreation(err)
    }
}

impl From<TransportError> for ChatError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

impl From<DecodeError> for ChatError {
    fn from(err: DecodeError) -> Self {
        Self::Decode(err)
    }
}
