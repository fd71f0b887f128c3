use std::fmt;
use std::time::Duration;

/// Failure kind reported by the remote account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// The service is temporarily unreachable.
    Unavailable,
    /// The transport gave up waiting for the remote side.
    DeadlineExceeded,
    /// The remote side failed while handling the call.
    Internal,
    /// Rate limit or quota hit.
    ResourceExhausted,
    /// Credentials were rejected.
    Unauthenticated,
    /// The account is not allowed to perform the call.
    PermissionDenied,
    /// The request was malformed.
    InvalidArgument,
    /// The remote state does not allow the call right now.
    FailedPrecondition,
    /// The requested entity does not exist.
    NotFound,
    /// The remote side aborted the call.
    Aborted,
    /// Anything the remote side did not classify.
    Unknown,
}

impl StatusCode {
    /// Returns the canonical upper-snake name of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unavailable => "UNAVAILABLE",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::Internal => "INTERNAL",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::NotFound => "NOT_FOUND",
            Self::Aborted => "ABORTED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type returned by this crate.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// The caller's cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,
    /// The per-operation deadline elapsed before the call completed.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    /// Failure reported by the remote account or its transport.
    #[error("remote error {code}: {message}")]
    Remote {
        /// Failure kind.
        code: StatusCode,
        /// Message text from the remote side.
        message: String,
    },
    /// Endpoint data is missing or unusable. No network attempt was made.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A call needed a live connection and the session had none.
    #[error("not connected")]
    NotConnected,
}

impl RpcError {
    /// Builds a remote failure.
    pub fn remote(code: StatusCode, message: impl Into<String>) -> Self {
        Self::Remote {
            code,
            message: message.into(),
        }
    }

    /// Returns the remote status code, if this is a remote failure.
    pub fn code(&self) -> Option<StatusCode> {
        match self {
            Self::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// `true` for caller- or deadline-initiated cancellation.
    ///
    /// Such errors are never retried.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Timeout(_))
    }

    /// `true` when the default transient set contains this error.
    ///
    /// The default set is UNAVAILABLE, DEADLINE_EXCEEDED (reported by the
    /// transport, not the caller's own deadline), INTERNAL and
    /// RESOURCE_EXHAUSTED. Call sites that need a different set pass their
    /// own classifier to [`crate::RetryPolicy::with_classifier`].
    pub fn is_transient(&self) -> bool {
        matches!(
            self.code(),
            Some(
                StatusCode::Unavailable
                    | StatusCode::DeadlineExceeded
                    | StatusCode::Internal
                    | StatusCode::ResourceExhausted
            )
        )
    }
}
