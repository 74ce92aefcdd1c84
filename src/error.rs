use std::time::Duration;

use thiserror::Error;

/// Aggregates every failure mode exposed by the crate.
///
/// Credential and initialization failures are raised before any network I/O happens.
/// HTTP failures are classified from the status code so callers can decide whether to
/// retry (see [`LLMError::is_retryable`]), bump a budget, or surface a message.
#[derive(Debug, Error)]
pub enum LLMError {
    /// No credential could be resolved for the service.
    #[error("credential not found for {service}")]
    NotFound { service: String },
    /// A credential already exists and `update` must be used instead.
    #[error("credential already exists for {service}")]
    AlreadyExists { service: String },
    /// The service handle was built without a usable credential.
    #[error("service {service} is not initialized")]
    NotInitialized { service: String },
    /// The token budget reached zero and the handle is on hold.
    #[error("token budget exhausted for {service} (budget {budget})")]
    BudgetExhausted { service: String, budget: i64 },
    /// Reports invalid or missing credentials (HTTP 401/403).
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },
    /// Indicates that the provider throttled the request.
    #[error("rate limited: {message}")]
    RateLimited {
        /// Raw message returned by the upstream provider.
        message: String,
        /// Optional wait duration suggested by the provider before retrying.
        retry_after: Option<Duration>,
    },
    /// The request or the provider timed out.
    #[error("timeout: {message}")]
    Timeout { message: String },
    /// Non-2xx responses that are neither auth, throttling nor timeouts.
    #[error("provider {provider} returned status {status}: {message}")]
    ServiceError {
        /// Name of the backend, such as `openai`.
        provider: &'static str,
        status: u16,
        message: String,
    },
    /// Connection-level failures: DNS, TLS, refused connections, broken bodies.
    #[error("service unreachable: {message}")]
    ServiceUnreachable { message: String },
    /// A dotted path could not be resolved inside a response.
    #[error("path not found: {path}")]
    PathNotFound { path: String },
    /// A persisted file does not have the expected shape.
    #[error("corrupt state in {source_name}: {message}")]
    CorruptState {
        /// File path or logical name of the broken input.
        source_name: String,
        message: String,
    },
    /// Signals validation failures in the request payload.
    #[error("invalid request: {message}")]
    Validation { message: String },
    /// Declares that a capability is not supported by the selected backend.
    #[error("feature unsupported: {feature}")]
    UnsupportedFeature { feature: &'static str },
    /// Local file-system failures while reading or writing state.
    #[error("io error on {path}: {message}")]
    Io { path: String, message: String },
}

impl LLMError {
    /// Creates an [`LLMError::ServiceUnreachable`] from a textual description.
    ///
    /// # Examples
    ///
    /// ```
    /// use kagi_llm::error::LLMError;
    ///
    /// let err = LLMError::unreachable("dns lookup failed");
    /// assert!(matches!(err, LLMError::ServiceUnreachable { .. }));
    /// ```
    pub fn unreachable<T: Into<String>>(message: T) -> Self {
        Self::ServiceUnreachable {
            message: message.into(),
        }
    }

    /// Creates an [`LLMError::CorruptState`] for the named source.
    pub fn corrupt<S: Into<String>, T: Into<String>>(source_name: S, message: T) -> Self {
        Self::CorruptState {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    pub(crate) fn io(path: &std::path::Path, err: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }

    /// Returns `true` for failures that may succeed when the same request is repeated.
    ///
    /// # Examples
    ///
    /// ```
    /// use kagi_llm::error::LLMError;
    ///
    /// assert!(LLMError::unreachable("reset by peer").is_retryable());
    /// assert!(!LLMError::Unauthorized { message: "bad key".into() }.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout { .. } | Self::ServiceUnreachable { .. } => {
                true
            }
            Self::ServiceError { status, .. } => (500..600).contains(status),
            _ => false,
        }
    }

    /// Wait duration suggested by the provider, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
