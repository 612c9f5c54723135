//! Error types for proxy sessions and the control plane.

use serde::Deserialize;
use thiserror::Error;

/// Error body returned by the control plane for non-2xx Twirp responses.
#[derive(Debug, Deserialize)]
pub struct TwirpErrorBody {
    /// Twirp error code, e.g. `"not_found"` or `"unavailable"`.
    pub code: String,
    /// Human readable message.
    #[serde(default)]
    pub msg: String,
}

/// Failures talking to the control plane.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ControlPlaneError {
    /// The HTTP exchange itself failed (connect, TLS, body read).
    #[error("Control plane transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The control plane answered with a Twirp error.
    #[error("Control plane returned {code} (HTTP {status}): {message}")]
    Twirp {
        /// HTTP status of the response.
        status: u16,
        /// Twirp error code.
        code: String,
        /// Message from the error body.
        message: String,
    },

    /// The response body was not a valid protobuf message.
    #[error("Failed to decode control plane response: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The control-plane address could not be used to build a request URL.
    #[error("Invalid control plane address '{address}': {reason}")]
    InvalidAddress {
        /// The offending address.
        address: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl ControlPlaneError {
    /// Check if retrying the call could plausibly succeed.
    ///
    /// Nothing in this crate retries; the predicate is for callers that do.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_connect() || e.is_timeout(),
            Self::Twirp { code, .. } => {
                matches!(code.as_str(), "unavailable" | "deadline_exceeded" | "resource_exhausted")
            }
            Self::Decode(_) | Self::InvalidAddress { .. } => false,
        }
    }
}

/// Errors surfaced by the session subsystem.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    /// `StartSession`/`EndSession` failed. Never retried internally.
    #[error("Control plane unavailable: {0}")]
    ControlPlaneUnavailable(#[from] ControlPlaneError),

    /// A renewal attempt failed. Only ever reported through session events.
    #[error("Session renewal failed: {0}")]
    RenewalFailed(#[source] ControlPlaneError),

    /// Ending the session on close failed. Only ever reported through session events.
    #[error("Closing session failed: {0}")]
    CloseFailed(#[source] ControlPlaneError),

    /// A proxied call came back with HTTP 401: the upstream credential is no
    /// longer valid.
    #[error("Upstream rejected credentials for {url}")]
    UpstreamUnauthorized {
        /// URL of the rejected request.
        url: String,
    },

    /// The session was closed and can no longer send requests.
    #[error("Proxy session {session_id} is closed")]
    SessionClosed {
        /// Id of the session at the time it was closed.
        session_id: String,
    },

    /// The transport was asked to handle a proxy address it was not configured
    /// with. This is a wiring bug, not a runtime condition.
    #[error("Unexpected proxy address: {0}")]
    UnexpectedProxy(String),

    /// TLS trust material from the control plane could not be compiled.
    #[error("Trust material error: {0}")]
    Trust(String),

    /// The proxied HTTP exchange failed.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// A renewal hint header could not be parsed.
    #[error("Invalid renewal hint: {0}")]
    InvalidRenewalHint(String),

    /// Session settings failed validation.
    #[error("Invalid session settings: {0}")]
    InvalidSettings(String),

    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// I/O error while reading configuration.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result type alias using `SessionError`.
pub type Result<T> = std::result::Result<T, SessionError>;

impl SessionError {
    /// Check if this is the upstream 401 signal.
    pub const fn is_unauthorized(&self) -> bool {
        matches!(self, Self::UpstreamUnauthorized { .. })
    }

    /// Check if this error means the control plane could not be reached or refused a call.
    pub const fn is_control_plane(&self) -> bool {
        matches!(
            self,
            Self::ControlPlaneUnavailable(_) | Self::RenewalFailed(_) | Self::CloseFailed(_)
        )
    }

    /// Check if the error is a wiring bug rather than a runtime failure.
    pub const fn is_programming_error(&self) -> bool {
        matches!(self, Self::UnexpectedProxy(_))
    }
}
