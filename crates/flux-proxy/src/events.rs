//! Lifecycle events emitted by sessions.
//!
//! Events are **observability**: fire-and-forget notifications about session
//! housekeeping. Renewal and close failures are never returned to callers, so
//! this is the place to observe them. Every event is also logged with
//! `tracing`.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::SessionError;

/// Events emitted by a [`SessionManager`](crate::SessionManager) and the
/// sessions it creates.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum SessionEvent {
    /// A new session was issued by the control plane.
    Started {
        session_id: String,
        expires_at: DateTime<Utc>,
    },

    /// Credentials were swapped in place by a successful renewal.
    Renewed {
        previous_session_id: String,
        session_id: String,
        expires_at: DateTime<Utc>,
    },

    /// A renewal attempt failed; the session keeps its current credentials.
    RenewalFailed {
        session_id: String,
        error: Arc<SessionError>,
    },

    /// The session was ended on the control plane.
    Closed { session_id: String },

    /// Ending the session failed; the control plane will expire it instead.
    CloseFailed {
        session_id: String,
        error: Arc<SessionError>,
    },
}

impl SessionEvent {
    /// Id of the session the event is about.
    pub fn session_id(&self) -> &str {
        match self {
            Self::Started { session_id, .. }
            | Self::Renewed { session_id, .. }
            | Self::RenewalFailed { session_id, .. }
            | Self::Closed { session_id }
            | Self::CloseFailed { session_id, .. } => session_id,
        }
    }

    /// The swallowed error, for failure events.
    pub fn error(&self) -> Option<&SessionError> {
        match self {
            Self::RenewalFailed { error, .. } | Self::CloseFailed { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Callback for receiving session events.
///
/// Returns `()` because events are notifications, not control flow decisions.
/// Called inline on the task that produced the event, so it should not block.
pub type EventCallback = Arc<dyn Fn(&SessionEvent) + Send + Sync>;
