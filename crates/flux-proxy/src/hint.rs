//! Renewal hints carried on proxied responses.
//!
//! The proxy stamps responses with a header such as
//!
//! ```text
//! X-Flux-Session: session_id=9f2c, expires_at=2024-05-01T13:00:00Z
//! ```
//!
//! A missing header means the response carries no renewal signal (error
//! responses generated before the session was resolved, for instance).

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::SessionError;

/// Response header carrying the renewal hint.
pub const SESSION_HINT_HEADER: &str = "X-Flux-Session";

/// Parsed form of the [`SESSION_HINT_HEADER`] value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalHint {
    /// When the proxy will stop honoring the session.
    pub expires_at: DateTime<Utc>,
    /// Every key/value pair in the header, `expires_at` included.
    pub params: BTreeMap<String, String>,
}

impl RenewalHint {
    /// Reads the hint from a response's headers, if present.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidRenewalHint`] if the header is present but
    /// contains characters other than visible ASCII or cannot be parsed.
    pub fn from_headers(headers: &reqwest::header::HeaderMap) -> Result<Option<Self>, SessionError> {
        let Some(value) = headers.get(SESSION_HINT_HEADER) else {
            return Ok(None);
        };
        let value = value
            .to_str()
            .map_err(|e| SessionError::InvalidRenewalHint(format!("header is not ASCII: {e}")))?;
        if value.trim().is_empty() {
            return Ok(None);
        }
        value.parse().map(Some)
    }

    /// Value of an arbitrary key from the header.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

impl FromStr for RenewalHint {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let params: BTreeMap<String, String> = s
            .split(',')
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((key, value)) => (key.trim().to_string(), value.trim().to_string()),
                None => (pair.to_string(), String::new()),
            })
            .collect();

        let raw = params
            .get("expires_at")
            .ok_or_else(|| SessionError::InvalidRenewalHint("missing expires_at".to_string()))?;
        let expires_at = DateTime::parse_from_rfc3339(raw)
            .map_err(|e| {
                SessionError::InvalidRenewalHint(format!("expires_at '{raw}' is not RFC3339: {e}"))
            })?
            .with_timezone(&Utc);

        Ok(Self { expires_at, params })
    }
}
