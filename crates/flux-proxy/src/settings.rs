//! Settings requested for a proxy session.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use reqwest::header::{HeaderName, HeaderValue};
use smallvec::SmallVec;
use typed_builder::TypedBuilder;

use crate::error::{Result, SessionError};

/// Session lifetime used when none is requested (1 hour).
pub const DEFAULT_SESSION_DURATION: Duration = Duration::from_secs(60 * 60);

/// Header values, almost always exactly one per name.
pub type HeaderValues = SmallVec<[String; 1]>;

/// Immutable description of the session to request from the control plane.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use flux_proxy::SessionSettings;
///
/// let settings = SessionSettings::builder()
///     .credential_ids(vec!["cred-1".to_string()])
///     .allow_hosts(vec!["api.example.com".to_string()])
///     .duration(Duration::from_secs(30 * 60))
///     .build()
///     .with_header("X-Tenant", "acme");
///
/// assert!(settings.validate().is_ok());
/// assert_eq!(settings.headers()["X-Tenant"].as_slice(), ["acme"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder)]
pub struct SessionSettings {
    /// Hosts the proxy lets this session reach. Empty allows every host.
    #[builder(default, setter(transform = |hosts: Vec<String>| hosts.into_iter().collect()))]
    allow_hosts: BTreeSet<String>,

    /// Opaque references to credentials the proxy attaches server-side.
    #[builder(default)]
    credential_ids: Vec<String>,

    /// Headers the proxy merges into every outbound request.
    #[builder(default)]
    headers: BTreeMap<String, HeaderValues>,

    /// Requested session lifetime.
    #[builder(default = DEFAULT_SESSION_DURATION)]
    duration: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SessionSettings {
    /// Settings for a single credential with every other field defaulted.
    #[must_use]
    pub fn for_credential(credential_id: impl Into<String>) -> Self {
        Self::builder()
            .credential_ids(vec![credential_id.into()])
            .build()
    }

    /// Returns a copy with `value` appended to the values of header `name`.
    ///
    /// Multiple values for one header should be added one call at a time rather
    /// than as a single comma separated value.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .entry(name.into())
            .or_default()
            .push(value.into());
        self
    }

    /// Returns a copy with a different requested lifetime.
    #[must_use]
    pub const fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub const fn allow_hosts(&self) -> &BTreeSet<String> {
        &self.allow_hosts
    }

    pub fn credential_ids(&self) -> &[String] {
        &self.credential_ids
    }

    pub const fn headers(&self) -> &BTreeMap<String, HeaderValues> {
        &self.headers
    }

    pub const fn duration(&self) -> Duration {
        self.duration
    }

    /// Validates the settings before they are sent to the control plane.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidSettings`] if:
    /// - The duration is zero
    /// - A host or credential id is empty
    /// - A header name or value is not valid HTTP
    pub fn validate(&self) -> Result<()> {
        if self.duration.is_zero() {
            return Err(SessionError::InvalidSettings(
                "session duration must be greater than zero".to_string(),
            ));
        }

        if self.allow_hosts.iter().any(|h| h.trim().is_empty()) {
            return Err(SessionError::InvalidSettings(
                "allow_hosts contains an empty host".to_string(),
            ));
        }

        if self.credential_ids.iter().any(|c| c.trim().is_empty()) {
            return Err(SessionError::InvalidSettings(
                "credential_ids contains an empty id".to_string(),
            ));
        }

        for (name, values) in &self.headers {
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                SessionError::InvalidSettings(format!("invalid header name '{name}': {e}"))
            })?;
            for value in values {
                HeaderValue::from_str(value).map_err(|e| {
                    SessionError::InvalidSettings(format!("invalid value for header '{name}': {e}"))
                })?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_defaults() {
        let settings = SessionSettings::default();
        assert!(settings.allow_hosts().is_empty());
        assert!(settings.credential_ids().is_empty());
        assert!(settings.headers().is_empty());
        assert_eq!(settings.duration(), Duration::from_secs(3600));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_allow_hosts_are_deduplicated() {
        let settings = SessionSettings::builder()
            .allow_hosts(vec![
                "b.example.com".to_string(),
                "a.example.com".to_string(),
                "b.example.com".to_string(),
            ])
            .build();

        let hosts: Vec<_> = settings.allow_hosts().iter().cloned().collect();
        assert_eq!(hosts, vec!["a.example.com", "b.example.com"]);
    }

    #[test]
    fn test_with_header_appends_values_in_order() {
        let settings = SessionSettings::for_credential("cred-1")
            .with_header("Accept", "application/json")
            .with_header("Accept", "text/csv");

        assert_eq!(
            settings.headers()["Accept"].as_slice(),
            ["application/json", "text/csv"]
        );
        assert_eq!(settings.credential_ids(), ["cred-1"]);
    }

    #[test]
    fn test_zero_duration_rejected() {
        let settings = SessionSettings::default().with_duration(Duration::ZERO);
        assert!(matches!(
            settings.validate(),
            Err(SessionError::InvalidSettings(_))
        ));
    }

    #[test]
    fn test_invalid_header_name_rejected() {
        let settings = SessionSettings::default().with_header("Bad Header", "x");
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("Bad Header"));
    }

    #[test]
    fn test_header_value_with_newline_rejected() {
        let settings = SessionSettings::default().with_header("X-Ok", "line\nbreak");
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_empty_credential_id_rejected() {
        let settings = SessionSettings::for_credential("  ");
        assert!(settings.validate().is_err());
    }
}
