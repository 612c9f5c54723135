//! Proxy configuration.
//!
//! Configuration is loaded from `~/.config/flux-proxy/config.toml` unless a
//! path is given explicitly.
//!
//! ## Example Configuration
//!
//! ```toml
//! control_plane_addr = "http://flux-proxy.flux-proxy:8001"
//! proxy_http_addr = "http://flux-proxy.flux-proxy:80"
//! proxy_https_addr = "https://flux-proxy.flux-proxy:443"
//!
//! [session]
//! duration_secs = 3600
//! renew_threshold_secs = 60
//! auto_renew = true
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, SessionError};

const DEFAULT_CONTROL_PLANE_ADDR: &str = "http://flux-proxy.flux-proxy:8001";
const DEFAULT_PROXY_HTTP_ADDR: &str = "http://flux-proxy.flux-proxy:80";
const DEFAULT_PROXY_HTTPS_ADDR: &str = "https://flux-proxy.flux-proxy:443";

/// Addresses of the control plane and the proxy ingress endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Base URL of the control-plane service.
    #[serde(default = "default_control_plane_addr")]
    pub control_plane_addr: String,

    /// Proxy endpoint used for `http://` targets.
    #[serde(default = "default_proxy_http_addr")]
    pub proxy_http_addr: String,

    /// Proxy endpoint used for `https://` targets.
    #[serde(default = "default_proxy_https_addr")]
    pub proxy_https_addr: String,

    /// Session lifecycle defaults
    #[serde(default)]
    pub session: SessionDefaults,
}

/// Lifecycle knobs shared by every session a manager creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDefaults {
    /// Requested session lifetime in seconds (default: 3600)
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,

    /// Renew when the session has less than this many seconds left (default: 60)
    #[serde(default = "default_renew_threshold_secs")]
    pub renew_threshold_secs: u64,

    /// Whether responses are inspected for renewal hints (default: true)
    #[serde(default = "default_auto_renew")]
    pub auto_renew: bool,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            duration_secs: default_duration_secs(),
            renew_threshold_secs: default_renew_threshold_secs(),
            auto_renew: default_auto_renew(),
        }
    }
}

impl SessionDefaults {
    pub const fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub const fn renew_threshold(&self) -> Duration {
        Duration::from_secs(self.renew_threshold_secs)
    }
}

fn default_control_plane_addr() -> String {
    DEFAULT_CONTROL_PLANE_ADDR.to_string()
}

fn default_proxy_http_addr() -> String {
    DEFAULT_PROXY_HTTP_ADDR.to_string()
}

fn default_proxy_https_addr() -> String {
    DEFAULT_PROXY_HTTPS_ADDR.to_string()
}

const fn default_duration_secs() -> u64 {
    3600
}

const fn default_renew_threshold_secs() -> u64 {
    60
}

const fn default_auto_renew() -> bool {
    true
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            control_plane_addr: default_control_plane_addr(),
            proxy_http_addr: default_proxy_http_addr(),
            proxy_https_addr: default_proxy_https_addr(),
            session: SessionDefaults::default(),
        }
    }
}

impl ProxyConfig {
    /// Builds a configuration from the three addresses, with default session knobs.
    pub fn new(
        control_plane_addr: impl Into<String>,
        proxy_http_addr: impl Into<String>,
        proxy_https_addr: impl Into<String>,
    ) -> Self {
        Self {
            control_plane_addr: control_plane_addr.into(),
            proxy_http_addr: proxy_http_addr.into(),
            proxy_https_addr: proxy_https_addr.into(),
            session: SessionDefaults::default(),
        }
    }

    /// Loads configuration from the default location.
    ///
    /// Falls back to the built-in defaults when no file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, parsed or validated.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Loads configuration from an explicit path.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file doesn't exist or cannot be read
    /// - Deserialization fails
    /// - Validation fails
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SessionError::Configuration(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;

        Ok(config)
    }

    /// Returns the default configuration file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the config directory cannot be determined.
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| {
                SessionError::Configuration("Failed to determine config directory".to_string())
            })?
            .join("flux-proxy");

        Ok(config_dir.join("config.toml"))
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Any address is not an absolute `http`/`https` URL with a host
    /// - The two proxy endpoints are the same address
    /// - The session duration is zero
    pub fn validate(&self) -> Result<()> {
        parse_http_url("control_plane_addr", &self.control_plane_addr)?;
        let http = parse_http_url("proxy_http_addr", &self.proxy_http_addr)?;
        let https = parse_http_url("proxy_https_addr", &self.proxy_https_addr)?;

        if http == https {
            return Err(SessionError::Configuration(
                "proxy_http_addr and proxy_https_addr must differ".to_string(),
            ));
        }

        if self.session.duration_secs == 0 {
            return Err(SessionError::Configuration(
                "session.duration_secs must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Parses `value` as an absolute `http`/`https` URL, naming `field` on failure.
pub(crate) fn parse_http_url(field: &str, value: &str) -> Result<Url> {
    let url = Url::parse(value)
        .map_err(|e| SessionError::Configuration(format!("{field} '{value}' is not a URL: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(SessionError::Configuration(format!(
            "{field} '{value}' must use http or https"
        )));
    }
    if url.host_str().is_none() {
        return Err(SessionError::Configuration(format!(
            "{field} '{value}' has no host"
        )));
    }

    Ok(url)
}
