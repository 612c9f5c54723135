//! Transport wiring between a session and the HTTP client.
//!
//! Every request a session sends is routed to one of two proxy endpoints by
//! target scheme. The `Proxy-Authorization` credentials are looked up from
//! the session's [`CredentialCell`] each time a request is routed, so a
//! renewal takes effect on the very next request without rebuilding the
//! client.

use std::fmt;
use std::sync::Arc;

use reqwest::header::HeaderValue;
use rustls::ClientConfig;
use secrecy::ExposeSecret;
use url::Url;

use crate::credentials::{CredentialCell, SessionCredentials};
use crate::error::{Result, SessionError};
use crate::trust::TrustContext;

/// The two proxy ingress addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoints {
    pub http: Url,
    pub https: Url,
}

impl ProxyEndpoints {
    /// Parses both endpoint addresses.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Configuration`] if either address is not an
    /// absolute http(s) URL.
    pub fn parse(http: &str, https: &str) -> Result<Self> {
        Ok(Self {
            http: crate::config::parse_http_url("proxy_http_addr", http)?,
            https: crate::config::parse_http_url("proxy_https_addr", https)?,
        })
    }

    /// Endpoint that serves targets with the given URL scheme.
    pub fn for_scheme(&self, scheme: &str) -> Option<&Url> {
        match scheme {
            "http" => Some(&self.http),
            "https" => Some(&self.https),
            _ => None,
        }
    }

    fn is_configured(&self, proxy: &Url) -> bool {
        *proxy == self.http || *proxy == self.https
    }
}

/// Everything needed to open a connection through one proxy endpoint.
pub struct ProxyConnection {
    /// Proxy address with the session credentials as user-info.
    pub proxy_url: Url,
    /// `Proxy-Authorization` header for the current credentials.
    pub authorization: HeaderValue,
    /// TLS configuration trusting the proxy's CA.
    pub tls: ClientConfig,
}

impl fmt::Debug for ProxyConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut redacted = self.proxy_url.clone();
        let _ = redacted.set_password(None);
        f.debug_struct("ProxyConnection")
            .field("proxy_url", &redacted.as_str())
            .field("authorization", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// Per-session transport hook.
///
/// Cheap to clone; clones observe the same live credentials.
#[derive(Clone)]
pub struct ProxyTransport {
    endpoints: Arc<ProxyEndpoints>,
    credentials: Arc<CredentialCell>,
    trust: TrustContext,
}

impl fmt::Debug for ProxyTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyTransport")
            .field("endpoints", &self.endpoints)
            .field("trust", &self.trust)
            .finish_non_exhaustive()
    }
}

impl ProxyTransport {
    pub const fn new(
        endpoints: Arc<ProxyEndpoints>,
        credentials: Arc<CredentialCell>,
        trust: TrustContext,
    ) -> Self {
        Self {
            endpoints,
            credentials,
            trust,
        }
    }

    pub fn endpoints(&self) -> &ProxyEndpoints {
        &self.endpoints
    }

    pub const fn trust(&self) -> &TrustContext {
        &self.trust
    }

    /// Connection parameters for `proxy`, using the credentials current right now.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::UnexpectedProxy`] if `proxy` is neither of the
    /// configured endpoints. Reaching that branch means the client was wired
    /// with a proxy this transport does not own.
    pub fn connection_for(&self, proxy: &Url) -> Result<ProxyConnection> {
        if !self.endpoints.is_configured(proxy) {
            return Err(SessionError::UnexpectedProxy(proxy.to_string()));
        }

        let credentials = self.credentials.current();
        Ok(ProxyConnection {
            proxy_url: with_user_info(proxy, &credentials)?,
            authorization: credentials.proxy_authorization(),
            tls: self.trust.tls_config().clone(),
        })
    }

    /// `Proxy-Authorization` header for the current credentials.
    pub fn proxy_authorization(&self) -> HeaderValue {
        self.credentials.current().proxy_authorization()
    }

    /// Proxy URL for a target URL, resolved against the live credentials.
    ///
    /// Targets with schemes other than `http`/`https` are not proxied.
    pub fn route(&self, target: &Url) -> Option<Url> {
        let proxy = self.endpoints.for_scheme(target.scheme())?;
        with_user_info(proxy, &self.credentials.current()).ok()
    }

    /// Builds the HTTP client all of a session's requests go through.
    ///
    /// # Errors
    ///
    /// Returns an error if the client fails to build.
    pub fn build_client(&self) -> Result<reqwest::Client> {
        let router = self.clone();
        let proxy = reqwest::Proxy::custom(move |target| router.route(target));

        Ok(reqwest::Client::builder()
            .use_preconfigured_tls(self.trust.tls_config().clone())
            .proxy(proxy)
            .build()?)
    }
}

/// Returns `proxy` with `session_id:secret` as its user-info.
pub(crate) fn with_user_info(proxy: &Url, credentials: &SessionCredentials) -> Result<Url> {
    let mut url = proxy.clone();
    url.set_username(&credentials.session_id)
        .and_then(|()| url.set_password(Some(credentials.secret.expose_secret())))
        .map_err(|()| {
            SessionError::Configuration(format!("proxy address '{proxy}' cannot carry credentials"))
        })?;
    Ok(url)
}
