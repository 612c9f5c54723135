//! Proxy sessions and transparent credential renewal.
//!
//! A [`ProxySession`] owns an HTTP client whose every request is routed
//! through the flux proxy with the session's current credentials. Responses
//! may carry a renewal hint; when the hinted expiry falls within the renew
//! threshold, the session obtains fresh credentials from the control plane
//! and swaps them in place. At most one renewal runs per session at a time,
//! and a hint observed with credentials that have since been replaced is
//! ignored.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, Request, RequestBuilder, Response};
use tracing::{debug, info, warn};
use url::Url;

use crate::control_plane::IssuedSession;
use crate::credentials::{CredentialCell, SessionCredentials};
use crate::error::{Result, SessionError};
use crate::events::SessionEvent;
use crate::hint::RenewalHint;
use crate::manager::SessionManager;
use crate::settings::SessionSettings;
use crate::transport::{ProxyTransport, with_user_info};
use crate::trust::TrustContext;

/// Observable lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    /// A renewal is in flight; requests keep using the current credentials.
    Renewing,
    Closed,
}

/// Clears the renewal flag when dropped, including on cancellation.
struct RenewalGuard<'a>(&'a AtomicBool);

impl<'a> RenewalGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RenewalGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A live proxy session.
///
/// `ProxySession` is `Send + Sync`; share it across tasks with an [`Arc`].
/// Dropping an open session ends it on the control plane in the background
/// when a Tokio runtime is available. Call [`close`](Self::close) to end it
/// deterministically.
pub struct ProxySession {
    manager: SessionManager,
    settings: SessionSettings,
    credentials: Arc<CredentialCell>,
    transport: ProxyTransport,
    client: reqwest::Client,
    renewing: AtomicBool,
    closed: AtomicBool,
}

impl fmt::Debug for ProxySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxySession")
            .field("credentials", &self.credentials.current())
            .field("state", &self.state())
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl ProxySession {
    pub(crate) fn new(
        manager: SessionManager,
        settings: SessionSettings,
        issued: IssuedSession,
        expires_at: DateTime<Utc>,
        trust: TrustContext,
    ) -> Result<Self> {
        let credentials = Arc::new(CredentialCell::new(SessionCredentials::new(
            issued.session_id,
            issued.secret,
            expires_at,
        )));
        let transport = ProxyTransport::new(manager.endpoints(), Arc::clone(&credentials), trust);
        let client = transport.build_client()?;

        Ok(Self {
            manager,
            settings,
            credentials,
            transport,
            client,
            renewing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Id of the current session. Changes after a renewal.
    pub fn session_id(&self) -> String {
        self.credentials.current().session_id.clone()
    }

    /// Snapshot of the current credentials.
    pub fn credentials(&self) -> Arc<SessionCredentials> {
        self.credentials.current()
    }

    /// Last known expiry of the current credentials.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.credentials.current().expires_at
    }

    pub const fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn state(&self) -> SessionState {
        if self.closed.load(Ordering::Acquire) {
            SessionState::Closed
        } else if self.renewing.load(Ordering::Acquire) {
            SessionState::Renewing
        } else {
            SessionState::Active
        }
    }

    /// Proxy routing and trust for this session.
    pub const fn transport(&self) -> &ProxyTransport {
        &self.transport
    }

    /// CA material the proxy's certificates chain to.
    pub const fn trust(&self) -> &TrustContext {
        self.transport.trust()
    }

    /// `Proxy-Authorization` header value for the current credentials.
    pub fn proxy_authorization(&self) -> HeaderValue {
        self.transport.proxy_authorization()
    }

    /// HTTP and HTTPS proxy URLs embedding the current credentials.
    ///
    /// Intended for handing to tools that take a proxy URL, such as a
    /// subprocess's `HTTP_PROXY`/`HTTPS_PROXY`. The returned URLs are not
    /// updated by later renewals.
    ///
    /// # Errors
    ///
    /// Returns an error if an endpoint cannot carry user-info.
    pub fn proxy_urls(&self) -> Result<(Url, Url)> {
        let credentials = self.credentials.current();
        let endpoints = self.transport.endpoints();
        Ok((
            with_user_info(&endpoints.http, &credentials)?,
            with_user_info(&endpoints.https, &credentials)?,
        ))
    }

    /// Starts building a request sent through this session's client.
    pub fn request<U: reqwest::IntoUrl>(&self, method: Method, url: U) -> RequestBuilder {
        self.client.request(method, url)
    }

    pub fn get<U: reqwest::IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    /// Builds and sends `builder`. See [`send`](Self::send).
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be built or sent.
    pub async fn execute(&self, builder: RequestBuilder) -> Result<Response> {
        let request = builder.build()?;
        self.send(request).await
    }

    /// Sends `request` through the proxy.
    ///
    /// If the response carries a renewal hint close to expiry, the
    /// credentials are renewed before this returns. Renewal failures are
    /// logged and reported as [`SessionEvent::RenewalFailed`]; the response is
    /// returned regardless, and the next hinted response retries.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::SessionClosed`] after [`close`](Self::close),
    /// or [`SessionError::Network`] if the request fails.
    pub async fn send(&self, request: Request) -> Result<Response> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::SessionClosed {
                session_id: self.session_id(),
            });
        }

        let used = self.credentials.current();
        let response = self.client.execute(request).await?;

        if self.manager.auto_renew() {
            self.observe_hint(&used, response.headers()).await;
        }
        Ok(response)
    }

    async fn observe_hint(&self, used: &SessionCredentials, headers: &HeaderMap) {
        let hint = match RenewalHint::from_headers(headers) {
            Ok(Some(hint)) => hint,
            Ok(None) => return,
            Err(e) => {
                warn!(session_id = %used.session_id, error = %e, "ignoring malformed renewal hint");
                return;
            }
        };

        if !self
            .credentials
            .refresh_expiry(used.generation, hint.expires_at)
        {
            debug!(session_id = %used.session_id, "renewal hint is for replaced credentials");
            return;
        }

        let remaining = hint.expires_at - self.manager.now();
        if remaining < self.manager.renew_threshold() {
            self.renew(used.generation).await;
        }
    }

    /// Replaces the credentials if they are still at `generation`.
    async fn renew(&self, generation: u64) {
        let Some(_guard) = RenewalGuard::try_acquire(&self.renewing) else {
            debug!("renewal already in progress");
            return;
        };

        // Another task may have finished a renewal between our response and
        // acquiring the guard.
        let current = self.credentials.current();
        if current.generation != generation || self.closed.load(Ordering::Acquire) {
            return;
        }

        info!(session_id = %current.session_id, expires_at = %current.expires_at, "renewing flux proxy session");
        match self.manager.issue(&self.settings).await {
            Ok((issued, expires_at)) => {
                if self.closed.load(Ordering::Acquire) {
                    debug!(session_id = %issued.session_id, "session closed during renewal; ending renewed session");
                    self.manager.end_and_report(issued.session_id).await;
                    return;
                }

                let next = self
                    .credentials
                    .replace(issued.session_id, issued.secret, expires_at);
                // close() may have read the previous id before the swap.
                if self.closed.load(Ordering::Acquire) {
                    self.manager.end_and_report(next.session_id.clone()).await;
                    return;
                }

                info!(
                    previous_session_id = %current.session_id,
                    session_id = %next.session_id,
                    expires_at = %next.expires_at,
                    "renewed flux proxy session"
                );
                self.manager.emit(&SessionEvent::Renewed {
                    previous_session_id: current.session_id.clone(),
                    session_id: next.session_id.clone(),
                    expires_at: next.expires_at,
                });
            }
            Err(e) => {
                warn!(
                    session_id = %current.session_id,
                    control_plane_addr = %self.manager.control_plane_addr(),
                    error = %e,
                    "unable to renew flux proxy session"
                );
                self.manager.emit(&SessionEvent::RenewalFailed {
                    session_id: current.session_id.clone(),
                    error: Arc::new(SessionError::RenewalFailed(e)),
                });
            }
        }
    }

    /// Ends the current session on the control plane.
    ///
    /// A renewal still in flight when this is called ends the session it
    /// obtained instead of installing it.
    ///
    /// Idempotent. Failures are logged and reported as
    /// [`SessionEvent::CloseFailed`], never returned.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.manager.end_and_report(self.session_id()).await;
    }
}

impl Drop for ProxySession {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let session_id = self.session_id();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let manager = self.manager.clone();
                handle.spawn(async move { manager.end_and_report(session_id).await });
            }
            Err(_) => {
                warn!(session_id = %session_id, "session dropped outside a runtime; leaving it to expire");
            }
        }
    }
}
