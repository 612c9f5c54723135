//! Session manager: mints [`ProxySession`]s and ends them.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{ProxyConfig, SessionDefaults};
use crate::control_plane::{
    ControlPlane, ControlPlaneRegistry, IssuedSession, SessionRequest, TwirpControlPlane,
};
use crate::error::{ControlPlaneError, Result, SessionError};
use crate::events::{EventCallback, SessionEvent};
use crate::session::ProxySession;
use crate::settings::SessionSettings;
use crate::transport::ProxyEndpoints;
use crate::trust::{TrustCache, TrustContext};

#[derive(Clone)]
struct ManagerInner {
    control_plane: Arc<dyn ControlPlane>,
    trust: Arc<TrustCache>,
    endpoints: Arc<ProxyEndpoints>,
    defaults: SessionDefaults,
    renew_threshold: TimeDelta,
    clock: Arc<dyn Clock>,
    on_event: Option<EventCallback>,
}

/// Facade over the control plane that hands out ready-to-use sessions.
///
/// Cheap to clone; clones share the control-plane client and trust cache.
///
/// # Examples
///
/// ```no_run
/// use flux_proxy::{ProxyConfig, SessionManager, SessionSettings};
///
/// # async fn example() -> flux_proxy::Result<()> {
/// let manager = SessionManager::from_config(ProxyConfig::default())?;
/// let session = manager
///     .start_session(SessionSettings::for_credential("cred-1"))
///     .await?;
///
/// let request = session.get("https://api.example.com/v1/employees").build()?;
/// let response = session.send(request).await?;
/// println!("{}", response.status());
///
/// session.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("control_plane_addr", &self.control_plane_addr())
            .field("endpoints", &self.inner.endpoints)
            .field("defaults", &self.inner.defaults)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Creates a manager over an existing control-plane client and trust cache.
    ///
    /// Managers that share `trust` fetch CA certificates once per control-plane
    /// address between them.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(
        config: &ProxyConfig,
        control_plane: Arc<dyn ControlPlane>,
        trust: Arc<TrustCache>,
    ) -> Result<Self> {
        config.validate()?;
        let endpoints = ProxyEndpoints::parse(&config.proxy_http_addr, &config.proxy_https_addr)?;
        let renew_threshold = TimeDelta::from_std(config.session.renew_threshold())
            .map_err(|e| SessionError::Configuration(format!("renew threshold out of range: {e}")))?;

        Ok(Self {
            inner: Arc::new(ManagerInner {
                control_plane,
                trust,
                endpoints: Arc::new(endpoints),
                defaults: config.session.clone(),
                renew_threshold,
                clock: Arc::new(SystemClock),
                on_event: None,
            }),
        })
    }

    /// Creates a manager with its own Twirp client and trust cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the client fails to build.
    pub fn from_config(config: ProxyConfig) -> Result<Self> {
        let control_plane = TwirpControlPlane::new(config.control_plane_addr.clone())?;
        Self::new(&config, Arc::new(control_plane), Arc::new(TrustCache::new()))
    }

    /// Creates a manager whose control-plane client comes from `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn connect(
        config: &ProxyConfig,
        registry: &ControlPlaneRegistry,
        trust: Arc<TrustCache>,
    ) -> Result<Self> {
        let control_plane = registry.client_for(&config.control_plane_addr)?;
        Self::new(config, control_plane, trust)
    }

    /// Replaces the clock used for expiry arithmetic.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        Arc::make_mut(&mut self.inner).clock = clock;
        self
    }

    /// Registers a callback for session lifecycle events.
    #[must_use]
    pub fn with_event_callback(mut self, callback: EventCallback) -> Self {
        Arc::make_mut(&mut self.inner).on_event = Some(callback);
        self
    }

    /// Starts a session and returns a handle wired to the proxy.
    ///
    /// Control-plane failures are returned as-is and never retried.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The settings are invalid
    /// - The CA certificates cannot be fetched or compiled
    /// - `StartSession` fails
    #[instrument(skip(self, settings), fields(control_plane_addr = %self.control_plane_addr()))]
    pub async fn start_session(&self, settings: SessionSettings) -> Result<ProxySession> {
        settings.validate()?;
        let trust = self.trust_context().await?;
        let (issued, expires_at) = self.issue(&settings).await?;
        let session_id = issued.session_id.clone();

        let session = match ProxySession::new(self.clone(), settings, issued, expires_at, trust) {
            Ok(session) => session,
            Err(e) => {
                // Nobody will ever use the issued credentials.
                if let Err(end_err) = self.inner.control_plane.end_session(&session_id).await {
                    warn!(session_id = %session_id, error = %end_err, "failed to end orphaned session");
                }
                return Err(e);
            }
        };

        info!(session_id = %session_id, expires_at = %expires_at, "started flux proxy session");
        self.emit(&SessionEvent::Started {
            session_id,
            expires_at,
        });
        Ok(session)
    }

    /// Ends a session by id.
    ///
    /// Ending an already-ended session is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::ControlPlaneUnavailable`] if `EndSession` fails.
    pub async fn end_session(&self, session_id: &str) -> Result<()> {
        self.inner.control_plane.end_session(session_id).await?;
        Ok(())
    }

    /// Calls `StartSession` for `settings` with an expiry of now + duration.
    pub(crate) async fn issue(
        &self,
        settings: &SessionSettings,
    ) -> std::result::Result<(IssuedSession, DateTime<Utc>), ControlPlaneError> {
        let expires_at = self.expiry_for(settings);
        let request = SessionRequest::from_settings(settings, expires_at);
        let issued = self.inner.control_plane.start_session(&request).await?;
        Ok((issued, expires_at))
    }

    /// Ends `session_id`, reporting the outcome as an event instead of an error.
    pub(crate) async fn end_and_report(&self, session_id: String) {
        match self.inner.control_plane.end_session(&session_id).await {
            Ok(()) => {
                info!(session_id = %session_id, "closed flux proxy session");
                self.emit(&SessionEvent::Closed { session_id });
            }
            Err(e) => {
                warn!(
                    session_id = %session_id,
                    control_plane_addr = %self.control_plane_addr(),
                    error = %e,
                    "unable to close flux proxy session"
                );
                self.emit(&SessionEvent::CloseFailed {
                    session_id,
                    error: Arc::new(SessionError::CloseFailed(e)),
                });
            }
        }
    }

    async fn trust_context(&self) -> Result<TrustContext> {
        self.inner
            .trust
            .get_or_build(self.inner.control_plane.as_ref())
            .await
    }

    fn expiry_for(&self, settings: &SessionSettings) -> DateTime<Utc> {
        let now = self.now();
        TimeDelta::from_std(settings.duration())
            .ok()
            .and_then(|duration| now.checked_add_signed(duration))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub(crate) fn emit(&self, event: &SessionEvent) {
        if let Some(callback) = &self.inner.on_event {
            callback(event);
        }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    pub(crate) fn renew_threshold(&self) -> TimeDelta {
        self.inner.renew_threshold
    }

    pub(crate) fn auto_renew(&self) -> bool {
        self.inner.defaults.auto_renew
    }

    pub(crate) fn endpoints(&self) -> Arc<ProxyEndpoints> {
        Arc::clone(&self.inner.endpoints)
    }

    /// Address of the control plane this manager talks to.
    pub fn control_plane_addr(&self) -> &str {
        self.inner.control_plane.address()
    }

    /// Session defaults from the configuration.
    pub fn defaults(&self) -> &SessionDefaults {
        &self.inner.defaults
    }

    /// The trust cache shared by every session this manager creates.
    pub fn trust_cache(&self) -> &Arc<TrustCache> {
        &self.inner.trust
    }
}
