//! Live session credentials shared between a session and its transport.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderValue;
use secrecy::{ExposeSecret, SecretString};

/// One (session id, secret, expiry) triple issued by the control plane.
///
/// `generation` starts at zero and increases by one with every renewal, so a
/// response can be matched against the credentials it was sent with.
#[derive(Clone)]
pub struct SessionCredentials {
    pub session_id: String,
    pub secret: SecretString,
    pub expires_at: DateTime<Utc>,
    pub generation: u64,
}

impl SessionCredentials {
    pub const fn new(session_id: String, secret: SecretString, expires_at: DateTime<Utc>) -> Self {
        Self {
            session_id,
            secret,
            expires_at,
            generation: 0,
        }
    }

    /// `Basic base64(session_id:secret)`, marked sensitive so it is redacted
    /// from `Debug` output of header maps.
    pub fn proxy_authorization(&self) -> HeaderValue {
        let token = STANDARD.encode(format!(
            "{}:{}",
            self.session_id,
            self.secret.expose_secret()
        ));
        let mut value = HeaderValue::try_from(format!("Basic {token}"))
            .unwrap_or_else(|_| HeaderValue::from_static("Basic"));
        value.set_sensitive(true);
        value
    }
}

impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("session_id", &self.session_id)
            .field("secret", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Holder of the current credentials.
///
/// Readers get an `Arc` snapshot, so a reader sees either the whole triple
/// before a swap or the whole triple after it.
pub struct CredentialCell {
    current: RwLock<Arc<SessionCredentials>>,
}

impl CredentialCell {
    pub fn new(credentials: SessionCredentials) -> Self {
        Self {
            current: RwLock::new(Arc::new(credentials)),
        }
    }

    /// Snapshot of the current credentials.
    pub fn current(&self) -> Arc<SessionCredentials> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Installs renewed credentials, bumping the generation. Returns the
    /// installed snapshot.
    pub fn replace(
        &self,
        session_id: String,
        secret: SecretString,
        expires_at: DateTime<Utc>,
    ) -> Arc<SessionCredentials> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let next = Arc::new(SessionCredentials {
            session_id,
            secret,
            expires_at,
            generation: guard.generation + 1,
        });
        *guard = Arc::clone(&next);
        next
    }

    /// Records a server-reported expiry, but only if `generation` is still
    /// current. Returns whether the expiry was applied.
    pub fn refresh_expiry(&self, generation: u64, expires_at: DateTime<Utc>) -> bool {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if guard.generation != generation {
            return false;
        }
        if guard.expires_at != expires_at {
            let mut updated = SessionCredentials::clone(&guard);
            updated.expires_at = expires_at;
            *guard = Arc::new(updated);
        }
        true
    }
}

impl fmt::Debug for CredentialCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCell")
            .field("current", &self.current())
            .finish()
    }
}
