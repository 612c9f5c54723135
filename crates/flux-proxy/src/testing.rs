//! Test doubles shared by the unit tests.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use secrecy::SecretString;

use crate::clock::Clock;
use crate::control_plane::{ControlPlane, IssuedSession, SessionRequest};
use crate::error::ControlPlaneError;

/// Self-signed CA certificate in PEM form.
pub fn test_ca_pem(common_name: &str) -> String {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.self_signed(&key).unwrap().pem()
}

fn unavailable() -> ControlPlaneError {
    ControlPlaneError::Twirp {
        status: 503,
        code: "unavailable".to_string(),
        message: "stub failure".to_string(),
    }
}

/// Call-counting control plane. Issues `sess-N`/`secret-N` pairs.
#[derive(Debug)]
pub struct StubControlPlane {
    address: String,
    ca_pem: String,
    delay: Duration,
    pub start_calls: AtomicUsize,
    pub end_calls: AtomicUsize,
    pub ca_calls: AtomicUsize,
    pub fail_start: AtomicBool,
    pub fail_end: AtomicBool,
    pub fail_ca: AtomicBool,
    pub requests: Mutex<Vec<SessionRequest>>,
    pub ended: Mutex<Vec<String>>,
}

impl StubControlPlane {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            ca_pem: test_ca_pem("flux-proxy test CA"),
            delay: Duration::ZERO,
            start_calls: AtomicUsize::new(0),
            end_calls: AtomicUsize::new(0),
            ca_calls: AtomicUsize::new(0),
            fail_start: AtomicBool::new(false),
            fail_end: AtomicBool::new(false),
            fail_ca: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
            ended: Mutex::new(Vec::new()),
        }
    }

    /// Delays every call, widening race windows.
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn last_request(&self) -> SessionRequest {
        self.requests.lock().unwrap().last().cloned().unwrap()
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl ControlPlane for StubControlPlane {
    fn address(&self) -> &str {
        &self.address
    }

    async fn start_session(
        &self,
        request: &SessionRequest,
    ) -> Result<IssuedSession, ControlPlaneError> {
        let n = self.start_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.pause().await;
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.requests.lock().unwrap().push(request.clone());
        Ok(IssuedSession {
            session_id: format!("sess-{n}"),
            secret: SecretString::from(format!("secret-{n}")),
        })
    }

    async fn end_session(&self, session_id: &str) -> Result<(), ControlPlaneError> {
        self.end_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.fail_end.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.ended.lock().unwrap().push(session_id.to_string());
        Ok(())
    }

    async fn ca_certificates(&self) -> Result<Vec<String>, ControlPlaneError> {
        self.ca_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.fail_ca.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        Ok(vec![self.ca_pem.clone()])
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
