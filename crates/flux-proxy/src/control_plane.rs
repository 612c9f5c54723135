//! Control-plane RPC client.
//!
//! The control plane issues and revokes proxy sessions and serves the CA
//! certificates the proxy signs intercepted traffic with. It speaks Twirp:
//! protobuf bodies POSTed to `{addr}/api/flux.proxy.v1.FluxProxyService/{Method}`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use prost::Message;
use reqwest::header::CONTENT_TYPE;
use secrecy::SecretString;
use tracing::debug;
use url::Url;

use flux_proxy_proto::{self as pb, twirp};

use crate::error::{ControlPlaneError, TwirpErrorBody};
use crate::settings::{HeaderValues, SessionSettings};

/// Parameters of a `StartSession` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub allow_hosts: Vec<String>,
    pub credential_ids: Vec<String>,
    pub headers: BTreeMap<String, HeaderValues>,
    pub expires_at: DateTime<Utc>,
}

impl SessionRequest {
    /// Request for `settings` expiring at `expires_at`.
    pub fn from_settings(settings: &SessionSettings, expires_at: DateTime<Utc>) -> Self {
        Self {
            allow_hosts: settings.allow_hosts().iter().cloned().collect(),
            credential_ids: settings.credential_ids().to_vec(),
            headers: settings.headers().clone(),
            expires_at,
        }
    }
}

impl From<&SessionRequest> for pb::StartSessionRequest {
    fn from(request: &SessionRequest) -> Self {
        Self {
            allow_hosts: request.allow_hosts.clone(),
            credential_ids: request.credential_ids.clone(),
            headers: request
                .headers
                .iter()
                .map(|(name, values)| pb::HttpHeader {
                    name: name.clone(),
                    values: values.to_vec(),
                })
                .collect(),
            expires_at: Some(pb::timestamp_from_datetime(&request.expires_at)),
        }
    }
}

/// Session credentials returned by `StartSession`.
pub struct IssuedSession {
    pub session_id: String,
    pub secret: SecretString,
}

impl fmt::Debug for IssuedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedSession")
            .field("session_id", &self.session_id)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl From<pb::StartSessionResponse> for IssuedSession {
    fn from(response: pb::StartSessionResponse) -> Self {
        Self {
            session_id: response.session_id,
            secret: SecretString::from(response.secret),
        }
    }
}

/// The control-plane call surface.
///
/// Implementations must be thread-safe; one instance is shared by every
/// session of a [`SessionManager`](crate::SessionManager).
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Address the implementation talks to, used to key shared trust material.
    fn address(&self) -> &str;

    /// Issues a new session.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails or the control plane rejects it.
    async fn start_session(
        &self,
        request: &SessionRequest,
    ) -> Result<IssuedSession, ControlPlaneError>;

    /// Ends a session. Ending an unknown or already-ended session succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails.
    async fn end_session(&self, session_id: &str) -> Result<(), ControlPlaneError>;

    /// PEM encoded CA certificates the proxy presents.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails.
    async fn ca_certificates(&self) -> Result<Vec<String>, ControlPlaneError>;
}

/// [`ControlPlane`] over Twirp with binary protobuf bodies.
#[derive(Clone)]
pub struct TwirpControlPlane {
    http: reqwest::Client,
    address: String,
    base: Url,
}

impl fmt::Debug for TwirpControlPlane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwirpControlPlane")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl TwirpControlPlane {
    /// Creates a client for the control plane at `address`, e.g.
    /// `http://flux-proxy.flux-proxy:8001`.
    ///
    /// # Errors
    ///
    /// Returns an error if `address` is not an absolute http(s) URL or the HTTP
    /// client fails to build.
    pub fn new(address: impl Into<String>) -> Result<Self, ControlPlaneError> {
        let http = reqwest::Client::builder().no_proxy().build()?;
        Self::with_client(http, address)
    }

    /// Creates a client sharing an existing HTTP connection pool.
    ///
    /// # Errors
    ///
    /// Returns an error if `address` is not an absolute http(s) URL.
    pub fn with_client(
        http: reqwest::Client,
        address: impl Into<String>,
    ) -> Result<Self, ControlPlaneError> {
        let address = address.into();
        let base = Url::parse(&address).map_err(|e| ControlPlaneError::InvalidAddress {
            address: address.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(base.scheme(), "http" | "https") || base.cannot_be_a_base() {
            return Err(ControlPlaneError::InvalidAddress {
                address,
                reason: "expected an http or https URL".to_string(),
            });
        }

        Ok(Self {
            http,
            address,
            base,
        })
    }

    fn method_url(&self, method: &str) -> Url {
        let path = format!(
            "{}{}",
            self.base.path().trim_end_matches('/'),
            twirp::method_path(method)
        );
        let mut url = self.base.clone();
        url.set_path(&path);
        url
    }

    /// POSTs `request` to `method` and decodes the protobuf response.
    async fn call<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp, ControlPlaneError>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let url = self.method_url(method);
        debug!(control_plane_addr = %self.address, method, "calling control plane");

        let response = self
            .http
            .post(url)
            .header(CONTENT_TYPE, twirp::CONTENT_TYPE_PROTOBUF)
            .body(request.encode_to_vec())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            let (code, message) = match serde_json::from_str::<TwirpErrorBody>(&body) {
                Ok(parsed) => (parsed.code, parsed.msg),
                Err(_) => ("unknown".to_string(), body),
            };
            return Err(ControlPlaneError::Twirp {
                status: status.as_u16(),
                code,
                message,
            });
        }

        let bytes = response.bytes().await?;
        Ok(Resp::decode(bytes)?)
    }
}

#[async_trait]
impl ControlPlane for TwirpControlPlane {
    fn address(&self) -> &str {
        &self.address
    }

    async fn start_session(
        &self,
        request: &SessionRequest,
    ) -> Result<IssuedSession, ControlPlaneError> {
        let response: pb::StartSessionResponse = self
            .call(twirp::START_SESSION, &pb::StartSessionRequest::from(request))
            .await?;
        Ok(response.into())
    }

    async fn end_session(&self, session_id: &str) -> Result<(), ControlPlaneError> {
        let _: pb::EndSessionResponse = self
            .call(
                twirp::END_SESSION,
                &pb::EndSessionRequest {
                    session_id: session_id.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    async fn ca_certificates(&self) -> Result<Vec<String>, ControlPlaneError> {
        let response: pb::GetCaCertificatesResponse = self
            .call(twirp::GET_CA_CERTIFICATES, &pb::GetCaCertificatesRequest {})
            .await?;
        Ok(response.ca_certificates)
    }
}

/// Address → client registry.
///
/// Construct once and share it so every manager talking to the same control
/// plane reuses one client and its connection pool.
#[derive(Debug)]
pub struct ControlPlaneRegistry {
    http: reqwest::Client,
    clients: DashMap<String, Arc<TwirpControlPlane>>,
}

impl ControlPlaneRegistry {
    /// Creates an empty registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the shared HTTP client fails to build.
    pub fn new() -> Result<Self, ControlPlaneError> {
        Ok(Self {
            http: reqwest::Client::builder().no_proxy().build()?,
            clients: DashMap::new(),
        })
    }

    /// Returns the client for `address`, creating it on first use.
    ///
    /// Two callers racing on a new address may both build a client; only the
    /// first one inserted is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if `address` is not a valid control-plane URL.
    pub fn client_for(&self, address: &str) -> Result<Arc<TwirpControlPlane>, ControlPlaneError> {
        if let Some(existing) = self.clients.get(address) {
            return Ok(Arc::clone(existing.value()));
        }

        let client = Arc::new(TwirpControlPlane::with_client(self.http.clone(), address)?);
        let stored = self.clients.entry(address.to_string()).or_insert(client);
        Ok(Arc::clone(stored.value()))
    }

    /// Number of distinct control-plane addresses seen.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use secrecy::ExposeSecret;
    use smallvec::smallvec;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    use super::*;

    fn protobuf_response<M: Message>(message: &M) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("content-type", twirp::CONTENT_TYPE_PROTOBUF)
            .set_body_bytes(message.encode_to_vec())
    }

    fn sample_request() -> SessionRequest {
        let mut headers = BTreeMap::new();
        headers.insert("X-Tenant".to_string(), smallvec!["acme".to_string()]);
        SessionRequest {
            allow_hosts: vec!["api.example.com".to_string()],
            credential_ids: vec!["cred-1".to_string()],
            headers,
            expires_at: DateTime::from_timestamp(1_700_003_600, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_start_session_round_trip() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/flux.proxy.v1.FluxProxyService/StartSession"))
            .and(header("content-type", "application/protobuf"))
            .respond_with(protobuf_response(&pb::StartSessionResponse {
                session_id: "sess-1".to_string(),
                secret: "s3cr3t".to_string(),
            }))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = TwirpControlPlane::new(mock_server.uri()).unwrap();
        let issued = client.start_session(&sample_request()).await.unwrap();

        assert_eq!(issued.session_id, "sess-1");
        assert_eq!(issued.secret.expose_secret(), "s3cr3t");

        let received: Vec<Request> = mock_server.received_requests().await.unwrap();
        let body = pb::StartSessionRequest::decode(received[0].body.as_slice()).unwrap();
        assert_eq!(body.allow_hosts, vec!["api.example.com"]);
        assert_eq!(body.credential_ids, vec!["cred-1"]);
        assert_eq!(body.headers[0].name, "X-Tenant");
        assert_eq!(body.headers[0].values, vec!["acme"]);
        assert_eq!(body.expires_at.unwrap().seconds, 1_700_003_600);
    }

    #[tokio::test]
    async fn test_end_session() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/flux.proxy.v1.FluxProxyService/EndSession"))
            .respond_with(protobuf_response(&pb::EndSessionResponse {}))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = TwirpControlPlane::new(mock_server.uri()).unwrap();
        client.end_session("sess-1").await.unwrap();

        let received = mock_server.received_requests().await.unwrap();
        let body = pb::EndSessionRequest::decode(received[0].body.as_slice()).unwrap();
        assert_eq!(body.session_id, "sess-1");
    }

    #[tokio::test]
    async fn test_ca_certificates() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/flux.proxy.v1.FluxProxyService/GetCACertificates"))
            .respond_with(protobuf_response(&pb::GetCaCertificatesResponse {
                ca_certificates: vec!["-----BEGIN CERTIFICATE-----".to_string()],
            }))
            .mount(&mock_server)
            .await;

        let client = TwirpControlPlane::new(mock_server.uri()).unwrap();
        let certs = client.ca_certificates().await.unwrap();
        assert_eq!(certs.len(), 1);
    }

    #[tokio::test]
    async fn test_twirp_error_is_decoded() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_json(serde_json::json!({
                "code": "unavailable",
                "msg": "control plane draining"
            })))
            .mount(&mock_server)
            .await;

        let client = TwirpControlPlane::new(mock_server.uri()).unwrap();
        let err = client.start_session(&sample_request()).await.unwrap_err();

        match err {
            ControlPlaneError::Twirp {
                status,
                code,
                message,
            } => {
                assert_eq!(status, 503);
                assert_eq!(code, "unavailable");
                assert_eq!(message, "control plane draining");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_json_error_body_kept_verbatim() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&mock_server)
            .await;

        let client = TwirpControlPlane::new(mock_server.uri()).unwrap();
        let err = client.end_session("sess-1").await.unwrap_err();
        assert!(err.to_string().contains("bad gateway"));
    }

    #[tokio::test]
    async fn test_garbage_body_is_decode_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xff, 0xff, 0xff]))
            .mount(&mock_server)
            .await;

        let client = TwirpControlPlane::new(mock_server.uri()).unwrap();
        let err = client.start_session(&sample_request()).await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::Decode(_)));
    }

    #[test]
    fn test_address_path_prefix_preserved() {
        let client = TwirpControlPlane::new("http://control.local:8001/flux/").unwrap();
        let url = client.method_url(twirp::END_SESSION);
        assert_eq!(
            url.as_str(),
            "http://control.local:8001/flux/api/flux.proxy.v1.FluxProxyService/EndSession"
        );
    }

    #[test]
    fn test_invalid_address_rejected() {
        assert!(matches!(
            TwirpControlPlane::new("not a url"),
            Err(ControlPlaneError::InvalidAddress { .. })
        ));
        assert!(TwirpControlPlane::new("mailto:ops@example.com").is_err());
    }

    #[test]
    fn test_registry_shares_clients_per_address() {
        let registry = ControlPlaneRegistry::new().unwrap();

        let a = registry.client_for("http://control.local:8001").unwrap();
        let b = registry.client_for("http://control.local:8001").unwrap();
        let c = registry.client_for("http://other.local:8001").unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
    }
}
