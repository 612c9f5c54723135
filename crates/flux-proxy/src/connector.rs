//! Single-credential HTTP convenience over a [`ProxySession`].

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use tracing::warn;

use crate::error::{Result, SessionError};
use crate::manager::SessionManager;
use crate::session::ProxySession;
use crate::settings::SessionSettings;

/// HTTP client for calling one integration through the proxy.
///
/// The proxy attaches the referenced credential server-side. A `401` from
/// upstream means that credential is no longer valid and is returned as
/// [`SessionError::UpstreamUnauthorized`] instead of a response.
#[derive(Debug)]
pub struct HttpConnector {
    session: ProxySession,
}

impl HttpConnector {
    /// Starts a session for `credential_id` using the manager's default duration.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be started.
    pub async fn connect(manager: &SessionManager, credential_id: impl Into<String>) -> Result<Self> {
        let settings = SessionSettings::for_credential(credential_id)
            .with_duration(manager.defaults().duration());
        let session = manager.start_session(settings).await?;
        Ok(Self::new(session))
    }

    pub const fn new(session: ProxySession) -> Self {
        Self { session }
    }

    pub const fn session(&self) -> &ProxySession {
        &self.session
    }

    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.session.request(method, url)
    }

    pub async fn get(&self, url: &str) -> Result<Response> {
        self.send(self.request(Method::GET, url)).await
    }

    pub async fn delete(&self, url: &str) -> Result<Response> {
        self.send(self.request(Method::DELETE, url)).await
    }

    /// POSTs `body` as JSON.
    pub async fn post<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<Response> {
        self.send(self.request(Method::POST, url).json(body)).await
    }

    /// PUTs `body` as JSON.
    pub async fn put<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<Response> {
        self.send(self.request(Method::PUT, url).json(body)).await
    }

    /// PATCHes `body` as JSON.
    pub async fn patch<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<Response> {
        self.send(self.request(Method::PATCH, url).json(body)).await
    }

    /// Sends a prepared request.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::UpstreamUnauthorized`] on a `401`, or any error
    /// from [`ProxySession::execute`].
    pub async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = self.session.execute(builder).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            let url = response.url().to_string();
            warn!(session_id = %self.session.session_id(), url = %url, "upstream rejected integration credentials");
            return Err(SessionError::UpstreamUnauthorized { url });
        }
        Ok(response)
    }

    /// Ends the session. Never fails; see [`ProxySession::close`].
    pub async fn close(&self) {
        self.session.close().await;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::config::ProxyConfig;
    use crate::control_plane::ControlPlane;
    use crate::testing::StubControlPlane;
    use crate::trust::TrustCache;

    async fn connector(proxy: &MockServer) -> (HttpConnector, Arc<StubControlPlane>) {
        let stub = Arc::new(StubControlPlane::new("http://control.local:8001"));
        let mut config =
            ProxyConfig::new("http://control.local:8001", proxy.uri(), "https://127.0.0.1:9");
        config.session.duration_secs = 900;

        let control_plane: Arc<dyn ControlPlane> = stub.clone();
        let manager = SessionManager::new(&config, control_plane, Arc::new(TrustCache::new())).unwrap();
        (HttpConnector::connect(&manager, "cred-42").await.unwrap(), stub)
    }

    #[tokio::test]
    async fn test_connect_uses_credential_and_default_duration() {
        let proxy = MockServer::start().await;
        let (connector, stub) = connector(&proxy).await;

        let request = stub.last_request();
        assert_eq!(request.credential_ids, vec!["cred-42"]);
        assert_eq!(
            connector.session().settings().duration(),
            std::time::Duration::from_secs(900)
        );
    }

    #[tokio::test]
    async fn test_unauthorized_is_distinct_error() {
        let proxy = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/employees"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&proxy)
            .await;
        let (connector, _) = connector(&proxy).await;

        let err = connector
            .get("http://hris.test/v1/employees")
            .await
            .unwrap_err();

        assert!(err.is_unauthorized());
        assert!(err.to_string().contains("hris.test/v1/employees"));
    }

    #[tokio::test]
    async fn test_other_statuses_pass_through() {
        let proxy = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&proxy)
            .await;
        let (connector, _) = connector(&proxy).await;

        let response = connector.delete("http://hris.test/v1/employees/7").await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_post_sends_json_body() {
        let proxy = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/employees"))
            .and(body_json(json!({"name": "Ada"})))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&proxy)
            .await;
        let (connector, _) = connector(&proxy).await;

        let response = connector
            .post("http://hris.test/v1/employees", &json!({"name": "Ada"}))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_close_ends_session() {
        let proxy = MockServer::start().await;
        let (connector, stub) = connector(&proxy).await;

        connector.close().await;

        assert_eq!(stub.end_calls.load(Ordering::SeqCst), 1);
        assert!(connector.get("http://hris.test/").await.is_err());
    }
}
