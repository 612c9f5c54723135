//! Wire definitions for the flux proxy control plane.
//!
//! This crate contains the protobuf message types of the
//! `flux.proxy.v1.FluxProxyService` (see `proto/flux/proxy/v1/proxy.proto`),
//! the Twirp routes they are exchanged on, and timestamp conversions between
//! `chrono` and the protobuf well-known types.
//!
//! The messages mirror what `prost-build` emits for the schema; they are
//! written out here so the crate builds without `protoc` on the path.

mod convert;

#[allow(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used
)]
pub mod proto {
    #[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
    pub struct HttpHeader {
        #[prost(string, tag = "1")]
        pub name: ::prost::alloc::string::String,
        #[prost(string, repeated, tag = "2")]
        pub values: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct StartSessionRequest {
        #[prost(string, repeated, tag = "1")]
        pub allow_hosts: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
        #[prost(string, repeated, tag = "2")]
        pub credential_ids: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
        #[prost(message, repeated, tag = "3")]
        pub headers: ::prost::alloc::vec::Vec<HttpHeader>,
        #[prost(message, optional, tag = "4")]
        pub expires_at: ::core::option::Option<::prost_types::Timestamp>,
    }

    #[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
    pub struct StartSessionResponse {
        #[prost(string, tag = "1")]
        pub session_id: ::prost::alloc::string::String,
        #[prost(string, tag = "2")]
        pub secret: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
    pub struct EndSessionRequest {
        #[prost(string, tag = "1")]
        pub session_id: ::prost::alloc::string::String,
    }

    #[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
    pub struct EndSessionResponse {}

    #[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
    pub struct GetCaCertificatesRequest {}

    #[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
    pub struct GetCaCertificatesResponse {
        #[prost(string, repeated, tag = "1")]
        pub ca_certificates: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    }
}

/// Twirp routing for the control-plane service.
pub mod twirp {
    /// Path prefix the control plane mounts its Twirp handlers under.
    pub const PATH_PREFIX: &str = "/api";

    /// Fully qualified protobuf service name.
    pub const SERVICE: &str = "flux.proxy.v1.FluxProxyService";

    /// Content type for binary protobuf request and response bodies.
    pub const CONTENT_TYPE_PROTOBUF: &str = "application/protobuf";

    pub const START_SESSION: &str = "StartSession";
    pub const END_SESSION: &str = "EndSession";
    pub const GET_CA_CERTIFICATES: &str = "GetCACertificates";

    /// Returns the request path for a service method,
    /// e.g. `/api/flux.proxy.v1.FluxProxyService/StartSession`.
    #[must_use]
    pub fn method_path(method: &str) -> String {
        format!("{PATH_PREFIX}/{SERVICE}/{method}")
    }
}

pub use convert::{datetime_from_timestamp, timestamp_from_datetime};
pub use proto::{
    EndSessionRequest, EndSessionResponse, GetCaCertificatesRequest, GetCaCertificatesResponse,
    HttpHeader, StartSessionRequest, StartSessionResponse,
};

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use prost::Message;

    use super::*;

    #[test]
    fn test_method_path() {
        assert_eq!(
            twirp::method_path(twirp::START_SESSION),
            "/api/flux.proxy.v1.FluxProxyService/StartSession"
        );
        assert_eq!(
            twirp::method_path(twirp::GET_CA_CERTIFICATES),
            "/api/flux.proxy.v1.FluxProxyService/GetCACertificates"
        );
    }

    #[test]
    fn test_start_session_request_decodes_what_it_encodes() {
        let request = StartSessionRequest {
            allow_hosts: vec!["api.example.com".to_string()],
            credential_ids: vec!["cred-1".to_string(), "cred-2".to_string()],
            headers: vec![HttpHeader {
                name: "X-Tenant".to_string(),
                values: vec!["acme".to_string()],
            }],
            expires_at: Some(prost_types::Timestamp {
                seconds: 1_700_000_000,
                nanos: 0,
            }),
        };

        let decoded = StartSessionRequest::decode(request.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_empty_messages_encode_to_nothing() {
        assert!(GetCaCertificatesRequest {}.encode_to_vec().is_empty());
        assert!(EndSessionResponse {}.encode_to_vec().is_empty());
    }
}
