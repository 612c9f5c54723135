//! # flux-proxy
//!
//! Client library for sending outbound HTTP traffic through the flux forward
//! proxy using short-lived, auto-renewing sessions.
//!
//! Callers never hold integration credentials. They reference them by id in
//! [`SessionSettings`]; the control plane issues a session id and secret that
//! authenticate to the proxy, and the proxy attaches the real credentials
//! server-side.
//!
//! - [`SessionManager`] starts and ends sessions against the control plane.
//! - [`ProxySession`] routes requests through the proxy, renewing its
//!   credentials in place when a response says they are about to expire.
//! - [`TrustCache`] fetches the proxy's CA certificates once per control-plane
//!   address.
//! - [`HttpConnector`] is a single-credential convenience that turns upstream
//!   `401`s into [`SessionError::UpstreamUnauthorized`].
//!
//! ## Example
//!
//! ```no_run
//! use flux_proxy::{HttpConnector, ProxyConfig, SessionManager};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let manager = SessionManager::from_config(ProxyConfig::load()?)?;
//! let connector = HttpConnector::connect(&manager, "cred-1").await?;
//!
//! let response = connector.get("https://api.example.com/v1/employees").await?;
//! println!("{}", response.text().await?);
//!
//! connector.close().await;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod connector;
pub mod control_plane;
pub mod credentials;
pub mod error;
pub mod events;
pub mod hint;
pub mod manager;
pub mod session;
pub mod settings;
pub mod transport;
pub mod trust;

#[cfg(test)]
mod testing;

pub use clock::{Clock, SystemClock};
pub use config::{ProxyConfig, SessionDefaults};
pub use connector::HttpConnector;
pub use control_plane::{ControlPlane, ControlPlaneRegistry, TwirpControlPlane};
pub use credentials::SessionCredentials;
pub use error::{ControlPlaneError, Result, SessionError};
pub use events::{EventCallback, SessionEvent};
pub use hint::{RenewalHint, SESSION_HINT_HEADER};
pub use manager::SessionManager;
pub use session::{ProxySession, SessionState};
pub use settings::SessionSettings;
pub use transport::{ProxyEndpoints, ProxyTransport};
pub use trust::{TrustCache, TrustContext};
