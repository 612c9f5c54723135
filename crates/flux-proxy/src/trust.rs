//! TLS trust material for the proxy.
//!
//! The proxy terminates TLS with certificates minted by its own CA, so both
//! the connection to an `https://` proxy endpoint and the tunneled connection
//! to the target must be verified against that CA instead of the platform
//! roots. The CA certificates are fetched from the control plane once per
//! control-plane address and compiled into a `rustls::ClientConfig`.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use rustls::{ClientConfig, RootCertStore};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::control_plane::ControlPlane;
use crate::error::{Result, SessionError};

/// Compiled TLS verification material for one control-plane address.
///
/// Cheap to clone; all clones share the same compiled config.
#[derive(Clone)]
pub struct TrustContext {
    pem_bundle: Arc<str>,
    certificate_count: usize,
    tls: Arc<ClientConfig>,
}

impl fmt::Debug for TrustContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustContext")
            .field("certificate_count", &self.certificate_count)
            .finish_non_exhaustive()
    }
}

impl TrustContext {
    /// Compiles a trust context from the PEM blocks served by the control plane.
    ///
    /// Blocks are concatenated in order, each terminated by a newline.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Trust`] if no certificate can be read from the
    /// blocks or a certificate is rejected by the root store.
    pub fn from_pem_blocks<S: AsRef<str>>(blocks: &[S]) -> Result<Self> {
        let pem_bundle = concat_pem_blocks(blocks);

        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut pem_bundle.as_bytes()) {
            let cert = cert
                .map_err(|e| SessionError::Trust(format!("Failed to parse CA certificate: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| SessionError::Trust(format!("Rejected CA certificate: {e}")))?;
        }

        if roots.is_empty() {
            return Err(SessionError::Trust(
                "control plane returned no CA certificates".to_string(),
            ));
        }
        let certificate_count = roots.len();

        let tls = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| SessionError::Trust(format!("Failed to configure TLS: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();

        Ok(Self {
            pem_bundle: pem_bundle.into(),
            certificate_count,
            tls: Arc::new(tls),
        })
    }

    /// The concatenated PEM bundle, e.g. for handing to a subprocess as a CA file.
    pub fn pem_bundle(&self) -> &str {
        &self.pem_bundle
    }

    /// Number of CA certificates in the root store.
    pub const fn certificate_count(&self) -> usize {
        self.certificate_count
    }

    /// The compiled client TLS configuration.
    pub fn tls_config(&self) -> &ClientConfig {
        &self.tls
    }
}

fn concat_pem_blocks<S: AsRef<str>>(blocks: &[S]) -> String {
    let mut bundle = String::new();
    for block in blocks {
        let block = block.as_ref();
        bundle.push_str(block);
        if !block.ends_with('\n') {
            bundle.push('\n');
        }
    }
    bundle
}

/// Address → trust context registry.
///
/// Concurrent first callers for one address wait on a single build, so each
/// address costs exactly one `GetCACertificates` call. A failed build leaves
/// the slot empty for the next caller to retry. Entries never expire.
#[derive(Debug, Default)]
pub struct TrustCache {
    entries: DashMap<String, Arc<OnceCell<TrustContext>>>,
}

impl TrustCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the trust context for `control_plane`'s address, fetching and
    /// compiling it on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the certificates cannot be fetched or compiled.
    pub async fn get_or_build(&self, control_plane: &dyn ControlPlane) -> Result<TrustContext> {
        let address = control_plane.address();
        // Clone the cell out so no map shard lock is held across the await.
        let cell = Arc::clone(
            self.entries
                .entry(address.to_string())
                .or_default()
                .value(),
        );

        let context = cell
            .get_or_try_init(|| async {
                info!(control_plane_addr = %address, "retrieving CA certificates from flux proxy");
                let blocks = control_plane.ca_certificates().await?;
                let context = TrustContext::from_pem_blocks(&blocks)?;
                debug!(
                    control_plane_addr = %address,
                    certificates = context.certificate_count(),
                    "compiled proxy trust context"
                );
                Ok::<_, SessionError>(context)
            })
            .await?;

        Ok(context.clone())
    }

    /// The cached context for `address`, if one has been built.
    pub fn get(&self, address: &str) -> Option<TrustContext> {
        self.entries
            .get(address)
            .and_then(|cell| cell.get().cloned())
    }

    /// Number of addresses with a built context.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
