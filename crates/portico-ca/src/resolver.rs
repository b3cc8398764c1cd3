//! rustls certificate resolver backed by the CA.
//!
//! Serves a CA-issued leaf for the canonical domain and its aliases. Any
//! other (or absent) SNI gets the canonical certificate, so a stranger
//! cannot make the daemon mint certificates for arbitrary names.

use std::fmt;
use std::sync::Arc;

use rustls::crypto::ring::sign;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;

use crate::error::CaError;
use crate::leaf::CertificateBundle;
use crate::CaCore;

/// Build a rustls `CertifiedKey` from a bundle whose key matches its
/// certificate.
pub(crate) fn certified_key(bundle: &CertificateBundle) -> Result<Arc<CertifiedKey>, CaError> {
    let key_der = pem::parse(bundle.key_pem.as_str())
        .map_err(|e| CaError::Certificate(e.to_string()))?
        .into_contents();
    let private_key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der));
    let signing_key = sign::any_supported_type(&private_key)
        .map_err(|e| CaError::Certificate(e.to_string()))?;
    let chain = vec![CertificateDer::from(bundle.cert_der.clone())];
    let certified = CertifiedKey::new(chain, signing_key);
    certified
        .keys_match()
        .map_err(|e| CaError::Certificate(format!("leaf key does not match certificate: {e}")))?;
    Ok(Arc::new(certified))
}

pub struct CaResolver {
    core: Arc<CaCore>,
    canonical: String,
    aliases: Vec<String>,
}

impl fmt::Debug for CaResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaResolver")
            .field("canonical", &self.canonical)
            .field("aliases", &self.aliases)
            .finish()
    }
}

impl CaResolver {
    pub fn new(core: Arc<CaCore>, canonical: impl Into<String>, aliases: Vec<String>) -> Self {
        Self {
            core,
            canonical: canonical.into(),
            aliases,
        }
    }

    /// The domain a handshake with `sni` is served under.
    pub fn domain_for(&self, sni: Option<&str>) -> &str {
        let Some(sni) = sni else {
            return &self.canonical;
        };
        let sni = sni.trim_end_matches('.');
        if sni.eq_ignore_ascii_case(&self.canonical) {
            return &self.canonical;
        }
        self.aliases
            .iter()
            .find(|a| a.eq_ignore_ascii_case(sni))
            .map(String::as_str)
            .unwrap_or(&self.canonical)
    }

    pub(crate) fn resolve_name(&self, sni: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let domain = self.domain_for(sni).to_string();
        let issue = || self.core.issue(&domain);

        // Minting is CPU-bound; keep it off the reactor where possible.
        let result = match tokio::runtime::Handle::try_current() {
            Ok(handle)
                if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread =>
            {
                tokio::task::block_in_place(issue)
            }
            _ => issue(),
        };

        match result {
            Ok(leaf) => Some(leaf.certified.clone()),
            Err(e) => {
                tracing::error!(domain = %domain, error = %e, "Failed to obtain certificate for TLS handshake");
                None
            }
        }
    }

    /// TLS server configuration using this resolver (ring provider, http/1.1 only).
    pub fn into_server_config(self) -> Result<rustls::ServerConfig, CaError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| CaError::Certificate(e.to_string()))?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(self));
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(config)
    }
}

impl ResolvesServerCert for CaResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.resolve_name(client_hello.server_name())
    }
}
