//! TLS configurations for the QUIC endpoints.
//!
//! Both sides pin the `ring` provider and TLS 1.3 so the result does not
//! depend on which process-wide crypto provider happens to be installed.

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::CsiError;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Server configuration presenting `certs` (leaf first) signed by `key`.
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<rustls::ServerConfig, CsiError> {
    rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(CsiError::config)?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(CsiError::config)
}

/// Client configuration trusting only `roots`.
pub fn client_config(
    roots: impl IntoIterator<Item = CertificateDer<'static>>,
) -> Result<rustls::ClientConfig, CsiError> {
    let mut store = rustls::RootCertStore::empty();
    for cert in roots {
        store.add(cert).map_err(CsiError::config)?;
    }
    Ok(rustls::ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(CsiError::config)?
        .with_root_certificates(store)
        .with_no_client_auth())
}
