use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use rustls::{RootCertStore, client::ClientConfig, crypto::ring, sign::SingleCertAndKey};

use layerproxy::tls::ca::CertificateAuthority;

/// Client configuration trusting only `root_store`, offering HTTP/1.1.
pub fn build_client_tls(root_store: RootCertStore) -> Result<Arc<ClientConfig>> {
    let provider = ring::default_provider();
    let builder = ClientConfig::builder_with_provider(provider.into());
    let builder = builder.with_safe_default_protocol_versions()?;
    let builder = builder.with_root_certificates(Arc::new(root_store));
    let mut config = builder.with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Server configuration for a mock upstream presenting a leaf minted by `ca`.
pub fn build_upstream_tls_config(
    ca: &CertificateAuthority,
    host: &str,
) -> Result<Arc<rustls::ServerConfig>> {
    let minted = ca.mint_leaf(host, StdDuration::from_secs(3600))?;
    let provider = ring::default_provider();
    let builder = rustls::ServerConfig::builder_with_provider(provider.into());
    let builder = builder.with_safe_default_protocol_versions()?;
    let mut config = builder
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SingleCertAndKey::from(minted.certified_key)));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
