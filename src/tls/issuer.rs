use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Result, ensure};
use rustls::crypto::ring;
use rustls::server::ServerConfig;
use rustls::sign::SingleCertAndKey;

use super::{ca::CertificateAuthority, cache::CertificateCache};

/// Builds TLS server configurations for bumped CONNECT tunnels.
pub struct TlsIssuer {
    ca: Arc<CertificateAuthority>,
    cache: CertificateCache,
    ttl: StdDuration,
}

impl TlsIssuer {
    pub fn new(
        ca: Arc<CertificateAuthority>,
        cache: CertificateCache,
        ttl: StdDuration,
    ) -> Result<Self> {
        ensure!(ttl > StdDuration::from_secs(0), "leaf ttl must be positive");
        Ok(Self { ca, cache, ttl })
    }

    /// Server configuration presenting a leaf for `host`. Only HTTP/1.1 is
    /// offered over ALPN.
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>> {
        let host = host.to_ascii_lowercase();
        let certified = self
            .cache
            .get_or_mint(&host, || self.ca.mint_leaf(&host, self.ttl))?;
        let provider = ring::default_provider();
        let mut config = ServerConfig::builder_with_provider(provider.into())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(SingleCertAndKey::from(certified)));
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }
}
