pub mod cli;
pub mod io_util;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod settings;
pub mod tls;
pub mod util;

use std::sync::Arc;

use anyhow::{Result, ensure};
use rustls::crypto::ring;
use rustls::{RootCertStore, client::ClientConfig};
use rustls_native_certs as native_certs;
use tracing::{info, warn};

use crate::{
    proxy::cache::{BlobCache, PathPatternClassifier},
    settings::Settings,
    tls::{ca::CertificateAuthority, cache::CertificateCache, issuer::TlsIssuer},
};

const DEFAULT_CERT_CACHE_CAPACITY: usize = 512;

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    if let Some(addr) = settings.metrics_listen {
        tokio::spawn(async move {
            if let Err(err) = crate::metrics::serve(addr).await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    let ca = Arc::new(CertificateAuthority::load_or_generate(&settings.ca_dir)?);
    info!(
        path = %ca.cert_path().display(),
        "clients must trust this CA certificate for intercepted HTTPS"
    );
    let cert_cache = CertificateCache::new(DEFAULT_CERT_CACHE_CAPACITY)?;
    let issuer = Arc::new(TlsIssuer::new(ca.clone(), cert_cache, settings.leaf_ttl())?);
    let client = build_tls_client_config(native_root_store()?)?;
    let tls = Arc::new(proxy::TlsContext::new(ca, issuer, client));

    let classifier = Arc::new(PathPatternClassifier::new(&settings.blob_path_pattern)?);
    let cache = BlobCache::open(
        settings.cache_dir.clone(),
        classifier,
        settings.wait_poll_interval(),
    )
    .await?;

    let app = proxy::AppContext::new(settings, tls, Arc::new(cache))?;
    proxy::run(app).await
}

fn native_root_store() -> Result<RootCertStore> {
    let mut root_store = RootCertStore::empty();
    let mut anchors_loaded = 0usize;

    match native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = root_store.add_parsable_certificates(certs);
            if ignored > 0 {
                warn!(ignored, "ignored {ignored} invalid system trust anchors");
            }
            anchors_loaded += added;
        }
        Err(err) => {
            warn!(error = %err, "failed to load system trust anchors");
        }
    }

    ensure!(
        anchors_loaded > 0,
        "no trust anchors available; install system certificates"
    );
    Ok(root_store)
}

/// Upstream TLS client configuration. Only HTTP/1.1 is offered since every
/// upstream exchange is a single HTTP/1.1 request.
pub fn build_tls_client_config(roots: RootCertStore) -> Result<Arc<ClientConfig>> {
    let provider = ring::default_provider();
    let mut config = ClientConfig::builder_with_provider(provider.into())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(Arc::new(roots))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
