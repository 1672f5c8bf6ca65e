use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use layerproxy::{
    build_tls_client_config,
    cli::LogFormat,
    proxy::{
        self, AppContext,
        cache::{BlobCache, PathPatternClassifier},
        intercept::Interceptor,
        listener,
    },
    settings::Settings,
    tls::{ca::CertificateAuthority, cache::CertificateCache, issuer::TlsIssuer},
};

use rustls::RootCertStore;

use super::dirs::TestDirs;

const CERT_CACHE_CAPACITY: usize = 64;

fn default_test_settings(dirs: &TestDirs) -> Settings {
    Settings {
        listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
        cache_dir: dirs.cache_dir.clone(),
        ca_dir: dirs.ca_dir.clone(),
        log: LogFormat::Text,
        leaf_ttl: 3_600,
        client_timeout: 10,
        upstream_connect_timeout: 5,
        upstream_timeout: 10,
        wait_poll_interval_ms: 200,
        ..Settings::default()
    }
}

/// A proxy listening on an ephemeral loopback port.
pub struct ProxyHarness {
    pub addr: SocketAddr,
    pub settings: Arc<Settings>,
    pub ca: Arc<CertificateAuthority>,
    pub cache: Option<Arc<BlobCache>>,
    handle: JoinHandle<()>,
}

impl ProxyHarness {
    pub async fn connect(&self) -> Result<TcpStream> {
        Ok(TcpStream::connect(self.addr).await?)
    }

    pub async fn shutdown(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

pub struct ProxyHarnessBuilder<'a> {
    dirs: &'a TestDirs,
    upstream_root_store: RootCertStore,
    interceptor: Option<Arc<dyn Interceptor>>,
    settings_override: Option<Box<dyn FnOnce(&mut Settings) + Send>>,
}

impl<'a> ProxyHarnessBuilder<'a> {
    pub fn new(dirs: &'a TestDirs) -> Self {
        Self {
            dirs,
            upstream_root_store: RootCertStore::empty(),
            interceptor: None,
            settings_override: None,
        }
    }

    /// Trust anchors the proxy uses to verify upstream TLS servers.
    pub fn with_upstream_root_store(mut self, root_store: RootCertStore) -> Self {
        self.upstream_root_store = root_store;
        self
    }

    /// Replaces the blob cache with another interceptor.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    pub fn with_settings<F>(mut self, func: F) -> Self
    where
        F: FnOnce(&mut Settings) + Send + 'static,
    {
        self.settings_override = Some(Box::new(func));
        self
    }

    pub async fn spawn(mut self) -> Result<ProxyHarness> {
        let mut settings = default_test_settings(self.dirs);
        if let Some(override_fn) = self.settings_override.take() {
            override_fn(&mut settings);
        }
        settings.validate()?;
        let settings = Arc::new(settings);

        let ca = Arc::new(CertificateAuthority::load_or_generate(&settings.ca_dir)?);
        let issuer = Arc::new(TlsIssuer::new(
            ca.clone(),
            CertificateCache::new(CERT_CACHE_CAPACITY)?,
            StdDuration::from_secs(settings.leaf_ttl),
        )?);
        let client = build_tls_client_config(self.upstream_root_store)?;
        let tls = Arc::new(proxy::TlsContext::new(ca.clone(), issuer, client));

        let mut cache = None;
        let interceptor: Arc<dyn Interceptor> = match self.interceptor.take() {
            Some(interceptor) => interceptor,
            None => {
                let classifier = Arc::new(PathPatternClassifier::new(&settings.blob_path_pattern)?);
                let blob_cache = Arc::new(
                    BlobCache::open(
                        settings.cache_dir.clone(),
                        classifier,
                        settings.wait_poll_interval(),
                    )
                    .await?,
                );
                cache = Some(blob_cache.clone());
                blob_cache
            }
        };

        let app = AppContext::new(settings.clone(), tls, interceptor)?;
        let tcp = TcpListener::bind(settings.listen).await?;
        let addr = tcp.local_addr()?;
        let handle = tokio::spawn(async move {
            if let Err(err) = listener::serve(tcp, app).await {
                tracing::error!(error = ?err, "proxy listener failed");
            }
        });

        Ok(ProxyHarness {
            addr,
            settings,
            ca,
            cache,
            handle,
        })
    }
}
