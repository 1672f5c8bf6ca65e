pub mod cache;
pub mod connect;
pub mod forward_error;
pub mod headers;
pub mod http;
pub mod intercept;
pub mod listener;
pub mod message;
pub mod request;
pub mod upstream;

use std::sync::Arc;

use anyhow::{Context, Result};
use regex::RegexSet;
use rustls::client::ClientConfig;

use crate::{
    settings::Settings,
    tls::{ca::CertificateAuthority, issuer::TlsIssuer},
};

use self::intercept::Interceptor;

/// Shared state handed to every connection task.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub tls: Arc<TlsContext>,
    pub interceptor: Arc<dyn Interceptor>,
    /// CONNECT hosts that are decrypted; all others are spliced.
    pub mitm_hosts: Arc<RegexSet>,
}

impl AppContext {
    pub fn new(
        settings: Arc<Settings>,
        tls: Arc<TlsContext>,
        interceptor: Arc<dyn Interceptor>,
    ) -> Result<Self> {
        let mitm_hosts =
            RegexSet::new(&settings.mitm_hosts).context("invalid mitm_hosts pattern")?;
        Ok(Self {
            settings,
            tls,
            interceptor,
            mitm_hosts: Arc::new(mitm_hosts),
        })
    }

    pub fn should_bump(&self, host: &str) -> bool {
        self.mitm_hosts.is_match(host)
    }
}

#[derive(Clone)]
pub struct TlsContext {
    pub ca: Arc<CertificateAuthority>,
    pub issuer: Arc<TlsIssuer>,
    /// Client configuration for upstream TLS connections.
    pub client: Arc<ClientConfig>,
}

impl TlsContext {
    pub fn new(
        ca: Arc<CertificateAuthority>,
        issuer: Arc<TlsIssuer>,
        client: Arc<ClientConfig>,
    ) -> Self {
        Self { ca, issuer, client }
    }
}

pub async fn run(app: AppContext) -> Result<()> {
    listener::start_listener(app).await
}
