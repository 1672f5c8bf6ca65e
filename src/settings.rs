use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use config::{Config, ConfigError, Environment, File};
use regex::RegexSet;
use serde::Deserialize;

use crate::proxy::cache::{DEFAULT_BLOB_PATH_PATTERN, PathPatternClassifier};
use crate::cli::{Cli, LogFormat};

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/tmp/proxy")
}

fn default_ca_dir() -> PathBuf {
    PathBuf::from("/tmp/layerproxy-ca")
}

fn default_blob_path_pattern() -> String {
    DEFAULT_BLOB_PATH_PATTERN.to_string()
}

fn default_mitm_hosts() -> Vec<String> {
    vec![".*".to_string()]
}

fn default_leaf_ttl() -> u64 {
    86_400
}

fn default_client_timeout() -> u64 {
    30
}

fn default_upstream_connect_timeout() -> u64 {
    5
}

fn default_upstream_timeout() -> u64 {
    60
}

fn default_wait_poll_interval_ms() -> u64 {
    2_000
}

fn default_max_header_size() -> usize {
    32 * 1024
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_ca_dir")]
    pub ca_dir: PathBuf,
    #[serde(default = "default_blob_path_pattern")]
    pub blob_path_pattern: String,
    /// CONNECT hosts matching any of these are decrypted and served through
    /// the cache; all others are tunneled untouched.
    #[serde(default = "default_mitm_hosts")]
    pub mitm_hosts: Vec<String>,
    #[serde(default = "default_leaf_ttl")]
    pub leaf_ttl: u64,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect_timeout: u64,
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout: u64,
    /// Upper bound between re-checks while waiting on an in-flight download.
    #[serde(default = "default_wait_poll_interval_ms")]
    pub wait_poll_interval_ms: u64,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            cache_dir: default_cache_dir(),
            ca_dir: default_ca_dir(),
            blob_path_pattern: default_blob_path_pattern(),
            mitm_hosts: default_mitm_hosts(),
            leaf_ttl: default_leaf_ttl(),
            client_timeout: default_client_timeout(),
            upstream_connect_timeout: default_upstream_connect_timeout(),
            upstream_timeout: default_upstream_timeout(),
            wait_poll_interval_ms: default_wait_poll_interval_ms(),
            max_header_size: default_max_header_size(),
            log: default_log_format(),
            verbose: false,
            metrics_listen: None,
        }
    }
}

impl Settings {
    /// Layers defaults, the optional config file, `LAYERPROXY_*` environment
    /// variables and finally command-line flags.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli);

        if let Some(path) = &config_path {
            builder = builder.add_source(File::from(path.clone()).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("LAYERPROXY")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("mitm_hosts")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        if let Some(path) = &config_path {
            settings.apply_base_dir(path);
        }
        settings.apply_cli(cli);
        settings.validate()?;
        Ok(settings)
    }

    pub fn leaf_ttl(&self) -> Duration {
        Duration::from_secs(self.leaf_ttl)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }

    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }

    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(listen) = cli.listen {
            self.listen = listen;
        }
        if let Some(cache_dir) = &cli.cache_dir {
            self.cache_dir = cache_dir.clone();
        }
        if let Some(log) = cli.log {
            self.log = log;
        }
        self.verbose |= cli.verbose;
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        self.cache_dir = absolutize(&self.cache_dir, base_dir);
        self.ca_dir = absolutize(&self.ca_dir, base_dir);
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_header_size > 0,
            "max_header_size must be greater than 0 (got {})",
            self.max_header_size
        );
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.upstream_connect_timeout > 0,
            "upstream_connect_timeout must be greater than 0 seconds (got {})",
            self.upstream_connect_timeout
        );
        ensure!(
            self.upstream_timeout > 0,
            "upstream_timeout must be greater than 0 seconds (got {})",
            self.upstream_timeout
        );
        ensure!(
            self.leaf_ttl > 0,
            "leaf_ttl must be greater than 0 seconds (got {})",
            self.leaf_ttl
        );
        ensure!(
            self.wait_poll_interval_ms > 0,
            "wait_poll_interval_ms must be greater than 0 (got {})",
            self.wait_poll_interval_ms
        );
        ensure!(
            !self.cache_dir.as_os_str().is_empty(),
            "cache_dir must not be empty"
        );
        PathPatternClassifier::new(&self.blob_path_pattern)?;
        RegexSet::new(&self.mitm_hosts).context("invalid mitm_hosts pattern")?;
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

fn resolve_config_path(cli: &Cli) -> Option<PathBuf> {
    if let Some(path) = &cli.config {
        return Some(path.clone());
    }
    default_config_candidates()
        .into_iter()
        .find(|candidate| candidate.exists())
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/layerproxy/layerproxy.toml"),
        PathBuf::from("layerproxy.toml"),
    ]
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
