#![allow(dead_code)]

mod dirs;
mod harness;
mod http_utils;
mod tls;
mod upstream;

pub use dirs::TestDirs;
pub use harness::{ProxyHarness, ProxyHarnessBuilder};
pub use http_utils::{
    ParsedResponse, blob_path, proxy_get, read_http_response, read_until_double_crlf,
};
pub use tls::{build_client_tls, build_upstream_tls_config};
pub use upstream::{BlobUpstream, Route};
