use std::fmt;

use anyhow::{Context, Result, anyhow, bail};
use http::{HeaderMap, Method, Uri};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request as seen by interceptors: normalized target plus the headers that
/// will be forwarded upstream (hop-by-hop headers already removed).
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub headers: HeaderMap,
}

impl ProxyRequest {
    /// Host header value for the upstream request; omits the default port.
    pub fn authority_host(&self) -> String {
        let mut host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port != self.scheme.default_port() {
            host.push(':');
            host.push_str(&self.port.to_string());
        }
        host
    }

    /// Request path without query parameters.
    pub fn path_without_query(&self) -> &str {
        self.path.split('?').next().unwrap_or("/")
    }
}

/// Parse an HTTP/1.1 request target into a normalized [`ProxyRequest`].
pub fn parse_http1_request(
    method: Method,
    target: &str,
    host_header: Option<&str>,
    fallback_scheme: Scheme,
) -> Result<ProxyRequest> {
    let uri: Uri = target
        .parse()
        .with_context(|| format!("invalid request target '{target}'"))?;

    if uri.scheme().is_some() {
        return parse_uri_request(method, &uri, fallback_scheme);
    }

    if target == "*" {
        if method != Method::OPTIONS {
            bail!("asterisk-form request target is only valid for OPTIONS");
        }
    } else if !target.starts_with('/') {
        bail!("request target must be origin-form (start with '/')");
    }

    let host_header = host_header
        .ok_or_else(|| anyhow!("request missing Host header required for origin-form request"))?;
    let (host, port) = parse_host_header(host_header)?;

    Ok(ProxyRequest {
        method,
        scheme: fallback_scheme,
        host,
        port: port.unwrap_or(fallback_scheme.default_port()),
        path: target.to_string(),
        headers: HeaderMap::new(),
    })
}

/// Parse an absolute-form URI into a [`ProxyRequest`].
pub fn parse_uri_request(
    method: Method,
    uri: &Uri,
    default_scheme: Scheme,
) -> Result<ProxyRequest> {
    let scheme = match uri.scheme_str() {
        Some(value) => parse_scheme(value)?,
        None => default_scheme,
    };
    let authority = uri
        .authority()
        .map(|auth| auth.as_str())
        .ok_or_else(|| anyhow!("request missing authority"))?;
    let (host, port) = parse_host_header(authority)?;
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    Ok(ProxyRequest {
        method,
        scheme,
        host,
        port: port.unwrap_or(scheme.default_port()),
        path,
        headers: HeaderMap::new(),
    })
}

pub fn parse_scheme(value: &str) -> Result<Scheme> {
    if value.eq_ignore_ascii_case("http") {
        Ok(Scheme::Http)
    } else if value.eq_ignore_ascii_case("https") {
        Ok(Scheme::Https)
    } else {
        bail!("unsupported scheme '{value}'")
    }
}

/// Parse a Host / authority value into a normalized host + port.
pub fn parse_host_header(value: &str) -> Result<(String, Option<u16>)> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        bail!("empty Host header");
    }
    if trimmed.chars().any(|c| c.is_whitespace()) {
        bail!("authority must not contain whitespace");
    }
    if trimmed.contains('@') {
        bail!("authority must not contain userinfo");
    }
    if trimmed.contains(['/', '?', '#', '\\']) {
        bail!("authority must not contain path or query");
    }
    let uri: Uri = format!("http://{trimmed}")
        .parse()
        .with_context(|| format!("invalid Host header '{trimmed}'"))?;
    let host = uri
        .host()
        .ok_or_else(|| anyhow!("Host header missing hostname"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    Ok((host, uri.port_u16()))
}
