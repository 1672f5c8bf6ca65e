use std::collections::HashSet;

use anyhow::{Context, Result, anyhow, bail, ensure};

/// Headers that describe a single connection and are never forwarded.
pub fn is_hop_by_hop(lower_name: &str) -> bool {
    matches!(
        lower_name,
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestHeaderKind {
    Connection,
    Host,
    ContentLength,
    TransferEncoding,
    HopByHop,
    EndToEnd,
}

fn classify_request_header(lower_name: &str) -> RequestHeaderKind {
    match lower_name {
        "connection" => RequestHeaderKind::Connection,
        "host" => RequestHeaderKind::Host,
        "content-length" => RequestHeaderKind::ContentLength,
        "transfer-encoding" => RequestHeaderKind::TransferEncoding,
        name if name.starts_with("proxy-") || is_hop_by_hop(name) => RequestHeaderKind::HopByHop,
        _ => RequestHeaderKind::EndToEnd,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderAction {
    Forward,
    Skip,
}

/// Tracks the framing and connection headers of a client request while its
/// header section is read, and enforces the header size budget.
#[derive(Debug, Clone)]
pub struct RequestHeaderSanitizer {
    max_bytes: usize,
    consumed: usize,
    host: Option<String>,
    content_length: Option<u64>,
    chunked: bool,
    connection_tokens: HashSet<String>,
    transfer_encoding_seen: bool,
}

impl RequestHeaderSanitizer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            consumed: 0,
            host: None,
            content_length: None,
            chunked: false,
            connection_tokens: HashSet::new(),
            transfer_encoding_seen: false,
        }
    }

    pub fn reserve(&mut self, byte_len: usize) -> Result<()> {
        self.consumed = self
            .consumed
            .checked_add(byte_len)
            .ok_or_else(|| anyhow!("header section exceeds configured limit"))?;
        ensure!(
            self.consumed <= self.max_bytes,
            "header section exceeds configured limit"
        );
        Ok(())
    }

    pub fn record(&mut self, name: &str, value: &str, byte_len: usize) -> Result<HeaderAction> {
        self.reserve(byte_len)?;

        match classify_request_header(&name.to_ascii_lowercase()) {
            RequestHeaderKind::Connection => {
                self.record_connection_tokens(value);
                Ok(HeaderAction::Skip)
            }
            RequestHeaderKind::Host => {
                if self.host.is_some() {
                    bail!("duplicate Host header");
                }
                ensure!(!value.is_empty(), "Host header must not be empty");
                self.host = Some(value.to_ascii_lowercase());
                Ok(HeaderAction::Skip)
            }
            RequestHeaderKind::ContentLength => {
                if self.chunked {
                    bail!("request must not include both Content-Length and Transfer-Encoding");
                }
                if self.content_length.is_some() {
                    bail!("multiple Content-Length headers are not supported");
                }
                let length: u64 = value
                    .parse()
                    .with_context(|| format!("invalid Content-Length value '{value}'"))?;
                self.content_length = Some(length);
                Ok(HeaderAction::Skip)
            }
            RequestHeaderKind::TransferEncoding => {
                if self.transfer_encoding_seen {
                    bail!("duplicate Transfer-Encoding header");
                }
                self.transfer_encoding_seen = true;
                if !value.trim().eq_ignore_ascii_case("chunked") {
                    bail!("unsupported Transfer-Encoding '{value}'");
                }
                if self.content_length.is_some() {
                    bail!("request must not include both Content-Length and Transfer-Encoding");
                }
                self.chunked = true;
                Ok(HeaderAction::Skip)
            }
            RequestHeaderKind::HopByHop => Ok(HeaderAction::Skip),
            RequestHeaderKind::EndToEnd => Ok(HeaderAction::Forward),
        }
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn total_bytes(&self) -> usize {
        self.consumed
    }

    pub fn connection_tokens(&self) -> &HashSet<String> {
        &self.connection_tokens
    }

    fn record_connection_tokens(&mut self, value: &str) {
        for token in value.split(',') {
            let trimmed = token.trim();
            if trimmed.is_empty() {
                continue;
            }
            self.connection_tokens.insert(trimmed.to_ascii_lowercase());
        }
    }
}
