use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{HeaderMap, StatusCode, Version};
use tokio::io::{AsyncRead, BufReader};
use tokio::time::Instant;
use tracing::warn;

use crate::proxy::headers::is_hop_by_hop;

use super::headers::{Http1HeaderLine, header_lines_to_map};
use super::line::read_line_with_deadline;

/// How the body of a response written to the client is delimited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ResponseFraming {
    /// No body follows; `Some` still advertises the representation length
    /// (responses to HEAD).
    Empty(Option<u64>),
    Fixed(u64),
    Chunked,
}

#[derive(Debug)]
pub(crate) struct Http1ResponseHead {
    pub status: StatusCode,
    pub headers: Vec<Http1HeaderLine>,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub transfer_encoding_present: bool,
}

impl Http1ResponseHead {
    /// Headers meant for the final recipient: hop-by-hop headers, headers
    /// named in `Connection`, and framing headers are dropped.
    pub fn end_to_end_headers(&self) -> HeaderMap {
        let connection_tokens: HashSet<String> = self
            .headers
            .iter()
            .filter(|header| header.lower_name() == "connection")
            .flat_map(|header| header.value.split(','))
            .map(|token| token.trim().to_ascii_lowercase())
            .filter(|token| !token.is_empty())
            .collect();

        header_lines_to_map(self.headers.iter().filter(|header| {
            let name = header.lower_name();
            name != "content-length"
                && !is_hop_by_hop(name)
                && !connection_tokens.contains(name)
        }))
    }
}

/// Serializes a response head for the client. Framing and connection headers
/// are generated here and any present in `headers` are ignored.
pub(crate) fn encode_response_head(
    status: StatusCode,
    headers: &HeaderMap,
    framing: ResponseFraming,
    close: bool,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(b"HTTP/1.1 ");
    buffer.extend_from_slice(status.as_str().as_bytes());
    buffer.extend_from_slice(b" ");
    buffer.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    buffer.extend_from_slice(b"\r\n");

    for (name, value) in headers {
        let name = name.as_str();
        if name == "content-length" || is_hop_by_hop(name) {
            continue;
        }
        buffer.extend_from_slice(name.as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    match framing {
        ResponseFraming::Fixed(length) | ResponseFraming::Empty(Some(length)) => {
            buffer.extend_from_slice(b"content-length: ");
            buffer.extend_from_slice(length.to_string().as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }
        ResponseFraming::Chunked => {
            buffer.extend_from_slice(b"transfer-encoding: chunked\r\n");
        }
        ResponseFraming::Empty(None) => {}
    }

    if close {
        buffer.extend_from_slice(b"connection: close\r\n");
    }

    buffer.extend_from_slice(b"\r\n");
    buffer
}

pub(crate) async fn read_http1_response_head<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<Http1ResponseHead>
where
    S: AsyncRead + Unpin,
{
    ensure!(
        max_header_bytes > 0,
        "max response header size must be greater than zero"
    );
    let deadline = Instant::now() + timeout_dur;
    let mut remaining = max_header_bytes;
    let mut line = String::new();

    let bytes = read_line_with_deadline(reader, &mut line, deadline, peer, remaining).await?;
    if bytes == 0 {
        bail!("upstream closed connection before sending status line");
    }
    remaining -= bytes;
    let (_, status, _) = parse_http1_status_line(line.trim_end_matches(['\r', '\n']))?;

    let mut headers = Vec::new();
    let mut content_length = None;
    let mut chunked = false;
    let mut transfer_encoding_present = false;

    loop {
        ensure!(remaining > 0, "upstream response headers exceed configured limit");
        let read = read_line_with_deadline(reader, &mut line, deadline, peer, remaining).await?;
        if read == 0 {
            bail!("upstream closed connection during headers");
        }
        remaining -= read;
        let trimmed_line = line.trim_end_matches(['\r', '\n']);
        if trimmed_line.is_empty() {
            break;
        }
        let (name, value) = trimmed_line
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator from upstream"))?;
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            if content_length.is_some() {
                bail!("multiple Content-Length headers from upstream are not supported");
            }
            let parsed: u64 = value
                .parse()
                .with_context(|| format!("invalid Content-Length value '{value}'"))?;
            content_length = Some(parsed);
        }
        if name.eq_ignore_ascii_case("transfer-encoding") {
            transfer_encoding_present = true;
            if value.to_ascii_lowercase().contains("chunked") {
                chunked = true;
            }
        }
        headers.push(Http1HeaderLine::new(name, value));
    }

    if transfer_encoding_present && content_length.is_some() {
        warn!(
            peer = %peer,
            "upstream response contained both Transfer-Encoding and Content-Length; rejecting"
        );
        bail!("upstream response must not include both Transfer-Encoding and Content-Length");
    }

    Ok(Http1ResponseHead {
        status,
        headers,
        content_length,
        chunked,
        transfer_encoding_present,
    })
}

pub(crate) fn parse_http1_status_line(value: &str) -> Result<(Version, StatusCode, String)> {
    let mut parts = value.split_whitespace();
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("upstream status line missing HTTP version"))?;
    let status = parts
        .next()
        .ok_or_else(|| anyhow!("upstream status line missing status code"))?;
    let reason = parts.collect::<Vec<_>>().join(" ");

    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => bail!("unsupported upstream HTTP version '{other}'"),
    };

    let status_code: u16 = status
        .parse()
        .with_context(|| format!("invalid upstream status code '{status}'"))?;
    let status = StatusCode::from_u16(status_code)
        .map_err(|_| anyhow!("unsupported upstream status code '{status_code}'"))?;

    Ok((version, status, reason))
}
