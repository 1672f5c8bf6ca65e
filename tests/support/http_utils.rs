use std::net::SocketAddr;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const RESPONSE_TIMEOUT: StdDuration = StdDuration::from_secs(10);

/// Path under which the default classifier recognises `digest` as a blob.
pub fn blob_path(digest: &str) -> String {
    format!(
        "/registry-v2/docker/registry/v2/blobs/sha256/{}/{digest}/data",
        &digest[..2]
    )
}

pub struct ParsedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ParsedResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Parses a complete response read up to connection close. Chunked
    /// bodies are decoded.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let split = raw
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .ok_or_else(|| anyhow!("response head is not terminated"))?;
        let head = std::str::from_utf8(&raw[..split]).context("response head is not UTF-8")?;
        let mut lines = head.split("\r\n");
        let status = lines
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .ok_or_else(|| anyhow!("missing status line"))?
            .parse::<u16>()?;
        let headers: Vec<(String, String)> = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
            .collect();
        let mut response = Self {
            status,
            headers,
            body: Vec::new(),
        };
        let body = &raw[split + 4..];
        response.body = match response.header("transfer-encoding") {
            Some(value) if value.eq_ignore_ascii_case("chunked") => decode_chunked(body)?,
            _ => body.to_vec(),
        };
        Ok(response)
    }
}

fn decode_chunked(mut body: &[u8]) -> Result<Vec<u8>> {
    let mut decoded = Vec::new();
    loop {
        let line_end = body
            .windows(2)
            .position(|window| window == b"\r\n")
            .ok_or_else(|| anyhow!("truncated chunk size line"))?;
        let size_text = std::str::from_utf8(&body[..line_end])?;
        let size = usize::from_str_radix(size_text.split(';').next().unwrap_or("").trim(), 16)?;
        body = &body[line_end + 2..];
        if size == 0 {
            return Ok(decoded);
        }
        if body.len() < size + 2 {
            return Err(anyhow!("truncated chunk"));
        }
        decoded.extend_from_slice(&body[..size]);
        body = &body[size + 2..];
    }
}

pub async fn read_http_response<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    timeout(RESPONSE_TIMEOUT, stream.read_to_end(&mut buf))
        .await
        .context("timed out reading response")??;
    Ok(buf)
}

pub async fn read_until_double_crlf<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        let bytes = stream.read(&mut byte).await?;
        if bytes == 0 {
            break;
        }
        buffer.extend_from_slice(&byte);
        if buffer.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8(buffer).context("invalid UTF-8 response")
}

/// Sends one absolute-form GET through the proxy on a fresh connection.
pub async fn proxy_get(proxy: SocketAddr, url: &str) -> Result<ParsedResponse> {
    let mut stream = TcpStream::connect(proxy).await?;
    let authority = url
        .split("://")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .ok_or_else(|| anyhow!("url has no authority: {url}"))?;
    let request = format!("GET {url} HTTP/1.1\r\nHost: {authority}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;
    let raw = read_http_response(&mut stream).await?;
    ParsedResponse::parse(&raw)
}
