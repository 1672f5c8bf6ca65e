use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use http::{Method, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::proxy::message::BoxBody;
use crate::util::{timeout_with_context, write_all_with_timeout};

use super::codec::{
    Http1HeaderAccumulator, Http1ResponseHead, ResponseFraming, read_line_with_timeout,
};

const MAX_CHUNK_LINE_LENGTH: usize = 8192;
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Framing of a client request body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BodyPlan {
    Empty,
    Fixed(u64),
    Chunked,
}

impl BodyPlan {
    pub fn from_headers(headers: &Http1HeaderAccumulator) -> Self {
        if headers.is_chunked() {
            BodyPlan::Chunked
        } else {
            match headers.content_length() {
                Some(0) | None => BodyPlan::Empty,
                Some(length) => BodyPlan::Fixed(length),
            }
        }
    }
}

/// Framing of an upstream response body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UpstreamBodyPlan {
    Empty,
    Fixed(u64),
    Chunked,
    UntilClose,
}

impl UpstreamBodyPlan {
    pub fn for_response(method: &Method, head: &Http1ResponseHead) -> Self {
        let status = head.status;
        if method == Method::HEAD
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            return UpstreamBodyPlan::Empty;
        }
        if head.chunked {
            return UpstreamBodyPlan::Chunked;
        }
        match head.content_length {
            Some(0) => UpstreamBodyPlan::Empty,
            Some(length) => UpstreamBodyPlan::Fixed(length),
            None => UpstreamBodyPlan::UntilClose,
        }
    }

    /// Body length known before the body is read.
    pub fn known_length(self) -> Option<u64> {
        match self {
            UpstreamBodyPlan::Empty => Some(0),
            UpstreamBodyPlan::Fixed(length) => Some(length),
            UpstreamBodyPlan::Chunked | UpstreamBodyPlan::UntilClose => None,
        }
    }
}

/// Copies a client request body upstream, keeping its framing.
pub(crate) async fn relay_request_body<S, U>(
    reader: &mut BufReader<S>,
    upstream: &mut U,
    plan: BodyPlan,
    client_timeout: Duration,
    upstream_timeout: Duration,
    peer: SocketAddr,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
    U: AsyncWrite + Unpin,
{
    match plan {
        BodyPlan::Empty => Ok(0),
        BodyPlan::Fixed(length) => {
            copy_exact(reader, upstream, length, client_timeout, upstream_timeout, "client").await
        }
        BodyPlan::Chunked => {
            relay_chunked_body(reader, upstream, client_timeout, upstream_timeout, peer).await
        }
    }
}

/// Reads an upstream response body according to `plan` and writes its
/// payload, without transfer coding, to `sink`.
pub(crate) async fn decode_upstream_body<S, W>(
    upstream: &mut BufReader<S>,
    sink: &mut W,
    plan: UpstreamBodyPlan,
    read_timeout: Duration,
    peer: SocketAddr,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // The sink is drained by the client writer, which applies the client timeout.
    let write_timeout = Duration::MAX;
    match plan {
        UpstreamBodyPlan::Empty => Ok(0),
        UpstreamBodyPlan::Fixed(length) => {
            copy_exact(upstream, sink, length, read_timeout, write_timeout, "upstream").await
        }
        UpstreamBodyPlan::Chunked => decode_chunked_body(upstream, sink, read_timeout, peer).await,
        UpstreamBodyPlan::UntilClose => {
            let mut total = 0u64;
            let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
            loop {
                let read = timeout_with_context(
                    read_timeout,
                    upstream.read(&mut buffer),
                    format!("reading response body from upstream {peer}"),
                )
                .await?;
                if read == 0 {
                    break;
                }
                sink.write_all(&buffer[..read])
                    .await
                    .context("forwarding upstream response body")?;
                total += read as u64;
            }
            Ok(total)
        }
    }
}

/// Streams a response body to the client using `framing`. A body that ends
/// before its advertised length is an error.
pub(crate) async fn write_response_body<C>(
    body: &mut BoxBody,
    client: &mut C,
    framing: ResponseFraming,
    client_timeout: Duration,
) -> Result<u64>
where
    C: AsyncWrite + Unpin,
{
    match framing {
        ResponseFraming::Empty(_) => Ok(0),
        ResponseFraming::Fixed(length) => {
            let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
            let mut written = 0u64;
            while written < length {
                let want = (length - written).min(buffer.len() as u64) as usize;
                let read = body
                    .read(&mut buffer[..want])
                    .await
                    .context("reading response body")?;
                if read == 0 {
                    bail!("response body ended after {written} of {length} bytes");
                }
                write_all_with_timeout(
                    client,
                    &buffer[..read],
                    client_timeout,
                    "writing response body to client",
                )
                .await?;
                written += read as u64;
            }
            Ok(written)
        }
        ResponseFraming::Chunked => {
            let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
            let mut written = 0u64;
            loop {
                let read = body
                    .read(&mut buffer)
                    .await
                    .context("reading response body")?;
                if read == 0 {
                    break;
                }
                let mut chunk = Vec::with_capacity(read + 16);
                chunk.extend_from_slice(format!("{read:x}\r\n").as_bytes());
                chunk.extend_from_slice(&buffer[..read]);
                chunk.extend_from_slice(b"\r\n");
                write_all_with_timeout(
                    client,
                    &chunk,
                    client_timeout,
                    "writing response chunk to client",
                )
                .await?;
                written += read as u64;
            }
            write_all_with_timeout(
                client,
                b"0\r\n\r\n",
                client_timeout,
                "writing final chunk to client",
            )
            .await?;
            Ok(written)
        }
    }
}

async fn copy_exact<R, W>(
    reader: &mut R,
    writer: &mut W,
    length: u64,
    read_timeout: Duration,
    write_timeout: Duration,
    source: &str,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = length;
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    while remaining > 0 {
        let to_read = remaining.min(buffer.len() as u64) as usize;
        let read = timeout_with_context(
            read_timeout,
            reader.read(&mut buffer[..to_read]),
            format!("reading body from {source}"),
        )
        .await?;
        if read == 0 {
            bail!(
                "{source} closed connection after {} of {length} body bytes",
                length - remaining
            );
        }
        remaining -= read as u64;
        write_all_with_timeout(writer, &buffer[..read], write_timeout, "forwarding body").await?;
    }
    Ok(length)
}

async fn read_chunk_size<S>(
    reader: &mut BufReader<S>,
    line: &mut String,
    read_timeout: Duration,
    peer: SocketAddr,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
{
    let read =
        read_line_with_timeout(reader, line, read_timeout, peer, MAX_CHUNK_LINE_LENGTH).await?;
    if read == 0 {
        bail!("unexpected EOF while reading chunk size from {peer}");
    }
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let size_str = trimmed
        .split_once(';')
        .map(|(size, _)| size)
        .unwrap_or(trimmed)
        .trim();
    u64::from_str_radix(size_str, 16).with_context(|| format!("invalid chunk size '{size_str}'"))
}

async fn read_chunk_terminator<S>(
    reader: &mut BufReader<S>,
    read_timeout: Duration,
    peer: SocketAddr,
) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut crlf = [0u8; 2];
    timeout_with_context(
        read_timeout,
        reader.read_exact(&mut crlf),
        format!("reading chunk terminator from {peer}"),
    )
    .await?;
    if &crlf != b"\r\n" {
        bail!("invalid chunk terminator when reading from {peer}");
    }
    Ok(())
}

async fn decode_chunked_body<S, W>(
    reader: &mut BufReader<S>,
    sink: &mut W,
    read_timeout: Duration,
    peer: SocketAddr,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = String::new();
    let mut total = 0u64;
    loop {
        let size = read_chunk_size(reader, &mut line, read_timeout, peer).await?;
        if size == 0 {
            // Trailers carry nothing the client needs once the body is re-framed.
            loop {
                let read = read_line_with_timeout(
                    reader,
                    &mut line,
                    read_timeout,
                    peer,
                    MAX_CHUNK_LINE_LENGTH,
                )
                .await?;
                if read == 0 || line.trim_end_matches(['\r', '\n']).is_empty() {
                    return Ok(total);
                }
            }
        }
        copy_exact(reader, sink, size, read_timeout, Duration::MAX, "upstream").await?;
        read_chunk_terminator(reader, read_timeout, peer).await?;
        total += size;
    }
}

async fn relay_chunked_body<R, W>(
    reader: &mut BufReader<R>,
    writer: &mut W,
    read_timeout: Duration,
    write_timeout: Duration,
    peer: SocketAddr,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = String::new();
    let mut total = 0u64;
    loop {
        let size = read_chunk_size(reader, &mut line, read_timeout, peer).await?;
        write_all_with_timeout(
            writer,
            format!("{size:x}\r\n").as_bytes(),
            write_timeout,
            "forwarding chunk size",
        )
        .await?;
        if size == 0 {
            loop {
                let read = read_line_with_timeout(
                    reader,
                    &mut line,
                    read_timeout,
                    peer,
                    MAX_CHUNK_LINE_LENGTH,
                )
                .await?;
                if read == 0 {
                    bail!("unexpected EOF while reading chunk trailer from {peer}");
                }
                write_all_with_timeout(
                    writer,
                    line.as_bytes(),
                    write_timeout,
                    "forwarding chunk trailer",
                )
                .await?;
                if line.trim_end_matches(['\r', '\n']).is_empty() {
                    return Ok(total);
                }
            }
        }
        copy_exact(reader, writer, size, read_timeout, write_timeout, "client").await?;
        read_chunk_terminator(reader, read_timeout, peer).await?;
        write_all_with_timeout(writer, b"\r\n", write_timeout, "forwarding chunk terminator")
            .await?;
        total += size;
    }
}
