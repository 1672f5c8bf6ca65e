use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::util::timeout_with_context;

const SPLICE_BUFFER_SIZE: usize = 16 * 1024;

const CONNECT_ESTABLISHED: &[u8] =
    b"HTTP/1.1 200 Connection Established\r\nProxy-Agent: layerproxy\r\n\r\n";

/// Bytes relayed in each direction of a spliced tunnel.
pub struct SpliceStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Relays raw bytes between the client and an already connected upstream
/// until both sides finish.
pub async fn splice(
    client: &mut TcpStream,
    upstream: &mut TcpStream,
    client_timeout: Duration,
    upstream_timeout: Duration,
) -> Result<SpliceStats> {
    let (mut client_reader, mut client_writer) = io::split(client);
    let (mut upstream_reader, mut upstream_writer) = io::split(upstream);

    let client_to_upstream = transfer_half(
        &mut client_reader,
        &mut upstream_writer,
        client_timeout,
        upstream_timeout,
        "client",
        "upstream",
    );
    let upstream_to_client = transfer_half(
        &mut upstream_reader,
        &mut client_writer,
        upstream_timeout,
        client_timeout,
        "upstream",
        "client",
    );

    let (client_to_upstream, upstream_to_client) =
        tokio::try_join!(client_to_upstream, upstream_to_client)
            .context("CONNECT splice relay failed")?;
    Ok(SpliceStats {
        client_to_upstream,
        upstream_to_client,
    })
}

pub async fn send_connect_established<S>(stream: &mut S, client_timeout: Duration) -> Result<u64>
where
    S: AsyncWrite + Unpin,
{
    timeout_with_context(
        client_timeout,
        stream.write_all(CONNECT_ESTABLISHED),
        "writing CONNECT response",
    )
    .await?;
    timeout_with_context(client_timeout, stream.flush(), "flushing CONNECT response").await?;
    Ok(CONNECT_ESTABLISHED.len() as u64)
}

/// Copies one direction, propagating EOF as a write shutdown. Each read and
/// write is bounded by its side's idle timeout.
async fn transfer_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    read_timeout: Duration,
    write_timeout: Duration,
    read_label: &str,
    write_label: &str,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut transferred = 0u64;
    let mut buffer = vec![0u8; SPLICE_BUFFER_SIZE];
    loop {
        let read = timeout_with_context(
            read_timeout,
            reader.read(&mut buffer),
            format!("reading from {read_label} during CONNECT splice"),
        )
        .await?;
        if read == 0 {
            break;
        }
        timeout_with_context(
            write_timeout,
            writer.write_all(&buffer[..read]),
            format!("forwarding to {write_label} during CONNECT splice"),
        )
        .await?;
        transferred = transferred.saturating_add(read as u64);
    }

    timeout_with_context(
        write_timeout,
        writer.shutdown(),
        format!("shutting down {write_label} during CONNECT splice"),
    )
    .await?;
    Ok(transferred)
}
