//! CONNECT tunnels: decrypted ("bumped") for hosts matching `mitm_hosts`,
//! spliced byte-for-byte otherwise.

mod bump;
mod splice;
mod target;

use std::{net::SocketAddr, time::Instant};

use anyhow::Result;
use http::StatusCode;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::logging::AccessLogBuilder;
use crate::proxy::{AppContext, upstream};
use crate::util::{timeout_with_context, write_all_with_timeout};

pub use self::target::ConnectTarget;

pub struct ConnectRequest<'a> {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub target: String,
    pub request_bytes: usize,
    pub start: Instant,
    pub app: &'a AppContext,
}

pub async fn handle_connect(ctx: ConnectRequest<'_>) -> Result<()> {
    let ConnectRequest {
        mut stream,
        peer,
        target,
        request_bytes,
        start,
        app,
    } = ctx;
    let bytes_in = request_bytes as u64;
    let client_timeout = app.settings.client_timeout();

    let parsed = match ConnectTarget::parse(&target) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(peer = %peer, target, error = %err, "invalid CONNECT target");
            let bytes_out = respond_and_close(
                &mut stream,
                StatusCode::BAD_REQUEST,
                b"invalid CONNECT target\n",
                client_timeout,
            )
            .await
            .unwrap_or(0);
            AccessLogBuilder::for_connect(peer, target)
                .status(StatusCode::BAD_REQUEST)
                .bytes(bytes_in, bytes_out)
                .elapsed(start.elapsed())
                .error_reason("invalid CONNECT target")
                .log();
            return Ok(());
        }
    };
    let log = AccessLogBuilder::for_connect(peer, parsed.authority());

    if app.should_bump(&parsed.host) {
        debug!(peer = %peer, target = %parsed, "bumping CONNECT tunnel");
        let result = bump::handle_bump(stream, &parsed, app, peer).await;
        let log = log.status(StatusCode::OK).path("bump").elapsed(start.elapsed());
        return match result {
            Ok(handshake_bytes) => {
                log.bytes(bytes_in, handshake_bytes).log();
                Ok(())
            }
            Err(err) => {
                log.bytes(bytes_in, 0).error_reason(format!("{err:#}")).log();
                Err(err)
            }
        };
    }

    debug!(peer = %peer, target = %parsed, "splicing CONNECT tunnel");
    let connect_timeout = app.settings.upstream_connect_timeout();
    let mut upstream_stream =
        match upstream::connect_to_host(&parsed.host, parsed.port, connect_timeout).await {
            Ok((stream, _)) => stream,
            Err(err) => {
                warn!(peer = %peer, target = %parsed, error = %err, "CONNECT upstream unreachable");
                crate::metrics::record_upstream_error("connect");
                let bytes_out = respond_and_close(
                    &mut stream,
                    StatusCode::BAD_GATEWAY,
                    b"upstream unreachable\n",
                    client_timeout,
                )
                .await
                .unwrap_or(0);
                log.status(StatusCode::BAD_GATEWAY)
                    .bytes(bytes_in, bytes_out)
                    .elapsed(start.elapsed())
                    .error_reason(format!("{err:#}"))
                    .log();
                return Ok(());
            }
        };

    let handshake_bytes = splice::send_connect_established(&mut stream, client_timeout).await?;
    let result = splice::splice(
        &mut stream,
        &mut upstream_stream,
        client_timeout,
        app.settings.upstream_timeout(),
    )
    .await;
    let log = log.status(StatusCode::OK).path("splice").elapsed(start.elapsed());
    match result {
        Ok(stats) => {
            log.bytes(
                bytes_in + stats.client_to_upstream,
                handshake_bytes + stats.upstream_to_client,
            )
            .log();
            Ok(())
        }
        Err(err) => {
            log.bytes(bytes_in, handshake_bytes)
                .error_reason(format!("{err:#}"))
                .log();
            Err(err)
        }
    }
}

/// Writes a short plain-text error and shuts the client stream down.
async fn respond_and_close<S>(
    stream: &mut S,
    status: StatusCode,
    body: &[u8],
    timeout: std::time::Duration,
) -> Result<u64>
where
    S: AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    let head = format!(
        "HTTP/1.1 {} {}\r\ncontent-type: text/plain; charset=utf-8\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown"),
        body.len()
    );
    write_all_with_timeout(stream, head.as_bytes(), timeout, "writing CONNECT error head").await?;
    write_all_with_timeout(stream, body, timeout, "writing CONNECT error body").await?;
    timeout_with_context(timeout, stream.shutdown(), "shutting down client stream").await?;
    Ok((head.len() + body.len()) as u64)
}
