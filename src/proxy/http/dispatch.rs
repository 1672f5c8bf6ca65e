use std::{net::SocketAddr, time::Instant};

use anyhow::Result;
use http::Method;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::proxy::AppContext;
use crate::proxy::request::Scheme;
use crate::util::timeout_with_context;

use super::codec::read_http1_request_head;
use super::pipeline::{ClientDisposition, RequestContext, handle_request};

pub(super) struct HttpLoopOptions {
    pub allow_connect: bool,
    pub fallback_scheme: Scheme,
    pub default_host: Option<String>,
}

pub(super) enum LoopOutcome<S> {
    Completed,
    Connect(ConnectRequest<S>),
}

pub(super) struct ConnectRequest<S> {
    pub stream: S,
    pub target: String,
    pub request_bytes: usize,
    pub start: Instant,
}

/// Serves requests from one client connection until it closes, goes idle, or
/// asks to tunnel with CONNECT.
pub(super) async fn serve_http_loop<S>(
    stream: S,
    peer: SocketAddr,
    app: &AppContext,
    options: HttpLoopOptions,
) -> Result<LoopOutcome<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let HttpLoopOptions {
        allow_connect,
        fallback_scheme,
        default_host,
    } = options;
    let client_timeout = app.settings.client_timeout();
    let max_header_size = app.settings.max_header_size;
    let mut reader = BufReader::new(stream);

    loop {
        let start = Instant::now();
        let Some(head) = read_http1_request_head(
            &mut reader,
            peer,
            client_timeout,
            client_timeout,
            max_header_size,
        )
        .await?
        else {
            break;
        };

        if allow_connect && head.method == Method::CONNECT {
            let request_bytes = head.request_line_bytes + head.header_bytes;
            let stream = reader.into_inner();
            return Ok(LoopOutcome::Connect(ConnectRequest {
                stream,
                target: head.target,
                request_bytes,
                start,
            }));
        }

        let ctx = RequestContext {
            head,
            start,
            fallback_scheme,
            default_host: default_host.as_deref(),
        };

        match handle_request(&mut reader, peer, app, ctx).await? {
            ClientDisposition::Continue => continue,
            ClientDisposition::Close => break,
        }
    }

    // Graceful close so TLS clients receive close_notify.
    if let Err(err) = timeout_with_context(
        client_timeout,
        reader.get_mut().shutdown(),
        "shutting down client stream",
    )
    .await
    {
        debug!(peer = %peer, error = %err, "client stream did not shut down cleanly");
    }
    Ok(LoopOutcome::Completed)
}
