use std::net::SocketAddr;

use anyhow::{Result, bail};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::proxy::AppContext;
use crate::proxy::connect::{self, ConnectRequest};
use crate::proxy::request::Scheme;

use super::dispatch::{self, HttpLoopOptions, LoopOutcome};

/// Serves a plaintext client connection. A CONNECT request ends the HTTP
/// loop and hands the raw stream to the tunnel handler.
pub async fn handle_http(stream: TcpStream, peer: SocketAddr, app: AppContext) -> Result<()> {
    let options = HttpLoopOptions {
        allow_connect: true,
        fallback_scheme: Scheme::Http,
        default_host: None,
    };
    match dispatch::serve_http_loop(stream, peer, &app, options).await? {
        LoopOutcome::Completed => Ok(()),
        LoopOutcome::Connect(request) => {
            connect::handle_connect(ConnectRequest {
                stream: request.stream,
                peer,
                target: request.target,
                request_bytes: request.request_bytes,
                start: request.start,
                app: &app,
            })
            .await
        }
    }
}

/// Serves requests read from a decrypted CONNECT tunnel to `authority`.
pub async fn handle_decrypted_https<S>(
    stream: S,
    peer: SocketAddr,
    app: AppContext,
    authority: String,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let options = HttpLoopOptions {
        allow_connect: false,
        fallback_scheme: Scheme::Https,
        default_host: Some(authority),
    };
    match dispatch::serve_http_loop(stream, peer, &app, options).await? {
        LoopOutcome::Completed => Ok(()),
        LoopOutcome::Connect(_) => bail!("unexpected CONNECT request over bumped HTTPS connection"),
    }
}
