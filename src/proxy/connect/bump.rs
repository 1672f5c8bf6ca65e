use std::net::SocketAddr;

use anyhow::{Context, Result, anyhow};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

use crate::proxy::{AppContext, http::handle_decrypted_https};

use super::{splice::send_connect_established, target::ConnectTarget};

/// Terminates TLS for `target` with a minted leaf and serves the decrypted
/// requests. Returns the number of bytes of the CONNECT reply.
pub async fn handle_bump(
    mut stream: TcpStream,
    target: &ConnectTarget,
    app: &AppContext,
    peer: SocketAddr,
) -> Result<u64> {
    let client_timeout = app.settings.client_timeout();
    let server_config = app
        .tls
        .issuer
        .server_config(&target.host)
        .with_context(|| format!("failed to issue certificate for {}", target.host))?;
    let handshake_bytes = send_connect_established(&mut stream, client_timeout).await?;

    let acceptor = TlsAcceptor::from(server_config);
    let tls_stream = timeout(client_timeout, acceptor.accept(stream))
        .await
        .map_err(|_| anyhow!("TLS handshake with client timed out"))?
        .context("failed to complete TLS handshake with client during CONNECT bump")?;

    handle_decrypted_https(tls_stream, peer, app.clone(), target.authority()).await?;
    Ok(handshake_bytes)
}
