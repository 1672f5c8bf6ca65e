use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::net::{TcpStream, lookup_host};
use tokio::time::timeout;
use tracing::debug;

/// Resolves `host` and connects to the first address that accepts within
/// `connect_timeout`.
pub async fn connect_to_host(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<(TcpStream, SocketAddr)> {
    let addrs: Vec<SocketAddr> = timeout(connect_timeout, lookup_host((host, port)))
        .await
        .map_err(|_| anyhow!("resolving {host} timed out"))?
        .with_context(|| format!("failed to resolve {host}"))?
        .collect();
    connect_to_addrs(&addrs, connect_timeout)
        .await
        .with_context(|| format!("failed to connect to {host}:{port}"))
}

/// Attempt to connect to the supplied socket addresses in order.
pub async fn connect_to_addrs(
    addrs: &[SocketAddr],
    connect_timeout: Duration,
) -> Result<(TcpStream, SocketAddr)> {
    let mut last_err = None;
    for addr in addrs {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(
                        host = %addr.ip(),
                        port = addr.port(),
                        error = %err,
                        "failed to set TCP_NODELAY on upstream stream"
                    );
                }
                debug!(host = %addr.ip(), port = addr.port(), "connected to upstream");
                return Ok((stream, *addr));
            }
            Ok(Err(err)) => {
                last_err = Some(anyhow::Error::new(err).context(format!("connecting to {addr}")));
            }
            Err(_) => {
                last_err = Some(anyhow!("connection to {addr} timed out"));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("no addresses provided for upstream connect")))
}
