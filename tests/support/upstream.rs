use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration as StdDuration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_rustls::TlsAcceptor;

use super::read_until_double_crlf;

#[derive(Clone)]
pub struct Route {
    pub status: u16,
    pub body: Vec<u8>,
    /// Send the body with chunked transfer coding instead of Content-Length.
    pub chunked: bool,
}

impl Route {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            chunked: false,
        }
    }

    pub fn status(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
            chunked: false,
        }
    }

    pub fn chunked(mut self) -> Self {
        self.chunked = true;
        self
    }
}

struct Shared {
    routes: HashMap<String, Route>,
    delay: StdDuration,
    hits: AtomicUsize,
}

/// Minimal registry stand-in that answers one request per connection and
/// counts every request it receives.
pub struct BlobUpstream {
    addr: SocketAddr,
    shared: Arc<Shared>,
    handle: JoinHandle<()>,
}

impl BlobUpstream {
    pub async fn spawn(routes: Vec<(String, Route)>) -> Result<Self> {
        Self::spawn_with(routes, StdDuration::ZERO, None).await
    }

    /// Holds every response for `delay` after reading the request head.
    pub async fn spawn_delayed(routes: Vec<(String, Route)>, delay: StdDuration) -> Result<Self> {
        Self::spawn_with(routes, delay, None).await
    }

    pub async fn spawn_tls(
        routes: Vec<(String, Route)>,
        config: Arc<rustls::ServerConfig>,
    ) -> Result<Self> {
        Self::spawn_with(routes, StdDuration::ZERO, Some(TlsAcceptor::from(config))).await
    }

    async fn spawn_with(
        routes: Vec<(String, Route)>,
        delay: StdDuration,
        acceptor: Option<TlsAcceptor>,
    ) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            routes: routes.into_iter().collect(),
            delay,
            hits: AtomicUsize::new(0),
        });
        let accept_shared = shared.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let shared = accept_shared.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match acceptor {
                        Some(acceptor) => {
                            if let Ok(tls) = acceptor.accept(stream).await {
                                let _ = handle_connection(tls, shared).await;
                            }
                        }
                        None => {
                            let _ = handle_connection(stream, shared).await;
                        }
                    }
                });
            }
        });
        Ok(Self {
            addr,
            shared,
            handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.shared.hits.load(Ordering::SeqCst)
    }
}

impl Drop for BlobUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection<S>(mut stream: S, shared: Arc<Shared>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let head = read_until_double_crlf(&mut stream).await?;
    if head.is_empty() {
        return Ok(());
    }
    shared.hits.fetch_add(1, Ordering::SeqCst);
    let path = head
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();
    let route = shared
        .routes
        .get(&path)
        .cloned()
        .unwrap_or_else(|| Route::status(404, b"not found".to_vec()));

    if !shared.delay.is_zero() {
        sleep(shared.delay).await;
    }

    let mut response = format!("HTTP/1.1 {} Test\r\nConnection: close\r\n", route.status);
    if route.chunked {
        response.push_str("Transfer-Encoding: chunked\r\n\r\n");
        let mut bytes = response.into_bytes();
        for chunk in route.body.chunks(7) {
            bytes.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            bytes.extend_from_slice(chunk);
            bytes.extend_from_slice(b"\r\n");
        }
        bytes.extend_from_slice(b"0\r\n\r\n");
        stream.write_all(&bytes).await?;
    } else {
        response.push_str(&format!("Content-Length: {}\r\n\r\n", route.body.len()));
        stream.write_all(response.as_bytes()).await?;
        stream.write_all(&route.body).await?;
    }
    stream.flush().await?;
    stream.shutdown().await.ok();
    Ok(())
}
