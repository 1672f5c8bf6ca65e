use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll, ready};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, DuplexStream, ReadBuf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;

use crate::proxy::message::ResponseBody;
use crate::proxy::request::{ProxyRequest, Scheme};
use crate::proxy::{AppContext, upstream};

use super::body::{UpstreamBodyPlan, decode_upstream_body};

const BODY_PIPE_CAPACITY: usize = 64 * 1024;

pub(crate) enum UpstreamIo {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_flush(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

pub(crate) struct UpstreamConnection {
    pub(crate) stream: UpstreamIo,
    pub(crate) peer: SocketAddr,
}

impl UpstreamConnection {
    /// Opens a fresh connection for `request`, wrapped in TLS for https.
    pub(crate) async fn connect(request: &ProxyRequest, app: &AppContext) -> Result<Self> {
        let connect_timeout = app.settings.upstream_connect_timeout();
        let (tcp, peer) =
            upstream::connect_to_host(&request.host, request.port, connect_timeout).await?;
        let stream = match request.scheme {
            Scheme::Http => UpstreamIo::Plain(tcp),
            Scheme::Https => {
                let server_name = ServerName::try_from(request.host.as_str())
                    .map_err(|_| anyhow!("invalid upstream host for TLS '{}'", request.host))?
                    .to_owned();
                let connector = tokio_rustls::TlsConnector::from(app.tls.client.clone());
                let tls = timeout(connect_timeout, connector.connect(server_name, tcp))
                    .await
                    .map_err(|_| anyhow!("TLS handshake with upstream timed out"))?
                    .with_context(|| {
                        format!(
                            "failed to establish TLS with upstream {}:{}",
                            request.host, request.port
                        )
                    })?;
                UpstreamIo::Tls(Box::new(tls))
            }
        };
        Ok(Self { stream, peer })
    }
}

/// Response body read from an upstream connection.
///
/// A background task decodes the transfer coding into a pipe. Errors from
/// the task surface as a read error once the pipe drains, so a truncated
/// upstream body never looks like a complete one.
pub(crate) struct UpstreamBody {
    pipe: DuplexStream,
    decoder: Option<JoinHandle<Result<u64>>>,
}

impl UpstreamBody {
    pub(crate) fn spawn<S>(
        mut upstream: BufReader<S>,
        plan: UpstreamBodyPlan,
        read_timeout: Duration,
        peer: SocketAddr,
    ) -> Self
    where
        S: AsyncRead + Unpin + Send + 'static,
    {
        let (pipe, mut sink) = tokio::io::duplex(BODY_PIPE_CAPACITY);
        let decoder = tokio::spawn(async move {
            decode_upstream_body(&mut upstream, &mut sink, plan, read_timeout, peer).await
        });
        Self {
            pipe,
            decoder: Some(decoder),
        }
    }
}

impl AsyncRead for UpstreamBody {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.pipe).poll_read(cx, buf))?;
        if buf.filled().len() > before {
            return Poll::Ready(Ok(()));
        }

        let Some(decoder) = this.decoder.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let outcome = ready!(Pin::new(decoder).poll(cx));
        this.decoder = None;
        match outcome {
            Ok(Ok(_)) => Poll::Ready(Ok(())),
            Ok(Err(err)) => Poll::Ready(Err(std::io::Error::other(format!("{err:#}")))),
            Err(err) => Poll::Ready(Err(std::io::Error::other(err))),
        }
    }
}

#[async_trait]
impl ResponseBody for UpstreamBody {
    async fn close(&mut self) -> Result<()> {
        if let Some(decoder) = self.decoder.take() {
            decoder.abort();
        }
        Ok(())
    }
}
