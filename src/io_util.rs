use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Bytes the sink may fall behind the reader before reads wait on the sink.
const MAX_PENDING: usize = 256 * 1024;

/// Forwards a byte stream unchanged while copying it into a secondary sink.
///
/// The sink is best-effort: its first error is recorded, copying stops, and
/// the reader side keeps returning exactly what the inner reader produced.
pub struct TeeReader<R, W> {
    reader: R,
    sink: W,
    pending: Vec<u8>,
    sink_error: Option<io::Error>,
    bytes_read: u64,
    bytes_copied: u64,
}

impl<R, W> TeeReader<R, W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, sink: W) -> Self {
        Self {
            reader,
            sink,
            pending: Vec::new(),
            sink_error: None,
            bytes_read: 0,
            bytes_copied: 0,
        }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_copied(&self) -> u64 {
        self.bytes_copied
    }

    pub fn sink_failed(&self) -> bool {
        self.sink_error.is_some()
    }

    /// Writes everything still buffered, then flushes and shuts down the sink.
    /// Returns the first sink error seen over the lifetime of the tee.
    pub async fn finish(&mut self) -> io::Result<()> {
        poll_fn(|cx| self.poll_drain(cx)).await;
        if let Some(err) = self.sink_error.take() {
            return Err(err);
        }
        self.sink.flush().await?;
        self.sink.shutdown().await
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        while !self.pending.is_empty() && self.sink_error.is_none() {
            match Pin::new(&mut self.sink).poll_write(cx, &self.pending) {
                Poll::Ready(Ok(0)) => {
                    self.sink_error = Some(io::Error::from(io::ErrorKind::WriteZero));
                }
                Poll::Ready(Ok(written)) => {
                    self.pending.drain(..written);
                    self.bytes_copied = self.bytes_copied.saturating_add(written as u64);
                }
                Poll::Ready(Err(err)) => self.sink_error = Some(err),
                Poll::Pending => return Poll::Pending,
            }
        }
        if self.sink_error.is_some() {
            self.pending.clear();
        }
        Poll::Ready(())
    }
}

impl<R, W> AsyncRead for TeeReader<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pending.len() >= MAX_PENDING {
            ready!(this.poll_drain(cx));
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.reader).poll_read(cx, buf))?;
        let fresh = &buf.filled()[before..];
        if fresh.is_empty() {
            return Poll::Ready(Ok(()));
        }

        this.bytes_read = this.bytes_read.saturating_add(fresh.len() as u64);
        if this.sink_error.is_none() {
            this.pending.extend_from_slice(fresh);
            // Opportunistic; a Pending sink is retried on the next read or in finish().
            let _ = this.poll_drain(cx);
        }
        Poll::Ready(Ok(()))
    }
}
