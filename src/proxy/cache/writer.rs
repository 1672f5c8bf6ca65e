use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::Result;
use async_trait::async_trait;
use tokio::fs::File as AsyncFile;
use tokio::io::{AsyncRead, ReadBuf};
use tracing::{debug, warn};

use super::{BlobStore, CacheError, CacheIndex, CacheKey};
use crate::io_util::TeeReader;
use crate::proxy::message::{BoxBody, ResponseBody};

/// Upstream body that is streamed to the client and written to the store at
/// the same time. Closing it publishes the blob.
pub struct PersistingBody {
    key: CacheKey,
    expected_len: Option<u64>,
    partial_path: PathBuf,
    tee: TeeReader<BoxBody, AsyncFile>,
    index: Arc<CacheIndex>,
    store: BlobStore,
    closed: bool,
}

impl PersistingBody {
    pub(super) fn new(
        key: CacheKey,
        expected_len: Option<u64>,
        upstream: BoxBody,
        file: AsyncFile,
        partial_path: PathBuf,
        index: Arc<CacheIndex>,
        store: BlobStore,
    ) -> Self {
        Self {
            key,
            expected_len,
            partial_path,
            tee: TeeReader::new(upstream, file),
            index,
            store,
            closed: false,
        }
    }

    async fn persist(&mut self) {
        let persisted = match self.tee.finish().await {
            Ok(()) => true,
            Err(source) => {
                let err = CacheError::PersistWrite {
                    key: self.key.to_string(),
                    source,
                };
                warn!(error = %err, "blob written to disk is incomplete");
                crate::metrics::record_cache_store_error();
                false
            }
        };

        match self.store.commit(&self.partial_path, &self.key).await {
            Ok(()) => {
                debug!(
                    key = %self.key,
                    bytes = self.tee.bytes_copied(),
                    complete = persisted,
                    "blob committed to store"
                );
                crate::metrics::record_cache_store();
            }
            Err(err) => {
                warn!(
                    key = %self.key,
                    path = %self.partial_path.display(),
                    error = %err,
                    "failed to move blob into place"
                );
                crate::metrics::record_cache_store_error();
            }
        }
    }
}

impl AsyncRead for PersistingBody {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().tee).poll_read(cx, buf)
    }
}

#[async_trait]
impl ResponseBody for PersistingBody {
    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let upstream_result = self.tee.get_mut().close().await;
        let bytes_read = self.tee.bytes_read();
        if let Some(expected) = self.expected_len
            && bytes_read < expected
        {
            warn!(
                key = %self.key,
                bytes_read,
                content_length = expected,
                "upstream body not fully read, storing truncated blob"
            );
        }
        self.persist().await;
        self.index.mark_available(&self.key);
        debug!(
            key = %self.key,
            bytes = self.tee.bytes_read(),
            "blob available"
        );
        upstream_result
    }
}
