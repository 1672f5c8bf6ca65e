//! Content-addressed, write-through cache for immutable registry blobs.
//!
//! A request whose path carries a blob digest is answered from disk when the
//! blob is stored, waits when another request is already fetching it, and
//! otherwise goes upstream. A successful upstream body is written to the store
//! while it streams to the client and published when the transport closes it.

mod error;
mod gate;
pub mod index;
mod key;
mod responder;
mod store;
mod writer;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

pub use error::CacheError;
pub use gate::{RequestGate, ResponseGate};
pub use index::{CacheIndex, EntryState, FetchTicket};
pub use key::{CacheKey, DEFAULT_BLOB_PATH_PATTERN, KeyClassifier, PathPatternClassifier};
pub use responder::cached_response;
pub use store::BlobStore;
pub use writer::PersistingBody;

use crate::proxy::intercept::{Interceptor, RequestAction};
use crate::proxy::message::ProxyResponse;
use crate::proxy::request::ProxyRequest;

pub struct BlobCache {
    index: Arc<CacheIndex>,
    store: BlobStore,
    request_gate: RequestGate,
    response_gate: ResponseGate,
}

impl BlobCache {
    /// Prepares the store directory and loads every blob already on disk.
    pub async fn open(
        dir: PathBuf,
        classifier: Arc<dyn KeyClassifier>,
        wait_poll_interval: Duration,
    ) -> Result<Self> {
        let store = BlobStore::new(dir);
        let scan_store = store.clone();
        let keys = tokio::task::spawn_blocking(move || scan_store.scan())
            .await
            .context("blob store scan task failed")??;

        let index = Arc::new(CacheIndex::new(wait_poll_interval));
        let found = keys.len();
        index.insert_available(keys);
        info!(
            directory = %store.dir().display(),
            blobs = found,
            "blob cache ready"
        );

        Ok(Self {
            request_gate: RequestGate::new(index.clone(), classifier.clone(), store.clone()),
            response_gate: ResponseGate::new(index.clone(), classifier, store.clone()),
            index,
            store,
        })
    }

    pub fn index(&self) -> &Arc<CacheIndex> {
        &self.index
    }

    pub fn store(&self) -> &BlobStore {
        &self.store
    }
}

#[async_trait]
impl Interceptor for BlobCache {
    async fn on_request(&self, request: &ProxyRequest) -> RequestAction {
        self.request_gate.handle(request).await
    }

    async fn on_response(&self, request: &ProxyRequest, response: ProxyResponse) -> ProxyResponse {
        self.response_gate.handle(request, response).await
    }
}
