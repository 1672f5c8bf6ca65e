use std::sync::Arc;

use http::{Method, StatusCode};
use tracing::{debug, info, warn};

use super::responder::cached_response;
use super::writer::PersistingBody;
use super::{BlobStore, CacheIndex, CacheKey, FetchTicket, KeyClassifier};
use crate::metrics::{self, CacheLookup};
use crate::proxy::intercept::RequestAction;
use crate::proxy::message::ProxyResponse;
use crate::proxy::request::ProxyRequest;

fn cacheable_key(classifier: &dyn KeyClassifier, request: &ProxyRequest) -> Option<CacheKey> {
    if request.method != Method::GET {
        return None;
    }
    classifier.classify(request.path_without_query())
}

/// Pre-fetch hook: serve from disk, wait for an in-flight fetch, or claim the
/// fetch for this request.
pub struct RequestGate {
    index: Arc<CacheIndex>,
    classifier: Arc<dyn KeyClassifier>,
    store: BlobStore,
}

impl RequestGate {
    pub fn new(
        index: Arc<CacheIndex>,
        classifier: Arc<dyn KeyClassifier>,
        store: BlobStore,
    ) -> Self {
        Self {
            index,
            classifier,
            store,
        }
    }

    pub async fn handle(&self, request: &ProxyRequest) -> RequestAction {
        let Some(key) = cacheable_key(self.classifier.as_ref(), request) else {
            metrics::record_cache_lookup(CacheLookup::Bypass);
            return RequestAction::Proceed;
        };

        match self.index.try_begin_fetch(&key) {
            FetchTicket::Fetch => {
                info!(key = %key, host = %request.host, "blob not cached, fetching upstream");
                metrics::record_cache_lookup(CacheLookup::Miss);
                RequestAction::Proceed
            }
            FetchTicket::Wait => {
                info!(key = %key, "blob fetch in progress, waiting");
                metrics::record_cache_lookup(CacheLookup::Wait);
                self.index.wait_available(&key).await;
                self.serve(&key).await
            }
            FetchTicket::Ready => {
                metrics::record_cache_lookup(CacheLookup::Hit);
                self.serve(&key).await
            }
        }
    }

    async fn serve(&self, key: &CacheKey) -> RequestAction {
        match cached_response(&self.store, key).await {
            Ok(response) => {
                info!(key = %key, bytes = response.content_length, "serving blob from cache");
                if let Some(bytes) = response.content_length {
                    metrics::record_cache_served(bytes);
                }
                RequestAction::Respond(response)
            }
            Err(err) => {
                warn!(key = %key, error = %err, "cached blob unreadable, fetching upstream");
                RequestAction::Proceed
            }
        }
    }
}

/// Post-fetch hook: wraps a successful upstream body so it is persisted while
/// it streams to the client.
pub struct ResponseGate {
    index: Arc<CacheIndex>,
    classifier: Arc<dyn KeyClassifier>,
    store: BlobStore,
}

impl ResponseGate {
    pub fn new(
        index: Arc<CacheIndex>,
        classifier: Arc<dyn KeyClassifier>,
        store: BlobStore,
    ) -> Self {
        Self {
            index,
            classifier,
            store,
        }
    }

    pub async fn handle(&self, request: &ProxyRequest, response: ProxyResponse) -> ProxyResponse {
        if response.status != StatusCode::OK {
            return response;
        }
        let Some(key) = cacheable_key(self.classifier.as_ref(), request) else {
            return response;
        };
        if self.index.state(&key) == super::EntryState::Available {
            debug!(key = %key, "blob already stored, passing response through");
            return response;
        }

        let (file, partial_path) = match self.store.create_partial(&key).await {
            Ok(created) => created,
            Err(err) => {
                warn!(key = %key, error = %err, "not caching blob");
                metrics::record_cache_store_error();
                return response;
            }
        };

        let ProxyResponse {
            status,
            headers,
            content_length,
            body,
        } = response;
        let body = PersistingBody::new(
            key,
            content_length,
            body,
            file,
            partial_path,
            self.index.clone(),
            self.store.clone(),
        );
        ProxyResponse::new(status, headers, content_length, Box::new(body))
    }
}
