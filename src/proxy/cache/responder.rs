use http::header::{CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, StatusCode};
use tokio::io::AsyncReadExt;

use super::{BlobStore, CacheError, CacheKey};
use crate::proxy::message::ProxyResponse;

const BLOB_CONTENT_TYPE: &str = "application/octet-stream";

/// Builds the synthetic `200 OK` served for a blob that is already on disk.
pub async fn cached_response(
    store: &BlobStore,
    key: &CacheKey,
) -> Result<ProxyResponse, CacheError> {
    let (file, size) = store.open_blob(key).await?;
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(BLOB_CONTENT_TYPE));
    Ok(ProxyResponse::new(
        StatusCode::OK,
        headers,
        Some(size),
        Box::new(file.take(size)),
    ))
}
