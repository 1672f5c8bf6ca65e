use std::io::Cursor;

use anyhow::Result;
use async_trait::async_trait;
use http::{HeaderMap, StatusCode};
use tokio::fs::File;
use tokio::io::{AsyncRead, Empty, Take};

/// Response body handed between the transport and interceptors.
///
/// The transport calls [`ResponseBody::close`] exactly once after it has
/// delivered the body, or given up delivering it.
#[async_trait]
pub trait ResponseBody: AsyncRead + Send + Unpin {
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub type BoxBody = Box<dyn ResponseBody>;

#[async_trait]
impl ResponseBody for Take<File> {}

#[async_trait]
impl ResponseBody for Empty {}

#[async_trait]
impl ResponseBody for Cursor<Vec<u8>> {}

pub struct ProxyResponse {
    pub status: StatusCode,
    /// End-to-end headers only; framing headers are derived from
    /// `content_length` when the response is written.
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub body: BoxBody,
}

impl ProxyResponse {
    pub fn new(
        status: StatusCode,
        headers: HeaderMap,
        content_length: Option<u64>,
        body: BoxBody,
    ) -> Self {
        Self {
            status,
            headers,
            content_length,
            body,
        }
    }

    /// Small in-memory response, used for locally generated errors.
    pub fn from_bytes(status: StatusCode, headers: HeaderMap, bytes: Vec<u8>) -> Self {
        let length = bytes.len() as u64;
        Self::new(status, headers, Some(length), Box::new(Cursor::new(bytes)))
    }
}

impl std::fmt::Debug for ProxyResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}
