use std::net::SocketAddr;

use http::StatusCode;
use thiserror::Error;
use tracing::warn;

/// Stage at which forwarding a request upstream failed.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to connect to upstream: {0:#}")]
    Connect(anyhow::Error),
    #[error("failed to send request to upstream: {0:#}")]
    Request(anyhow::Error),
    /// The client's request body could not be read; the client connection is
    /// no longer in a usable state.
    #[error("failed to read request body from client: {0:#}")]
    ClientBody(anyhow::Error),
    #[error("invalid response from upstream: {0:#}")]
    Response(anyhow::Error),
}

impl ForwardError {
    pub fn kind(&self) -> &'static str {
        match self {
            ForwardError::Connect(_) => "connect",
            ForwardError::Request(_) => "request",
            ForwardError::ClientBody(_) => "client_body",
            ForwardError::Response(_) => "response",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ForwardError::ClientBody(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn client_failed(&self) -> bool {
        matches!(self, ForwardError::ClientBody(_))
    }
}

pub fn log_forward_error(err: &ForwardError, peer: SocketAddr, host: &str) {
    crate::metrics::record_upstream_error(err.kind());
    warn!(
        peer = %peer,
        host,
        stage = err.kind(),
        error = %err,
        "upstream request failed"
    );
}
