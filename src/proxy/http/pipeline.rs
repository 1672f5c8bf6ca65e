use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Result;
use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::logging::AccessLogBuilder;
use crate::proxy::AppContext;
use crate::proxy::forward_error::log_forward_error;
use crate::proxy::intercept::RequestAction;
use crate::proxy::message::ProxyResponse;
use crate::proxy::request::{Scheme, parse_http1_request};
use crate::util::{timeout_with_context, write_all_with_timeout};

use super::body::{BodyPlan, write_response_body};
use super::codec::{Http1RequestHead, ResponseFraming, encode_response_head};
use super::forward::forward_request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ClientDisposition {
    Continue,
    Close,
}

/// Where a response handed to the client was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseSource {
    Cache,
    Upstream,
    Proxy,
}

impl ResponseSource {
    fn as_str(self) -> &'static str {
        match self {
            ResponseSource::Cache => "cache",
            ResponseSource::Upstream => "upstream",
            ResponseSource::Proxy => "proxy",
        }
    }
}

pub(super) struct RequestContext<'a> {
    pub head: Http1RequestHead,
    pub start: Instant,
    pub fallback_scheme: Scheme,
    /// Authority used when the request carries no Host header, such as the
    /// CONNECT target of a bumped tunnel.
    pub default_host: Option<&'a str>,
}

/// Serves one request: runs the pre-fetch hook, forwards upstream when the
/// hook lets it through, runs the post-fetch hook and writes the response.
pub(super) async fn handle_request<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    app: &AppContext,
    ctx: RequestContext<'_>,
) -> Result<ClientDisposition>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let RequestContext {
        head,
        start,
        fallback_scheme,
        default_host,
    } = ctx;
    let client_timeout = app.settings.client_timeout();
    let bytes_in = (head.request_line_bytes + head.header_bytes) as u64;
    let client_close = head.headers.wants_connection_close();
    let log = AccessLogBuilder::new(peer).method(head.method.as_str());

    let host_header = head.headers.host().or(default_host);
    let parsed = parse_http1_request(head.method.clone(), &head.target, host_header, fallback_scheme)
        .and_then(|request| Ok((request, head.headers.expect_continue()?)));
    let (mut request, expect_continue) = match parsed {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!(peer = %peer, error = %err, "rejecting malformed request");
            let response = error_response(StatusCode::BAD_REQUEST, "invalid request\n");
            let sent =
                send_response(reader.get_mut(), &head.method, response, true, client_timeout).await;
            let mut log = log
                .path(head.target.as_str())
                .status(StatusCode::BAD_REQUEST)
                .bytes(bytes_in, sent.bytes_out)
                .elapsed(start.elapsed())
                .error_reason("invalid request");
            if let Some(err) = sent.error {
                log = log.error_reason(format!("{err:#}"));
            }
            log.log();
            return Ok(ClientDisposition::Close);
        }
    };
    request.headers = head.headers.forward_header_map();
    let body_plan = BodyPlan::from_headers(&head.headers);
    let log = log
        .scheme(request.scheme.as_str())
        .host(request.authority_host())
        .path(request.path.as_str());

    let mut error_reason = None;
    let (response, source, close) = match app.interceptor.on_request(&request).await {
        RequestAction::Respond(response) => {
            // The request body was never read; the stream cannot be reused.
            let close = client_close || body_plan != BodyPlan::Empty;
            (response, ResponseSource::Cache, close)
        }
        RequestAction::Proceed => {
            match forward_request(reader, &request, body_plan, expect_continue, peer, app).await {
                Ok(response) => {
                    let response = app.interceptor.on_response(&request, response).await;
                    (response, ResponseSource::Upstream, client_close)
                }
                Err(err) => {
                    log_forward_error(&err, peer, &request.host);
                    error_reason = Some(err.kind());
                    let close = client_close || body_plan != BodyPlan::Empty;
                    let message = if err.client_failed() {
                        "failed to read request body\n"
                    } else {
                        "upstream request failed\n"
                    };
                    (error_response(err.status(), message), ResponseSource::Proxy, close)
                }
            }
        }
    };

    let status = response.status;
    let sent = send_response(reader.get_mut(), &request.method, response, close, client_timeout).await;
    let mut log = log
        .source(source.as_str())
        .status(status)
        .bytes(bytes_in, sent.bytes_out)
        .elapsed(start.elapsed());
    if let Some(reason) = error_reason {
        log = log.error_reason(reason);
    }
    let disposition = match sent.error {
        Some(err) => {
            debug!(peer = %peer, host = %request.host, error = %err, "failed to deliver response");
            log = log.error_reason(format!("{err:#}"));
            ClientDisposition::Close
        }
        None if close => ClientDisposition::Close,
        None => ClientDisposition::Continue,
    };
    log.log();
    Ok(disposition)
}

struct SendOutcome {
    bytes_out: u64,
    error: Option<anyhow::Error>,
}

/// Writes `response` to the client and closes its body exactly once, whether
/// or not the write succeeded.
async fn send_response<W>(
    client: &mut W,
    method: &Method,
    mut response: ProxyResponse,
    close: bool,
    timeout: Duration,
) -> SendOutcome
where
    W: AsyncWrite + Unpin,
{
    let framing = response_framing(method, &response);
    let head = encode_response_head(response.status, &response.headers, framing, close);
    let mut bytes_out = 0u64;
    let mut error = None;

    match write_all_with_timeout(client, &head, timeout, "writing response head to client").await
    {
        Ok(()) => {
            bytes_out += head.len() as u64;
            match write_response_body(&mut response.body, client, framing, timeout).await {
                Ok(written) => {
                    bytes_out += written;
                    if let Err(err) =
                        timeout_with_context(timeout, client.flush(), "flushing client stream")
                            .await
                    {
                        error = Some(err);
                    }
                }
                Err(err) => error = Some(err),
            }
        }
        Err(err) => error = Some(err),
    }

    if let Err(err) = response.body.close().await {
        warn!(error = %err, "failed to close response body");
    }
    SendOutcome { bytes_out, error }
}

fn response_framing(method: &Method, response: &ProxyResponse) -> ResponseFraming {
    let status = response.status;
    if status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return ResponseFraming::Empty(None);
    }
    if method == Method::HEAD {
        return ResponseFraming::Empty(response.content_length);
    }
    match response.content_length {
        Some(length) => ResponseFraming::Fixed(length),
        None => ResponseFraming::Chunked,
    }
}

fn error_response(status: StatusCode, message: &str) -> ProxyResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    ProxyResponse::from_bytes(status, headers, message.as_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use async_trait::async_trait;
    use tokio::io::ReadBuf;

    use crate::proxy::message::ResponseBody;

    struct TrackedBody {
        inner: Cursor<Vec<u8>>,
        closes: Arc<AtomicUsize>,
    }

    impl AsyncRead for TrackedBody {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    #[async_trait]
    impl ResponseBody for TrackedBody {
        async fn close(&mut self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn tracked(bytes: &[u8], content_length: Option<u64>) -> (ProxyResponse, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        let body = TrackedBody {
            inner: Cursor::new(bytes.to_vec()),
            closes: closes.clone(),
        };
        let response =
            ProxyResponse::new(StatusCode::OK, HeaderMap::new(), content_length, Box::new(body));
        (response, closes)
    }

    #[tokio::test]
    async fn known_length_is_sent_with_content_length() {
        let (response, closes) = tracked(b"layer", Some(5));
        let mut client = Vec::new();
        let sent =
            send_response(&mut client, &Method::GET, response, false, Duration::from_secs(1)).await;
        assert!(sent.error.is_none());
        let text = String::from_utf8(client).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\nlayer"));
        assert_eq!(sent.bytes_out, text.len() as u64);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_length_is_chunked() {
        let (response, closes) = tracked(b"layer", None);
        let mut client = Vec::new();
        send_response(&mut client, &Method::GET, response, true, Duration::from_secs(1)).await;
        let text = String::from_utf8(client).unwrap();
        assert!(text.contains("transfer-encoding: chunked\r\n"));
        assert!(text.contains("connection: close\r\n"));
        assert!(text.ends_with("5\r\nlayer\r\n0\r\n\r\n"));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn short_body_is_reported_and_still_closed() {
        let (response, closes) = tracked(b"lay", Some(5));
        let mut client = Vec::new();
        let sent =
            send_response(&mut client, &Method::GET, response, false, Duration::from_secs(1)).await;
        assert!(sent.error.is_some());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn head_and_bodiless_statuses_send_no_body() {
        let (response, _) = tracked(b"", Some(42));
        assert_eq!(
            response_framing(&Method::HEAD, &response),
            ResponseFraming::Empty(Some(42))
        );

        let (mut response, _) = tracked(b"", Some(0));
        response.status = StatusCode::NOT_MODIFIED;
        assert_eq!(
            response_framing(&Method::GET, &response),
            ResponseFraming::Empty(None)
        );
    }

    #[test]
    fn error_responses_are_plain_text() {
        let response = error_response(StatusCode::BAD_GATEWAY, "upstream request failed\n");
        assert_eq!(response.status, StatusCode::BAD_GATEWAY);
        assert_eq!(response.content_length, Some(24));
        assert_eq!(
            response.headers.get(header::CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
    }
}
