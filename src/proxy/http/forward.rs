use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, bail};
use http::{Method, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::proxy::AppContext;
use crate::proxy::forward_error::ForwardError;
use crate::proxy::message::ProxyResponse;
use crate::proxy::request::ProxyRequest;
use crate::util::{timeout_with_context, write_all_with_timeout};

use super::body::{BodyPlan, UpstreamBodyPlan, relay_request_body};
use super::codec::{Http1ResponseHead, read_http1_response_head};
use super::upstream::{UpstreamBody, UpstreamConnection};

/// Sends `request` upstream on a fresh connection and returns the response
/// with its body still streaming.
pub(crate) async fn forward_request<S>(
    client: &mut BufReader<S>,
    request: &ProxyRequest,
    body_plan: BodyPlan,
    expect_continue: bool,
    peer: SocketAddr,
    app: &AppContext,
) -> Result<ProxyResponse, ForwardError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let client_timeout = app.settings.client_timeout();
    let upstream_timeout = app.settings.upstream_timeout();

    let mut connection = UpstreamConnection::connect(request, app)
        .await
        .map_err(ForwardError::Connect)?;
    let upstream_peer = connection.peer;

    let head = build_upstream_request(request, body_plan, expect_continue);
    write_all_with_timeout(
        &mut connection.stream,
        &head,
        upstream_timeout,
        "sending request headers to upstream",
    )
    .await
    .map_err(ForwardError::Request)?;

    send_continue_if_needed(client.get_mut(), expect_continue, body_plan, client_timeout)
        .await
        .map_err(ForwardError::ClientBody)?;
    relay_request_body(
        client,
        &mut connection.stream,
        body_plan,
        client_timeout,
        upstream_timeout,
        peer,
    )
    .await
    .map_err(ForwardError::ClientBody)?;
    timeout_with_context(
        upstream_timeout,
        connection.stream.flush(),
        "flushing upstream stream",
    )
    .await
    .map_err(ForwardError::Request)?;

    let mut upstream_reader = BufReader::new(connection.stream);
    let head = read_final_response_head(
        &mut upstream_reader,
        upstream_timeout,
        upstream_peer,
        app.settings.max_header_size,
    )
    .await
    .map_err(ForwardError::Response)?;

    let plan = UpstreamBodyPlan::for_response(&request.method, &head);
    let content_length = if request.method == Method::HEAD {
        head.content_length
    } else {
        plan.known_length()
    };
    let body = UpstreamBody::spawn(upstream_reader, plan, upstream_timeout, upstream_peer);
    Ok(ProxyResponse::new(
        head.status,
        head.end_to_end_headers(),
        content_length,
        Box::new(body),
    ))
}

/// Serializes the request head sent upstream. Every upstream connection
/// carries exactly one request, so `Connection: close` is always set.
pub(crate) fn build_upstream_request(
    request: &ProxyRequest,
    body_plan: BodyPlan,
    expect_continue: bool,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(request.method.as_str().as_bytes());
    buffer.extend_from_slice(b" ");
    buffer.extend_from_slice(request.path.as_bytes());
    buffer.extend_from_slice(b" HTTP/1.1\r\n");

    buffer.extend_from_slice(b"Host: ");
    buffer.extend_from_slice(request.authority_host().as_bytes());
    buffer.extend_from_slice(b"\r\n");

    for (name, value) in &request.headers {
        if expect_continue && name == http::header::EXPECT {
            continue;
        }
        buffer.extend_from_slice(name.as_str().as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    buffer.extend_from_slice(b"Connection: close\r\n");

    match body_plan {
        BodyPlan::Fixed(length) => {
            buffer.extend_from_slice(b"Content-Length: ");
            buffer.extend_from_slice(length.to_string().as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }
        BodyPlan::Chunked => {
            buffer.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
        BodyPlan::Empty => {}
    }

    buffer.extend_from_slice(b"\r\n");
    buffer
}

async fn send_continue_if_needed<S>(
    client: &mut S,
    expect_continue: bool,
    body_plan: BodyPlan,
    timeout: Duration,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    if !expect_continue || matches!(body_plan, BodyPlan::Empty) {
        return Ok(());
    }

    write_all_with_timeout(
        client,
        b"HTTP/1.1 100 Continue\r\n\r\n",
        timeout,
        "sending 100 Continue to client",
    )
    .await?;
    timeout_with_context(timeout, client.flush(), "flushing 100 Continue to client").await
}

/// Skips interim 1xx responses; the client already got its own
/// `100 Continue` when it asked for one.
async fn read_final_response_head<S>(
    upstream: &mut BufReader<S>,
    timeout: Duration,
    upstream_peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<Http1ResponseHead>
where
    S: AsyncRead + Unpin,
{
    loop {
        let head = read_http1_response_head(upstream, timeout, upstream_peer, max_header_bytes)
            .await?;
        if head.status == StatusCode::SWITCHING_PROTOCOLS {
            bail!("upstream attempted protocol upgrade (101 Switching Protocols)");
        }
        if !head.status.is_informational() {
            return Ok(head);
        }
        if head.transfer_encoding_present || head.content_length.is_some_and(|len| len > 0) {
            bail!("informational response must not include a body");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::request::Scheme;
    use http::{HeaderMap, HeaderValue};
    use tokio::io::duplex;

    fn request(method: Method, headers: HeaderMap) -> ProxyRequest {
        ProxyRequest {
            method,
            scheme: Scheme::Http,
            host: "registry.example".to_string(),
            port: 8080,
            path: "/v2/lib/blobs/sha256:abc?x=1".to_string(),
            headers,
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    #[test]
    fn upstream_request_uses_origin_form_and_closes() {
        let mut headers = HeaderMap::new();
        headers.insert("accept", HeaderValue::from_static("*/*"));
        let bytes = build_upstream_request(&request(Method::GET, headers), BodyPlan::Empty, false);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("GET /v2/lib/blobs/sha256:abc?x=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: registry.example:8080\r\n"));
        assert!(text.contains("accept: */*\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn upstream_request_drops_expect_when_continue_is_local() {
        let mut headers = HeaderMap::new();
        headers.insert("expect", HeaderValue::from_static("100-continue"));
        let bytes = build_upstream_request(
            &request(Method::PUT, headers),
            BodyPlan::Fixed(12),
            true,
        );
        let text = String::from_utf8(bytes).unwrap();
        assert!(!text.contains("expect"));
        assert!(text.contains("Content-Length: 12\r\n"));
    }

    #[test]
    fn chunked_request_body_is_announced() {
        let bytes =
            build_upstream_request(&request(Method::POST, HeaderMap::new()), BodyPlan::Chunked, false);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
    }

    #[tokio::test]
    async fn final_head_skips_informational_responses() -> Result<()> {
        let (mut upstream, reader) = duplex(256);
        upstream
            .write_all(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .await?;
        drop(upstream);

        let mut reader = BufReader::new(reader);
        let head =
            read_final_response_head(&mut reader, Duration::from_secs(1), peer(), 256).await?;
        assert_eq!(head.status, StatusCode::OK);
        Ok(())
    }

    #[tokio::test]
    async fn final_head_rejects_switching_protocols() -> Result<()> {
        let (mut upstream, reader) = duplex(256);
        upstream
            .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n")
            .await?;
        drop(upstream);

        let mut reader = BufReader::new(reader);
        let err = read_final_response_head(&mut reader, Duration::from_secs(1), peer(), 256)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Switching Protocols"), "{err}");
        Ok(())
    }

    #[tokio::test]
    async fn continue_is_only_sent_when_a_body_follows() -> Result<()> {
        let mut client = Vec::new();
        send_continue_if_needed(&mut client, true, BodyPlan::Empty, Duration::from_secs(1))
            .await?;
        assert!(client.is_empty());

        send_continue_if_needed(&mut client, true, BodyPlan::Fixed(3), Duration::from_secs(1))
            .await?;
        assert_eq!(client, b"HTTP/1.1 100 Continue\r\n\r\n");
        Ok(())
    }
}
