use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::Method;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::Instant;
use tracing::debug;

use super::headers::Http1HeaderAccumulator;
use super::line::read_line_with_deadline;

pub(crate) struct Http1RequestHead {
    pub method: Method,
    pub target: String,
    pub headers: Http1HeaderAccumulator,
    pub request_line_bytes: usize,
    pub header_bytes: usize,
}

/// Reads the next request head from a client connection.
///
/// Returns `None` when the client closes the connection, or stays silent for
/// `idle_timeout`, between requests. Once the first byte arrives the whole
/// head must be received within `header_timeout`.
pub(crate) async fn read_http1_request_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    idle_timeout: Duration,
    header_timeout: Duration,
    max_header_bytes: usize,
) -> Result<Option<Http1RequestHead>>
where
    S: AsyncRead + Unpin,
{
    let available = match tokio::time::timeout(idle_timeout, reader.fill_buf()).await {
        Ok(Ok(buf)) => buf,
        Ok(Err(err)) => {
            return Err(err).with_context(|| format!("waiting for request data from {peer}"));
        }
        Err(_) => return Ok(None),
    };
    if available.is_empty() {
        return Ok(None);
    }

    let deadline = Instant::now() + header_timeout;
    let mut request_line = String::new();
    let request_line_bytes =
        read_line_with_deadline(reader, &mut request_line, deadline, peer, max_header_bytes)
            .await
            .map_err(|err| {
                if err.to_string().contains("exceeds configured limit") {
                    anyhow!("request line exceeds configured limit of {max_header_bytes} bytes")
                } else {
                    err
                }
            })?;
    if request_line_bytes == 0 {
        debug!(peer = %peer, "connection closed before request line");
        return Ok(None);
    }
    let request_line = request_line.trim_end_matches(['\r', '\n']);
    if request_line.is_empty() {
        bail!("empty request line from {peer}");
    }

    let mut parts = request_line.split_whitespace();
    let method_str = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing target"))?;
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing version"))?;
    if parts.next().is_some() {
        bail!("malformed request line: unexpected data");
    }
    match version {
        "HTTP/1.1" => {}
        "HTTP/1.0" => bail!("HTTP/1.0 requests are not supported"),
        other => bail!("invalid HTTP version '{other}'"),
    }

    let method = Method::from_bytes(method_str.as_bytes())
        .with_context(|| format!("invalid method '{method_str}'"))?;
    let target = target.to_string();

    let remaining = max_header_bytes
        .checked_sub(request_line_bytes)
        .ok_or_else(|| anyhow!("request headers exceed configured limit"))?;
    ensure!(remaining > 0, "request headers exceed configured limit");
    let mut headers = Http1HeaderAccumulator::new(remaining);
    let mut header_line = String::new();
    loop {
        let read =
            read_line_with_deadline(reader, &mut header_line, deadline, peer, remaining).await?;
        if read == 0 {
            bail!("connection closed during request headers from {peer}");
        }
        if !headers
            .push_line(&header_line)
            .with_context(|| format!("invalid header from {peer}"))?
        {
            break;
        }
    }
    let header_bytes = headers.total_bytes();

    Ok(Some(Http1RequestHead {
        method,
        target,
        headers,
        request_line_bytes,
        header_bytes,
    }))
}

#[cfg(test)]
mod tests {
    use super::read_http1_request_head;
    use http::Method;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, BufReader};

    fn peer() -> SocketAddr {
        "127.0.0.1:12345".parse().unwrap()
    }

    #[tokio::test]
    async fn parses_absolute_form_request() -> anyhow::Result<()> {
        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(
                b"GET http://example.com/path HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n",
            )
            .await?;
        drop(client);

        let mut reader = BufReader::new(server);
        let head = read_http1_request_head(
            &mut reader,
            peer(),
            Duration::from_secs(1),
            Duration::from_secs(1),
            1024,
        )
        .await?
        .expect("expected request head");
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.target, "http://example.com/path");
        assert_eq!(head.headers.host(), Some("example.com"));
        assert_eq!(head.headers.forward_header_map().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn closed_connection_yields_none() -> anyhow::Result<()> {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut reader = BufReader::new(server);
        let head = read_http1_request_head(
            &mut reader,
            peer(),
            Duration::from_secs(1),
            Duration::from_secs(1),
            1024,
        )
        .await?;
        assert!(head.is_none());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn read_request_head_times_out_on_partial_line() {
        let (mut client, server) = tokio::io::duplex(64);

        let handle = tokio::spawn(async move {
            let mut reader = BufReader::new(server);
            read_http1_request_head(
                &mut reader,
                peer(),
                Duration::from_millis(50),
                Duration::from_millis(50),
                1024,
            )
            .await
        });

        tokio::task::yield_now().await;
        client
            .write_all(b"GET / HTTP/1.1")
            .await
            .expect("write partial line");
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_millis(100)).await;

        let result = handle.await.expect("request head join");
        match result {
            Ok(_) => panic!("expected timeout on partial line"),
            Err(err) => {
                assert!(
                    err.to_string().contains("timed out"),
                    "unexpected error: {err}"
                );
            }
        }
    }

    #[tokio::test]
    async fn rejects_long_request_line() -> anyhow::Result<()> {
        let (mut client, server) = tokio::io::duplex(4096);
        let request = format!(
            "GET http://example.com/{} HTTP/1.1\r\nHost: example.com\r\n\r\n",
            "a".repeat(2048)
        );
        client.write_all(request.as_bytes()).await?;
        drop(client);

        let mut reader = BufReader::new(server);
        let err = match read_http1_request_head(
            &mut reader,
            peer(),
            Duration::from_secs(1),
            Duration::from_secs(1),
            512,
        )
        .await
        {
            Ok(_) => panic!("request line should exceed limit"),
            Err(err) => err,
        };
        assert!(
            err.to_string().contains("request line exceeds"),
            "unexpected error: {err}"
        );
        Ok(())
    }

    #[tokio::test]
    async fn read_request_head_rejects_http10() {
        let (mut client, server) = tokio::io::duplex(128);
        client
            .write_all(b"GET / HTTP/1.0\r\nHost: example.com\r\n\r\n")
            .await
            .expect("write request");
        drop(client);

        let mut reader = BufReader::new(server);
        let err = match read_http1_request_head(
            &mut reader,
            peer(),
            Duration::from_secs(1),
            Duration::from_secs(1),
            1024,
        )
        .await
        {
            Ok(_) => panic!("HTTP/1.0 should be rejected"),
            Err(err) => err,
        };
        assert!(
            err.to_string().contains("HTTP/1.0"),
            "unexpected error: {err}"
        );
    }
}
