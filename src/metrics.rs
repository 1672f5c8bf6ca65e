use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow, ensure};
use http::StatusCode;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    time::timeout,
};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_total", "Proxied requests by response source");
    let vec = IntCounterVec::new(opts, &["source"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_total");
    vec
});

static REQUEST_STATUS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_status_total", "Requests by status class");
    let vec = IntCounterVec::new(opts, &["status_class"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_status_total");
    vec
});

static REQUEST_LATENCY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new("request_duration_seconds", "Request latency by source")
        .buckets(latency_buckets());
    let vec = HistogramVec::new(opts, &["source"]).expect("create histogram vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register request_duration_seconds");
    vec
});

static CACHE_LOOKUP_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("blob_cache_lookup_total", "Blob cache lookups by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register blob_cache_lookup_total");
    vec
});

static CACHE_STORE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("blob_cache_store_total", "Blobs committed to the store")
        .expect("create blob_cache_store_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register blob_cache_store_total");
    counter
});

static CACHE_STORE_ERRORS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "blob_cache_store_errors_total",
        "Blob persistence failures (create, write or commit)",
    )
    .expect("create blob_cache_store_errors_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register blob_cache_store_errors_total");
    counter
});

static CACHE_SERVED_BYTES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "blob_cache_served_bytes_total",
        "Bytes of cached blobs handed to clients",
    )
    .expect("create blob_cache_served_bytes_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register blob_cache_served_bytes_total");
    counter
});

static UPSTREAM_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let vec = IntCounterVec::new(
        Opts::new("upstream_errors_total", "Upstream errors by kind"),
        &["kind"],
    )
    .expect("create upstream_errors_total");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register upstream_errors_total");
    vec
});

fn latency_buckets() -> Vec<f64> {
    // Layer downloads run long; extend past the usual request range.
    vec![
        0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0,
    ]
}

const METRICS_MAX_REQUEST_BYTES: usize = 8192;
const METRICS_READ_TIMEOUT: Duration = Duration::from_secs(5);

fn status_class(status: u16) -> &'static str {
    match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}

/// Result of the pre-fetch cache check for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    Hit,
    Miss,
    Wait,
    Bypass,
}

impl CacheLookup {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheLookup::Hit => "hit",
            CacheLookup::Miss => "miss",
            CacheLookup::Wait => "wait",
            CacheLookup::Bypass => "bypass",
        }
    }
}

pub fn record_request(source: &str, status: StatusCode, elapsed: Duration) {
    REQUESTS_TOTAL.with_label_values(&[source]).inc();
    REQUEST_STATUS_TOTAL
        .with_label_values(&[status_class(status.as_u16())])
        .inc();
    REQUEST_LATENCY_SECONDS
        .with_label_values(&[source])
        .observe(elapsed.as_secs_f64());
}

pub fn record_cache_lookup(result: CacheLookup) {
    CACHE_LOOKUP_TOTAL.with_label_values(&[result.as_str()]).inc();
}

pub fn record_cache_store() {
    CACHE_STORE_TOTAL.inc();
}

pub fn record_cache_store_error() {
    CACHE_STORE_ERRORS_TOTAL.inc();
}

pub fn record_cache_served(bytes: u64) {
    CACHE_SERVED_BYTES_TOTAL.inc_by(bytes);
}

pub fn record_upstream_error(kind: &str) {
    UPSTREAM_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn gather() -> Vec<u8> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %err, "failed to encode metrics");
    }
    buffer
}

pub async fn serve(addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(address = %addr, "metrics listener started");
    loop {
        let (stream, _) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(err) = handle_stream(stream).await {
                tracing::debug!(error = %err, "metrics handler error");
            }
        });
    }
}

async fn handle_stream<S>(stream: S) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    handle_stream_with_limits(stream, METRICS_READ_TIMEOUT, METRICS_MAX_REQUEST_BYTES).await
}

async fn handle_stream_with_limits<S>(
    stream: S,
    read_timeout: Duration,
    max_bytes: usize,
) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    let mut total_bytes = 0usize;
    let bytes = read_line_with_limits(
        &mut reader,
        &mut request_line,
        read_timeout,
        max_bytes,
        &mut total_bytes,
        "reading metrics request line",
    )
    .await?;
    if bytes == 0 {
        return Ok(());
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let uri = parts.next().unwrap_or_default();

    loop {
        let mut line = String::new();
        let n = read_line_with_limits(
            &mut reader,
            &mut line,
            read_timeout,
            max_bytes,
            &mut total_bytes,
            "reading metrics request headers",
        )
        .await?;
        if n == 0 || line == "\r\n" {
            break;
        }
    }

    let response = if method == "GET" && uri == "/metrics" {
        build_response(200, TextEncoder::new().format_type(), gather())
    } else {
        build_response(404, "text/plain", b"not found".to_vec())
    };

    reader.get_mut().write_all(&response).await?;
    reader.get_mut().shutdown().await?;
    Ok(())
}

fn build_response(status: u16, content_type: &str, body: Vec<u8>) -> Vec<u8> {
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: {content_type}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let mut response = header.into_bytes();
    response.extend_from_slice(&body);
    response
}

async fn read_line_with_limits<R>(
    reader: &mut BufReader<R>,
    buf: &mut String,
    timeout_dur: Duration,
    max_bytes: usize,
    total: &mut usize,
    context: &str,
) -> Result<usize>
where
    R: tokio::io::AsyncRead + Unpin,
{
    ensure!(max_bytes > 0, "max_bytes must be greater than zero");
    buf.clear();
    let mut collected = Vec::new();
    loop {
        let available = timeout(timeout_dur, reader.fill_buf())
            .await
            .map_err(|_| anyhow!("timed out {context}"))??;
        if available.is_empty() {
            if collected.is_empty() {
                return Ok(0);
            }
            anyhow::bail!("connection closed while {context}");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());

        let remaining = max_bytes
            .checked_sub(*total)
            .ok_or_else(|| anyhow!("metrics request exceeded allowed size"))?;
        if collected.len() + consume > remaining {
            anyhow::bail!("metrics request exceeded allowed size");
        }

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let string = String::from_utf8(collected)
        .map_err(|_| anyhow!("metrics request contained invalid bytes"))?;
    let bytes = string.len();
    *total += bytes;
    ensure!(*total <= max_bytes, "metrics request exceeded allowed size");
    *buf = string;
    Ok(bytes)
}
