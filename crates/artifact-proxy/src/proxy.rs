//! Store lookups, mirror failover and relaying fetched artifacts
//!
//! A request is answered from the store when possible. Otherwise mirrors
//! are tried in priority order; the first 200 response is streamed to the
//! client and written to the store in the same pass.

use crate::error::Result;
use crate::mirrors::{build_url, Mirrors};
use artifact_store::{ArtifactStore, PartialWrite, StoreError};
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::channel::mpsc;
use futures::SinkExt;
use reqwest::Client;
use std::borrow::Cow;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn, Span};
use url::Url;

/// Request headers passed on to mirrors
const FORWARDED_REQUEST_HEADERS: [HeaderName; 2] = [header::ACCEPT, header::IF_MODIFIED_SINCE];

/// Mirror response headers passed on to the client
const RELAYED_RESPONSE_HEADERS: [HeaderName; 5] = [
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::ETAG,
    header::LAST_MODIFIED,
    header::DATE,
];

pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// How much of an unsuccessful mirror response body is kept
const ERROR_BODY_LIMIT: usize = 1024;

/// `Sunday, 06-Nov-94 08:49:37 GMT`
const RFC_850_FORMAT: &str = "%A, %d-%b-%y %H:%M:%S GMT";

/// `Sun Nov  6 08:49:37 1994`
const ASCTIME_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

/// Chunks buffered between the tee task and the client
const TEE_BUFFER: usize = 4;

/// A mirror answered with something other than 200
#[derive(Debug)]
pub struct BadStatus {
    pub upstream: String,
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// At most [`ERROR_BODY_LIMIT`] bytes of the response body
    pub body: Bytes,
}

impl fmt::Display for BadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bad upstream {:?} status {}, response (first {} bytes):\n{}",
            self.upstream,
            self.status.as_u16(),
            self.body.len(),
            String::from_utf8_lossy(&self.body)
        )
    }
}

/// A mirror produced no response at all
#[derive(Debug)]
pub enum TransportFailure {
    Request(reqwest::Error),
    Timeout { upstream: String, after: Duration },
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportFailure::Request(err) => write!(f, "upstream request failed: {}", err),
            TransportFailure::Timeout { upstream, after } => write!(
                f,
                "upstream request to {:?} timed out after {:?}",
                upstream, after
            ),
        }
    }
}

/// Outcome of asking one mirror
#[derive(Debug)]
pub enum MirrorOutcome {
    Fetched(reqwest::Response),
    BadStatus(BadStatus),
    Failed(TransportFailure),
}

/// Serves artifacts from the store, falling back to mirrors
pub struct Downloader {
    store: Arc<ArtifactStore>,
    mirrors: Mirrors,
    client: Client,
    /// Limit on connecting to a mirror and receiving its response headers
    timeout: Duration,
    span: Span,
}

impl Downloader {
    pub fn new(
        store: Arc<ArtifactStore>,
        mirrors: Mirrors,
        timeout: Duration,
        span: Span,
    ) -> Result<Self> {
        let client = Client::builder().connect_timeout(timeout).build()?;
        Ok(Self {
            store,
            mirrors,
            client,
            timeout,
            span,
        })
    }

    pub fn mirrors(&self) -> &Mirrors {
        &self.mirrors
    }

    /// Answer a request for `path`
    pub async fn serve(&self, path: &str, request_headers: &HeaderMap) -> Response {
        let key = cache_key(path);

        // The store cannot answer conditional requests, ask a mirror.
        if let Some(since) = if_modified_since(request_headers) {
            debug!(parent: &self.span, key = %key, since = %since, "Conditional request, asking mirrors first");
        } else if let Some(response) = self.from_store(&key).await {
            return response;
        }

        self.from_mirrors(path, &key, request_headers).await
    }

    async fn from_store(&self, key: &str) -> Option<Response> {
        match self.store.get(key).await {
            Ok((file, size)) => {
                debug!(parent: &self.span, key, size, "Serving from store");
                let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
                let headers = response.headers_mut();
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/octet-stream"),
                );
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
                headers.insert(X_CACHE, HeaderValue::from_static("HIT"));
                Some(response)
            }
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                // Mirrors may still be able to answer.
                error!(parent: &self.span, key, error = %e, "Store lookup failed");
                None
            }
        }
    }

    async fn from_mirrors(&self, path: &str, key: &str, request_headers: &HeaderMap) -> Response {
        let mut last_failure: Option<TransportFailure> = None;

        for (idx, mirror) in self.mirrors.iter().enumerate() {
            let url = match Url::parse(&build_url(mirror, path)) {
                Ok(url) => url,
                Err(e) => {
                    error!(parent: &self.span, mirror, path, error = %e, "Failed to prepare request");
                    return text_response(
                        StatusCode::BAD_GATEWAY,
                        format!("error processing request: cannot prepare request: {}\n", e),
                    );
                }
            };

            debug!(parent: &self.span, mirror, url = %url, "Trying mirror");
            match self.try_mirror(url, request_headers).await {
                MirrorOutcome::Fetched(upstream) => return self.relay_and_store(key, upstream).await,
                MirrorOutcome::BadStatus(bad) if bad.status == StatusCode::NOT_MODIFIED => {
                    debug!(parent: &self.span, upstream = %bad.upstream, "Not modified, passing through");
                    return relay_bad_status(bad, true);
                }
                MirrorOutcome::BadStatus(bad) => {
                    warn!(parent: &self.span, upstream = %bad.upstream, status = %bad.status, "Mirror returned bad status");
                    if !self.mirrors.has_more(idx) {
                        return relay_bad_status(bad, false);
                    }
                }
                MirrorOutcome::Failed(failure) => {
                    warn!(parent: &self.span, mirror, error = %failure, "Mirror failed");
                    if !self.mirrors.has_more(idx) {
                        last_failure = Some(failure);
                    }
                }
            }
        }

        mirrors_exhausted(last_failure.as_ref())
    }

    /// Ask one mirror and classify its answer
    pub async fn try_mirror(&self, url: Url, request_headers: &HeaderMap) -> MirrorOutcome {
        let upstream = url.to_string();

        let mut request = self.client.get(url);
        for name in &FORWARDED_REQUEST_HEADERS {
            if let Some(value) = request_headers.get(name) {
                request = request.header(name.clone(), value.clone());
            }
        }

        // Covers connecting and waiting for headers, not the body.
        let response = match tokio::time::timeout(self.timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return MirrorOutcome::Failed(TransportFailure::Request(e)),
            Err(_) => {
                return MirrorOutcome::Failed(TransportFailure::Timeout {
                    upstream,
                    after: self.timeout,
                })
            }
        };

        if response.status() == StatusCode::OK {
            return MirrorOutcome::Fetched(response);
        }

        let status = response.status();
        let headers = response.headers().clone();
        let body = read_prefix(response, ERROR_BODY_LIMIT).await;
        MirrorOutcome::BadStatus(BadStatus {
            upstream,
            status,
            headers,
            body,
        })
    }

    async fn relay_and_store(&self, key: &str, upstream: reqwest::Response) -> Response {
        let entry = match self.store.put(key).await {
            Ok(entry) => entry,
            Err(e) => {
                error!(parent: &self.span, key, error = %e, "Cannot write to store");
                return text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("error processing request: cannot write to cache: {}\n", e),
                );
            }
        };

        info!(parent: &self.span, key, url = %upstream.url(), "Downloading to store");

        let mut headers = relayed_headers(upstream.headers(), true);
        headers.insert(X_CACHE, HeaderValue::from_static("MISS"));

        let (tx, rx) = mpsc::channel(TEE_BUFFER);
        tokio::spawn(tee(
            upstream,
            entry,
            tx,
            key.to_string(),
            self.span.clone(),
        ));

        let mut response = Response::new(Body::from_stream(rx));
        *response.headers_mut() = headers;
        response
    }
}

#[derive(Debug)]
enum TeeError {
    Upstream(reqwest::Error),
    Store(StoreError),
    ClientGone,
}

impl fmt::Display for TeeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeeError::Upstream(err) => write!(f, "upstream read failed: {}", err),
            TeeError::Store(err) => write!(f, "store write failed: {}", err),
            TeeError::ClientGone => write!(f, "client went away"),
        }
    }
}

/// Copy the upstream body to both the client and the store entry.
///
/// The entry is committed only after every byte reached both sides, and
/// before the client sees the end of the body.
async fn tee(
    mut upstream: reqwest::Response,
    mut entry: PartialWrite,
    mut client: mpsc::Sender<io::Result<Bytes>>,
    key: String,
    span: Span,
) {
    match copy_both(&mut upstream, &mut entry, &mut client).await {
        Ok(copied) => match entry.commit().await {
            Ok(()) => info!(parent: &span, key = %key, bytes = copied, "Stored download"),
            Err(e) => error!(parent: &span, key = %key, error = %e, "Failed to commit download"),
        },
        Err(e) => {
            // Headers are out already, all that is left is to keep the
            // partial data out of the store.
            error!(parent: &span, key = %key, error = %e, "Copy failed, discarding store entry");
            if let Err(e) = entry.abort().await {
                error!(parent: &span, key = %key, error = %e, "Failed to discard store entry");
            }
            if !matches!(e, TeeError::ClientGone) {
                let _ = client.send(Err(io::Error::other(e.to_string()))).await;
            }
        }
    }
}

async fn copy_both(
    upstream: &mut reqwest::Response,
    entry: &mut PartialWrite,
    client: &mut mpsc::Sender<io::Result<Bytes>>,
) -> std::result::Result<u64, TeeError> {
    let mut copied = 0u64;
    while let Some(chunk) = upstream.chunk().await.map_err(TeeError::Upstream)? {
        entry.write_all(&chunk).await.map_err(TeeError::Store)?;
        copied += chunk.len() as u64;
        client
            .send(Ok(chunk))
            .await
            .map_err(|_| TeeError::ClientGone)?;
    }
    Ok(copied)
}

/// Store key for a request path: percent-decoded, without the leading `/`
pub fn cache_key(path: &str) -> String {
    let decoded = urlencoding::decode(path)
        .map(Cow::into_owned)
        .unwrap_or_else(|_| path.to_string());
    decoded.trim_start_matches('/').to_string()
}

fn if_modified_since(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    let value = headers.get(header::IF_MODIFIED_SINCE)?.to_str().ok()?;
    parse_http_date(value)
}

/// Parse a date in any of the three HTTP formats: IMF-fixdate (RFC 1123),
/// obsolete RFC 850 and ANSI C `asctime()`
fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date.with_timezone(&Utc));
    }
    [RFC_850_FORMAT, ASCTIME_FORMAT]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

fn relayed_headers(from: &HeaderMap, with_length: bool) -> HeaderMap {
    RELAYED_RESPONSE_HEADERS
        .iter()
        .filter(|name| with_length || **name != header::CONTENT_LENGTH)
        .filter_map(|name| from.get(name).map(|value| (name.clone(), value.clone())))
        .collect()
}

/// Forward a non-200 mirror response. The body may have been truncated,
/// in which case the upstream length must not be relayed.
fn relay_bad_status(bad: BadStatus, with_length: bool) -> Response {
    let mut response = Response::new(Body::from(bad.body));
    *response.status_mut() = bad.status;
    *response.headers_mut() = relayed_headers(&bad.headers, with_length);
    response
}

fn mirrors_exhausted(last_failure: Option<&TransportFailure>) -> Response {
    let mut body = String::from("error: mirrors exhausted\n");
    if let Some(failure) = last_failure {
        body.push_str(&format!("error from last mirror:\n - {}\n", failure));
    }
    text_response(StatusCode::NOT_FOUND, body)
}

fn text_response(status: StatusCode, body: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

async fn read_prefix(mut response: reqwest::Response, limit: usize) -> Bytes {
    let mut buf = BytesMut::new();
    while buf.len() < limit {
        match response.chunk().await {
            Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
            Ok(None) | Err(_) => break,
        }
    }
    buf.truncate(limit);
    buf.freeze()
}
