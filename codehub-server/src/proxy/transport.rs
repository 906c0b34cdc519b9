//! HTTP relay to the upstream container (spec §4.J step 6). Streams both
//! directions through `reqwest` rather than buffering, and strips the
//! headers that only mean something to the hop they were set on.

use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, Response};
use axum::response::IntoResponse;
use reqwest::Client;

use codehub_core::retry::{classify_http_status, Backoff, ErrorClass};
use codehub_core::runtime::UpstreamAddress;

use crate::errors::AppError;

/// Bounded retries for the relay's idempotent fast path (spec §7): enough to
/// ride out a brief upstream hiccup without turning a dead container into a
/// long hang.
const MAX_RETRIES: u32 = 2;
const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_CAP: Duration = Duration::from_secs(2);

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

fn forward_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if !is_hop_by_hop(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Relays one HTTP request/response pair to `upstream`, preserving method,
/// headers (minus hop-by-hop), and streaming bodies in both directions.
pub async fn relay_http(
    client: &Client,
    upstream: UpstreamAddress,
    path_and_query: &str,
    req: Request,
) -> Result<axum::response::Response, AppError> {
    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
        .map_err(|_| AppError::invalid_request("unsupported HTTP method"))?;
    let headers = forward_headers(req.headers());
    let url = format!("http://{}:{}{}", upstream.host, upstream.port, path_and_query);

    // GET/HEAD carry no body worth re-sending, so they're the only methods
    // safe to retry; everything else streams through once, same as before.
    let upstream_response = if method == reqwest::Method::GET || method == reqwest::Method::HEAD {
        relay_idempotent_with_retry(client, method, &url, headers).await?
    } else {
        let body_stream = req.into_body().into_data_stream();
        client
            .request(method, &url)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body_stream))
            .send()
            .await
            .map_err(|err| {
                tracing::warn!(error = %err, url, "proxied request to workspace container failed");
                AppError::upstream_unavailable("workspace container did not respond")
            })?
    };

    let status = upstream_response.status();
    let response_headers = forward_headers(upstream_response.headers());
    let body = Body::from_stream(upstream_response.bytes_stream());

    let mut builder = Response::builder().status(status);
    for (name, value) in response_headers.iter() {
        builder = builder.header(name, value);
    }
    builder
        .body(body)
        .map(IntoResponse::into_response)
        .map_err(|_| AppError::internal("failed to build proxied response"))
}

/// Retries connect failures and transient (429/5xx) upstream statuses with
/// jittered backoff, classified through the same helper WC's circuit
/// breaker uses (spec §7, "WC, Scheduler, and Proxy all agree on what is
/// retryable"). Permanent statuses and exhausted retries return as-is for
/// the caller to surface.
async fn relay_idempotent_with_retry(
    client: &Client,
    method: reqwest::Method,
    url: &str,
    headers: HeaderMap,
) -> Result<reqwest::Response, AppError> {
    let mut backoff = Backoff::new(RETRY_BASE, RETRY_CAP);
    let mut attempt = 0;
    loop {
        match client.request(method.clone(), url).headers(headers.clone()).send().await {
            Ok(response) => {
                let class = classify_http_status(response.status().as_u16());
                if class == ErrorClass::Transient && attempt < MAX_RETRIES {
                    attempt += 1;
                    tracing::warn!(url, attempt, status = %response.status(), "transient upstream status, retrying");
                    tokio::time::sleep(backoff.next_delay()).await;
                    continue;
                }
                return Ok(response);
            }
            Err(err) if attempt < MAX_RETRIES => {
                attempt += 1;
                tracing::warn!(error = %err, url, attempt, "transient proxy connect failure, retrying");
                tokio::time::sleep(backoff.next_delay()).await;
            }
            Err(err) => {
                tracing::warn!(error = %err, url, "proxied request to workspace container failed");
                return Err(AppError::upstream_unavailable("workspace container did not respond"));
            }
        }
    }
}
