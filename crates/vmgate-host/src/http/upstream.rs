//! Forwarding for requests the interceptor lets through.

use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::HOST;
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use reqwest::Client;
use url::Url;

use crate::config::HttpServerConfig;
use crate::error::HostError;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Sends pass-through traffic to a single upstream origin.
pub struct Upstream {
    client: Client,
    origin: Url,
    max_body_size: usize,
}

impl Upstream {
    pub fn new(origin: Url, timeout: Duration, max_body_size: usize) -> Result<Self, HostError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HostError::Config(format!("build upstream client: {e}")))?;
        Ok(Self {
            client,
            origin,
            max_body_size,
        })
    }

    pub fn from_config(config: &HttpServerConfig) -> Result<Self, HostError> {
        Self::new(
            config.upstream.clone(),
            config.upstream_timeout,
            config.max_body_size,
        )
    }

    /// Target URL for a request path and query on the upstream origin.
    pub fn target(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.origin.clone();
        url.set_path(path);
        url.set_query(query);
        url
    }

    pub async fn forward(&self, request: Request) -> Response {
        let (parts, body) = request.into_parts();
        let url = self.target(parts.uri.path(), parts.uri.query());
        let body = match axum::body::to_bytes(body, self.max_body_size).await {
            Ok(body) => body,
            Err(err) => {
                return (StatusCode::PAYLOAD_TOO_LARGE, format!("read request body: {err}"))
                    .into_response();
            }
        };

        let mut headers = strip_hop_by_hop(&parts.headers);
        headers.remove(HOST);
        tracing::trace!(method = %parts.method, %url, "passing request upstream");

        let response = match self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!("upstream request failed: {err}");
                return (StatusCode::BAD_GATEWAY, format!("upstream request failed: {err}"))
                    .into_response();
            }
        };

        let status = response.status();
        let headers = strip_hop_by_hop(response.headers());
        let mut out = Response::new(Body::from_stream(response.bytes_stream()));
        *out.status_mut() = status;
        *out.headers_mut() = headers;
        out
    }
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if !is_hop_by_hop(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}
