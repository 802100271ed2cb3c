//! Progress reporting for streamed module downloads.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>;

/// A response whose body can be read exactly once, as a stream.
pub struct FetchedResponse {
    pub status: StatusCode,
    pub status_text: String,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl FetchedResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: ByteStream) -> Self {
        Self {
            status,
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
        }
    }

    /// Declared `Content-Length`, if present and numeric.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    /// Drain the body into one buffer.
    pub async fn bytes(mut self) -> Result<Bytes, io::Error> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl fmt::Debug for FetchedResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchedResponse")
            .field("status", &self.status)
            .field("status_text", &self.status_text)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Cumulative bytes read so far, and the declared total when known.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Progress {
    pub loaded: u64,
    pub total: Option<u64>,
}

impl Progress {
    /// Loaded ratio rounded to two decimals; `None` without a usable total.
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(total) if total > 0 => {
                Some(((self.loaded as f64 / total as f64) * 100.0).round() / 100.0)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.total, self.fraction()) {
            (Some(total), Some(fraction)) => write!(f, "{}/{} = {}", self.loaded, total, fraction),
            (Some(total), None) => write!(f, "{}/{}", self.loaded, total),
            (None, _) => write!(f, "{}/?", self.loaded),
        }
    }
}

/// Wrap `response` so every chunk read reports progress to `on_progress`.
///
/// Status, status text and every header (all values of repeated headers
/// included) are copied onto the returned response. The callback runs once per
/// chunk and once more when the stream ends, with `loaded == total` if the
/// total is known. Read errors are passed through and end reporting.
pub fn with_progress<F>(response: FetchedResponse, on_progress: F) -> FetchedResponse
where
    F: FnMut(Progress) + Send + 'static,
{
    let total = response.content_length();

    let mut headers = HeaderMap::with_capacity(response.headers.len());
    for (name, value) in response.headers.iter() {
        headers.append(name.clone(), value.clone());
    }

    let body = ProgressStream {
        inner: response.body,
        loaded: 0,
        total,
        on_progress: Box::new(on_progress),
        finished: false,
    };

    FetchedResponse {
        status: response.status,
        status_text: response.status_text,
        headers,
        body: Box::pin(body),
    }
}

struct ProgressStream {
    inner: ByteStream,
    loaded: u64,
    total: Option<u64>,
    on_progress: Box<dyn FnMut(Progress) + Send>,
    finished: bool,
}

impl Stream for ProgressStream {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.loaded += chunk.len() as u64;
                (this.on_progress)(Progress {
                    loaded: this.loaded,
                    total: this.total,
                });
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.finished = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                // Never report less than was actually read, even past a short
                // Content-Length.
                (this.on_progress)(Progress {
                    loaded: this.total.map_or(this.loaded, |total| total.max(this.loaded)),
                    total: this.total,
                });
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::http::HeaderValue;
    use axum::http::header::SET_COOKIE;
    use futures_util::stream;

    use super::*;

    fn chunked(chunks: Vec<Result<&'static str, io::Error>>) -> ByteStream {
        Box::pin(stream::iter(
            chunks
                .into_iter()
                .map(|c| c.map(|s| Bytes::from_static(s.as_bytes()))),
        ))
    }

    fn recorder() -> (Arc<Mutex<Vec<Progress>>>, impl FnMut(Progress) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |p| sink.lock().unwrap().push(p))
    }

    #[tokio::test]
    async fn reports_each_chunk_and_completion() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("6"));
        let response = FetchedResponse::new(
            StatusCode::OK,
            headers,
            chunked(vec![Ok("ab"), Ok("cde"), Ok("f")]),
        );
        let (seen, sink) = recorder();

        let body = with_progress(response, sink).bytes().await.unwrap();
        assert_eq!(&body[..], b"abcdef");

        let seen = seen.lock().unwrap();
        let loaded: Vec<u64> = seen.iter().map(|p| p.loaded).collect();
        assert_eq!(loaded, vec![2, 5, 6, 6]);
        assert!(loaded.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(
            *seen.last().unwrap(),
            Progress {
                loaded: 6,
                total: Some(6)
            }
        );
    }

    #[tokio::test]
    async fn body_longer_than_declared_keeps_loaded_increasing() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("3"));
        let response =
            FetchedResponse::new(StatusCode::OK, headers, chunked(vec![Ok("abcd"), Ok("ef")]));
        let (seen, sink) = recorder();

        with_progress(response, sink).bytes().await.unwrap();
        let seen = seen.lock().unwrap();
        let loaded: Vec<u64> = seen.iter().map(|p| p.loaded).collect();
        assert_eq!(loaded, vec![4, 6, 6]);
        assert!(seen.iter().all(|p| p.total == Some(3)));
    }

    #[tokio::test]
    async fn unknown_total_only_counts_loaded() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("lots"));
        let response =
            FetchedResponse::new(StatusCode::OK, headers, chunked(vec![Ok("abc"), Ok("d")]));
        let (seen, sink) = recorder();

        with_progress(response, sink).bytes().await.unwrap();
        let seen = seen.lock().unwrap();
        assert!(seen.iter().all(|p| p.total.is_none()));
        assert_eq!(seen.last().unwrap().loaded, 4);
        assert_eq!(seen.last().unwrap().fraction(), None);
    }

    #[tokio::test]
    async fn copies_status_and_every_header() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/wasm"));
        headers.append(SET_COOKIE, HeaderValue::from_static("a=1"));
        headers.append(SET_COOKIE, HeaderValue::from_static("b=2"));
        let mut response =
            FetchedResponse::new(StatusCode::NON_AUTHORITATIVE_INFORMATION, headers, chunked(vec![]));
        response.status_text = "Custom Reason".into();

        let wrapped = with_progress(response, |_| {});
        assert_eq!(wrapped.status, StatusCode::NON_AUTHORITATIVE_INFORMATION);
        assert_eq!(wrapped.status_text, "Custom Reason");
        assert_eq!(wrapped.content_type(), Some("application/wasm"));
        let cookies: Vec<_> = wrapped.headers.get_all(SET_COOKIE).iter().collect();
        assert_eq!(cookies.len(), 2);
    }

    #[tokio::test]
    async fn read_errors_propagate_without_completion_report() {
        let response = FetchedResponse::new(
            StatusCode::OK,
            HeaderMap::new(),
            chunked(vec![
                Ok("ab"),
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
            ]),
        );
        let (seen, sink) = recorder();

        let err = with_progress(response, sink).bytes().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn fraction_rounds_to_two_decimals() {
        let p = Progress {
            loaded: 1,
            total: Some(3),
        };
        assert_eq!(p.fraction(), Some(0.33));
        assert_eq!(p.to_string(), "1/3 = 0.33");
    }
}
