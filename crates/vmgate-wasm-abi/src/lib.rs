//! HTTP envelopes exchanged between the gateway host and a VM module.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current ABI version carried in request envelopes.
pub const ABI_VERSION: u8 = 1;

/// Import module name under which the host exposes its functions.
pub const HOST_MODULE: &str = "vmgate";

/// Request envelope (host → WASM module).
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct HttpRequest {
    pub version: u8,
    pub method: String,
    /// Path plus query, as received by the gateway.
    pub uri: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "serde_bytes")]
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            version: ABI_VERSION,
            method: method.into(),
            uri: uri.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AbiDecodeError> {
        let request: HttpRequest = serde_cbor::from_slice(bytes)?;
        if request.version != ABI_VERSION {
            return Err(AbiDecodeError::UnsupportedVersion {
                found: request.version,
            });
        }
        Ok(request)
    }

    pub fn encode(&self) -> Result<Vec<u8>, AbiEncodeError> {
        serde_cbor::to_vec(self).map_err(AbiEncodeError::Cbor)
    }

    /// Path portion of `uri`, without the query string.
    pub fn path(&self) -> &str {
        self.uri.split('?').next().unwrap_or_default()
    }
}

/// Response envelope (WASM module → host).
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "serde_bytes")]
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AbiDecodeError> {
        serde_cbor::from_slice(bytes).map_err(AbiDecodeError::Cbor)
    }

    pub fn encode(&self) -> Result<Vec<u8>, AbiEncodeError> {
        serde_cbor::to_vec(self).map_err(AbiEncodeError::Cbor)
    }
}

#[derive(Debug, Error)]
pub enum AbiDecodeError {
    #[error("ABI version {found} is not supported (expected {ABI_VERSION})")]
    UnsupportedVersion { found: u8 },
    #[error("failed to decode envelope: {0}")]
    Cbor(#[from] serde_cbor::Error),
}

#[derive(Debug, Error)]
pub enum AbiEncodeError {
    #[error("failed to encode envelope: {0}")]
    Cbor(#[from] serde_cbor::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_headers_and_body() {
        let mut request = HttpRequest::new("POST", "/sw/metrics/api/v1/import?db=0");
        request
            .headers
            .push(("content-type".into(), "text/plain".into()));
        request.body = b"up 1".to_vec();

        let decoded = HttpRequest::decode(&request.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, request);
        assert_eq!(decoded.path(), "/sw/metrics/api/v1/import");
    }

    #[test]
    fn rejects_wrong_version() {
        let mut request = HttpRequest::new("GET", "/");
        request.version = 99;
        let bytes = serde_cbor::to_vec(&request).unwrap();
        let err = HttpRequest::decode(&bytes).unwrap_err();
        assert!(matches!(err, AbiDecodeError::UnsupportedVersion { found: 99 }));
    }

    #[test]
    fn response_defaults_missing_fields() {
        #[derive(Serialize)]
        struct Bare {
            status: u16,
        }
        let bytes = serde_cbor::to_vec(&Bare { status: 204 }).unwrap();
        let decoded = HttpResponse::decode(&bytes).expect("decode");
        assert_eq!(decoded, HttpResponse::new(204, Vec::new()));
    }
}
