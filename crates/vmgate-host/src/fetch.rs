use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use url::Url;

use crate::error::{HostError, LaunchError};
use crate::progress::FetchedResponse;

/// Source of VM module bytes.
#[async_trait]
pub trait ModuleFetcher: Send + Sync {
    /// Issue the request and return as soon as the response head is in; the
    /// body is consumed later as a stream.
    async fn fetch(&self, module_path: &str) -> Result<FetchedResponse, LaunchError>;
}

/// Fetches modules over HTTP relative to a fixed origin.
pub struct HttpFetcher {
    client: Client,
    origin: Url,
}

impl HttpFetcher {
    pub fn new(origin: Url, connect_timeout: Duration) -> Result<Self, HostError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| HostError::Config(format!("build module fetch client: {e}")))?;
        Ok(Self { client, origin })
    }

    pub fn resolve(&self, module_path: &str) -> Result<Url, LaunchError> {
        self.origin
            .join(module_path)
            .map_err(|e| LaunchError::Fetch(format!("invalid module path '{module_path}': {e}")))
    }
}

#[async_trait]
impl ModuleFetcher for HttpFetcher {
    async fn fetch(&self, module_path: &str) -> Result<FetchedResponse, LaunchError> {
        let url = self.resolve(module_path)?;
        tracing::debug!(%url, "fetching vm module");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| LaunchError::Fetch(e.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes_stream().map(|r| r.map_err(io::Error::other));
        Ok(FetchedResponse::new(status, headers, Box::pin(body)))
    }
}
