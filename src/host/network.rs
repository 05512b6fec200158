//! Outbound HTTP on behalf of extensions.
//!
//! Extensions never own a socket; every request goes through this
//! service after the host has checked the extension's network grant.

use futures::Stream;
use reqwest::Client;
use std::time::Duration;

use crate::error::{HostError, HostResult};
use crate::permissions::PermissionChecker;
use crate::protocol::{FetchRequest, FetchResponse};

/// Shared HTTP client for all extension fetches.
pub struct NetworkService {
    client: Client,
}

impl Default for NetworkService {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkService {
    pub fn new() -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Buffered fetch: whole body in, whole body out.
    pub async fn fetch(&self, request: &FetchRequest) -> HostResult<FetchResponse> {
        let response = self
            .build(request)?
            .send()
            .await
            .map_err(|e| HostError::Transport(format!("fetch failed: {e}")))?;

        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| HostError::Transport(format!("fetch body read failed: {e}")))?;

        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }

    /// Start a streaming fetch. Returns the status line plus the byte
    /// stream; the caller pumps chunks at its own pace.
    pub async fn fetch_stream(
        &self,
        request: &FetchRequest,
    ) -> HostResult<(
        u16,
        impl Stream<Item = reqwest::Result<bytes::Bytes>> + Send + Unpin + 'static,
    )> {
        let response = self
            .build(request)?
            .send()
            .await
            .map_err(|e| HostError::Transport(format!("fetch failed: {e}")))?;
        let status = response.status().as_u16();
        Ok((status, response.bytes_stream()))
    }

    fn build(&self, request: &FetchRequest) -> HostResult<reqwest::RequestBuilder> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| HostError::InvalidInput(format!("invalid method: {}", request.method)))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        Ok(builder)
    }
}

fn collect_headers(headers: &reqwest::header::HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            )
        })
        .collect()
}

/// Check an extension's network grant against a concrete URL. A bare
/// `network` grant (or `network:*`) allows any host; `network:<host>`
/// allows exactly that host.
pub fn check_network_access(checker: &PermissionChecker, url: &str) -> HostResult<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| HostError::InvalidInput(format!("invalid url: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| HostError::InvalidInput(format!("url has no host: {url}")))?;

    if checker.has("network") || checker.has(&format!("network:{host}")) {
        return Ok(());
    }
    Err(HostError::PermissionDenied(format!(
        "extension '{}' may not reach host '{host}'",
        checker.extension_id()
    )))
}
