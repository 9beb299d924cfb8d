//! reqwest implementation of the image service client.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::{multipart, Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::config::BackendConfig;

use super::{
    ArchiveStream, BackendError, DownloadRequest, DownloadStatus, HealthStatus, ImageBackend,
    ParseCsvResponse, ReprocessRequest, ReprocessResponse, SearchRequest, SearchResponse,
};

/// HTTP client for the image search/download service.
pub struct HttpImageBackend {
    client: Client,
    config: BackendConfig,
}

impl HttpImageBackend {
    /// Create a new client; every request is bounded by the configured timeout.
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(concat!("partpix/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BackendError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Get the base URL without trailing slash.
    fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url(), path)
    }

    /// URL for an operation addressed by an id path segment.
    fn id_url(&self, path: &str, id: &str) -> String {
        format!("{}/{}/{}", self.base_url(), path, urlencoding::encode(id))
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, BackendError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        debug!(url = %url, "POST");

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;

        decode(check_status(response).await?).await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T, BackendError> {
        debug!(url = %url, "GET");

        let response = self.client.get(&url).send().await.map_err(transport_error)?;

        decode(check_status(response).await?).await
    }
}

#[async_trait]
impl ImageBackend for HttpImageBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn parse_csv(
        &self,
        file_name: &str,
        contents: Vec<u8>,
    ) -> Result<Vec<String>, BackendError> {
        let url = self.url("parse-csv");
        debug!(url = %url, file_name, bytes = contents.len(), "Uploading CSV");

        let part = multipart::Part::bytes(contents)
            .file_name(file_name.to_string())
            .mime_str("text/csv")
            .map_err(|e| BackendError::Internal(e.to_string()))?;
        let form = multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(transport_error)?;

        let parsed: ParseCsvResponse = decode(check_status(response).await?).await?;
        Ok(parsed.part_numbers)
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, BackendError> {
        self.post_json("search-images", request).await
    }

    async fn reprocess(
        &self,
        request: &ReprocessRequest,
    ) -> Result<ReprocessResponse, BackendError> {
        self.post_json("reprocess-images", request).await
    }

    async fn start_download(
        &self,
        request: &DownloadRequest,
    ) -> Result<DownloadStatus, BackendError> {
        self.post_json("download-images", request).await
    }

    async fn download_status(&self, download_id: &str) -> Result<DownloadStatus, BackendError> {
        self.get_json(self.id_url("download-status", download_id))
            .await
    }

    async fn fetch_archive(&self, download_id: &str) -> Result<ArchiveStream, BackendError> {
        let url = self.id_url("download-zip", download_id);
        debug!(url = %url, "Fetching archive");

        let response = self.client.get(&url).send().await.map_err(transport_error)?;
        let response = check_status(response).await?;

        Ok(response
            .bytes_stream()
            .map_ok(|chunk| chunk.to_vec())
            .map_err(transport_error)
            .boxed())
    }

    async fn cleanup(&self, task_id: &str) -> Result<(), BackendError> {
        let url = self.id_url("cleanup", task_id);
        debug!(url = %url, "DELETE");

        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await?;
        Ok(())
    }

    async fn health(&self) -> Result<HealthStatus, BackendError> {
        self.get_json(self.url("health")).await
    }
}

fn transport_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout
    } else if e.is_decode() {
        BackendError::InvalidResponse(e.to_string())
    } else {
        BackendError::ConnectionFailed(e.to_string())
    }
}

/// Turn a non-2xx response into `BackendError::Api`, keeping the service's
/// `detail` message when it sent one.
async fn check_status(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(BackendError::Api {
        status: status.as_u16(),
        detail: extract_detail(&body),
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, BackendError> {
    let body = response.bytes().await.map_err(transport_error)?;
    serde_json::from_slice(&body)
        .map_err(|e| BackendError::InvalidResponse(format!("Failed to parse response: {}", e)))
}

fn extract_detail(body: &str) -> Option<String> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }

    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::Object(map)) => match map.get("detail") {
            Some(serde_json::Value::String(detail)) => Some(detail.clone()),
            Some(other) => Some(other.to_string()),
            None => Some(body.chars().take(200).collect()),
        },
        _ => Some(body.chars().take(200).collect()),
    }
}
