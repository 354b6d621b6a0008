use super::{ApiError, Backend, ByteStream, ChatRequest};
use crate::config::Config;
use crate::document::Document;
use crate::models::{FileId, StatusReport};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct UploadResponse {
    file_id: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    message: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client: Client::new(),
            base_url,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.base_url.clone())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

async fn ensure_success(resp: Response) -> Result<Response, ApiError> {
    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        return Err(ApiError::Api {
            status,
            message: text,
        });
    }
    Ok(resp)
}

#[async_trait]
impl Backend for HttpBackend {
    async fn submit(&self, document: &Document) -> Result<FileId, ApiError> {
        let part = Part::bytes(document.bytes.clone())
            .file_name(document.filename.clone())
            .mime_str("application/pdf")?;
        let form = Form::new().part("file", part);

        let resp = self
            .client
            .post(self.url("/upload"))
            .multipart(form)
            .send()
            .await?;
        let data: UploadResponse = ensure_success(resp).await?.json().await?;

        if data.file_id.is_empty() {
            return Err(ApiError::Parse("upload response carried an empty file_id".into()));
        }
        Ok(FileId::new(data.file_id))
    }

    async fn status(&self, file_id: &FileId) -> Result<StatusReport, ApiError> {
        let resp = self
            .client
            .get(self.url(&format!("/status/{}", file_id)))
            .send()
            .await?;
        let data: StatusResponse = ensure_success(resp).await?.json().await?;
        Ok(StatusReport::new(&data.status, data.progress, data.message))
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ByteStream, ApiError> {
        let resp = self
            .client
            .post(self.url("/chat"))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await?;
        let resp = ensure_success(resp).await?;

        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(ApiError::from))
            .boxed())
    }

    async fn fetch_document(&self, file_id: &FileId) -> Result<Bytes, ApiError> {
        let resp = self
            .client
            .get(self.url(&format!("/pdf/{}", file_id)))
            .send()
            .await?;
        Ok(ensure_success(resp).await?.bytes().await?)
    }
}
