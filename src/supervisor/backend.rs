//! HTTP client for the camera server's REST API

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use tracing::{debug, info};

use super::{ErrorReporter, StreamControl, StreamErrorReport};
use crate::config::BackendConfig;
use crate::error::{AppError, Result};

/// Stream control and error reporting over HTTP
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        if !config.is_enabled() {
            return Err(AppError::Config("backend base URL is empty".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs as u64))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim().trim_end_matches('/').to_string(),
            token: config.api_token.clone().filter(|t| !t.is_empty()),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: Response) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(AppError::Backend {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl StreamControl for HttpBackend {
    async fn start_stream(&self, camera_id: &str) -> Result<()> {
        let path = format!(
            "/api/cameras/{}/stream/start",
            urlencoding::encode(camera_id)
        );
        let response = self.request(Method::POST, &path).send().await?;
        Self::check(response).await?;
        info!("Requested stream restart for camera {}", camera_id);
        Ok(())
    }
}

#[async_trait]
impl ErrorReporter for HttpBackend {
    async fn report_error(&self, report: &StreamErrorReport) -> Result<()> {
        let response = self
            .request(Method::POST, "/api/stream-errors")
            .json(report)
            .send()
            .await?;
        Self::check(response).await?;
        debug!(
            "Reported {:?} for camera {}",
            report.error_type, report.camera_id
        );
        Ok(())
    }
}
