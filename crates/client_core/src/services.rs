//! Contracts for the remote analysis, quota and image source collaborators,
//! plus their HTTP and filesystem implementations.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use shared::{
    domain::ImageRef,
    error::{ApiError, ApiException, ErrorCode},
    protocol::{AnalysisResult, AnalyzeRequest, QuotaSnapshot, SaveAnalysisRequest},
};
use tokio::sync::RwLock;
use tracing::{debug, info};

#[async_trait]
pub trait AnalysisService: Send + Sync {
    async fn analyze(&self, request: AnalyzeRequest) -> Result<AnalysisResult>;
    async fn save(&self, request: SaveAnalysisRequest) -> Result<()>;
}

#[async_trait]
pub trait QuotaStatus: Send + Sync {
    async fn should_warn_low(&self) -> Result<bool>;
    async fn refetch(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    Library,
    Camera,
}

/// Platform pickers. `None` means the user cancelled.
#[async_trait]
pub trait ImageSourceProvider: Send + Sync {
    async fn pick_from_library(&self) -> Result<Option<ImageRef>>;
    async fn capture_with_camera(&self) -> Result<Option<ImageRef>>;

    async fn acquire(&self, source: ImageSource) -> Result<Option<ImageRef>> {
        match source {
            ImageSource::Library => self.pick_from_library().await,
            ImageSource::Camera => self.capture_with_camera().await,
        }
    }
}

/// Quota collaborator for deployments without usage limits.
pub struct UnmeteredQuota;

#[async_trait]
impl QuotaStatus for UnmeteredQuota {
    async fn should_warn_low(&self) -> Result<bool> {
        Ok(false)
    }

    async fn refetch(&self) -> Result<()> {
        Ok(())
    }
}

/// Library picker backed by a fixed local file; there is no camera.
pub struct PathImageSource {
    path: PathBuf,
}

impl PathImageSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ImageSourceProvider for PathImageSource {
    async fn pick_from_library(&self) -> Result<Option<ImageRef>> {
        let exists = tokio::fs::try_exists(&self.path)
            .await
            .with_context(|| format!("failed to inspect {}", self.path.display()))?;
        if !exists {
            return Err(anyhow!("image file {} does not exist", self.path.display()));
        }
        Ok(Some(ImageRef::new(self.path.display().to_string())))
    }

    async fn capture_with_camera(&self) -> Result<Option<ImageRef>> {
        Ok(None)
    }
}

pub struct HttpAnalysisClient {
    http: Client,
    server_url: String,
}

impl HttpAnalysisClient {
    pub fn new(http: Client, server_url: impl Into<String>) -> Self {
        Self {
            http,
            server_url: server_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl AnalysisService for HttpAnalysisClient {
    async fn analyze(&self, request: AnalyzeRequest) -> Result<AnalysisResult> {
        debug!(protocol = %request.protocol_id, "posting analyze request");
        let response = self
            .http
            .post(format!("{}/analyze", self.server_url))
            .json(&request)
            .send()
            .await
            .context("failed to reach analysis service")?;
        let result = ensure_success(response)
            .await?
            .json::<AnalysisResult>()
            .await
            .context("malformed analysis response")?;
        Ok(result)
    }

    async fn save(&self, request: SaveAnalysisRequest) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/analyses", self.server_url))
            .json(&request)
            .send()
            .await
            .context("failed to reach analysis storage")?;
        ensure_success(response).await?;
        Ok(())
    }
}

pub struct HttpQuotaStatus {
    http: Client,
    server_url: String,
    cached: RwLock<Option<QuotaSnapshot>>,
}

impl HttpQuotaStatus {
    pub fn new(http: Client, server_url: impl Into<String>) -> Self {
        Self {
            http,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            cached: RwLock::new(None),
        }
    }

    pub async fn snapshot(&self) -> Option<QuotaSnapshot> {
        *self.cached.read().await
    }

    async fn fetch(&self) -> Result<QuotaSnapshot> {
        let response = self
            .http
            .get(format!("{}/quota", self.server_url))
            .send()
            .await
            .context("failed to reach quota service")?;
        let snapshot = ensure_success(response)
            .await?
            .json::<QuotaSnapshot>()
            .await
            .context("malformed quota response")?;
        *self.cached.write().await = Some(snapshot);
        Ok(snapshot)
    }
}

#[async_trait]
impl QuotaStatus for HttpQuotaStatus {
    async fn should_warn_low(&self) -> Result<bool> {
        let cached = *self.cached.read().await;
        let snapshot = match cached {
            Some(snapshot) => snapshot,
            None => self.fetch().await?,
        };
        Ok(snapshot.warn_low)
    }

    async fn refetch(&self) -> Result<()> {
        self.cached.write().await.take();
        let snapshot = self.fetch().await?;
        info!(
            used = snapshot.used,
            limit = snapshot.limit,
            "refreshed quota status"
        );
        Ok(())
    }
}

/// Maps a non-2xx response onto an [`ApiException`] when the body carries the
/// service error envelope.
async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if let Ok(api_error) = serde_json::from_str::<ApiError>(&body) {
        return Err(ApiException::from(api_error).into());
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        let code = if body.to_ascii_lowercase().contains("quota") {
            ErrorCode::QuotaExceeded
        } else {
            ErrorCode::RateLimited
        };
        return Err(ApiException::new(code, format!("{status}: {body}")).into());
    }
    Err(anyhow!("service returned {status}: {body}"))
}

#[cfg(test)]
#[path = "tests/services_tests.rs"]
mod tests;
