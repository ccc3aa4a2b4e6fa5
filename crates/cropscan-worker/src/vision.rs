use async_trait::async_trait;
use cropscan_core::{AnalysisParameters, AnalysisType, ProcessingError, StoredFile};
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything the Vision Service needs for one analysis.
#[derive(Debug, Clone)]
pub struct VisionRequest {
    pub job_id: Uuid,
    pub file: StoredFile,
    pub analysis_type: AnalysisType,
    pub parameters: AnalysisParameters,
}

/// External image analyzer.
///
/// Implementations may watch `cancel` and return
/// [`ProcessingError::cancelled`] early; ignoring it is also valid.
#[async_trait]
pub trait VisionService: Send + Sync {
    async fn analyze(
        &self,
        request: &VisionRequest,
        cancel: CancellationToken,
    ) -> Result<Value, ProcessingError>;
}

#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    #[error("Failed to read stored file: {0}")]
    File(#[from] std::io::Error),

    #[error("Vision service request failed: {0}")]
    Transport(reqwest::Error),

    #[error("Vision service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Vision service response could not be decoded: {0}")]
    Decode(String),

    #[error("Vision service rejected the image: {0}")]
    Rejected(String),
}

impl From<VisionError> for ProcessingError {
    fn from(err: VisionError) -> Self {
        let (code, retryable) = match &err {
            VisionError::File(e) if e.kind() == std::io::ErrorKind::NotFound => {
                ("file_missing", false)
            }
            VisionError::File(_) => ("file_read_failed", true),
            VisionError::Transport(e) if e.is_timeout() => ("vision_timeout", true),
            VisionError::Transport(_) => ("vision_unreachable", true),
            VisionError::Status { status, .. } if *status >= 500 || *status == 429 => {
                ("vision_unavailable", true)
            }
            VisionError::Status { .. } | VisionError::Rejected(_) => ("vision_rejected", false),
            VisionError::Decode(_) => ("vision_bad_response", false),
        };
        if retryable {
            ProcessingError::retryable(code, err)
        } else {
            ProcessingError::permanent(code, err)
        }
    }
}

/// Vision Service client speaking multipart over HTTP.
///
/// The image is streamed from disk into the request body, so worker memory
/// stays flat regardless of file size.
pub struct HttpVisionClient {
    http: reqwest::Client,
    base_url: String,
}

impl Debug for HttpVisionClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("HttpVisionClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl HttpVisionClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, VisionError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(VisionError::Transport)?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(analysis_type: AnalysisType) -> &'static str {
        match analysis_type {
            AnalysisType::Disease => "/detect/disease",
            AnalysisType::Pest => "/detect/pests",
            AnalysisType::Comprehensive => "/analyze/comprehensive",
        }
    }

    async fn build_form(request: &VisionRequest) -> Result<Form, VisionError> {
        let file = tokio::fs::File::open(&request.file.path).await?;
        let length = file.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let part = Part::stream_with_length(body, length)
            .file_name(format!(
                "{}.{}",
                request.file.file_id,
                request.file.format.as_str()
            ))
            .mime_str(request.file.format.mime_type())
            .map_err(VisionError::Transport)?;

        let params = &request.parameters;
        let mut form = Form::new().part("image", part);
        match request.analysis_type {
            AnalysisType::Disease => {
                if let Some(prompt) = &params.custom_prompt {
                    form = form.text("custom_prompt", prompt.clone());
                }
            }
            AnalysisType::Pest => {
                if let Some(threshold) = params.confidence_threshold {
                    form = form.text("confidence_threshold", threshold.to_string());
                }
                if let Some(details) = params.return_details {
                    form = form.text("include_details", details.to_string());
                }
            }
            AnalysisType::Comprehensive => {
                if let Some(threshold) = params.confidence_threshold {
                    form = form.text("pest_confidence", threshold.to_string());
                }
                if let Some(details) = params.return_details {
                    form = form.text("pest_details", details.to_string());
                }
                if let Some(prompt) = &params.custom_prompt {
                    form = form.text("disease_prompt", prompt.clone());
                }
            }
        }
        if let Some(crop) = &params.crop_type {
            form = form.text("crop_type", crop.clone());
        }
        Ok(form)
    }

    async fn send(&self, request: &VisionRequest) -> Result<Value, VisionError> {
        let url = format!("{}{}", self.base_url, Self::endpoint(request.analysis_type));
        let form = Self::build_form(request).await?;

        let response = self
            .http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(VisionError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(VisionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| VisionError::Decode(e.to_string()))?;

        if body.get("success").and_then(Value::as_bool) == Some(false) {
            let reason = body
                .get("error")
                .or_else(|| body.get("detail"))
                .map(|v| v.to_string())
                .unwrap_or_else(|| "no reason given".to_string());
            return Err(VisionError::Rejected(reason));
        }

        // The service wraps results as {"success", "data", ...}; keep the payload.
        Ok(match body.get("data") {
            Some(data) => data.clone(),
            None => body,
        })
    }
}

#[async_trait]
impl VisionService for HttpVisionClient {
    #[tracing::instrument(skip(self, request, cancel), fields(job.id = %request.job_id, analysis_type = %request.analysis_type))]
    async fn analyze(
        &self,
        request: &VisionRequest,
        cancel: CancellationToken,
    ) -> Result<Value, ProcessingError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProcessingError::cancelled()),
            result = self.send(request) => result.map_err(ProcessingError::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Multipart;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::Utc;
    use cropscan_core::{FailureKind, ImageFormat};
    use serde_json::json;

    async fn spawn_fake_service() -> String {
        async fn disease(mut multipart: Multipart) -> Json<Value> {
            let mut image_len = 0;
            let mut image_type = None;
            let mut prompt = None;
            while let Ok(Some(field)) = multipart.next_field().await {
                let name = field.name().map(str::to_string);
                match name.as_deref() {
                    Some("image") => {
                        image_type = field.content_type().map(str::to_string);
                        image_len = field.bytes().await.map(|b| b.len()).unwrap_or(0);
                    }
                    Some("custom_prompt") => prompt = field.text().await.ok(),
                    _ => {}
                }
            }
            Json(json!({
                "success": true,
                "data": {
                    "image_bytes": image_len,
                    "image_type": image_type,
                    "prompt": prompt,
                },
                "processing_time_ms": 12.5,
            }))
        }

        let app = Router::new()
            .route("/detect/disease", post(disease))
            .route(
                "/detect/pests",
                post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "model loading") }),
            )
            .route(
                "/analyze/comprehensive",
                post(|| async { (StatusCode::UNPROCESSABLE_ENTITY, "bad image") }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn request(dir: &tempfile::TempDir, analysis_type: AnalysisType) -> VisionRequest {
        let path = dir.path().join("leaf.png");
        let mut bytes = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
        bytes.resize(4096, 7);
        std::fs::write(&path, &bytes).unwrap();
        VisionRequest {
            job_id: Uuid::new_v4(),
            file: StoredFile {
                file_id: "ab".repeat(32),
                path,
                size_bytes: 4096,
                format: ImageFormat::Png,
                created_at: Utc::now(),
                expires_at: Utc::now(),
            },
            analysis_type,
            parameters: AnalysisParameters {
                custom_prompt: Some("check for rust".to_string()),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_disease_request_streams_file_and_unwraps_data() {
        let base = spawn_fake_service().await;
        let client = HttpVisionClient::new(base, Duration::from_secs(5)).unwrap();
        let dir = tempfile::tempdir().unwrap();

        let result = client
            .analyze(&request(&dir, AnalysisType::Disease), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result["image_bytes"], 4096);
        assert_eq!(result["image_type"], "image/png");
        assert_eq!(result["prompt"], "check for rust");
    }

    #[tokio::test]
    async fn test_status_codes_are_classified() {
        let base = spawn_fake_service().await;
        let client = HttpVisionClient::new(base, Duration::from_secs(5)).unwrap();
        let dir = tempfile::tempdir().unwrap();

        let err = client
            .analyze(&request(&dir, AnalysisType::Pest), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Retryable);
        assert_eq!(err.code(), "vision_unavailable");

        let err = client
            .analyze(
                &request(&dir, AnalysisType::Comprehensive),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Permanent);
        assert_eq!(err.code(), "vision_rejected");
    }

    #[tokio::test]
    async fn test_missing_file_is_permanent() {
        let base = spawn_fake_service().await;
        let client = HttpVisionClient::new(base, Duration::from_secs(5)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut req = request(&dir, AnalysisType::Disease);
        req.file.path = dir.path().join("gone.png");

        let err = client
            .analyze(&req, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Permanent);
        assert_eq!(err.code(), "file_missing");
    }

    #[tokio::test]
    async fn test_unreachable_service_is_retryable() {
        // Bind then drop to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client =
            HttpVisionClient::new(format!("http://{}", addr), Duration::from_secs(2)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let err = client
            .analyze(&request(&dir, AnalysisType::Disease), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_cancelled_token_short_circuits() {
        let client =
            HttpVisionClient::new("http://127.0.0.1:9", Duration::from_secs(30)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let err = client
            .analyze(&request(&dir, AnalysisType::Disease), token)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Cancelled);
    }
}
