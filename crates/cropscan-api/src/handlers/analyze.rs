use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use cropscan_core::{AnalysisParameters, AnalysisType, AppError};
use cropscan_services::EnqueueRequest;
use cropscan_storage::UploadHandle;
use std::sync::Arc;

use crate::error::HttpAppError;
use crate::state::AppState;

const IMAGE_FIELDS: [&str; 2] = ["image", "file"];

/// Text fields collected from the form, in whatever order they arrive.
#[derive(Default)]
struct AnalyzeForm {
    analysis_type: Option<String>,
    parameters: AnalysisParameters,
}

impl AnalyzeForm {
    fn analysis_type(&self) -> Result<AnalysisType, AppError> {
        AnalysisType::parse_optional(self.analysis_type.as_deref())
    }

    fn set(&mut self, name: &str, value: String) -> Result<(), AppError> {
        let value = value.trim().to_string();
        match name {
            "analysis_type" => self.analysis_type = Some(value),
            "confidence_threshold" => {
                let threshold = value.parse::<f32>().map_err(|_| {
                    AppError::Validation(format!(
                        "confidence_threshold must be a number, got '{}'",
                        value
                    ))
                })?;
                self.parameters.confidence_threshold = Some(threshold);
            }
            "return_details" | "include_details" => {
                let flag = value.parse::<bool>().map_err(|_| {
                    AppError::Validation(format!("{} must be true or false", name))
                })?;
                self.parameters.return_details = Some(flag);
            }
            "custom_prompt" => {
                self.parameters.custom_prompt = Some(value).filter(|v| !v.is_empty())
            }
            "crop_type" => self.parameters.crop_type = Some(value).filter(|v| !v.is_empty()),
            other => tracing::debug!(field = other, "Ignoring unknown form field"),
        }
        Ok(())
    }
}

/// `POST /analyze`: stream the image to disk and queue an analysis job.
///
/// The image is never buffered: the multipart field is written chunk by chunk
/// to a temp file, with the size cap enforced mid-stream. Form fields may come
/// before or after the image; the upload is committed only once every field
/// has been validated, so a rejected request leaves nothing in the store.
/// Only a file reference is published to the queue. Returns `202 Accepted`
/// with the new job id; progress is polled through `GET /jobs/{id}`.
#[tracing::instrument(skip(state, multipart), fields(operation = "analyze_image"))]
pub async fn analyze_image(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, HttpAppError> {
    let mut form = AnalyzeForm::default();
    let mut staged: Option<UploadHandle> = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();

        if IMAGE_FIELDS.contains(&name.as_str()) {
            if staged.is_some() {
                return Err(AppError::Validation(
                    "Only one image may be uploaded per request".to_string(),
                )
                .into());
            }
            // Reject what we already know is invalid before touching disk.
            form.analysis_type()?;
            form.parameters.validate()?;

            let content_type = field
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_string();
            staged = Some(state.intake.stage_upload(&content_type, field).await?);
        } else {
            let value = field.text().await?;
            form.set(&name, value)?;
        }
    }

    let staged = staged.ok_or_else(|| {
        AppError::Validation("Missing 'image' field in multipart form".to_string())
    })?;
    let analysis_type = form.analysis_type()?;
    form.parameters.validate()?;
    let commit = state.intake.commit_staged(staged).await?;

    let submitted = state
        .intake
        .enqueue(EnqueueRequest {
            stored: commit.stored,
            deduplicated: commit.deduplicated,
            analysis_type,
            parameters: form.parameters,
        })
        .await?;

    Ok((StatusCode::ACCEPTED, Json(submitted)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_fields_map_onto_parameters() {
        let mut form = AnalyzeForm::default();
        form.set("analysis_type", "pest_detection".into()).unwrap();
        form.set("confidence_threshold", " 0.4 ".into()).unwrap();
        form.set("include_details", "true".into()).unwrap();
        form.set("crop_type", "maize".into()).unwrap();
        form.set("custom_prompt", "".into()).unwrap();
        form.set("unrelated", "whatever".into()).unwrap();

        assert_eq!(form.analysis_type().unwrap(), AnalysisType::Pest);
        assert_eq!(form.parameters.confidence_threshold, Some(0.4));
        assert_eq!(form.parameters.return_details, Some(true));
        assert_eq!(form.parameters.crop_type.as_deref(), Some("maize"));
        assert!(form.parameters.custom_prompt.is_none());
    }

    #[test]
    fn malformed_values_are_validation_errors() {
        let mut form = AnalyzeForm::default();
        assert!(form
            .set("confidence_threshold", "high".into())
            .unwrap_err()
            .is_validation());
        assert!(form
            .set("return_details", "maybe".into())
            .unwrap_err()
            .is_validation());

        form.set("analysis_type", "soil".into()).unwrap();
        assert!(form.analysis_type().unwrap_err().is_validation());
    }

    #[test]
    fn missing_analysis_type_defaults_to_comprehensive() {
        let form = AnalyzeForm::default();
        assert_eq!(form.analysis_type().unwrap(), AnalysisType::Comprehensive);
    }
}
