use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisType {
    #[serde(alias = "disease_detection")]
    Disease,
    #[serde(alias = "pest_detection")]
    Pest,
    #[default]
    #[serde(alias = "full")]
    Comprehensive,
}

impl AnalysisType {
    /// Rough processing time quoted to clients at intake.
    pub fn estimated_processing_secs(&self) -> u64 {
        match self {
            AnalysisType::Pest => 30,
            AnalysisType::Disease => 60,
            AnalysisType::Comprehensive => 90,
        }
    }

    /// Parse an optional form value; a missing or blank value means comprehensive.
    pub fn parse_optional(value: Option<&str>) -> Result<Self, AppError> {
        match value.map(str::trim).filter(|v| !v.is_empty()) {
            None => Ok(AnalysisType::default()),
            Some(v) => v
                .parse()
                .map_err(|e: anyhow::Error| AppError::Validation(e.to_string())),
        }
    }
}

impl Display for AnalysisType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            AnalysisType::Disease => write!(f, "disease"),
            AnalysisType::Pest => write!(f, "pest"),
            AnalysisType::Comprehensive => write!(f, "comprehensive"),
        }
    }
}

impl FromStr for AnalysisType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disease" | "disease_detection" => Ok(AnalysisType::Disease),
            "pest" | "pest_detection" => Ok(AnalysisType::Pest),
            "comprehensive" | "full" => Ok(AnalysisType::Comprehensive),
            _ => Err(anyhow::anyhow!("Invalid analysis type: {}", s)),
        }
    }
}

/// Optional knobs forwarded untouched to the Vision Service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AnalysisParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_threshold: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_details: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop_type: Option<String>,
}

const MAX_PROMPT_CHARS: usize = 2000;

impl AnalysisParameters {
    pub fn validate(&self) -> Result<(), AppError> {
        if let Some(threshold) = self.confidence_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(AppError::Validation(format!(
                    "confidence_threshold must be between 0.0 and 1.0, got {}",
                    threshold
                )));
            }
        }
        if let Some(prompt) = &self.custom_prompt {
            if prompt.chars().count() > MAX_PROMPT_CHARS {
                return Err(AppError::Validation(format!(
                    "custom_prompt exceeds {} characters",
                    MAX_PROMPT_CHARS
                )));
            }
        }
        Ok(())
    }
}
