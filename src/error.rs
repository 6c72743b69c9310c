//! Edge-facing error codes and the uniform error envelope.
//!
//! Every failure that crosses the service boundary (REST glue, webhooks,
//! push channels, logs) is reduced to one envelope shape so all consumers
//! agree on how to render and react to it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Machine-readable error codes exposed at the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    // Photograph quality (E001-E099), attributable to the applicant.
    E001,
    E002,
    E003,
    E004,
    E005,
    E006,
    E007,
    // Processing (E100-E199)
    E100,
    E101,
    E102,
    E103,
    E104,
    E105,
    // Store (E200-E299)
    E200,
    E202,
    // Auth (E300-E399), issued by the external auth layer and mapped here.
    E300,
    E301,
    E302,
    E303,
    // Validation (E400-E499)
    E400,
    E401,
    // System (E500-E599)
    E500,
    E501,
    E503,
    E504,
    // Terminal retry exhaustion.
    E999,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::E001 => "E001",
            Self::E002 => "E002",
            Self::E003 => "E003",
            Self::E004 => "E004",
            Self::E005 => "E005",
            Self::E006 => "E006",
            Self::E007 => "E007",
            Self::E100 => "E100",
            Self::E101 => "E101",
            Self::E102 => "E102",
            Self::E103 => "E103",
            Self::E104 => "E104",
            Self::E105 => "E105",
            Self::E200 => "E200",
            Self::E202 => "E202",
            Self::E300 => "E300",
            Self::E301 => "E301",
            Self::E302 => "E302",
            Self::E303 => "E303",
            Self::E400 => "E400",
            Self::E401 => "E401",
            Self::E500 => "E500",
            Self::E501 => "E501",
            Self::E503 => "E503",
            Self::E504 => "E504",
            Self::E999 => "E999",
        }
    }

    /// Internal (log-facing) message.
    pub fn message(&self) -> &'static str {
        match self {
            Self::E001 => "No face detected in photograph",
            Self::E002 => "Multiple faces detected in photograph",
            Self::E003 => "Photograph quality below threshold",
            Self::E004 => "Detected face below minimum size",
            Self::E005 => "Unsupported or invalid image format",
            Self::E006 => "Image file exceeds size limit",
            Self::E007 => "Image resolution below minimum",
            Self::E100 => "Application processing failed",
            Self::E101 => "Embedding generation failed",
            Self::E102 => "Duplicate detection failed",
            Self::E103 => "Identity creation failed",
            Self::E104 => "Processing stage timed out",
            Self::E105 => "Submission queue is full",
            Self::E200 => "Application store unavailable",
            Self::E202 => "Record not found",
            Self::E300 => "Authentication failed",
            Self::E301 => "Invalid credentials",
            Self::E302 => "Token expired",
            Self::E303 => "Insufficient permissions",
            Self::E400 => "Invalid request data",
            Self::E401 => "Missing required field",
            Self::E500 => "Internal error",
            Self::E501 => "Service unavailable",
            Self::E503 => "Circuit breaker open",
            Self::E504 => "Rate limit exceeded",
            Self::E999 => "Retries exhausted",
        }
    }

    /// Applicant/operator-facing message with remedial guidance.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::E001 => {
                "We couldn't detect a face in your photograph. Please submit a clear photo showing your face."
            }
            Self::E002 => {
                "Your photograph contains multiple faces. Please submit a photo with only your face."
            }
            Self::E003 => {
                "The quality of your photograph is too low. Please submit a clearer, higher-quality image."
            }
            Self::E004 => {
                "Your face appears too small or partially hidden. Please submit a closer, clearer photograph."
            }
            Self::E005 => "The image format is not supported. Please upload a JPEG or PNG file.",
            Self::E006 => "Your image file is too large. Please upload an image smaller than 10MB.",
            Self::E007 => {
                "Your image resolution is too low. Please upload an image with at least 300x300 pixels."
            }
            Self::E100 | Self::E101 | Self::E102 | Self::E103 => {
                "We couldn't finish processing your application. Please try again later."
            }
            Self::E104 => "Processing took longer than expected. Please try again later.",
            Self::E105 => "The system is busy right now. Please try again in a few minutes.",
            Self::E200 | Self::E500 | Self::E501 | Self::E503 => {
                "A system error occurred. Our team has been notified."
            }
            Self::E202 => "The requested record could not be found.",
            Self::E300 | Self::E301 => "Authentication failed. Please check your credentials.",
            Self::E302 => "Your session has expired. Please sign in again.",
            Self::E303 => "You don't have permission to perform this action.",
            Self::E400 | Self::E401 => "The request is invalid. Please check the submitted data.",
            Self::E504 => "Too many requests. Please slow down and try again.",
            Self::E999 => {
                "Processing failed after several attempts. An operator will review your application."
            }
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::E001 | Self::E002 | Self::E003 | Self::E004 | Self::E005 | Self::E006
            | Self::E007 | Self::E202 | Self::E400 | Self::E401 | Self::E504 => Severity::Low,
            Self::E104 | Self::E105 | Self::E300 | Self::E301 | Self::E302 | Self::E303 => {
                Severity::Medium
            }
            Self::E100 | Self::E101 | Self::E102 | Self::E103 | Self::E501 | Self::E503
            | Self::E999 => Severity::High,
            Self::E200 | Self::E500 => Severity::Critical,
        }
    }

    /// Whether a failure with this code is attributable to the applicant
    /// (resubmission fixes it) rather than the system.
    pub fn applicant_attributable(&self) -> bool {
        matches!(
            self,
            Self::E001 | Self::E002 | Self::E003 | Self::E004 | Self::E005 | Self::E006 | Self::E007
        )
    }

    /// Default `retry_after` hint in seconds, only for throttling codes.
    pub fn default_retry_after(&self) -> Option<u64> {
        match self {
            Self::E105 => Some(120),
            Self::E501 => Some(30),
            Self::E503 => Some(60),
            Self::E504 => Some(10),
            _ => None,
        }
    }

    pub fn actionable_feedback(&self) -> Option<Vec<String>> {
        let items: &[&str] = match self {
            Self::E001 => &[
                "Face the camera directly with your full face visible",
                "Use even lighting without strong shadows",
                "Remove sunglasses, masks or other face coverings",
            ],
            Self::E002 => &[
                "Make sure you are the only person in the frame",
                "Crop the photo so only your face appears",
            ],
            Self::E003 => &[
                "Hold the camera steady to avoid blur",
                "Take the photo in good, even lighting",
            ],
            Self::E004 => &[
                "Move closer to the camera",
                "Make sure your whole face is visible and unobstructed",
            ],
            Self::E005 => &["Save the photo as JPEG or PNG and upload again"],
            Self::E006 => &["Compress or resize the image below 10MB"],
            Self::E007 => &["Use a camera or setting with at least 300x300 pixels"],
            _ => return None,
        };
        Some(items.iter().map(|s| (*s).to_string()).collect())
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The uniform failure shape shared by the review UI, webhooks and logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error_code: ErrorCode,
    pub message: String,
    pub user_message: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actionable: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorEnvelope {
    pub fn new(code: ErrorCode, timestamp: DateTime<Utc>) -> Self {
        Self {
            error_code: code,
            message: code.message().to_string(),
            user_message: code.user_message().to_string(),
            severity: code.severity(),
            timestamp,
            details: None,
            actionable: code.actionable_feedback(),
            retry_after: code.default_retry_after(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_detail(mut self, key: &str, value: serde_json::Value) -> Self {
        self.details
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value);
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_only_for_throttling_codes() {
        for code in [
            ErrorCode::E001,
            ErrorCode::E101,
            ErrorCode::E200,
            ErrorCode::E500,
        ] {
            assert!(code.default_retry_after().is_none(), "{code}");
        }
        for code in [
            ErrorCode::E105,
            ErrorCode::E501,
            ErrorCode::E503,
            ErrorCode::E504,
        ] {
            assert!(code.default_retry_after().is_some(), "{code}");
        }
    }

    #[test]
    fn rejection_codes_are_applicant_attributable() {
        assert!(ErrorCode::E001.applicant_attributable());
        assert!(ErrorCode::E005.applicant_attributable());
        assert!(!ErrorCode::E101.applicant_attributable());
        assert!(!ErrorCode::E999.applicant_attributable());
    }

    #[test]
    fn envelope_serializes_code_as_string() {
        let envelope = ErrorEnvelope::new(ErrorCode::E503, Utc::now());
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["error_code"], "E503");
        assert_eq!(json["retry_after"], 60);
    }
}
