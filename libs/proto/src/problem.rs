//! RFC 7807 problem-details bodies returned by the control surface.

use serde::{Deserialize, Serialize};

use crate::ProtoError;

pub const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";

/// Machine-readable `code` values.
pub mod problem_codes {
    pub const SESSION_NOT_FOUND: &str = "session_not_found";
    pub const HANDSHAKE_INCOMPLETE: &str = "handshake_incomplete";
    pub const SESSION_EXISTS: &str = "session_exists";
    pub const TARGET_UNREACHABLE: &str = "target_unreachable";
    pub const TIMEOUT: &str = "timeout";
    pub const BAD_REQUEST: &str = "bad_request";
    pub const INTERNAL: &str = "internal_error";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub code: String,
    #[serde(default)]
    pub retryable: bool,
}

impl ProblemDetails {
    pub fn new(status: u16, title: impl Into<String>, code: &str, detail: impl Into<String>) -> Self {
        Self {
            r#type: format!("https://veil.dev/problems/{code}"),
            title: title.into(),
            status,
            detail: detail.into(),
            instance: None,
            code: code.to_string(),
            retryable: false,
        }
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn from_slice(body: &[u8]) -> Result<Self, ProtoError> {
        Ok(serde_json::from_slice(body)?)
    }
}
