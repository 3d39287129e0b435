use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use veil_proto::{problem_codes, ProblemDetails, PROBLEM_CONTENT_TYPE};

use crate::oob::OobError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, detail: impl Into<String>) -> Self {
        let title = status.canonical_reason().unwrap_or("Unknown Error");
        let problem = Box::new(ProblemDetails::new(status.as_u16(), title, code, detail));
        Self { status, problem }
    }

    pub fn bad_request(code: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }

    pub fn conflict(code: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }

    pub fn bad_gateway(code: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, code, message)
    }

    pub fn gateway_timeout(code: &str, message: impl Into<String>) -> Self {
        let mut err = Self::new(StatusCode::GATEWAY_TIMEOUT, code, message);
        err.problem.retryable = true;
        err
    }

    pub fn internal(code: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.problem.instance = Some(instance.into());
        self
    }
}

impl From<OobError> for ApiError {
    fn from(e: OobError) -> Self {
        let detail = e.to_string();
        match e {
            OobError::SessionNotFound(_) => Self::not_found(problem_codes::SESSION_NOT_FOUND, detail),
            OobError::HandshakeIncomplete(_) => {
                Self::bad_request(problem_codes::HANDSHAKE_INCOMPLETE, detail)
            }
            OobError::SessionExists(_) => Self::conflict(problem_codes::SESSION_EXISTS, detail),
            OobError::Target(_) => Self::bad_gateway(problem_codes::TARGET_UNREACHABLE, detail),
            OobError::Timeout => Self::gateway_timeout(problem_codes::TIMEOUT, detail),
            OobError::Protocol(_) => Self::bad_request(problem_codes::BAD_REQUEST, detail),
            OobError::Transport(_) => Self::internal(problem_codes::INTERNAL, detail),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static(PROBLEM_CONTENT_TYPE),
        );
        response
    }
}
