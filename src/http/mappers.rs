use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::core::domain::{ExecutionRequest, SessionId};
use crate::core::errors::ExecuteError;
use crate::core::registry::LanguageProfile;
use crate::http::models::{ErrorBody, ExecuteBody, LanguageInfo};

/// An error rendered as `{"error": code, "message": text}` with a matching status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<ExecuteError> for ApiError {
    fn from(error: ExecuteError) -> Self {
        let (status, code) = match &error {
            ExecuteError::UnsupportedLanguage(_) => {
                (StatusCode::BAD_REQUEST, "unsupported_language")
            }
            ExecuteError::SourceTooLarge { .. } => {
                (StatusCode::PAYLOAD_TOO_LARGE, "source_too_large")
            }
            ExecuteError::AlreadyRunning(_) => (StatusCode::CONFLICT, "already_running"),
            ExecuteError::Cancelled => (StatusCode::CONFLICT, "cancelled"),
            ExecuteError::Overloaded { .. } => (StatusCode::SERVICE_UNAVAILABLE, "overloaded"),
        };
        Self {
            status,
            code,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.code.to_string(),
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<ExecuteBody> for (SessionId, ExecutionRequest) {
    fn from(body: ExecuteBody) -> Self {
        let session = body
            .session_id
            .map(SessionId::from)
            .unwrap_or_else(SessionId::random);
        let mut request =
            ExecutionRequest::new(body.language, body.source).with_limits(body.limits);
        request.stdin = body.stdin;
        (session, request)
    }
}

impl From<&LanguageProfile> for LanguageInfo {
    fn from(profile: &LanguageProfile) -> Self {
        Self {
            id: profile.id.to_string(),
            aliases: profile.aliases.iter().map(|alias| alias.to_string()).collect(),
            source_file: profile.source_file.to_string(),
            compiled: profile.is_compiled(),
        }
    }
}
