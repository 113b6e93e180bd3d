//! Problem-details error responses for the worker API.

use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::custodian::RefreshError;
use crate::reconciler::CycleError;

#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://ampflow.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            code,
            retryable: false,
            retry_after_seconds: None,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn unauthorized(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn bad_gateway(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, code, message)
    }

    pub fn gateway_timeout(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, code, message)
    }

    pub fn too_many_requests(code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut this = Self::new(StatusCode::TOO_MANY_REQUESTS, code, message);
        this.problem.retryable = true;
        this
    }

    pub fn retryable(mut self) -> Self {
        self.problem.retryable = true;
        self
    }

    pub fn with_retry_after_seconds(mut self, seconds: u64) -> Self {
        self.problem.retry_after_seconds = Some(seconds);
        self.problem.retryable = true;
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

impl From<CycleError> for ApiError {
    fn from(err: CycleError) -> Self {
        let message = err.to_string();
        match err {
            CycleError::AuthExpired => {
                ApiError::bad_gateway("gateway_auth_expired", message).retryable()
            }
            CycleError::VehicleUnreachable(_) => {
                ApiError::gateway_timeout("vehicle_unreachable", message).retryable()
            }
            CycleError::RateLimited => {
                ApiError::too_many_requests("gateway_rate_limited", message)
            }
            CycleError::PartialRewrite { .. } => {
                // Stale entries remain for the next cycle; operators see
                // this through worker-status as well.
                ApiError::internal("partial_rewrite", message).retryable()
            }
            CycleError::Store(amp_store::StoreError::Conflict { .. }) => {
                ApiError::conflict("fingerprint_conflict", message)
            }
            CycleError::InvalidPlan(_) => ApiError::bad_gateway("invalid_plan", message),
            CycleError::NoCredentials => ApiError::internal("no_credentials", message),
            CycleError::Store(_) | CycleError::Gateway(_) => {
                ApiError::internal("internal", message).retryable()
            }
        }
    }
}

impl From<RefreshError> for ApiError {
    fn from(err: RefreshError) -> Self {
        let message = err.to_string();
        match err {
            RefreshError::CooldownActive { remaining_secs } => {
                ApiError::too_many_requests("refresh_cooldown", message)
                    .with_retry_after_seconds(remaining_secs)
            }
            RefreshError::NoRefreshToken => ApiError::internal("no_refresh_token", message),
            RefreshError::Upstream(_) => ApiError::bad_gateway("refresh_failed", message).retryable(),
            RefreshError::Store(_) => ApiError::internal("internal", message),
        }
    }
}
