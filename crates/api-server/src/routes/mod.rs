//! Route handlers

pub mod control;
pub mod health;
pub mod runs;

use axum::{http::StatusCode, Json};
use serde::Serialize;

use agent_runner::{ResumeRejection, RunnerError};

/// Header carrying the caller's tenant
pub const TENANT_HEADER: &str = "x-tenant-id";

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

pub type RouteError = (StatusCode, Json<ErrorResponse>);

fn route_error(status: StatusCode, error: String, code: Option<&str>) -> RouteError {
    (
        status,
        Json(ErrorResponse {
            error,
            code: code.map(str::to_string),
        }),
    )
}

pub fn internal_error(error: impl std::fmt::Display) -> RouteError {
    route_error(StatusCode::INTERNAL_SERVER_ERROR, error.to_string(), None)
}

pub fn not_found(error: impl Into<String>) -> RouteError {
    route_error(StatusCode::NOT_FOUND, error.into(), Some("run_not_found"))
}

pub fn bad_request(error: impl Into<String>) -> RouteError {
    route_error(StatusCode::BAD_REQUEST, error.into(), None)
}

pub fn conflict(error: impl Into<String>, code: &str) -> RouteError {
    route_error(StatusCode::CONFLICT, error.into(), Some(code))
}

/// Map a runner error to a response; resume rejections keep their code
pub fn runner_error(error: RunnerError) -> RouteError {
    let Some(rejection) = error.rejection() else {
        return internal_error(error);
    };
    let status = match rejection {
        ResumeRejection::RunNotFound => StatusCode::NOT_FOUND,
        ResumeRejection::NotAuthorized => StatusCode::FORBIDDEN,
        ResumeRejection::NotInAttention => StatusCode::CONFLICT,
        ResumeRejection::MissingSnapshot | ResumeRejection::CorruptSnapshot => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
    };
    route_error(status, error.to_string(), Some(rejection.code()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_rejections_map_to_statuses() {
        let run_id = Uuid::new_v4();
        let cases = [
            (ResumeRejection::RunNotFound, StatusCode::NOT_FOUND),
            (ResumeRejection::NotAuthorized, StatusCode::FORBIDDEN),
            (ResumeRejection::NotInAttention, StatusCode::CONFLICT),
            (ResumeRejection::MissingSnapshot, StatusCode::UNPROCESSABLE_ENTITY),
            (ResumeRejection::CorruptSnapshot, StatusCode::UNPROCESSABLE_ENTITY),
        ];

        for (rejection, expected) in cases {
            let (status, Json(body)) = runner_error(RunnerError::rejected(run_id, rejection));
            assert_eq!(status, expected);
            assert_eq!(body.code.as_deref(), Some(rejection.code()));
        }

        let (status, Json(body)) = runner_error(RunnerError::inference("timeout"));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.code.is_none());
    }
}
