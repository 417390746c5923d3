use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use thiserror::Error;
use validator::ValidationErrors;

use crate::{
    dao::storage::StorageError,
    services::allocator::ActivationError,
    state::{AbortError, ApplyError, PlanError},
};

/// Errors that can occur in service layer operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Storage backend is unavailable.
    #[error("storage unavailable")]
    Unavailable(#[source] StorageError),
    /// Missing or unknown credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Authenticated caller acting on something it does not own.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Invalid input provided by the client.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Operation cannot be performed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// Operation exceeded its timeout limit.
    #[error("operation timed out")]
    Timeout,
    /// No invitation code could be reserved.
    #[error("invitation code allocation failed after {attempts} attempts")]
    AllocationExhausted { attempts: u32 },
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        ServiceError::Unavailable(err)
    }
}

impl From<ActivationError> for ServiceError {
    fn from(err: ActivationError) -> Self {
        match err {
            ActivationError::Exhausted { attempts } => {
                ServiceError::AllocationExhausted { attempts }
            }
            ActivationError::NotFound => ServiceError::NotFound("session not found".into()),
            ActivationError::NotOwner => {
                ServiceError::Forbidden("session belongs to another admin".into())
            }
            ActivationError::Closed => {
                ServiceError::InvalidState("session has been terminated".into())
            }
            ActivationError::Storage(source) => ServiceError::Unavailable(source),
        }
    }
}

impl From<ValidationErrors> for AppError {
    fn from(err: ValidationErrors) -> Self {
        AppError::BadRequest(format!("validation failed: {}", err))
    }
}

/// Application-level errors that are converted to HTTP responses.
#[derive(Debug, Error)]
pub enum AppError {
    /// Bad request with invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Unauthorized access attempt.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Authenticated but not allowed.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Requested resource not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// Conflict with current state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Service unavailable or degraded.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Unavailable(source) => AppError::ServiceUnavailable(source.to_string()),
            ServiceError::Unauthorized(message) => AppError::Unauthorized(message),
            ServiceError::Forbidden(message) => AppError::Forbidden(message),
            ServiceError::InvalidInput(message) => AppError::BadRequest(message),
            ServiceError::InvalidState(message) => AppError::Conflict(message),
            ServiceError::NotFound(message) => AppError::NotFound(message),
            ServiceError::Timeout => AppError::ServiceUnavailable("operation timed out".into()),
            err @ ServiceError::AllocationExhausted { .. } => {
                AppError::ServiceUnavailable(err.to_string())
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        let payload = Json(ErrorBody {
            message: self.to_string(),
        });

        (status, payload).into_response()
    }
}

/// Errors raised while handling a WebSocket frame.
///
/// They are answered with an error envelope on the offending socket only.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame is not a valid envelope.
    #[error("malformed message: {0}")]
    Malformed(String),
    /// Envelope names an action the role does not support.
    #[error("unknown action `{component}/{action}`")]
    UnknownAction { component: String, action: String },
    /// Envelope data does not match the action.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    /// The engine refused the action.
    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl ProtocolError {
    /// Stable machine-readable kind sent to clients.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolError::Malformed(_) => "malformed",
            ProtocolError::UnknownAction { .. } => "unknown_action",
            ProtocolError::InvalidPayload(_) => "invalid_payload",
            ProtocolError::Service(err) => match err {
                ServiceError::Unavailable(_) => "unavailable",
                ServiceError::Unauthorized(_) => "unauthorized",
                ServiceError::Forbidden(_) => "forbidden",
                ServiceError::InvalidInput(_) => "invalid_input",
                ServiceError::InvalidState(_) => "invalid_state",
                ServiceError::NotFound(_) => "not_found",
                ServiceError::Timeout => "timeout",
                ServiceError::AllocationExhausted { .. } => "allocation_exhausted",
            },
        }
    }
}

impl From<ValidationErrors> for ProtocolError {
    fn from(err: ValidationErrors) -> Self {
        ProtocolError::InvalidPayload(format!("validation failed: {}", err))
    }
}

impl From<PlanError> for ServiceError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::AlreadyPending => {
                ServiceError::InvalidState("state transition already pending".into())
            }
            PlanError::InvalidTransition(invalid) => {
                ServiceError::InvalidState(invalid.to_string())
            }
        }
    }
}

impl From<ApplyError> for ServiceError {
    fn from(err: ApplyError) -> Self {
        match err {
            ApplyError::NoPending => ServiceError::InvalidState("no transition is pending".into()),
            ApplyError::IdMismatch { .. } => {
                ServiceError::InvalidState("pending transition does not match".into())
            }
            ApplyError::PhaseMismatch { expected, actual } => ServiceError::InvalidState(format!(
                "state changed during transition (expected {expected:?}, got {actual:?})"
            )),
        }
    }
}

impl From<AbortError> for ServiceError {
    fn from(err: AbortError) -> Self {
        match err {
            AbortError::NoPending => ServiceError::InvalidState("no pending transition".into()),
            AbortError::IdMismatch { .. } => {
                ServiceError::InvalidState("transition plan does not match".into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_exhaustion_maps_to_service_unavailable() {
        let app: AppError = ServiceError::from(ActivationError::Exhausted { attempts: 10 }).into();
        assert_eq!(
            app.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn terminated_session_maps_to_conflict() {
        let app: AppError = ServiceError::from(ActivationError::Closed).into();
        assert_eq!(app.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn protocol_kinds_follow_the_service_error() {
        let err = ProtocolError::from(ServiceError::InvalidState("late".into()));
        assert_eq!(err.kind(), "invalid_state");
        assert_eq!(ProtocolError::Malformed("x".into()).kind(), "malformed");
    }
}
