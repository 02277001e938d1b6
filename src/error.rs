use std::time::Duration;

use axum::http::StatusCode;
use serde_json::{json, Value};
use thiserror::Error;

use crate::geometry::{CoordinateSpace, Dimensions, Point};

/// Input rejected before any backend call was made.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Coordinates ({:.0}, {:.0}) in {} space resolve to ({:.0}, {:.0}), outside the {}x{} {} area", .requested.x, .requested.y, .requested.space, .resolved.x, .resolved.y, .bounds.width, .bounds.height, .resolved.space)]
    OutOfBounds {
        requested: Point,
        resolved: Point,
        bounds: Dimensions,
    },

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Unknown action type: {0}")]
    UnknownActionType(String),

    #[error("Unknown coordinate space: {0}")]
    UnknownCoordinateSpace(String),

    #[error("Unknown {field}: {value}")]
    UnknownValue { field: &'static str, value: String },

    #[error("Cannot convert from {from} to {to}: {reason}")]
    UnsupportedConversion {
        from: CoordinateSpace,
        to: CoordinateSpace,
        reason: String,
    },

    #[error("Session {session_id} is a {actual} session, not {expected}")]
    ScopeMismatch {
        session_id: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Ref '{0}' not found; fetch a fresh DOM tree first")]
    UnknownRef(String),
}

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session stopped: {0}")]
    SessionStopped(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Backend execution failed: {0}")]
    BackendExecution(String),

    #[error("Backend call timed out after {}ms", .0.as_millis())]
    BackendTimeout(Duration),

    #[error("{operation} is not supported for {scope} sessions")]
    Unsupported { scope: String, operation: String },
}

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation_error",
            EngineError::SessionNotFound(_) => "session_not_found",
            EngineError::SessionStopped(_) => "session_stopped",
            EngineError::BackendUnavailable(_) => "backend_unavailable",
            EngineError::BackendExecution(_) => "backend_execution_error",
            EngineError::BackendTimeout(_) => "backend_timeout",
            EngineError::Unsupported { .. } => "unsupported",
        }
    }

    /// Only failures of the backend itself may be retried by the healing chain.
    pub fn is_healable(&self) -> bool {
        matches!(
            self,
            EngineError::BackendExecution(_) | EngineError::BackendTimeout(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::Validation(_) | EngineError::Unsupported { .. } => StatusCode::BAD_REQUEST,
            EngineError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::SessionStopped(_) => StatusCode::GONE,
            EngineError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::BackendExecution(_) => StatusCode::BAD_GATEWAY,
            EngineError::BackendTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Structured context for the response `details` field.
    pub fn details(&self) -> Option<Value> {
        match self {
            EngineError::Validation(ValidationError::OutOfBounds {
                requested,
                resolved,
                bounds,
            }) => Some(json!({
                "bounds": {
                    "width": bounds.width,
                    "height": bounds.height,
                    "x_range": [0, bounds.width],
                    "y_range": [0, bounds.height],
                    "space": resolved.space,
                },
                "requested": {
                    "x": requested.x,
                    "y": requested.y,
                    "space": requested.space,
                },
                "resolved": {
                    "x": resolved.x,
                    "y": resolved.y,
                    "space": resolved.space,
                },
            })),
            EngineError::Validation(ValidationError::UnsupportedConversion { from, to, .. }) => {
                Some(json!({ "from_space": from, "to_space": to }))
            }
            EngineError::Validation(ValidationError::UnknownRef(id)) => Some(json!({ "ref": id })),
            EngineError::BackendTimeout(limit) => {
                Some(json!({ "timeout_ms": limit.as_millis() as u64 }))
            }
            _ => None,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_bounds_details_carry_bounds_and_request() {
        let err = EngineError::from(ValidationError::OutOfBounds {
            requested: Point::new(CoordinateSpace::Viewport, 1500.0, 200.0),
            resolved: Point::new(CoordinateSpace::Viewport, 1500.0, 200.0),
            bounds: Dimensions::new(1280, 720),
        });

        assert_eq!(err.kind(), "validation_error");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        let details = err.details().expect("details");
        assert_eq!(details["bounds"]["width"], 1280);
        assert_eq!(details["bounds"]["height"], 720);
        assert_eq!(details["requested"]["x"], 1500.0);
        assert!(err.to_string().contains("1280x720"));
    }

    #[test]
    fn only_backend_failures_are_healable() {
        assert!(EngineError::BackendExecution("boom".into()).is_healable());
        assert!(EngineError::BackendTimeout(Duration::from_secs(1)).is_healable());
        assert!(!EngineError::SessionStopped("s".into()).is_healable());
        assert!(!EngineError::from(ValidationError::MissingField("x")).is_healable());
    }
}
