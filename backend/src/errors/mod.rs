//! # Error Handling Module
//!
//! All errors the dispatch services return. Each variant maps to a stable,
//! machine-readable code (see [`DispatchError::code`]) plus a
//! human-readable message from its `Display` impl.
//!
//! ## Error Categories
//!
//! | Code | Cause | Caller's fault? |
//! |------|-------|-----------------|
//! | `VALIDATION_ERROR` | Missing or malformed input | yes |
//! | `NOT_FOUND` | Unknown case / volunteer / match / zone | yes |
//! | `INVALID_TRANSITION` | Case or workflow state-machine violation | yes |
//! | `INVALID_STATE` | Match lifecycle violation | yes |
//! | `CAPACITY_EXCEEDED` | Case volunteer cap reached | no |
//! | `UNAVAILABLE` | Volunteer not eligible for assignment | no |
//! | `DEPENDENCY_FAILURE` | Primary persistence write/read failed | no |
//!
//! Notification and audit failures never surface here; they are logged
//! where they happen.

use thiserror::Error;
use uuid::Uuid;

use crate::db::StoreError;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Input failed validation. `fields` names every offending field.
    #[error("Validation failed ({}): {message}", .fields.join(", "))]
    Validation { fields: Vec<String>, message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Transition not present in the state table.
    #[error("Invalid transition from {from} to {to} (allowed: [{}])", .allowed.join(", "))]
    InvalidTransition {
        from: String,
        to: String,
        allowed: Vec<String>,
    },

    /// Operation not legal in the record's current state.
    #[error("{entity} {id} is {actual}, expected {expected}")]
    InvalidState {
        entity: &'static str,
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Case {case_id} already holds the maximum of {cap} volunteers")]
    CapacityExceeded { case_id: Uuid, cap: usize },

    #[error("Volunteer {volunteer_id} is not available (status: {status})")]
    Unavailable { volunteer_id: String, status: String },

    #[error("Dependency failure: {0}")]
    DependencyFailure(#[from] StoreError),
}

impl DispatchError {
    pub fn validation(fields: Vec<String>, message: impl Into<String>) -> Self {
        DispatchError::Validation {
            fields,
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        DispatchError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Stable code for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::Validation { .. } => "VALIDATION_ERROR",
            DispatchError::NotFound { .. } => "NOT_FOUND",
            DispatchError::InvalidTransition { .. } => "INVALID_TRANSITION",
            DispatchError::InvalidState { .. } => "INVALID_STATE",
            DispatchError::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            DispatchError::Unavailable { .. } => "UNAVAILABLE",
            DispatchError::DependencyFailure(_) => "DEPENDENCY_FAILURE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_lists_fields() {
        let err = DispatchError::validation(
            vec!["title".to_string(), "location".to_string()],
            "missing required fields",
        );
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(err.to_string().contains("title, location"));
    }

    #[test]
    fn test_invalid_transition_names_pair() {
        let err = DispatchError::InvalidTransition {
            from: "dispatched".to_string(),
            to: "assigned".to_string(),
            allowed: vec!["in_progress".to_string(), "resolved".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("dispatched to assigned"));
        assert!(msg.contains("in_progress, resolved"));
    }
}
