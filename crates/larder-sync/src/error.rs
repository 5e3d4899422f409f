//! Error types for the sync layer.
//!
//! Collaborators report [`RemoteError`]s. [`classify`] turns them into the
//! [`SyncError`] taxonomy that callers see.

use thiserror::Error;

use crate::collection::CollectionSpec;
use crate::entity::EntityId;

/// Postgres unique-violation code, passed through by the persistence API.
pub const UNIQUE_VIOLATION_CODE: &str = "23505";

/// PostgREST code for a single-row request that matched no rows.
pub const NO_ROWS_CODE: &str = "PGRST116";

/// Raw failures reported by the persistence and change-feed collaborators.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Error body returned by the persistence API.
    #[error("API error ({status}): {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// Target record does not exist.
    #[error("record not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    /// Credentials missing, expired or rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Transport-level failure.
    #[error("network error: {0}")]
    Network(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Response did not have the expected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

impl RemoteError {
    /// Conflict code attached to an API error, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            RemoteError::Api { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

/// Validation failures, including the duplicate-entity subtype.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The remote store or a local schema rejected the input.
    #[error("{0}")]
    Invalid(String),

    /// A uniqueness constraint was violated.
    #[error("{0}")]
    Duplicate(String),
}

impl ValidationError {
    pub fn message(&self) -> &str {
        match self {
            ValidationError::Invalid(m) | ValidationError::Duplicate(m) => m,
        }
    }
}

/// Classified errors surfaced to callers of the sync layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// No authenticated actor at mutation time.
    #[error("authentication required: {0}")]
    Authentication(String),

    /// Input rejected (see [`ValidationError`]).
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Target id absent on update or delete.
    #[error("{collection} {id} not found")]
    NotFound { collection: String, id: String },

    /// Transport-level failure.
    #[error("network error: {0}")]
    Network(String),
}

impl SyncError {
    /// Whether a read that failed with this error is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }

    /// Whether this is the duplicate-entity validation failure.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, SyncError::Validation(ValidationError::Duplicate(_)))
    }

    /// Message suitable for display next to the rolled-back view.
    pub fn user_message(&self) -> String {
        match self {
            SyncError::Authentication(_) => "Please sign in again to save changes".to_string(),
            SyncError::Validation(v) => v.message().to_string(),
            SyncError::NotFound { .. } => "This item no longer exists".to_string(),
            SyncError::Network(_) => "Could not reach the server, please try again".to_string(),
        }
    }
}

/// Classify a collaborator failure for the given collection.
///
/// `target` is the entity the failed call addressed, when there was one.
pub fn classify(spec: &CollectionSpec, target: Option<&EntityId>, err: RemoteError) -> SyncError {
    let target_id = || target.map(|id| id.to_string()).unwrap_or_default();

    match err {
        RemoteError::Api { code: Some(ref code), .. } if code == UNIQUE_VIOLATION_CODE => {
            ValidationError::Duplicate(spec.duplicate_message()).into()
        }
        RemoteError::Api { code: Some(ref code), .. } if code == NO_ROWS_CODE => SyncError::NotFound {
            collection: spec.name.clone(),
            id: target_id(),
        },
        RemoteError::Api { status: 404, .. } => SyncError::NotFound {
            collection: spec.name.clone(),
            id: target_id(),
        },
        RemoteError::Api { status: 401 | 403, message, .. } => SyncError::Authentication(message),
        RemoteError::Api { status, message, .. } if (400..500).contains(&status) => {
            ValidationError::Invalid(message).into()
        }
        RemoteError::Api { status, message, .. } => {
            SyncError::Network(format!("server error ({}): {}", status, message))
        }
        RemoteError::NotFound { collection, id } => SyncError::NotFound { collection, id },
        RemoteError::Unauthorized(message) => SyncError::Authentication(message),
        RemoteError::Network(message) | RemoteError::InvalidResponse(message) | RemoteError::WebSocket(message) => {
            SyncError::Network(message)
        }
        RemoteError::Http(e) => SyncError::Network(e.to_string()),
        RemoteError::Json(e) => SyncError::Network(format!("malformed response: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::CollectionRegistry;

    fn categories() -> std::sync::Arc<CollectionSpec> {
        CollectionRegistry::default().spec("categories")
    }

    #[test]
    fn test_unique_violation_maps_to_duplicate() {
        let err = RemoteError::Api {
            status: 409,
            code: Some(UNIQUE_VIOLATION_CODE.to_string()),
            message: "duplicate key value violates unique constraint".to_string(),
        };

        let classified = classify(&categories(), None, err);
        assert_eq!(
            classified,
            SyncError::Validation(ValidationError::Duplicate(
                "A category with this name already exists".to_string()
            ))
        );
        assert!(classified.is_duplicate());
        assert_eq!(classified.to_string(), "A category with this name already exists");
    }

    #[test]
    fn test_other_conflicts_are_plain_validation() {
        let err = RemoteError::Api {
            status: 400,
            code: Some("23502".to_string()),
            message: "null value in column \"name\"".to_string(),
        };

        let classified = classify(&categories(), None, err);
        assert!(matches!(classified, SyncError::Validation(ValidationError::Invalid(_))));
        assert!(!classified.is_duplicate());
    }

    #[test]
    fn test_not_found_carries_target() {
        let id = EntityId::new("42");
        let err = RemoteError::Api {
            status: 406,
            code: Some(NO_ROWS_CODE.to_string()),
            message: "JSON object requested, multiple (or no) rows returned".to_string(),
        };

        let classified = classify(&categories(), Some(&id), err);
        assert_eq!(
            classified,
            SyncError::NotFound {
                collection: "categories".to_string(),
                id: "42".to_string()
            }
        );
    }

    #[test]
    fn test_server_errors_are_network_and_retryable() {
        let err = RemoteError::Api {
            status: 503,
            code: None,
            message: "unavailable".to_string(),
        };

        let classified = classify(&categories(), None, err);
        assert!(matches!(classified, SyncError::Network(_)));
        assert!(classified.is_retryable());
    }

    #[test]
    fn test_unauthorized_maps_to_authentication() {
        let classified = classify(&categories(), None, RemoteError::Unauthorized("expired".into()));
        assert!(matches!(classified, SyncError::Authentication(_)));
        assert!(!classified.is_retryable());
    }
}
