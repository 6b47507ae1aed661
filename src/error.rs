use serde::Serialize;
use thiserror::Error;

/// Error classes the HTTP edge maps onto status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Precondition,
    Forbidden,
    Transient,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NameSuggestion {
    pub name: String,
    pub similarity: f64,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("section {0} not found")]
    SectionNotFound(i64),

    #[error("student '{normalized_name}' already registered in section {section_id}")]
    DuplicateStudent {
        section_id: i64,
        normalized_name: String,
    },

    #[error("claimed name is not in the roster of section {section_id}")]
    StudentNotInRoster {
        section_id: i64,
        suggestions: Vec<NameSuggestion>,
    },

    #[error("section {section_id} has {count} students sharing one normalized name")]
    AmbiguousRoster { section_id: i64, count: usize },

    #[error("student {student_id} already joined with a different telegram account")]
    JoinConflict { student_id: i64 },

    #[error("telegram group of section {section_id} is not ready (status {status})")]
    GroupNotReady { section_id: i64, status: String },

    #[error("lease '{name}' is held by {owner}")]
    LeaseHeld { name: String, owner: String },

    #[error("{0}")]
    Forbidden(String),

    #[error("external service unavailable: {0}")]
    Transient(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation { .. } => ErrorKind::Validation,
            CoreError::NotFound { .. }
            | CoreError::SectionNotFound(_)
            | CoreError::StudentNotInRoster { .. } => ErrorKind::NotFound,
            CoreError::DuplicateStudent { .. } | CoreError::JoinConflict { .. } => {
                ErrorKind::Conflict
            }
            CoreError::GroupNotReady { .. }
            | CoreError::AmbiguousRoster { .. }
            | CoreError::LeaseHeld { .. } => ErrorKind::Precondition,
            CoreError::Forbidden(_) => ErrorKind::Forbidden,
            CoreError::Transient(_) => ErrorKind::Transient,
            CoreError::Db(e) if is_busy(e) => ErrorKind::Transient,
            CoreError::Db(_) | CoreError::Internal(_) => ErrorKind::Fatal,
        }
    }

    /// Stable machine-readable code, also used as the `message` of join failures.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation { .. } => "ValidationError",
            CoreError::NotFound { .. } => "NotFound",
            CoreError::SectionNotFound(_) => "SectionNotFound",
            CoreError::DuplicateStudent { .. } => "DuplicateStudent",
            CoreError::StudentNotInRoster { .. } => "StudentNotInRoster",
            CoreError::AmbiguousRoster { .. } => "AmbiguousRoster",
            CoreError::JoinConflict { .. } => "JoinConflict",
            CoreError::GroupNotReady { .. } => "GroupNotReady",
            CoreError::LeaseHeld { .. } => "LeaseHeld",
            CoreError::Forbidden(_) => "Forbidden",
            CoreError::Transient(_) => "ServiceUnavailable",
            CoreError::Db(e) if is_busy(e) => "ServiceUnavailable",
            CoreError::Db(_) | CoreError::Internal(_) => "InternalError",
        }
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if matches!(f.code, rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}

pub type CoreResult<T> = Result<T, CoreError>;
