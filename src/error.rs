use std::fmt;

use thiserror::Error;
use uuid::Uuid;

/// One offending column found while validating a schema definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    pub column: String,
    pub reason: String,
}

impl SchemaViolation {
    pub fn new(column: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "column '{}': {}", self.column, self.reason)
    }
}

fn joined<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn quoted(names: &[String]) -> String {
    names
        .iter()
        .map(|name| format!("'{name}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Schema validation failed: {}", joined(.violations))]
    SchemaValidation { violations: Vec<SchemaViolation> },
    #[error("Table binding '{0}' is already bound to an experiment type")]
    DuplicateTableBinding(String),
    #[error("A {entity} named '{name}' already exists")]
    DuplicateName { entity: &'static str, name: String },
    #[error("Unsupported column type '{0}' (expected one of INTEGER, FLOAT, STRING, TEXT, BOOLEAN, DATETIME, JSON)")]
    UnsupportedType(String),
    #[error("Unknown columns: {}", quoted(.columns))]
    UnknownColumn { columns: Vec<String> },
    #[error("Column '{column}' expects {expected}, got {found}")]
    TypeMismatch {
        column: String,
        expected: String,
        found: String,
    },
    #[error("Columns cannot be modified: {}", quoted(.columns))]
    ImmutableColumn { columns: Vec<String> },
    #[error("Row {0} not found")]
    RowNotFound(i64),
    #[error("Experiment {0} not found")]
    ExperimentNotFound(Uuid),
    #[error("Experiment type {0} not found")]
    ExperimentTypeNotFound(String),
    #[error("Tag {0} not found")]
    TagNotFound(String),
    #[error("Row {row_id} does not belong to participant '{participant_id}'")]
    ParticipantMismatch { row_id: i64, participant_id: String },
    #[error("{entity} is still in use: {detail}")]
    InUse { entity: String, detail: String },
    #[error("Invalid {field}: {reason}")]
    InvalidArgument { field: &'static str, reason: String },
    #[error("Config error: {0}")]
    Config(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

impl StoreError {
    /// Machine-readable error kind, stable across message wording changes.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::SchemaValidation { .. } => "SchemaValidationError",
            StoreError::DuplicateTableBinding(_) => "DuplicateTableBinding",
            StoreError::DuplicateName { .. } => "DuplicateName",
            StoreError::UnsupportedType(_) => "UnsupportedType",
            StoreError::UnknownColumn { .. } => "UnknownColumn",
            StoreError::TypeMismatch { .. } => "TypeMismatch",
            StoreError::ImmutableColumn { .. } => "ImmutableColumn",
            StoreError::RowNotFound(_) => "RowNotFound",
            StoreError::ExperimentNotFound(_) => "ExperimentNotFound",
            StoreError::ExperimentTypeNotFound(_) => "ExperimentTypeNotFound",
            StoreError::TagNotFound(_) => "TagNotFound",
            StoreError::ParticipantMismatch { .. } => "ParticipantMismatch",
            StoreError::InUse { .. } => "InUse",
            StoreError::InvalidArgument { .. } => "InvalidArgument",
            StoreError::Config(_) => "ConfigError",
            StoreError::Persistence(_) => "PersistenceError",
            StoreError::Lock(_) => "LockPoisoned",
        }
    }

    /// Errors a transport layer would surface as a conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::DuplicateTableBinding(_)
                | StoreError::DuplicateName { .. }
                | StoreError::InUse { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::RowNotFound(_)
                | StoreError::ExperimentNotFound(_)
                | StoreError::ExperimentTypeNotFound(_)
                | StoreError::TagNotFound(_)
        )
    }

    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        StoreError::InvalidArgument {
            field,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

// Helper conversions
impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Persistence(format!("malformed stored JSON: {e}"))
    }
}

impl From<config::ConfigError> for StoreError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

/// Which uniqueness or reference rule a failed statement ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Constraint {
    Unique,
    ForeignKey,
}

/// Classifies a constraint failure, returning the violated rule and the message
/// SQLite attached to it (e.g. `UNIQUE constraint failed: tags.name`).
pub(crate) fn constraint_violation(error: &rusqlite::Error) -> Option<(Constraint, String)> {
    match error {
        rusqlite::Error::SqliteFailure(failure, message)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            let message = message.clone().unwrap_or_default();
            let kind = match failure.extended_code {
                rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => Constraint::ForeignKey,
                rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY => Constraint::Unique,
                _ if message.contains("FOREIGN KEY") => Constraint::ForeignKey,
                _ => Constraint::Unique,
            };
            Some((kind, message))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_validation_lists_every_violation() {
        let err = StoreError::SchemaValidation {
            violations: vec![
                SchemaViolation::new("id", "reserved column name"),
                SchemaViolation::new("blob", "unsupported column type 'BLOB'"),
            ],
        };
        let message = err.to_string();
        assert!(message.contains("'id'"));
        assert!(message.contains("'blob'"));
        assert_eq!(err.kind(), "SchemaValidationError");
    }

    #[test]
    fn conflicts_and_absences_are_classified() {
        assert!(StoreError::DuplicateTableBinding("t".into()).is_conflict());
        assert!(!StoreError::RowNotFound(1).is_conflict());
        assert!(StoreError::RowNotFound(1).is_not_found());
        assert!(StoreError::ExperimentNotFound(Uuid::nil()).is_not_found());
    }

    #[test]
    fn unknown_columns_are_named() {
        let err = StoreError::UnknownColumn {
            columns: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "Unknown columns: 'a', 'b'");
    }
}
