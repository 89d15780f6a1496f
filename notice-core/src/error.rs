/// Unique-constraint and delete-guard violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Conflict {
    /// The row already exists (e.g. a raw source with the same message hash).
    #[error("duplicate: {0}")]
    Duplicate(String),
    /// The row is still referenced and cannot be removed.
    #[error("in use: {0}")]
    InUse(String),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(Conflict),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("external call failed: {0}")]
    ExternalCall(String),
}

impl Error {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Error::NotFound { entity, id }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Error::Conflict(Conflict::Duplicate(_)))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// True when SQLite rejected a write because of a UNIQUE / constraint rule.
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
