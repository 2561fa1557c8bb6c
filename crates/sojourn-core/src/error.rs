use thiserror::Error;

/// A convenience `Result` alias using [`SojournError`].
pub type SojournResult<T> = Result<T, SojournError>;

/// Top-level error type for the Sojourn session service.
///
/// Callers either get a fully populated result or one of these variants;
/// nothing is ever partially applied.
#[derive(Error, Debug)]
pub enum SojournError {
    /// A row required by a read is absent (e.g. `get` on a missing session).
    #[error("Not found: {0}")]
    NotFound(String),

    /// `create` was given a session id that is already taken.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A required identity component is missing or malformed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// `append_event` received a session handle not produced by this store.
    #[error("Session type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Type name the store produces.
        expected: &'static str,
        /// Type name that was passed in.
        actual: &'static str,
    },

    /// Lock timeout, busy database or lost connection. Safe to retry.
    #[error("Transient persistence error: {0}")]
    Transient(String),

    /// Any other storage failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A failure inside the append transaction, reported after full rollback.
    #[error("Failed to append event {event_id}: {source}")]
    Append {
        /// Id of the event that was not appended.
        event_id: String,
        /// The underlying failure.
        #[source]
        source: Box<SojournError>,
    },

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SojournError {
    /// Whether the caller may retry the operation unchanged.
    pub fn is_transient(&self) -> bool {
        match self {
            SojournError::Transient(_) => true,
            SojournError::Append { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Whether this is (or wraps) a [`SojournError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        match self {
            SojournError::NotFound(_) => true,
            SojournError::Append { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Wrap a failure from inside the append transaction.
    pub fn append(event_id: impl Into<String>, source: SojournError) -> Self {
        SojournError::Append {
            event_id: event_id.into(),
            source: Box::new(source),
        }
    }
}
