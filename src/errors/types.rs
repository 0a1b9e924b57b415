//! # Error Types
//!
//! Error types for the Forge data access layer using `thiserror`.
//!
//! Point lookups report a missing row with [`ForgeError::NotFound`]. Every other
//! database failure is passed through as [`ForgeError::Database`] with the
//! original `sqlx::Error` kept as the source.

/// Custom result type for data access operations
pub type Result<T> = std::result::Result<T, ForgeError>;

/// SQLSTATE raised by PostgreSQL for foreign key violations
const PG_FOREIGN_KEY_VIOLATION: &str = "23503";

/// SQLSTATE raised by PostgreSQL for unique constraint violations
const PG_UNIQUE_VIOLATION: &str = "23505";

/// Main error type for the data access layer
#[derive(thiserror::Error, Debug)]
pub enum ForgeError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Database and storage errors
    #[error("Database error: {context}")]
    Database {
        #[source]
        source: sqlx::Error,
        context: String,
    },

    /// I/O errors with additional context
    #[error("I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {context}")]
    Serialization {
        #[source]
        source: serde_json::Error,
        context: String,
    },

    /// Invalid parameters or values supplied by the caller
    #[error("Validation error: {message}")]
    Validation { message: String, field: Option<String> },

    /// Record lookup by identifier found nothing
    #[error("Resource not found: {resource_type} with ID '{id}'")]
    NotFound { resource_type: String, id: String },

    /// Batch input exceeds the allowed number of items
    #[error("batch size {size} exceeds maximum allowed {max}")]
    BatchTooLarge { size: usize, max: usize },

    /// A non-blocking transaction advisory lock is held elsewhere
    #[error("Failed to acquire transaction advisory lock {lock_id}")]
    AdvisoryLockNotAcquired { lock_id: i64 },

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ForgeError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into(), source: None }
    }

    /// Create a configuration error with source
    pub fn config_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Config { message: message.into(), source: Some(source) }
    }

    /// Create a database error with context
    pub fn database<S: Into<String>>(source: sqlx::Error, context: S) -> Self {
        Self::Database { source, context: context.into() }
    }

    /// Create an I/O error with context
    pub fn io<S: Into<String>>(source: std::io::Error, context: S) -> Self {
        Self::Io { source, context: context.into() }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation { message: message.into(), field: None }
    }

    /// Create a validation error with field information
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation { message: message.into(), field: Some(field.into()) }
    }

    /// Create a not found error
    pub fn not_found<R: Into<String>, I: ToString>(resource_type: R, id: I) -> Self {
        Self::NotFound { resource_type: resource_type.into(), id: id.to_string() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// True when a point lookup found no row
    pub fn is_not_found(&self) -> bool {
        matches!(self, ForgeError::NotFound { .. })
    }

    /// True when the database rejected a row for a missing parent
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sql_state().as_deref() == Some(PG_FOREIGN_KEY_VIOLATION)
    }

    /// True when the database rejected a duplicate key
    pub fn is_unique_violation(&self) -> bool {
        self.sql_state().as_deref() == Some(PG_UNIQUE_VIOLATION)
    }

    /// SQLSTATE code of the underlying database error, if any
    pub fn sql_state(&self) -> Option<String> {
        match self {
            ForgeError::Database { source: sqlx::Error::Database(db_err), .. } => {
                db_err.code().map(|code| code.into_owned())
            }
            _ => None,
        }
    }

    /// Add context to an error
    pub fn with_context<S: Into<String>>(mut self, context: S) -> Self {
        let context = context.into();
        match &mut self {
            ForgeError::Io { context: ctx, .. }
            | ForgeError::Database { context: ctx, .. }
            | ForgeError::Serialization { context: ctx, .. } => {
                *ctx = format!("{}: {}", context, ctx);
            }
            _ => {}
        }
        self
    }
}

// Error conversions for common external error types
impl From<sqlx::Error> for ForgeError {
    fn from(error: sqlx::Error) -> Self {
        Self::Database { source: error, context: "Database operation failed".to_string() }
    }
}

impl From<std::io::Error> for ForgeError {
    fn from(error: std::io::Error) -> Self {
        Self::Io { source: error, context: "I/O operation failed".to_string() }
    }
}

impl From<serde_json::Error> for ForgeError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization { source: error, context: "JSON serialization failed".to_string() }
    }
}

impl From<config::ConfigError> for ForgeError {
    fn from(error: config::ConfigError) -> Self {
        Self::config_with_source("Configuration loading failed", Box::new(error))
    }
}

impl From<validator::ValidationErrors> for ForgeError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut messages = Vec::new();
        collect_validation_messages("", &errors, &mut messages);
        Self::validation(format!("Validation failed: {}", messages.join("; ")))
    }
}

/// Flatten nested validator errors into `path: message` strings
fn collect_validation_messages(
    prefix: &str,
    errors: &validator::ValidationErrors,
    out: &mut Vec<String>,
) {
    use validator::ValidationErrorsKind;

    for (field, kind) in errors.errors() {
        let path =
            if prefix.is_empty() { field.to_string() } else { format!("{}.{}", prefix, field) };
        match kind {
            ValidationErrorsKind::Field(field_errors) => {
                let error_messages: Vec<String> = field_errors
                    .iter()
                    .map(|e| {
                        e.message.as_ref().map_or("Invalid value".to_string(), |m| m.to_string())
                    })
                    .collect();
                out.push(format!("{}: {}", path, error_messages.join(", ")));
            }
            ValidationErrorsKind::Struct(nested) => {
                collect_validation_messages(&path, nested, out);
            }
            ValidationErrorsKind::List(items) => {
                for (index, nested) in items {
                    collect_validation_messages(&format!("{}[{}]", path, index), nested, out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = ForgeError::config("Test configuration error");
        assert!(matches!(error, ForgeError::Config { .. }));
        assert_eq!(error.to_string(), "Configuration error: Test configuration error");
    }

    #[test]
    fn test_validation_error() {
        let error = ForgeError::validation_field("Invalid order by field", "order_by");
        assert!(matches!(error, ForgeError::Validation { .. }));
        if let ForgeError::Validation { field, .. } = error {
            assert_eq!(field, Some("order_by".to_string()));
        }
    }

    #[test]
    fn test_not_found_is_distinct() {
        let id = uuid::Uuid::new_v4();
        let error = ForgeError::not_found("Instance", id);
        assert!(error.is_not_found());
        assert_eq!(error.to_string(), format!("Resource not found: Instance with ID '{}'", id));

        let db_error = ForgeError::database(sqlx::Error::RowNotFound, "lookup");
        assert!(!db_error.is_not_found());
    }

    #[test]
    fn test_batch_too_large_message() {
        let error = ForgeError::BatchTooLarge { size: 101, max: 100 };
        assert_eq!(error.to_string(), "batch size 101 exceeds maximum allowed 100");
    }

    #[test]
    fn test_sql_state_absent_for_non_database_errors() {
        assert_eq!(ForgeError::validation("bad").sql_state(), None);
        assert!(!ForgeError::internal("boom").is_foreign_key_violation());
        assert!(!ForgeError::database(sqlx::Error::PoolTimedOut, "acquire").is_unique_violation());
    }

    #[test]
    fn test_with_context_prefixes_database_context() {
        let error = ForgeError::database(sqlx::Error::PoolTimedOut, "acquire connection")
            .with_context("Failed to fetch tenant");
        assert_eq!(error.to_string(), "Database error: Failed to fetch tenant: acquire connection");
    }

    #[test]
    fn test_error_conversions() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: ForgeError = io_error.into();
        assert!(matches!(error, ForgeError::Io { .. }));

        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let error: ForgeError = json_error.into();
        assert!(matches!(error, ForgeError::Serialization { .. }));

        let error: ForgeError = sqlx::Error::RowNotFound.into();
        assert!(matches!(error, ForgeError::Database { .. }));
    }
}
