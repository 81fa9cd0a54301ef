use std::fmt;
use thiserror::Error;

/// Five-character SQLSTATE code attached to database errors.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SqlState(String);

impl SqlState {
    /// `40001`: the transaction could not be serialized and must be restarted.
    pub const SERIALIZATION_FAILURE: &'static str = "40001";
    pub const UNIQUE_VIOLATION: &'static str = "23505";
    pub const SYNTAX_ERROR: &'static str = "42601";
    pub const UNDEFINED_TABLE: &'static str = "42P01";
    pub const UNDEFINED_COLUMN: &'static str = "42703";
    pub const DUPLICATE_TABLE: &'static str = "42P07";
    pub const DATATYPE_MISMATCH: &'static str = "42804";
    pub const FEATURE_NOT_SUPPORTED: &'static str = "0A000";
    pub const ACTIVE_SQL_TRANSACTION: &'static str = "25001";
    pub const NO_ACTIVE_SQL_TRANSACTION: &'static str = "25P01";
    pub const IN_FAILED_SQL_TRANSACTION: &'static str = "25P02";
    pub const CONNECTION_FAILURE: &'static str = "08006";
    pub const INTERNAL_ERROR: &'static str = "XX000";

    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn code(&self) -> &str {
        &self.0
    }

    pub fn is_serialization_failure(&self) -> bool {
        self.0 == Self::SERIALIZATION_FAILURE
    }
}

impl fmt::Display for SqlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DbError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Table '{0}' already exists")]
    TableExists(String),

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Column '{0}' not found in table '{1}'")]
    ColumnNotFound(String, String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Statement not valid in the current transaction state (e.g. COMMIT with no open transaction).
    #[error("Transaction state error ({code}): {message}")]
    TransactionState { code: &'static str, message: String },

    /// The database asked for the transaction to be restarted.
    #[error("Serialization failure: {0}")]
    SerializationFailure(String),

    /// Error reported by a remote server, with its SQLSTATE preserved.
    #[error("Server error ({code}): {message}")]
    Server { code: SqlState, message: String },

    #[error("Connection error: {0}")]
    Connection(String),
}

impl DbError {
    /// SQLSTATE class this error would carry on the wire.
    pub fn sql_state(&self) -> SqlState {
        let code = match self {
            Self::ParseError(_) => SqlState::SYNTAX_ERROR,
            Self::TableExists(_) => SqlState::DUPLICATE_TABLE,
            Self::TableNotFound(_) => SqlState::UNDEFINED_TABLE,
            Self::ColumnNotFound(..) => SqlState::UNDEFINED_COLUMN,
            Self::TypeMismatch(_) => SqlState::DATATYPE_MISMATCH,
            Self::ConstraintViolation(_) => SqlState::UNIQUE_VIOLATION,
            Self::UnsupportedOperation(_) => SqlState::FEATURE_NOT_SUPPORTED,
            Self::TransactionState { code, .. } => code,
            Self::SerializationFailure(_) => SqlState::SERIALIZATION_FAILURE,
            Self::Server { code, .. } => return code.clone(),
            Self::Connection(_) => SqlState::CONNECTION_FAILURE,
            Self::ExecutionError(_) => SqlState::INTERNAL_ERROR,
        };
        SqlState::new(code)
    }

    pub fn is_serialization_failure(&self) -> bool {
        match self {
            Self::SerializationFailure(_) => true,
            Self::Server { code, .. } => code.is_serialization_failure(),
            _ => false,
        }
    }

    pub(crate) fn no_transaction(message: impl Into<String>) -> Self {
        Self::TransactionState {
            code: SqlState::NO_ACTIVE_SQL_TRANSACTION,
            message: message.into(),
        }
    }

    pub(crate) fn already_in_transaction(message: impl Into<String>) -> Self {
        Self::TransactionState {
            code: SqlState::ACTIVE_SQL_TRANSACTION,
            message: message.into(),
        }
    }

    pub(crate) fn failed_transaction() -> Self {
        Self::TransactionState {
            code: SqlState::IN_FAILED_SQL_TRANSACTION,
            message: "current transaction is aborted, commands ignored until end of transaction block"
                .into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialization_failure_classification() {
        assert!(DbError::SerializationFailure("restart transaction".into()).is_serialization_failure());
        assert!(DbError::Server {
            code: SqlState::new("40001"),
            message: "restart transaction".into(),
        }
        .is_serialization_failure());

        assert!(!DbError::Server {
            code: SqlState::new("23505"),
            message: "duplicate key".into(),
        }
        .is_serialization_failure());
        assert!(!DbError::ConstraintViolation("dup".into()).is_serialization_failure());
    }

    #[test]
    fn test_sql_state_codes() {
        assert_eq!(
            DbError::SerializationFailure("x".into()).sql_state().code(),
            "40001"
        );
        assert_eq!(DbError::TableNotFound("t".into()).sql_state().code(), "42P01");
        assert_eq!(DbError::no_transaction("x").sql_state().code(), "25P01");
        assert_eq!(
            DbError::Server {
                code: SqlState::new("53300"),
                message: "too many connections".into()
            }
            .sql_state()
            .code(),
            "53300"
        );
    }
}
