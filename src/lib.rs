// ============================================================================
// txretry Library
// ============================================================================
//
// Client-side retry of serializable SQL transactions. A
// `TransactionRetryExecutor` wraps an operation in BEGIN/COMMIT, and when the
// database answers with SQLSTATE 40001 it rolls back, backs off
// exponentially and runs the operation again in a fresh transaction.
//
// ============================================================================

pub mod accounts;
pub mod connection;
pub mod core;
pub mod memory;
pub mod result;
pub mod retry;
pub mod session;

// Re-export main types for convenience
pub use crate::core::{DataType, DbError, Result, Row, SqlState, Value};
pub use result::QueryResult;
pub use session::Session;

pub use retry::{
    AttemptOutcome, ExecutorError, FnOperation, RetryClassification, RetryPolicy,
    TransactionOperation, TransactionRetryExecutor,
};

pub use accounts::{Account, InitAccounts, Transfer, TransferError};
pub use connection::ClientConfig;
pub use memory::{MemoryDatabase, MemorySession};
