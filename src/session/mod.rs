// ============================================================================
// Session Interface
// ============================================================================
//
// A Session is one open logical connection. Statements and transaction
// control go through the same handle, so a transaction started by `begin`
// covers every `execute` until `commit` or `rollback`.
//
// ============================================================================

use crate::core::{Result, Value};
use crate::result::QueryResult;
use async_trait::async_trait;

/// An open database session the retry executor can drive.
///
/// Implementations must report a serialization conflict as a [`DbError`]
/// whose [`is_serialization_failure`] returns `true` (SQLSTATE `40001`).
///
/// [`DbError`]: crate::DbError
/// [`is_serialization_failure`]: crate::DbError::is_serialization_failure
#[async_trait]
pub trait Session: Send {
    /// Execute one statement with positional `$n` parameters.
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    async fn begin(&mut self) -> Result<()> {
        self.execute("BEGIN", &[]).await.map(|_| ())
    }

    async fn commit(&mut self) -> Result<()> {
        self.execute("COMMIT", &[]).await.map(|_| ())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.execute("ROLLBACK", &[]).await.map(|_| ())
    }
}

#[async_trait]
impl<S: Session + ?Sized> Session for Box<S> {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        (**self).execute(sql, params).await
    }

    async fn begin(&mut self) -> Result<()> {
        (**self).begin().await
    }

    async fn commit(&mut self) -> Result<()> {
        (**self).commit().await
    }

    async fn rollback(&mut self) -> Result<()> {
        (**self).rollback().await
    }
}
