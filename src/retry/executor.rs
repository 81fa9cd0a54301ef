// ============================================================================
// Transaction Retry Executor
// ============================================================================
//
// Runs an operation inside BEGIN/COMMIT and restarts it when the database
// reports a serialization conflict.
//
// State transitions per run:
// ```text
// Idle ──BEGIN──> InTransaction ──COMMIT ok──> Committed
//                    │
//                    ├──conflict──> RollingBack ──backoff──> InTransaction
//                    ├──other error──> ROLLBACK ──> Failed
//                    └──attempt bound reached──> Exhausted
// ```
//
// ============================================================================

use super::operation::{FnOperation, RetryClassification, TransactionOperation};
use super::policy::RetryPolicy;
use crate::core::DbError;
use crate::session::Session;
use futures::future::BoxFuture;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

/// Error returned by [`TransactionRetryExecutor::run`].
///
/// `E` is the operation's own error type; it is returned unmodified inside
/// [`ExecutorError::OperationFailed`].
#[derive(Error, Debug)]
pub enum ExecutorError<E = DbError> {
    /// The attempt bound was reached while the database kept reporting conflicts.
    #[error("transaction retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// The operation failed with an error that is not a serialization conflict.
    #[error("transaction operation failed on attempt {attempt}: {source}")]
    OperationFailed {
        attempt: u32,
        #[source]
        source: E,
    },

    #[error("BEGIN failed on attempt {attempt}: {source}")]
    Begin {
        attempt: u32,
        #[source]
        source: DbError,
    },

    #[error("COMMIT failed on attempt {attempt}: {source}")]
    Commit {
        attempt: u32,
        #[source]
        source: DbError,
    },

    /// ROLLBACK after a conflict failed; the session state is unknown.
    #[error("ROLLBACK failed on attempt {attempt}: {source}")]
    Rollback {
        attempt: u32,
        #[source]
        source: DbError,
    },

    #[error("transaction cancelled before attempt {attempt} could complete")]
    Cancelled { attempt: u32 },
}

impl<E> ExecutorError<E> {
    /// Attempt number on which the run stopped.
    pub fn attempt(&self) -> u32 {
        match self {
            Self::RetriesExhausted { attempts, .. } => *attempts,
            Self::OperationFailed { attempt, .. }
            | Self::Begin { attempt, .. }
            | Self::Commit { attempt, .. }
            | Self::Rollback { attempt, .. }
            | Self::Cancelled { attempt } => *attempt,
        }
    }

    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// The operation's own error, if that is what ended the run.
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            Self::OperationFailed { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::OperationFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Result of a single BEGIN..COMMIT/ROLLBACK cycle.
#[derive(Debug)]
pub enum AttemptOutcome<T, E> {
    Committed(T),
    /// Serialization conflict, carrying the database's message.
    RetryableConflict(String),
    FatalError(ExecutorError<E>),
}

/// Retries serializable transactions on conflict with exponential backoff.
///
/// The executor is stateless between calls; one instance can serve any number
/// of concurrent `run` calls on distinct sessions.
///
/// # Examples
///
/// ```ignore
/// let executor = TransactionRetryExecutor::new(RetryPolicy::default());
/// let balances = executor
///     .run(&mut session, |s| {
///         async move {
///             s.execute("UPDATE accounts SET balance = balance - $1 WHERE id = $2", &[100.into(), 1.into()]).await?;
///             s.execute("SELECT id, balance FROM accounts", &[]).await
///         }
///         .boxed()
///     })
///     .await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct TransactionRetryExecutor {
    policy: RetryPolicy,
    cancel: Option<CancellationToken>,
}

impl TransactionRetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            cancel: None,
        }
    }

    /// Stop retrying once `token` is cancelled.
    ///
    /// The token is checked before every attempt and interrupts backoff sleeps.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` in a retried transaction on `session`.
    pub async fn run<S, F, T, E>(&self, session: &mut S, operation: F) -> Result<T, ExecutorError<E>>
    where
        S: Session + ?Sized,
        F: for<'a> Fn(&'a mut S) -> BoxFuture<'a, Result<T, E>> + Send + Sync,
        T: Send + 'static,
        E: std::error::Error + RetryClassification + Send + Sync + 'static,
    {
        self.run_operation(session, &FnOperation(operation)).await
    }

    /// Run a [`TransactionOperation`] in a retried transaction on `session`.
    pub async fn run_operation<S, Op>(
        &self,
        session: &mut S,
        operation: &Op,
    ) -> Result<Op::Output, ExecutorError<Op::Error>>
    where
        S: Session + ?Sized,
        Op: TransactionOperation<S>,
    {
        let span = info_span!("txn_retry", max_attempts = self.policy.max_attempts);
        self.retry_loop(session, operation).instrument(span).await
    }

    async fn retry_loop<S, Op>(
        &self,
        session: &mut S,
        operation: &Op,
    ) -> Result<Op::Output, ExecutorError<Op::Error>>
    where
        S: Session + ?Sized,
        Op: TransactionOperation<S>,
    {
        let max_attempts = self.policy.max_attempts;
        let mut attempt: u32 = 0;
        let mut last_conflict: Option<String> = None;

        loop {
            attempt += 1;
            if attempt >= max_attempts {
                warn!(attempts = attempt, "transaction retry limit reached, giving up");
                return Err(ExecutorError::RetriesExhausted {
                    attempts: attempt,
                    last_error: last_conflict
                        .unwrap_or_else(|| "attempt bound reached before the first attempt".into()),
                });
            }

            if self.is_cancelled() {
                debug!(attempt, "transaction cancelled before BEGIN");
                return Err(ExecutorError::Cancelled { attempt });
            }

            session
                .begin()
                .await
                .map_err(|source| ExecutorError::Begin { attempt, source })?;

            let conflict = match self.attempt_once(session, operation, attempt).await {
                AttemptOutcome::Committed(output) => {
                    debug!(attempt, "transaction committed");
                    return Ok(output);
                }
                AttemptOutcome::RetryableConflict(message) => message,
                AttemptOutcome::FatalError(err) => {
                    self.rollback_after_failure(session, attempt).await;
                    return Err(err);
                }
            };

            info!(attempt, error = %conflict, "transaction failed with a serialization conflict, retrying");
            session
                .rollback()
                .await
                .map_err(|source| ExecutorError::Rollback { attempt, source })?;
            debug!(attempt, "rolled back transaction");
            last_conflict = Some(conflict);

            // The next turn of the loop gives up without running anything.
            if attempt + 1 >= max_attempts {
                continue;
            }

            let delay = self.policy.backoff(attempt);
            info!(attempt, backoff_ms = delay.as_millis() as u64, "backing off before retry");
            if !self.sleep(delay).await {
                debug!(attempt, "transaction cancelled during backoff");
                return Err(ExecutorError::Cancelled { attempt });
            }
        }
    }

    async fn attempt_once<S, Op>(
        &self,
        session: &mut S,
        operation: &Op,
        attempt: u32,
    ) -> AttemptOutcome<Op::Output, Op::Error>
    where
        S: Session + ?Sized,
        Op: TransactionOperation<S>,
    {
        match operation.attempt(session).await {
            Ok(output) => match session.commit().await {
                Ok(()) => AttemptOutcome::Committed(output),
                Err(err) if err.is_serialization_failure() => {
                    AttemptOutcome::RetryableConflict(err.to_string())
                }
                Err(source) => AttemptOutcome::FatalError(ExecutorError::Commit { attempt, source }),
            },
            Err(err) if err.is_serialization_failure() => {
                AttemptOutcome::RetryableConflict(err.to_string())
            }
            Err(source) => {
                AttemptOutcome::FatalError(ExecutorError::OperationFailed { attempt, source })
            }
        }
    }

    /// Best-effort ROLLBACK before surfacing a fatal error; the original error wins.
    async fn rollback_after_failure<S>(&self, session: &mut S, attempt: u32)
    where
        S: Session + ?Sized,
    {
        if let Err(err) = session.rollback().await {
            warn!(attempt, error = %err, "ROLLBACK after failed attempt also failed");
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|token| token.is_cancelled())
    }

    /// Returns `false` when the sleep was interrupted by cancellation.
    async fn sleep(&self, delay: Duration) -> bool {
        match &self.cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => false,
                    _ = tokio::time::sleep(delay) => true,
                }
            }
            None => {
                tokio::time::sleep(delay).await;
                true
            }
        }
    }
}
