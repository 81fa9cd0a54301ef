use crate::core::DbError;
use crate::session::Session;
use async_trait::async_trait;
use futures::future::BoxFuture;

/// Decides whether an error means "restart this transaction".
///
/// Only serialization conflicts are retried; everything else is returned to
/// the caller as-is.
pub trait RetryClassification {
    fn is_serialization_failure(&self) -> bool;
}

impl RetryClassification for DbError {
    fn is_serialization_failure(&self) -> bool {
        DbError::is_serialization_failure(self)
    }
}

/// One transaction attempt's worth of statements.
///
/// `attempt` may be invoked several times for a single
/// [`run`](crate::TransactionRetryExecutor::run_operation) call, each time inside a
/// fresh transaction, so it must not carry side effects outside the session.
#[async_trait]
pub trait TransactionOperation<S: Session + ?Sized>: Send + Sync {
    type Output: Send;
    type Error: std::error::Error + RetryClassification + Send + Sync + 'static;

    async fn attempt(&self, session: &mut S) -> Result<Self::Output, Self::Error>;
}

/// Adapts a closure returning a boxed future into a [`TransactionOperation`].
pub struct FnOperation<F>(pub F);

#[async_trait]
impl<S, F, T, E> TransactionOperation<S> for FnOperation<F>
where
    S: Session + ?Sized,
    F: for<'a> Fn(&'a mut S) -> BoxFuture<'a, Result<T, E>> + Send + Sync,
    T: Send + 'static,
    E: std::error::Error + RetryClassification + Send + Sync + 'static,
{
    type Output = T;
    type Error = E;

    async fn attempt(&self, session: &mut S) -> Result<T, E> {
        (self.0)(session).await
    }
}
