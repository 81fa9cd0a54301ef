// ============================================================================
// Transaction Retry
// ============================================================================
//
// Client-side retry of serializable transactions: a policy describing the
// attempt bound and the exponential backoff, and an executor that drives
// BEGIN / operation / COMMIT cycles against a Session.
//
// ============================================================================

pub mod executor;
pub mod operation;
pub mod policy;

pub use executor::{AttemptOutcome, ExecutorError, TransactionRetryExecutor};
pub use operation::{FnOperation, RetryClassification, TransactionOperation};
pub use policy::RetryPolicy;
