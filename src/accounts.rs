// ============================================================================
// Bank-account transfer workload
// ============================================================================
//
// The demo workload driven through the retry executor: a two-row `accounts`
// table and a funds transfer that reads the source balance, checks it, then
// debits and credits inside one transaction.
//
// ============================================================================

use crate::core::{DbError, Value};
use crate::result::QueryResult;
use crate::retry::{RetryClassification, TransactionOperation};
use crate::session::Session;
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

const CREATE_ACCOUNTS: &str =
    "CREATE TABLE IF NOT EXISTS accounts (id INT PRIMARY KEY, balance INT)";
const SEED_ACCOUNTS: &str =
    "INSERT INTO accounts (id, balance) VALUES (1, 1000), (2, 250) ON CONFLICT (id) DO NOTHING";
const SELECT_BALANCES: &str = "SELECT id, balance FROM accounts ORDER BY id";
const SELECT_BALANCE: &str = "SELECT balance FROM accounts WHERE id = $1";
const DEBIT: &str = "UPDATE accounts SET balance = balance - $1 WHERE id = $2";
const CREDIT: &str = "UPDATE accounts SET balance = balance + $1 WHERE id = $2";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Account {
    pub id: i64,
    pub balance: i64,
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ id: {}, balance: {} }}", self.id, self.balance)
    }
}

/// Move `amount` from account `from` to account `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub from: i64,
    pub to: i64,
    pub amount: i64,
}

impl Transfer {
    pub fn new(from: i64, to: i64, amount: i64) -> Self {
        Self { from, to, amount }
    }
}

impl Default for Transfer {
    fn default() -> Self {
        Self::new(1, 2, 100)
    }
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("account {0} not found")]
    AccountNotFound(i64),

    #[error("insufficient funds in account {account}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        account: i64,
        balance: i64,
        requested: i64,
    },

    #[error("transfer amount must be positive, got {0}")]
    InvalidAmount(i64),

    #[error(transparent)]
    Db(#[from] DbError),
}

impl RetryClassification for TransferError {
    fn is_serialization_failure(&self) -> bool {
        matches!(self, TransferError::Db(err) if err.is_serialization_failure())
    }
}

/// Create the `accounts` table if needed and seed accounts 1 and 2.
///
/// Seeding skips rows that already exist, so running it twice is harmless.
pub async fn init_accounts<S>(session: &mut S) -> Result<Vec<Account>, DbError>
where
    S: Session + ?Sized,
{
    session.execute(CREATE_ACCOUNTS, &[]).await?;
    session.execute(SEED_ACCOUNTS, &[]).await?;
    balances(session).await
}

/// All accounts ordered by id.
pub async fn balances<S>(session: &mut S) -> Result<Vec<Account>, DbError>
where
    S: Session + ?Sized,
{
    let result = session.execute(SELECT_BALANCES, &[]).await?;
    accounts_from(&result)
}

/// Run the statements of one transfer. Meant to be called inside a
/// transaction; nothing is written when a precondition fails.
pub async fn transfer_funds<S>(session: &mut S, transfer: Transfer) -> Result<Vec<Account>, TransferError>
where
    S: Session + ?Sized,
{
    let Transfer { from, to, amount } = transfer;
    if amount <= 0 {
        return Err(TransferError::InvalidAmount(amount));
    }

    let result = session
        .execute(SELECT_BALANCE, &[Value::Integer(from)])
        .await?;
    if result.is_empty() {
        return Err(TransferError::AccountNotFound(from));
    }
    let balance = result.get_i64(0, "balance")?.ok_or_else(|| {
        DbError::ExecutionError(format!("account {} has a NULL balance", from))
    })?;
    if balance < amount {
        return Err(TransferError::InsufficientFunds {
            account: from,
            balance,
            requested: amount,
        });
    }

    session
        .execute(DEBIT, &[Value::Integer(amount), Value::Integer(from)])
        .await?;
    let credited = session
        .execute(CREDIT, &[Value::Integer(amount), Value::Integer(to)])
        .await?;
    if credited.affected_rows == 0 {
        return Err(TransferError::AccountNotFound(to));
    }

    Ok(balances(session).await?)
}

fn accounts_from(result: &QueryResult) -> Result<Vec<Account>, DbError> {
    (0..result.row_count())
        .map(|row| {
            let id = result.get_i64(row, "id")?;
            let balance = result.get_i64(row, "balance")?;
            match (id, balance) {
                (Some(id), Some(balance)) => Ok(Account { id, balance }),
                _ => Err(DbError::ExecutionError(format!(
                    "accounts row {} has a NULL column",
                    row
                ))),
            }
        })
        .collect()
}

/// [`init_accounts`] as a retryable operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitAccounts;

#[async_trait]
impl<S: Session + ?Sized> TransactionOperation<S> for InitAccounts {
    type Output = Vec<Account>;
    type Error = DbError;

    async fn attempt(&self, session: &mut S) -> Result<Vec<Account>, DbError> {
        init_accounts(session).await
    }
}

#[async_trait]
impl<S: Session + ?Sized> TransactionOperation<S> for Transfer {
    type Output = Vec<Account>;
    type Error = TransferError;

    async fn attempt(&self, session: &mut S) -> Result<Vec<Account>, TransferError> {
        transfer_funds(session, *self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDatabase;

    #[test]
    fn test_transfer_error_classification() {
        let conflict = TransferError::from(DbError::SerializationFailure("restart".into()));
        assert!(conflict.is_serialization_failure());
        assert!(!TransferError::AccountNotFound(3).is_serialization_failure());
        assert!(!TransferError::from(DbError::TableNotFound("accounts".into()))
            .is_serialization_failure());
    }

    #[test]
    fn test_db_error_is_transparent() {
        let err = TransferError::from(DbError::TableNotFound("accounts".into()));
        assert_eq!(err.to_string(), "Table 'accounts' not found");
    }

    #[tokio::test]
    async fn test_init_accounts_is_idempotent() {
        let db = MemoryDatabase::new();
        let mut session = db.session();

        let first = init_accounts(&mut session).await.unwrap();
        let second = init_accounts(&mut session).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            first,
            vec![
                Account { id: 1, balance: 1000 },
                Account { id: 2, balance: 250 }
            ]
        );
    }

    #[tokio::test]
    async fn test_transfer_moves_funds() {
        let db = MemoryDatabase::new();
        let mut session = db.session();
        init_accounts(&mut session).await.unwrap();

        let accounts = transfer_funds(&mut session, Transfer::default()).await.unwrap();
        assert_eq!(accounts[0].balance, 900);
        assert_eq!(accounts[1].balance, 350);
    }

    #[tokio::test]
    async fn test_preconditions_fail_before_writes() {
        let db = MemoryDatabase::new();
        let mut session = db.session();
        init_accounts(&mut session).await.unwrap();

        let err = transfer_funds(&mut session, Transfer::new(2, 1, 500))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::InsufficientFunds {
                account: 2,
                balance: 250,
                requested: 500
            }
        ));

        let err = transfer_funds(&mut session, Transfer::new(9, 1, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::AccountNotFound(9)));

        let err = transfer_funds(&mut session, Transfer::new(1, 2, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidAmount(0)));

        let accounts = balances(&mut session).await.unwrap();
        assert_eq!(accounts[0].balance, 1000);
        assert_eq!(accounts[1].balance, 250);
    }

    #[test]
    fn test_account_display() {
        let account = Account { id: 1, balance: 900 };
        assert_eq!(account.to_string(), "{ id: 1, balance: 900 }");
    }
}
