use super::ast::Statement;
use super::exec::{apply_writes, create_table, StatementExecutor};
use super::parser::SqlParserAdapter;
use super::storage::Catalog;
use super::transaction::Transaction;
use crate::core::{DbError, Result, Value};
use crate::result::QueryResult;
use crate::session::Session;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, warn};

struct Shared {
    catalog: RwLock<Catalog>,
    forced_failures: AtomicU32,
    next_row_id: AtomicU64,
    next_session_id: AtomicU64,
}

/// Shared in-memory database. Cloning yields another handle to the same data.
///
/// # Examples
///
/// ```
/// use txretry::{MemoryDatabase, Session};
///
/// # tokio_test::block_on(async {
/// let db = MemoryDatabase::new();
/// let mut session = db.session();
/// session.execute("CREATE TABLE t (id INT PRIMARY KEY)", &[]).await?;
/// session.execute("INSERT INTO t VALUES (1), (2)", &[]).await?;
///
/// let result = db.session().execute("SELECT id FROM t", &[]).await?;
/// assert_eq!(result.row_count(), 2);
/// # Ok::<(), txretry::DbError>(())
/// # }).unwrap();
/// ```
#[derive(Clone)]
pub struct MemoryDatabase {
    shared: Arc<Shared>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("forced_failures", &self.pending_forced_failures())
            .finish_non_exhaustive()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                catalog: RwLock::new(Catalog::new()),
                forced_failures: AtomicU32::new(0),
                next_row_id: AtomicU64::new(1),
                next_session_id: AtomicU64::new(1),
            }),
        }
    }

    /// Open a new session on this database.
    pub fn session(&self) -> MemorySession {
        MemorySession {
            id: self.shared.next_session_id.fetch_add(1, Ordering::SeqCst),
            db: self.clone(),
            parser: SqlParserAdapter::new(),
            state: SessionState::Idle,
        }
    }

    /// Make the next `count` explicit COMMITs fail with a serialization
    /// failure, whatever the transactions did.
    pub fn fail_next_commits(&self, count: u32) {
        self.shared.forced_failures.store(count, Ordering::SeqCst);
    }

    pub fn pending_forced_failures(&self) -> u32 {
        self.shared.forced_failures.load(Ordering::SeqCst)
    }

    /// Sequence number of the last commit.
    pub async fn commit_seq(&self) -> u64 {
        self.shared.catalog.read().await.commit_seq()
    }

    pub async fn table_names(&self) -> Vec<String> {
        self.shared.catalog.read().await.table_names()
    }

    fn take_forced_failure(&self) -> bool {
        self.shared
            .forced_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[derive(Debug)]
enum SessionState {
    Idle,
    InTransaction(Transaction),
}

/// One connection to a [`MemoryDatabase`].
///
/// Statements outside `BEGIN` ... `COMMIT` run in autocommit mode. Inside a
/// transaction, writes stay private until COMMIT validates every read the
/// transaction made; a failed validation aborts with SQLSTATE `40001`.
pub struct MemorySession {
    id: u64,
    db: MemoryDatabase,
    parser: SqlParserAdapter,
    state: SessionState,
}

impl std::fmt::Debug for MemorySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySession")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn database(&self) -> &MemoryDatabase {
        &self.db
    }

    pub fn in_transaction(&self) -> bool {
        matches!(self.state, SessionState::InTransaction(_))
    }

    async fn begin_transaction(&mut self) -> Result<QueryResult> {
        if self.in_transaction() {
            return Err(DbError::already_in_transaction(
                "there is already a transaction in progress",
            ));
        }
        let start_seq = self.db.shared.catalog.read().await.commit_seq();
        let txn = Transaction::begin(start_seq);
        debug!(session = self.id, txn = %txn.id(), start_seq, "transaction started");
        self.state = SessionState::InTransaction(txn);
        Ok(QueryResult::empty())
    }

    async fn commit_transaction(&mut self) -> Result<QueryResult> {
        let SessionState::InTransaction(mut txn) =
            std::mem::replace(&mut self.state, SessionState::Idle)
        else {
            return Err(DbError::no_transaction("there is no transaction in progress"));
        };

        if txn.ensure_active().is_err() {
            txn.abort();
            return Err(DbError::TransactionState {
                code: crate::core::SqlState::IN_FAILED_SQL_TRANSACTION,
                message: "transaction was aborted by an earlier error and has been rolled back"
                    .into(),
            });
        }

        let mut catalog = self.db.shared.catalog.write().await;
        if self.db.take_forced_failure() {
            txn.abort();
            warn!(session = self.id, txn = %txn.id(), "injected serialization failure at commit");
            return Err(DbError::SerializationFailure(
                "restart transaction: injected conflict".into(),
            ));
        }
        if let Err(err) = txn.validate(&catalog) {
            txn.abort();
            debug!(session = self.id, txn = %txn.id(), error = %err, "commit validation failed");
            return Err(err);
        }

        let writes = txn.write_count();
        let seq = apply_writes(&mut catalog, txn.take_writes())?;
        txn.mark_committed();
        debug!(
            session = self.id,
            txn = %txn.id(),
            seq,
            writes,
            elapsed_ms = txn.duration().as_millis() as u64,
            "transaction committed"
        );
        Ok(QueryResult::empty())
    }

    fn rollback_transaction(&mut self) -> Result<QueryResult> {
        match std::mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::InTransaction(mut txn) => {
                txn.abort();
                debug!(session = self.id, txn = %txn.id(), "transaction rolled back");
            }
            SessionState::Idle => {
                debug!(session = self.id, "ROLLBACK outside a transaction ignored");
            }
        }
        Ok(QueryResult::empty())
    }

    async fn execute_statement(&mut self, stmt: &Statement, params: &[Value]) -> Result<QueryResult> {
        match stmt {
            Statement::Begin => self.begin_transaction().await,
            Statement::Commit => self.commit_transaction().await,
            Statement::Rollback => self.rollback_transaction(),
            Statement::CreateTable(create) => {
                if let SessionState::InTransaction(txn) = &self.state {
                    txn.ensure_active()?;
                }
                let mut catalog = self.db.shared.catalog.write().await;
                let created = create_table(&mut catalog, create)?;
                if let (Some(seq), SessionState::InTransaction(txn)) = (created, &mut self.state) {
                    txn.record_created_table(&create.table_name, seq);
                }
                Ok(QueryResult::empty())
            }
            _ => match &mut self.state {
                SessionState::InTransaction(txn) => {
                    txn.ensure_active()?;
                    let catalog = self.db.shared.catalog.read().await;
                    StatementExecutor::new(&catalog, txn, params, &self.db.shared.next_row_id)
                        .execute(stmt)
                }
                SessionState::Idle => {
                    let mut catalog = self.db.shared.catalog.write().await;
                    let mut txn = Transaction::begin(catalog.commit_seq());
                    let result =
                        StatementExecutor::new(&catalog, &mut txn, params, &self.db.shared.next_row_id)
                            .execute(stmt)?;
                    apply_writes(&mut catalog, txn.take_writes())?;
                    Ok(result)
                }
            },
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let result = match self.parser.parse(sql) {
            Ok(stmt) => self.execute_statement(&stmt, params).await,
            Err(err) => Err(err),
        };

        if let Err(err) = &result {
            if let SessionState::InTransaction(txn) = &mut self.state {
                txn.mark_failed();
            }
            debug!(session = self.id, error = %err, sql, "statement failed");
        }
        result
    }
}
