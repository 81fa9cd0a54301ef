// ============================================================================
// Optimistic transaction state
// ============================================================================
//
// A transaction reads the committed catalog as of `start_seq` and buffers its
// writes. Reads are tracked so COMMIT can prove nothing it depended on was
// changed by a transaction that committed in the meantime:
//
// ```text
// Active ──commit (validation ok)──> Committed
//   │
//   ├──commit (validation failed)──> Aborted   (SQLSTATE 40001)
//   ├──statement error──> Failed ──rollback──> Aborted
//   └──rollback──> Aborted
// ```
//
// ============================================================================

use super::storage::{Catalog, RowKey};
use crate::core::{DbError, Result, Row};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl TransactionId {
    pub fn next() -> Self {
        TransactionId(NEXT_TXN_ID.fetch_add(1, Ordering::SeqCst))
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    /// A statement failed; only ROLLBACK is accepted.
    Failed,
    Committed,
    Aborted,
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Failed => write!(f, "FAILED"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Buffered write: `Some(row)` for insert/update, `None` for delete.
pub type PendingWrites = BTreeMap<String, BTreeMap<RowKey, Option<Row>>>;

#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    state: TransactionState,
    /// Catalog commit sequence this transaction reads at.
    start_seq: u64,
    read_rows: HashSet<(String, RowKey)>,
    scanned_tables: HashSet<String>,
    /// Tables created by this transaction, with the sequence of the creation.
    created_tables: HashMap<String, u64>,
    writes: PendingWrites,
    start_time: std::time::Instant,
}

impl Transaction {
    pub fn begin(start_seq: u64) -> Self {
        Self {
            id: TransactionId::next(),
            state: TransactionState::Active,
            start_seq,
            read_rows: HashSet::new(),
            scanned_tables: HashSet::new(),
            created_tables: HashMap::new(),
            writes: BTreeMap::new(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    pub fn write_count(&self) -> usize {
        self.writes.values().map(|rows| rows.len()).sum()
    }

    pub fn mark_failed(&mut self) {
        if self.state == TransactionState::Active {
            self.state = TransactionState::Failed;
        }
    }

    pub fn ensure_active(&self) -> Result<()> {
        match self.state {
            TransactionState::Active => Ok(()),
            TransactionState::Failed => Err(DbError::failed_transaction()),
            other => Err(DbError::ExecutionError(format!(
                "transaction {} is already {}",
                self.id, other
            ))),
        }
    }

    /// Newest version of `table` this transaction may observe. Its own CREATE
    /// TABLE counts as seen.
    fn visible_seq(&self, table: &str) -> u64 {
        self.created_tables
            .get(table)
            .map_or(self.start_seq, |&seq| seq.max(self.start_seq))
    }

    /// Remember a table this transaction created at commit sequence `seq`.
    pub fn record_created_table(&mut self, table: &str, seq: u64) {
        self.created_tables.insert(table.to_string(), seq);
    }

    /// Record a point read and reject it if the row changed after our snapshot.
    pub fn record_row_read(&mut self, catalog: &Catalog, table: &str, key: &RowKey) -> Result<()> {
        let version = catalog.get_table(table)?.row_version(key);
        if version > self.visible_seq(table) {
            return Err(self.conflict(format!("row {} of '{}' was written concurrently", key, table)));
        }
        self.read_rows.insert((table.to_string(), key.clone()));
        Ok(())
    }

    /// Record a full scan and reject it if the table changed after our snapshot.
    pub fn record_table_scan(&mut self, catalog: &Catalog, table: &str) -> Result<()> {
        let version = catalog.get_table(table)?.version;
        if version > self.visible_seq(table) {
            return Err(self.conflict(format!("table '{}' was written concurrently", table)));
        }
        self.scanned_tables.insert(table.to_string());
        Ok(())
    }

    pub fn pending(&self, table: &str, key: &RowKey) -> Option<&Option<Row>> {
        self.writes.get(table).and_then(|rows| rows.get(key))
    }

    pub fn pending_for_table(&self, table: &str) -> Option<&BTreeMap<RowKey, Option<Row>>> {
        self.writes.get(table)
    }

    pub fn buffer_write(&mut self, table: &str, key: RowKey, row: Option<Row>) {
        self.writes.entry(table.to_string()).or_default().insert(key, row);
    }

    /// Check every recorded read against the current catalog. A table that is
    /// gone counts as a conflict.
    pub fn validate(&self, catalog: &Catalog) -> Result<()> {
        for table in &self.scanned_tables {
            let version = catalog.get_table(table).map(|t| t.version).unwrap_or(u64::MAX);
            if version > self.visible_seq(table) {
                return Err(self.conflict(format!("table '{}' changed since the transaction began", table)));
            }
        }
        for (table, key) in &self.read_rows {
            let version = catalog
                .get_table(table)
                .map(|t| t.row_version(key))
                .unwrap_or(u64::MAX);
            if version > self.visible_seq(table) {
                return Err(self.conflict(format!(
                    "row {} of '{}' changed since the transaction began",
                    key, table
                )));
            }
        }
        Ok(())
    }

    /// Finish the transaction, handing its buffered writes to the caller.
    pub fn take_writes(&mut self) -> PendingWrites {
        std::mem::take(&mut self.writes)
    }

    pub fn mark_committed(&mut self) {
        self.state = TransactionState::Committed;
    }

    pub fn abort(&mut self) {
        self.writes.clear();
        self.read_rows.clear();
        self.scanned_tables.clear();
        self.created_tables.clear();
        self.state = TransactionState::Aborted;
    }

    fn conflict(&self, detail: String) -> DbError {
        DbError::SerializationFailure(format!(
            "restart transaction: {} ({})",
            detail, self.id
        ))
    }
}
