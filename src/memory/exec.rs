// ============================================================================
// Statement execution against a transaction view
// ============================================================================
//
// Reads see the committed catalog overlaid with the transaction's own
// buffered writes. Every read that reaches committed data is recorded on the
// transaction so COMMIT can validate it.
//
// ============================================================================

use super::ast::{
    ColumnDef, CreateTableStmt, DeleteStmt, Expr, InsertStmt, SelectItem, SelectStmt, Statement,
    UpdateStmt,
};
use super::eval::{point_key, EvalContext};
use super::storage::{Catalog, RowKey, StoredRow, TableSchema};
use super::transaction::{PendingWrites, Transaction};
use crate::core::{DbError, Result, Row, Value};
use crate::result::QueryResult;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

pub(crate) struct StatementExecutor<'a> {
    catalog: &'a Catalog,
    txn: &'a mut Transaction,
    params: &'a [Value],
    row_ids: &'a AtomicU64,
}

impl<'a> StatementExecutor<'a> {
    pub fn new(
        catalog: &'a Catalog,
        txn: &'a mut Transaction,
        params: &'a [Value],
        row_ids: &'a AtomicU64,
    ) -> Self {
        Self {
            catalog,
            txn,
            params,
            row_ids,
        }
    }

    pub fn execute(&mut self, stmt: &Statement) -> Result<QueryResult> {
        match stmt {
            Statement::Insert(insert) => self.insert(insert),
            Statement::Select(select) => self.select(select),
            Statement::Update(update) => self.update(update),
            Statement::Delete(delete) => self.delete(delete),
            other => Err(DbError::ExecutionError(format!(
                "{:?} is not a data statement",
                other
            ))),
        }
    }

    fn schema(&self, table: &str) -> Result<&'a TableSchema> {
        let catalog = self.catalog;
        Ok(&catalog.get_table(table)?.schema)
    }

    fn read_row(&mut self, table: &str, key: &RowKey) -> Result<Option<Row>> {
        if let Some(pending) = self.txn.pending(table, key) {
            return Ok(pending.clone());
        }
        self.txn.record_row_read(self.catalog, table, key)?;
        Ok(self.catalog.get_table(table)?.live_row(key).cloned())
    }

    fn scan_rows(&mut self, table: &str) -> Result<Vec<(RowKey, Row)>> {
        self.txn.record_table_scan(self.catalog, table)?;
        let mut rows: BTreeMap<RowKey, Row> = self
            .catalog
            .get_table(table)?
            .live_rows()
            .map(|(key, row)| (key.clone(), row.clone()))
            .collect();
        if let Some(pending) = self.txn.pending_for_table(table) {
            for (key, row) in pending {
                match row {
                    Some(row) => {
                        rows.insert(key.clone(), row.clone());
                    }
                    None => {
                        rows.remove(key);
                    }
                }
            }
        }
        Ok(rows.into_iter().collect())
    }

    /// Rows of `table` matching `selection`, in primary-key order.
    fn matching_rows(
        &mut self,
        table: &str,
        selection: Option<&Expr>,
    ) -> Result<Vec<(RowKey, Row)>> {
        let schema = self.schema(table)?;
        let candidates = match point_key(schema, selection, self.params)? {
            Some(key) => self
                .read_row(table, &key)?
                .map(|row| vec![(key, row)])
                .unwrap_or_default(),
            None => self.scan_rows(table)?,
        };

        let mut matched = Vec::with_capacity(candidates.len());
        for (key, row) in candidates {
            if EvalContext::for_row(schema, &row, self.params).matches(selection)? {
                matched.push((key, row));
            }
        }
        Ok(matched)
    }

    fn insert(&mut self, stmt: &InsertStmt) -> Result<QueryResult> {
        let schema = self.schema(&stmt.table_name)?;
        let targets: Vec<usize> = match &stmt.columns {
            Some(columns) => columns
                .iter()
                .map(|name| schema.column_index(name))
                .collect::<Result<_>>()?,
            None => (0..schema.columns.len()).collect(),
        };

        let ctx = EvalContext::constant(self.params);
        let mut inserted = 0u64;
        for exprs in &stmt.values {
            if exprs.len() != targets.len() {
                return Err(DbError::ExecutionError(format!(
                    "INSERT has {} target columns but {} expressions",
                    targets.len(),
                    exprs.len()
                )));
            }
            let mut row = vec![Value::Null; schema.columns.len()];
            for (idx, expr) in targets.iter().zip(exprs) {
                row[*idx] = ctx.evaluate(expr)?;
            }
            schema.validate_row(&mut row)?;

            let key = match schema.primary_key {
                Some(pk) => RowKey::from_value(&row[pk])?,
                None => RowKey::RowId(self.row_ids.fetch_add(1, AtomicOrdering::SeqCst)),
            };
            if schema.primary_key.is_some() && self.read_row(&stmt.table_name, &key)?.is_some() {
                if stmt.ignore_conflicts {
                    continue;
                }
                return Err(duplicate_key(schema, &key));
            }
            self.txn.buffer_write(&stmt.table_name, key, Some(row));
            inserted += 1;
        }
        Ok(QueryResult::affected(inserted))
    }

    fn select(&mut self, stmt: &SelectStmt) -> Result<QueryResult> {
        let schema = self.schema(&stmt.table_name)?;
        let mut rows: Vec<Row> = self
            .matching_rows(&stmt.table_name, stmt.selection.as_ref())?
            .into_iter()
            .map(|(_, row)| row)
            .collect();

        if !stmt.order_by.is_empty() {
            let mut keyed = Vec::with_capacity(rows.len());
            for row in rows.drain(..) {
                let ctx = EvalContext::for_row(schema, &row, self.params);
                let sort_key = stmt
                    .order_by
                    .iter()
                    .map(|item| ctx.evaluate(&item.expr))
                    .collect::<Result<Vec<_>>>()?;
                keyed.push((sort_key, row));
            }

            let mut failure = None;
            keyed.sort_by(|(a, _), (b, _)| {
                for ((left, right), item) in a.iter().zip(b).zip(&stmt.order_by) {
                    let ordering = match compare_for_sort(left, right) {
                        Ok(ordering) => ordering,
                        Err(err) => {
                            failure.get_or_insert(err);
                            Ordering::Equal
                        }
                    };
                    let ordering = if item.descending {
                        ordering.reverse()
                    } else {
                        ordering
                    };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
            if let Some(err) = failure {
                return Err(err);
            }
            rows = keyed.into_iter().map(|(_, row)| row).collect();
        }

        if let Some(limit) = stmt.limit {
            rows.truncate(limit);
        }

        let mut columns = Vec::new();
        for item in &stmt.projection {
            match item {
                SelectItem::Wildcard => columns.extend(schema.column_names()),
                SelectItem::Expr { expr, alias } => columns.push(match (alias, expr) {
                    (Some(alias), _) => alias.clone(),
                    (None, Expr::Column(name)) => {
                        schema.columns[schema.column_index(name)?].name.clone()
                    }
                    (None, _) => "?column?".to_string(),
                }),
            }
        }

        let mut projected = Vec::with_capacity(rows.len());
        for row in &rows {
            let ctx = EvalContext::for_row(schema, row, self.params);
            let mut out = Vec::with_capacity(columns.len());
            for item in &stmt.projection {
                match item {
                    SelectItem::Wildcard => out.extend(row.iter().cloned()),
                    SelectItem::Expr { expr, .. } => out.push(ctx.evaluate(expr)?),
                }
            }
            projected.push(out);
        }

        Ok(QueryResult::new(columns, projected))
    }

    fn update(&mut self, stmt: &UpdateStmt) -> Result<QueryResult> {
        let schema = self.schema(&stmt.table_name)?;
        let targets = stmt
            .assignments
            .iter()
            .map(|a| schema.column_index(&a.column))
            .collect::<Result<Vec<_>>>()?;

        let rows = self.matching_rows(&stmt.table_name, stmt.selection.as_ref())?;
        let mut updated = 0u64;
        for (key, row) in rows {
            let mut new_row = row.clone();
            {
                // SET expressions see the row as it was before the update.
                let ctx = EvalContext::for_row(schema, &row, self.params);
                for (idx, assignment) in targets.iter().zip(&stmt.assignments) {
                    new_row[*idx] = ctx.evaluate(&assignment.value)?;
                }
            }
            schema.validate_row(&mut new_row)?;

            let new_key = match schema.primary_key {
                Some(pk) => RowKey::from_value(&new_row[pk])?,
                None => key.clone(),
            };
            if new_key != key {
                if self.read_row(&stmt.table_name, &new_key)?.is_some() {
                    return Err(duplicate_key(schema, &new_key));
                }
                self.txn.buffer_write(&stmt.table_name, key, None);
            }
            self.txn.buffer_write(&stmt.table_name, new_key, Some(new_row));
            updated += 1;
        }
        Ok(QueryResult::affected(updated))
    }

    fn delete(&mut self, stmt: &DeleteStmt) -> Result<QueryResult> {
        let rows = self.matching_rows(&stmt.table_name, stmt.selection.as_ref())?;
        let deleted = rows.len() as u64;
        for (key, _) in rows {
            self.txn.buffer_write(&stmt.table_name, key, None);
        }
        Ok(QueryResult::affected(deleted))
    }
}

/// Ascending sort order with NULLs last.
fn compare_for_sort(left: &Value, right: &Value) -> Result<Ordering> {
    match (left.is_null(), right.is_null()) {
        (true, true) => Ok(Ordering::Equal),
        (true, false) => Ok(Ordering::Greater),
        (false, true) => Ok(Ordering::Less),
        (false, false) => Ok(left.sql_cmp(right)?.unwrap_or(Ordering::Equal)),
    }
}

fn duplicate_key(schema: &TableSchema, key: &RowKey) -> DbError {
    DbError::ConstraintViolation(format!(
        "duplicate key value violates unique constraint \"{}_pkey\": ({})=({})",
        schema.name,
        schema.primary_key_name().unwrap_or("rowid"),
        key
    ))
}

/// Apply CREATE TABLE directly to the committed catalog. Returns the commit
/// sequence stamped on the new table, or `None` when `IF NOT EXISTS` found one.
pub(crate) fn create_table(catalog: &mut Catalog, stmt: &CreateTableStmt) -> Result<Option<u64>> {
    if catalog.table_exists(&stmt.table_name) {
        if stmt.if_not_exists {
            return Ok(None);
        }
        return Err(DbError::TableExists(stmt.table_name.clone()));
    }
    if stmt.columns.is_empty() {
        return Err(DbError::ExecutionError(format!(
            "table '{}' must have at least one column",
            stmt.table_name
        )));
    }
    let mut seen: Vec<&str> = Vec::new();
    for ColumnDef { name, .. } in &stmt.columns {
        if seen.iter().any(|s| s.eq_ignore_ascii_case(name)) {
            return Err(DbError::ExecutionError(format!(
                "column '{}' specified more than once",
                name
            )));
        }
        seen.push(name);
    }

    catalog.create_table(TableSchema::new(stmt.table_name.clone(), stmt.columns.clone()))?;
    let seq = catalog.next_commit_seq();
    catalog.get_table_mut(&stmt.table_name)?.version = seq;
    Ok(Some(seq))
}

/// Publish buffered writes as one commit. Returns the commit sequence, or the
/// current one for a read-only transaction.
pub(crate) fn apply_writes(catalog: &mut Catalog, writes: PendingWrites) -> Result<u64> {
    if writes.is_empty() {
        return Ok(catalog.commit_seq());
    }
    for table in writes.keys() {
        catalog.get_table(table)?;
    }

    let seq = catalog.next_commit_seq();
    for (table_name, rows) in writes {
        let table = catalog.get_table_mut(&table_name)?;
        for (key, values) in rows {
            table.rows.insert(
                key,
                StoredRow {
                    values,
                    version: seq,
                },
            );
        }
        table.version = seq;
    }
    Ok(seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::parser::SqlParserAdapter;

    struct Fixture {
        catalog: Catalog,
        row_ids: AtomicU64,
        parser: SqlParserAdapter,
    }

    impl Fixture {
        fn new() -> Self {
            let mut fixture = Self {
                catalog: Catalog::new(),
                row_ids: AtomicU64::new(1),
                parser: SqlParserAdapter::new(),
            };
            let Statement::CreateTable(create) = fixture
                .parser
                .parse("CREATE TABLE accounts (id INT PRIMARY KEY, balance INT)")
                .unwrap()
            else {
                panic!("expected CREATE TABLE");
            };
            create_table(&mut fixture.catalog, &create).unwrap();
            fixture.autocommit("INSERT INTO accounts VALUES (1, 1000), (2, 250)", &[]).unwrap();
            fixture
        }

        fn run(&self, txn: &mut Transaction, sql: &str, params: &[Value]) -> Result<QueryResult> {
            let stmt = self.parser.parse(sql)?;
            StatementExecutor::new(&self.catalog, txn, params, &self.row_ids).execute(&stmt)
        }

        fn autocommit(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
            let mut txn = Transaction::begin(self.catalog.commit_seq());
            let result = self.run(&mut txn, sql, params)?;
            apply_writes(&mut self.catalog, txn.take_writes())?;
            Ok(result)
        }
    }

    #[test]
    fn test_select_reads_own_writes() {
        let fixture = Fixture::new();
        let mut txn = Transaction::begin(fixture.catalog.commit_seq());
        fixture
            .run(&mut txn, "UPDATE accounts SET balance = balance - $1 WHERE id = $2", &[
                Value::Integer(100),
                Value::Integer(1),
            ])
            .unwrap();

        let result = fixture
            .run(&mut txn, "SELECT balance FROM accounts WHERE id = 1", &[])
            .unwrap();
        assert_eq!(result.get_i64(0, "balance").unwrap(), Some(900));

        let committed = fixture.catalog.get_table("accounts").unwrap();
        assert_eq!(committed.live_row(&RowKey::Int(1)).unwrap()[1], Value::Integer(1000));
    }

    #[test]
    fn test_duplicate_key_and_on_conflict() {
        let mut fixture = Fixture::new();
        let err = fixture
            .autocommit("INSERT INTO accounts VALUES (1, 5)", &[])
            .unwrap_err();
        assert_eq!(err.sql_state().code(), "23505");

        let result = fixture
            .autocommit(
                "INSERT INTO accounts (id, balance) VALUES (1, 5), (3, 7) ON CONFLICT (id) DO NOTHING",
                &[],
            )
            .unwrap();
        assert_eq!(result.affected_rows, 1);
        assert_eq!(fixture.catalog.get_table("accounts").unwrap().live_rows().count(), 3);
    }

    #[test]
    fn test_order_by_limit_and_projection() {
        let mut fixture = Fixture::new();
        fixture
            .autocommit("INSERT INTO accounts VALUES (3, 500), (4, NULL)", &[])
            .unwrap();

        let mut txn = Transaction::begin(fixture.catalog.commit_seq());
        let result = fixture
            .run(
                &mut txn,
                "SELECT id, balance * 2 AS doubled, balance + 1 FROM accounts ORDER BY balance DESC LIMIT 3",
                &[],
            )
            .unwrap();
        assert_eq!(result.columns, vec!["id", "doubled", "?column?"]);
        assert_eq!(result.row_count(), 3);
        // NULLs sort last ascending, so first when descending.
        assert_eq!(result.get_i64(0, "id").unwrap(), Some(4));
        assert_eq!(result.get_i64(1, "doubled").unwrap(), Some(2000));
        assert_eq!(result.get_i64(2, "id").unwrap(), Some(3));
    }

    #[test]
    fn test_delete_and_scan_overlay() {
        let fixture = Fixture::new();
        let mut txn = Transaction::begin(fixture.catalog.commit_seq());
        let deleted = fixture
            .run(&mut txn, "DELETE FROM accounts WHERE balance < 500", &[])
            .unwrap();
        assert_eq!(deleted.affected_rows, 1);

        let remaining = fixture.run(&mut txn, "SELECT * FROM accounts", &[]).unwrap();
        assert_eq!(remaining.row_count(), 1);
        assert_eq!(remaining.get_i64(0, "id").unwrap(), Some(1));
    }

    #[test]
    fn test_apply_writes_stamps_versions() {
        let mut fixture = Fixture::new();
        let before = fixture.catalog.commit_seq();
        fixture
            .autocommit("UPDATE accounts SET balance = 0 WHERE id = 2", &[])
            .unwrap();
        let table = fixture.catalog.get_table("accounts").unwrap();
        assert_eq!(table.row_version(&RowKey::Int(2)), before + 1);
        assert_eq!(table.version, before + 1);
        assert!(table.row_version(&RowKey::Int(1)) <= before);
    }

    #[test]
    fn test_type_errors_surface() {
        let mut fixture = Fixture::new();
        assert!(matches!(
            fixture.autocommit("INSERT INTO accounts VALUES (5, 'lots')", &[]),
            Err(DbError::TypeMismatch(_))
        ));
        assert!(matches!(
            fixture.autocommit("UPDATE accounts SET nope = 1", &[]),
            Err(DbError::ColumnNotFound(..))
        ));
        assert!(matches!(
            fixture.autocommit("SELECT * FROM missing", &[]),
            Err(DbError::TableNotFound(_))
        ));
    }
}
