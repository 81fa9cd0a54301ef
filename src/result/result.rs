use crate::core::{DbError, Result, Row, Value};

/// Rows returned by a statement, or the number of rows it touched.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// Rows inserted, updated or deleted by a DML statement.
    pub affected_rows: u64,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows,
            affected_rows: 0,
        }
    }

    pub fn affected(count: u64) -> Self {
        Self {
            affected_rows: count,
            ..Self::default()
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Value of `column` in row `row`.
    pub fn get(&self, row: usize, column: &str) -> Result<&Value> {
        let idx = self.column_index(column).ok_or_else(|| {
            DbError::ColumnNotFound(column.to_string(), "<result>".to_string())
        })?;
        self.rows
            .get(row)
            .and_then(|r| r.get(idx))
            .ok_or_else(|| DbError::ExecutionError(format!("Row {} out of range", row)))
    }

    /// Integer value of `column` in row `row`; `None` when the row does not exist.
    pub fn get_i64(&self, row: usize, column: &str) -> Result<Option<i64>> {
        if row >= self.rows.len() {
            return Ok(None);
        }
        match self.get(row, column)? {
            Value::Integer(i) => Ok(Some(*i)),
            Value::Null => Ok(None),
            other => Err(DbError::TypeMismatch(format!(
                "Column '{}' is {}, expected INTEGER",
                column,
                other.type_name()
            ))),
        }
    }
}
