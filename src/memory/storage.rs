// ============================================================================
// Versioned table storage
// ============================================================================
//
// Every committed write stamps the row (and its table) with the commit
// sequence number. Deleted rows stay behind as tombstones so a reader can
// tell "never existed" apart from "deleted after my snapshot".
//
// ============================================================================

use super::ast::ColumnDef;
use crate::core::{DataType, DbError, Result, Row, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Primary-key value of a row. Tables without a primary key use a hidden row id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RowKey {
    Int(i64),
    Text(String),
    Bool(bool),
    RowId(u64),
}

impl RowKey {
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Integer(i) => Ok(RowKey::Int(*i)),
            Value::Text(s) => Ok(RowKey::Text(s.clone())),
            Value::Boolean(b) => Ok(RowKey::Bool(*b)),
            Value::Null => Err(DbError::ConstraintViolation(
                "primary key cannot be NULL".into(),
            )),
            Value::Float(_) => Err(DbError::TypeMismatch(
                "FLOAT primary keys are not supported".into(),
            )),
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowKey::Int(i) => write!(f, "{}", i),
            RowKey::Text(s) => write!(f, "'{}'", s),
            RowKey::Bool(b) => write!(f, "{}", b),
            RowKey::RowId(id) => write!(f, "rowid {}", id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredRow {
    /// `None` marks a tombstone.
    pub values: Option<Row>,
    pub version: u64,
}

#[derive(Debug, Clone)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Option<usize>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        let primary_key = columns.iter().position(|c| c.primary_key);
        Self {
            name: name.into(),
            columns,
            primary_key,
        }
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| DbError::ColumnNotFound(name.to_string(), self.name.clone()))
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn primary_key_name(&self) -> Option<&str> {
        self.primary_key.map(|idx| self.columns[idx].name.as_str())
    }

    /// Check types and nullability, widening integers stored in FLOAT columns.
    pub fn validate_row(&self, row: &mut Row) -> Result<()> {
        for (column, value) in self.columns.iter().zip(row.iter_mut()) {
            if value.is_null() {
                if !column.nullable {
                    return Err(DbError::ConstraintViolation(format!(
                        "null value in column '{}' violates not-null constraint",
                        column.name
                    )));
                }
                continue;
            }
            if !column.data_type.is_compatible(value) {
                return Err(DbError::TypeMismatch(format!(
                    "Column '{}' expects type {}, got {}",
                    column.name,
                    column.data_type,
                    value.type_name()
                )));
            }
            if column.data_type == DataType::Float {
                if let Value::Integer(i) = *value {
                    *value = Value::Float(i as f64);
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Table {
    pub schema: TableSchema,
    pub rows: BTreeMap<RowKey, StoredRow>,
    /// Sequence number of the last commit that wrote to this table.
    pub version: u64,
}

impl Table {
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: BTreeMap::new(),
            version: 0,
        }
    }

    /// Version of the row at `key`; `0` when it was never written.
    pub fn row_version(&self, key: &RowKey) -> u64 {
        self.rows.get(key).map(|r| r.version).unwrap_or(0)
    }

    pub fn live_row(&self, key: &RowKey) -> Option<&Row> {
        self.rows.get(key).and_then(|r| r.values.as_ref())
    }

    pub fn live_rows(&self) -> impl Iterator<Item = (&RowKey, &Row)> {
        self.rows
            .iter()
            .filter_map(|(key, row)| row.values.as_ref().map(|values| (key, values)))
    }
}

/// Committed database state.
#[derive(Debug, Default)]
pub struct Catalog {
    tables: HashMap<String, Table>,
    /// Sequence number of the last successful commit.
    commit_seq: u64,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit_seq(&self) -> u64 {
        self.commit_seq
    }

    pub fn next_commit_seq(&mut self) -> u64 {
        self.commit_seq += 1;
        self.commit_seq
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get_table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))
    }

    pub fn get_table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))
    }

    pub fn create_table(&mut self, schema: TableSchema) -> Result<()> {
        if self.tables.contains_key(&schema.name) {
            return Err(DbError::TableExists(schema.name));
        }
        self.tables.insert(schema.name.clone(), Table::new(schema));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accounts_schema() -> TableSchema {
        TableSchema::new(
            "accounts",
            vec![
                ColumnDef {
                    name: "id".into(),
                    data_type: DataType::Integer,
                    nullable: false,
                    primary_key: true,
                },
                ColumnDef {
                    name: "balance".into(),
                    data_type: DataType::Float,
                    nullable: true,
                    primary_key: false,
                },
            ],
        )
    }

    #[test]
    fn test_row_key_from_value() {
        assert_eq!(RowKey::from_value(&Value::Integer(7)).unwrap(), RowKey::Int(7));
        assert!(RowKey::from_value(&Value::Null).is_err());
        assert!(RowKey::from_value(&Value::Float(1.5)).is_err());
    }

    #[test]
    fn test_validate_row_widens_integers() {
        let schema = accounts_schema();
        let mut row = vec![Value::Integer(1), Value::Integer(10)];
        schema.validate_row(&mut row).unwrap();
        assert_eq!(row[1], Value::Float(10.0));

        let mut bad = vec![Value::Null, Value::Integer(10)];
        assert!(matches!(
            schema.validate_row(&mut bad),
            Err(DbError::ConstraintViolation(_))
        ));
    }

    #[test]
    fn test_catalog_create_table() {
        let mut catalog = Catalog::new();
        catalog.create_table(accounts_schema()).unwrap();
        assert!(catalog.table_exists("accounts"));
        assert!(matches!(
            catalog.create_table(accounts_schema()),
            Err(DbError::TableExists(_))
        ));
        assert_eq!(catalog.get_table("accounts").unwrap().schema.primary_key_name(), Some("id"));
        assert!(catalog.get_table("missing").is_err());
    }

    #[test]
    fn test_tombstones_are_not_live() {
        let mut table = Table::new(accounts_schema());
        table.rows.insert(
            RowKey::Int(1),
            StoredRow {
                values: None,
                version: 4,
            },
        );
        assert_eq!(table.row_version(&RowKey::Int(1)), 4);
        assert!(table.live_row(&RowKey::Int(1)).is_none());
        assert_eq!(table.live_rows().count(), 0);
        assert_eq!(table.row_version(&RowKey::Int(2)), 0);
    }
}
