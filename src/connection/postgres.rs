// ============================================================================
// PostgreSQL-wire Session (tokio-postgres)
// ============================================================================
//
// Lets the retry executor drive a real CockroachDB or PostgreSQL server.
// Statements are prepared so the server reports parameter and column types;
// `Value`s are encoded and decoded against those types.
//
// ============================================================================

use crate::core::{DbError, Result, SqlState, Value};
use crate::result::QueryResult;
use crate::session::Session;
use async_trait::async_trait;
use bytes::BytesMut;
use tokio_postgres::error::SqlState as PgSqlState;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::{Client, Row as PgRow};

type BoxError = Box<dyn std::error::Error + Sync + Send>;

impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Integer(i) => match *ty {
                Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                Type::FLOAT4 => (*i as f32).to_sql(ty, out),
                Type::FLOAT8 => (*i as f64).to_sql(ty, out),
                Type::TEXT | Type::VARCHAR => i.to_string().to_sql(ty, out),
                _ => i.to_sql(ty, out),
            },
            Value::Float(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                _ => f.to_sql(ty, out),
            },
            Value::Text(s) => s.to_sql(ty, out),
            Value::Boolean(b) => b.to_sql(ty, out),
        }
    }

    // Type mismatches surface from the per-variant encoders above.
    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Map a driver error onto [`DbError`], keeping the server's SQLSTATE.
pub fn map_pg_error(err: tokio_postgres::Error) -> DbError {
    if let Some(db) = err.as_db_error() {
        if *db.code() == PgSqlState::T_R_SERIALIZATION_FAILURE {
            return DbError::SerializationFailure(db.message().to_string());
        }
        return DbError::Server {
            code: SqlState::new(db.code().code()),
            message: db.message().to_string(),
        };
    }
    if err.is_closed() {
        return DbError::Connection(err.to_string());
    }
    DbError::ExecutionError(err.to_string())
}

fn decode_value(row: &PgRow, idx: usize) -> Result<Value> {
    let ty = row.columns()[idx].type_();
    let value = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx).map(Value::from),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .map(|v| v.map(i64::from).into()),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .map(|v| v.map(i64::from).into()),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx).map(Value::from),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .map(|v| v.map(f64::from).into()),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx).map(Value::from),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            row.try_get::<_, Option<String>>(idx).map(Value::from)
        }
        _ => {
            return Err(DbError::UnsupportedOperation(format!(
                "column '{}' has unsupported type {}",
                row.columns()[idx].name(),
                ty
            )));
        }
    };
    value.map_err(map_pg_error)
}

#[async_trait]
impl Session for Client {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let statement = self.prepare(sql).await.map_err(map_pg_error)?;
        let bound: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|v| v as &(dyn ToSql + Sync)).collect();

        if statement.columns().is_empty() {
            let affected = Client::execute(self, &statement, &bound)
                .await
                .map_err(map_pg_error)?;
            return Ok(QueryResult::affected(affected));
        }

        let rows = self.query(&statement, &bound).await.map_err(map_pg_error)?;
        let columns = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        let mut decoded = Vec::with_capacity(rows.len());
        for row in &rows {
            decoded.push(
                (0..row.len())
                    .map(|idx| decode_value(row, idx))
                    .collect::<Result<Vec<_>>>()?,
            );
        }
        Ok(QueryResult::new(columns, decoded))
    }

    async fn begin(&mut self) -> Result<()> {
        self.batch_execute("BEGIN").await.map_err(map_pg_error)
    }

    async fn commit(&mut self) -> Result<()> {
        self.batch_execute("COMMIT").await.map_err(map_pg_error)
    }

    async fn rollback(&mut self) -> Result<()> {
        self.batch_execute("ROLLBACK").await.map_err(map_pg_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_encoding_follows_column_type() {
        let mut out = BytesMut::new();
        Value::Integer(7).to_sql(&Type::INT4, &mut out).unwrap();
        assert_eq!(out.as_ref(), &7i32.to_be_bytes());

        out.clear();
        Value::Integer(7).to_sql(&Type::INT8, &mut out).unwrap();
        assert_eq!(out.as_ref(), &7i64.to_be_bytes());

        out.clear();
        assert!(Value::Integer(i64::MAX).to_sql(&Type::INT2, &mut out).is_err());
    }

    #[test]
    fn test_null_encoding() {
        let mut out = BytesMut::new();
        assert!(matches!(
            Value::Null.to_sql(&Type::INT8, &mut out).unwrap(),
            IsNull::Yes
        ));
        assert!(out.is_empty());
    }
}
