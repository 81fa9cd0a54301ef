// ============================================================================
// sqlparser adapter for the in-memory backend
// ============================================================================
//
// Converts the PostgreSQL-dialect AST produced by `sqlparser` into the small
// statement set the in-memory backend executes. Anything outside that set is
// rejected with `UnsupportedOperation`.
//
// ============================================================================

use super::ast::*;
use crate::core::{DataType, DbError, Result, Value};
use sqlparser::ast as sql_ast;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

pub struct SqlParserAdapter {
    dialect: PostgreSqlDialect,
}

impl Default for SqlParserAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SqlParserAdapter {
    pub fn new() -> Self {
        Self {
            dialect: PostgreSqlDialect {},
        }
    }

    /// Parse exactly one statement.
    pub fn parse(&self, sql: &str) -> Result<Statement> {
        let trimmed = sql.trim().trim_end_matches(';').trim().to_uppercase();
        match trimmed.as_str() {
            "BEGIN" | "BEGIN TRANSACTION" | "START TRANSACTION" => return Ok(Statement::Begin),
            "COMMIT" | "COMMIT TRANSACTION" | "END" => return Ok(Statement::Commit),
            "ROLLBACK" | "ROLLBACK TRANSACTION" | "ABORT" => return Ok(Statement::Rollback),
            _ => {}
        }

        let mut statements = Parser::parse_sql(&self.dialect, sql)
            .map_err(|e| DbError::ParseError(e.to_string()))?;

        if statements.len() != 1 {
            return Err(DbError::UnsupportedOperation(format!(
                "Expected exactly one statement, got {}",
                statements.len()
            )));
        }

        self.convert_statement(statements.remove(0))
    }

    fn convert_statement(&self, stmt: sql_ast::Statement) -> Result<Statement> {
        match stmt {
            sql_ast::Statement::StartTransaction { .. } => Ok(Statement::Begin),
            sql_ast::Statement::Commit { .. } => Ok(Statement::Commit),
            sql_ast::Statement::Rollback { .. } => Ok(Statement::Rollback),
            sql_ast::Statement::CreateTable(create) => {
                Ok(Statement::CreateTable(self.convert_create_table(create)?))
            }
            sql_ast::Statement::Insert(insert) => Ok(Statement::Insert(self.convert_insert(insert)?)),
            sql_ast::Statement::Query(query) => Ok(Statement::Select(self.convert_query(*query)?)),
            sql_ast::Statement::Update {
                table,
                assignments,
                selection,
                ..
            } => Ok(Statement::Update(self.convert_update(table, assignments, selection)?)),
            sql_ast::Statement::Delete(delete) => Ok(Statement::Delete(self.convert_delete(delete)?)),
            _ => Err(DbError::UnsupportedOperation(format!(
                "Statement type not supported: {}",
                stmt
            ))),
        }
    }

    fn convert_create_table(&self, create: sql_ast::CreateTable) -> Result<CreateTableStmt> {
        let table_name = normalize_object_name(&create.name.to_string());
        let mut columns = create
            .columns
            .into_iter()
            .map(|col| self.convert_column_def(col))
            .collect::<Result<Vec<_>>>()?;

        // Table-level `PRIMARY KEY (col)`
        for constraint in &create.constraints {
            let text = constraint.to_string();
            let Some(rest) = text.to_uppercase().find("PRIMARY KEY").map(|i| &text[i + 11..]) else {
                continue;
            };
            let inner = rest
                .trim()
                .trim_start_matches('(')
                .split(')')
                .next()
                .unwrap_or_default();
            let names: Vec<String> = inner.split(',').map(normalize_object_name).collect();
            if names.len() != 1 {
                return Err(DbError::UnsupportedOperation(
                    "Composite primary keys are not supported".into(),
                ));
            }
            let column = columns
                .iter_mut()
                .find(|c| c.name == names[0])
                .ok_or_else(|| DbError::ColumnNotFound(names[0].clone(), table_name.clone()))?;
            column.primary_key = true;
            column.nullable = false;
        }

        if columns.iter().filter(|c| c.primary_key).count() > 1 {
            return Err(DbError::UnsupportedOperation(
                "Composite primary keys are not supported".into(),
            ));
        }

        Ok(CreateTableStmt {
            table_name,
            columns,
            if_not_exists: create.if_not_exists,
        })
    }

    fn convert_column_def(&self, col: sql_ast::ColumnDef) -> Result<ColumnDef> {
        let data_type = self.convert_data_type(&col.data_type)?;
        let primary_key = col
            .options
            .iter()
            .any(|opt| opt.option.to_string().to_uppercase().starts_with("PRIMARY KEY"));
        let not_null = col
            .options
            .iter()
            .any(|opt| matches!(opt.option, sql_ast::ColumnOption::NotNull));

        Ok(ColumnDef {
            name: normalize_ident(&col.name),
            data_type,
            nullable: !(not_null || primary_key),
            primary_key,
        })
    }

    fn convert_data_type(&self, dt: &sql_ast::DataType) -> Result<DataType> {
        let name = dt.to_string().to_uppercase();
        let base = name.split('(').next().unwrap_or_default().trim();
        match base {
            "INT" | "INTEGER" | "BIGINT" | "SMALLINT" | "INT2" | "INT4" | "INT8" => Ok(DataType::Integer),
            "FLOAT" | "FLOAT4" | "FLOAT8" | "DOUBLE" | "DOUBLE PRECISION" | "REAL" => Ok(DataType::Float),
            "TEXT" | "VARCHAR" | "CHAR" | "STRING" | "CHARACTER VARYING" => Ok(DataType::Text),
            "BOOL" | "BOOLEAN" => Ok(DataType::Boolean),
            _ => Err(DbError::TypeMismatch(format!("Unsupported data type: {}", dt))),
        }
    }

    fn convert_insert(&self, insert: sql_ast::Insert) -> Result<InsertStmt> {
        let table_name = normalize_object_name(&insert.table.to_string());

        let columns = if insert.columns.is_empty() {
            None
        } else {
            Some(insert.columns.iter().map(normalize_ident).collect())
        };

        let ignore_conflicts = match &insert.on {
            None => false,
            Some(sql_ast::OnInsert::OnConflict(on_conflict)) => {
                if !matches!(on_conflict.action, sql_ast::OnConflictAction::DoNothing) {
                    return Err(DbError::UnsupportedOperation(
                        "Only ON CONFLICT DO NOTHING is supported".into(),
                    ));
                }
                true
            }
            Some(other) => {
                return Err(DbError::UnsupportedOperation(format!(
                    "Unsupported INSERT clause: {}",
                    other
                )));
            }
        };

        let Some(source) = insert.source else {
            return Err(DbError::ParseError("INSERT requires a VALUES clause".into()));
        };
        let sql_ast::SetExpr::Values(vals) = *source.body else {
            return Err(DbError::UnsupportedOperation("Only VALUES clause supported".into()));
        };

        let values = vals
            .rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|expr| self.convert_expr(expr))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(InsertStmt {
            table_name,
            columns,
            values,
            ignore_conflicts,
        })
    }

    fn convert_query(&self, query: sql_ast::Query) -> Result<SelectStmt> {
        let order_by = self.convert_order_by(query.order_by)?;
        let limit = self.convert_limit_clause(&query.limit_clause)?;

        let sql_ast::SetExpr::Select(select) = *query.body else {
            return Err(DbError::UnsupportedOperation("Only SELECT queries supported".into()));
        };
        let select = *select;

        if select.from.len() != 1 || !select.from[0].joins.is_empty() {
            return Err(DbError::UnsupportedOperation(
                "SELECT must read from exactly one table".into(),
            ));
        }
        let table_name = table_factor_name(&select.from[0].relation)?;

        let projection = select
            .projection
            .into_iter()
            .map(|item| self.convert_select_item(item))
            .collect::<Result<Vec<_>>>()?;

        let selection = select.selection.map(|expr| self.convert_expr(expr)).transpose()?;

        Ok(SelectStmt {
            table_name,
            projection,
            selection,
            order_by,
            limit,
        })
    }

    fn convert_select_item(&self, item: sql_ast::SelectItem) -> Result<SelectItem> {
        match item {
            sql_ast::SelectItem::Wildcard(_) => Ok(SelectItem::Wildcard),
            sql_ast::SelectItem::UnnamedExpr(expr) => Ok(SelectItem::Expr {
                expr: self.convert_expr(expr)?,
                alias: None,
            }),
            sql_ast::SelectItem::ExprWithAlias { expr, alias } => Ok(SelectItem::Expr {
                expr: self.convert_expr(expr)?,
                alias: Some(normalize_ident(&alias)),
            }),
            _ => Err(DbError::UnsupportedOperation("Unsupported select item".into())),
        }
    }

    fn convert_order_by(&self, order_by: Option<sql_ast::OrderBy>) -> Result<Vec<OrderByExpr>> {
        let Some(order_by) = order_by else {
            return Ok(Vec::new());
        };

        match order_by.kind {
            sql_ast::OrderByKind::Expressions(exprs) => exprs
                .into_iter()
                .map(|order| {
                    Ok(OrderByExpr {
                        expr: self.convert_expr(order.expr)?,
                        descending: order.options.asc.map(|asc| !asc).unwrap_or(false),
                    })
                })
                .collect(),
            sql_ast::OrderByKind::All(_) => {
                Err(DbError::UnsupportedOperation("ORDER BY ALL not supported".into()))
            }
        }
    }

    fn convert_limit_clause(&self, limit_clause: &Option<sql_ast::LimitClause>) -> Result<Option<usize>> {
        let limit = match limit_clause {
            None => return Ok(None),
            Some(sql_ast::LimitClause::LimitOffset { limit: None, .. }) => return Ok(None),
            Some(sql_ast::LimitClause::LimitOffset { limit: Some(limit), .. }) => limit,
            Some(sql_ast::LimitClause::OffsetCommaLimit { limit, .. }) => limit,
        };

        match limit {
            sql_ast::Expr::Value(value_with_span) => match &value_with_span.value {
                sql_ast::Value::Number(n, _) => n
                    .parse::<usize>()
                    .map(Some)
                    .map_err(|_| DbError::ParseError(format!("Invalid LIMIT value: {}", n))),
                other => Err(DbError::UnsupportedOperation(format!(
                    "Only numeric LIMIT supported, got: {}",
                    other
                ))),
            },
            _ => Err(DbError::UnsupportedOperation("Only numeric LIMIT supported".into())),
        }
    }

    fn convert_update(
        &self,
        table: sql_ast::TableWithJoins,
        assignments: Vec<sql_ast::Assignment>,
        selection: Option<sql_ast::Expr>,
    ) -> Result<UpdateStmt> {
        let table_name = table_factor_name(&table.relation)?;

        let assignments = assignments
            .into_iter()
            .map(|assign| {
                let column = match assign.target {
                    sql_ast::AssignmentTarget::ColumnName(col_name) if col_name.0.len() == 1 => {
                        normalize_object_name(&col_name.0[0].to_string())
                    }
                    _ => {
                        return Err(DbError::UnsupportedOperation(
                            "Only simple column names supported in UPDATE".into(),
                        ));
                    }
                };
                Ok(Assignment {
                    column,
                    value: self.convert_expr(assign.value)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let selection = selection.map(|expr| self.convert_expr(expr)).transpose()?;

        Ok(UpdateStmt {
            table_name,
            assignments,
            selection,
        })
    }

    fn convert_delete(&self, delete: sql_ast::Delete) -> Result<DeleteStmt> {
        let tables = match delete.from {
            sql_ast::FromTable::WithFromKeyword(tables) | sql_ast::FromTable::WithoutKeyword(tables) => {
                tables
            }
        };
        let Some(first) = tables.first() else {
            return Err(DbError::ParseError("DELETE requires a table".into()));
        };
        let table_name = table_factor_name(&first.relation)?;

        let selection = delete.selection.map(|expr| self.convert_expr(expr)).transpose()?;

        Ok(DeleteStmt {
            table_name,
            selection,
        })
    }

    fn convert_expr(&self, expr: sql_ast::Expr) -> Result<Expr> {
        match expr {
            sql_ast::Expr::Identifier(ident) => Ok(Expr::Column(normalize_ident(&ident))),
            sql_ast::Expr::CompoundIdentifier(idents) => idents
                .last()
                .map(|ident| Expr::Column(normalize_ident(ident)))
                .ok_or_else(|| DbError::ParseError("Empty identifier".into())),
            sql_ast::Expr::Value(val) => self.convert_value(&val.value),
            sql_ast::Expr::Nested(inner) => self.convert_expr(*inner),
            sql_ast::Expr::IsNull(inner) => Ok(Expr::IsNull {
                expr: Box::new(self.convert_expr(*inner)?),
                negated: false,
            }),
            sql_ast::Expr::IsNotNull(inner) => Ok(Expr::IsNull {
                expr: Box::new(self.convert_expr(*inner)?),
                negated: true,
            }),
            sql_ast::Expr::UnaryOp { op, expr } => {
                let inner = self.convert_expr(*expr)?;
                match op {
                    sql_ast::UnaryOperator::Not => Ok(Expr::Not(Box::new(inner))),
                    sql_ast::UnaryOperator::Minus => Ok(match inner {
                        Expr::Literal(Value::Integer(i)) => Expr::Literal(Value::Integer(-i)),
                        Expr::Literal(Value::Float(f)) => Expr::Literal(Value::Float(-f)),
                        other => Expr::Negate(Box::new(other)),
                    }),
                    sql_ast::UnaryOperator::Plus => Ok(inner),
                    _ => Err(DbError::UnsupportedOperation(format!(
                        "Unsupported unary operator: {}",
                        op
                    ))),
                }
            }
            sql_ast::Expr::BinaryOp { left, op, right } => Ok(Expr::BinaryOp {
                left: Box::new(self.convert_expr(*left)?),
                op: self.convert_binary_op(&op)?,
                right: Box::new(self.convert_expr(*right)?),
            }),
            other => Err(DbError::UnsupportedOperation(format!(
                "Unsupported expression: {}",
                other
            ))),
        }
    }

    fn convert_value(&self, val: &sql_ast::Value) -> Result<Expr> {
        let value = match val {
            sql_ast::Value::Number(n, _) => {
                if let Ok(i) = n.parse::<i64>() {
                    Value::Integer(i)
                } else if let Ok(f) = n.parse::<f64>() {
                    Value::Float(f)
                } else {
                    return Err(DbError::TypeMismatch(format!("Invalid number: {}", n)));
                }
            }
            sql_ast::Value::SingleQuotedString(s) => Value::Text(s.clone()),
            sql_ast::Value::Boolean(b) => Value::Boolean(*b),
            sql_ast::Value::Null => Value::Null,
            sql_ast::Value::Placeholder(p) => return parse_placeholder(p),
            _ => {
                return Err(DbError::UnsupportedOperation(format!(
                    "Unsupported value: {}",
                    val
                )));
            }
        };
        Ok(Expr::Literal(value))
    }

    fn convert_binary_op(&self, op: &sql_ast::BinaryOperator) -> Result<BinaryOp> {
        use sql_ast::BinaryOperator as SqlOp;

        match op {
            SqlOp::Plus => Ok(BinaryOp::Add),
            SqlOp::Minus => Ok(BinaryOp::Subtract),
            SqlOp::Multiply => Ok(BinaryOp::Multiply),
            SqlOp::Divide => Ok(BinaryOp::Divide),

            SqlOp::Eq => Ok(BinaryOp::Eq),
            SqlOp::NotEq => Ok(BinaryOp::NotEq),
            SqlOp::Lt => Ok(BinaryOp::Lt),
            SqlOp::LtEq => Ok(BinaryOp::LtEq),
            SqlOp::Gt => Ok(BinaryOp::Gt),
            SqlOp::GtEq => Ok(BinaryOp::GtEq),

            SqlOp::And => Ok(BinaryOp::And),
            SqlOp::Or => Ok(BinaryOp::Or),

            _ => Err(DbError::UnsupportedOperation(format!(
                "Unsupported binary operator: {}",
                op
            ))),
        }
    }
}

fn parse_placeholder(raw: &str) -> Result<Expr> {
    raw.strip_prefix('$')
        .and_then(|n| n.parse::<usize>().ok())
        .filter(|n| *n >= 1)
        .map(|n| Expr::Placeholder(n - 1))
        .ok_or_else(|| DbError::ParseError(format!("Invalid parameter placeholder: {}", raw)))
}

fn table_factor_name(factor: &sql_ast::TableFactor) -> Result<String> {
    match factor {
        sql_ast::TableFactor::Table { name, .. } => Ok(normalize_object_name(&name.to_string())),
        _ => Err(DbError::UnsupportedOperation(
            "Complex table references not supported".into(),
        )),
    }
}

fn normalize_ident(ident: &sql_ast::Ident) -> String {
    if ident.quote_style.is_some() {
        ident.value.clone()
    } else {
        ident.value.to_lowercase()
    }
}

/// Last dotted part of a printed object name, unquoted identifiers folded to lower case.
fn normalize_object_name(name: &str) -> String {
    let last = name.trim().rsplit('.').next().unwrap_or_default().trim();
    if last.len() >= 2 && last.starts_with('"') && last.ends_with('"') {
        last[1..last.len() - 1].to_string()
    } else {
        last.to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_transaction_control() {
        let adapter = SqlParserAdapter::new();
        assert_eq!(adapter.parse("BEGIN;").unwrap(), Statement::Begin);
        assert_eq!(adapter.parse("commit").unwrap(), Statement::Commit);
        assert_eq!(adapter.parse(" ROLLBACK; ").unwrap(), Statement::Rollback);
    }

    #[test]
    fn test_parse_create_table_with_primary_key() {
        let adapter = SqlParserAdapter::new();
        let stmt = adapter
            .parse("CREATE TABLE IF NOT EXISTS accounts (id INT PRIMARY KEY, balance INT);")
            .unwrap();

        let Statement::CreateTable(create) = stmt else {
            panic!("Expected CreateTable");
        };
        assert_eq!(create.table_name, "accounts");
        assert!(create.if_not_exists);
        assert_eq!(create.columns.len(), 2);
        assert!(create.columns[0].primary_key);
        assert!(!create.columns[0].nullable);
        assert!(!create.columns[1].primary_key);
        assert_eq!(create.columns[1].data_type, DataType::Integer);
    }

    #[test]
    fn test_parse_table_level_primary_key() {
        let adapter = SqlParserAdapter::new();
        let Statement::CreateTable(create) = adapter
            .parse("CREATE TABLE t (name TEXT, id INT, PRIMARY KEY (id))")
            .unwrap()
        else {
            panic!("Expected CreateTable");
        };
        assert!(!create.columns[0].primary_key);
        assert!(create.columns[1].primary_key);
    }

    #[test]
    fn test_parse_update_with_placeholders() {
        let adapter = SqlParserAdapter::new();
        let stmt = adapter
            .parse("UPDATE accounts SET balance = balance - $1 WHERE id = $2 ;")
            .unwrap();

        let Statement::Update(update) = stmt else {
            panic!("Expected Update");
        };
        assert_eq!(update.table_name, "accounts");
        assert_eq!(update.assignments.len(), 1);
        assert_eq!(update.assignments[0].column, "balance");
        assert_eq!(
            update.assignments[0].value,
            Expr::BinaryOp {
                left: Box::new(Expr::Column("balance".into())),
                op: BinaryOp::Subtract,
                right: Box::new(Expr::Placeholder(0)),
            }
        );
        assert_eq!(
            update.selection,
            Some(Expr::BinaryOp {
                left: Box::new(Expr::Column("id".into())),
                op: BinaryOp::Eq,
                right: Box::new(Expr::Placeholder(1)),
            })
        );
    }

    #[test]
    fn test_parse_insert_multiple_rows() {
        let adapter = SqlParserAdapter::new();
        let Statement::Insert(insert) = adapter
            .parse("INSERT INTO accounts (id, balance) VALUES (1, 1000), (2, -250) ON CONFLICT (id) DO NOTHING")
            .unwrap()
        else {
            panic!("Expected Insert");
        };
        assert_eq!(insert.columns, Some(vec!["id".to_string(), "balance".to_string()]));
        assert_eq!(insert.values.len(), 2);
        assert_eq!(insert.values[1][1], Expr::Literal(Value::Integer(-250)));
        assert!(insert.ignore_conflicts);
    }

    #[test]
    fn test_parse_select_order_and_limit() {
        let adapter = SqlParserAdapter::new();
        let Statement::Select(select) = adapter
            .parse("SELECT id, balance AS b FROM Accounts WHERE balance > 0 ORDER BY id DESC LIMIT 5")
            .unwrap()
        else {
            panic!("Expected Select");
        };
        assert_eq!(select.table_name, "accounts");
        assert_eq!(select.projection.len(), 2);
        assert_eq!(select.order_by.len(), 1);
        assert!(select.order_by[0].descending);
        assert_eq!(select.limit, Some(5));
    }

    #[test]
    fn test_rejects_unsupported_statements() {
        let adapter = SqlParserAdapter::new();
        assert!(matches!(
            adapter.parse("SELECT * FROM a JOIN b ON a.id = b.id"),
            Err(DbError::UnsupportedOperation(_))
        ));
        assert!(matches!(
            adapter.parse("DROP TABLE accounts"),
            Err(DbError::UnsupportedOperation(_))
        ));
        assert!(matches!(adapter.parse("SELEC nonsense"), Err(DbError::ParseError(_))));
        assert!(adapter.parse("SELECT 1; SELECT 2").is_err());
    }

    #[test]
    fn test_invalid_placeholder() {
        assert!(parse_placeholder("$0").is_err());
        assert!(parse_placeholder("?").is_err());
        assert_eq!(parse_placeholder("$3").unwrap(), Expr::Placeholder(2));
    }
}
