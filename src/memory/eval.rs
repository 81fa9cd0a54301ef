use super::ast::{BinaryOp, Expr};
use super::storage::{RowKey, TableSchema};
use crate::core::{DbError, Result, Row, Value};
use std::cmp::Ordering;

/// Row and bind parameters an expression is evaluated against.
pub struct EvalContext<'a> {
    row: Option<(&'a TableSchema, &'a Row)>,
    params: &'a [Value],
}

impl<'a> EvalContext<'a> {
    pub fn constant(params: &'a [Value]) -> Self {
        Self { row: None, params }
    }

    pub fn for_row(schema: &'a TableSchema, row: &'a Row, params: &'a [Value]) -> Self {
        Self {
            row: Some((schema, row)),
            params,
        }
    }

    pub fn evaluate(&self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Placeholder(idx) => self.params.get(*idx).cloned().ok_or_else(|| {
                DbError::ExecutionError(format!(
                    "bind parameter ${} was not supplied ({} given)",
                    idx + 1,
                    self.params.len()
                ))
            }),
            Expr::Column(name) => {
                let Some((schema, row)) = self.row else {
                    return Err(DbError::ExecutionError(format!(
                        "column '{}' referenced outside of a row context",
                        name
                    )));
                };
                let idx = schema.column_index(name)?;
                Ok(row[idx].clone())
            }
            Expr::Not(inner) => match self.evaluate(inner)? {
                Value::Null => Ok(Value::Null),
                Value::Boolean(b) => Ok(Value::Boolean(!b)),
                other => Err(DbError::TypeMismatch(format!(
                    "NOT requires a boolean operand, got {}",
                    other.type_name()
                ))),
            },
            Expr::Negate(inner) => match self.evaluate(inner)? {
                Value::Null => Ok(Value::Null),
                Value::Integer(i) => i
                    .checked_neg()
                    .map(Value::Integer)
                    .ok_or_else(|| DbError::ExecutionError("integer out of range".into())),
                Value::Float(f) => Ok(Value::Float(-f)),
                other => Err(DbError::TypeMismatch(format!(
                    "unary minus requires a numeric operand, got {}",
                    other.type_name()
                ))),
            },
            Expr::IsNull { expr, negated } => {
                let is_null = self.evaluate(expr)?.is_null();
                Ok(Value::Boolean(is_null != *negated))
            }
            Expr::BinaryOp { left, op, right } => match op {
                BinaryOp::And | BinaryOp::Or => self.evaluate_logical(left, *op, right),
                BinaryOp::Add | BinaryOp::Subtract | BinaryOp::Multiply | BinaryOp::Divide => {
                    arithmetic(self.evaluate(left)?, *op, self.evaluate(right)?)
                }
                _ => comparison(&self.evaluate(left)?, *op, &self.evaluate(right)?),
            },
        }
    }

    /// WHERE semantics: only `TRUE` keeps the row, `NULL` and `FALSE` drop it.
    pub fn matches(&self, predicate: Option<&Expr>) -> Result<bool> {
        let Some(predicate) = predicate else {
            return Ok(true);
        };
        match self.evaluate(predicate)? {
            Value::Boolean(b) => Ok(b),
            Value::Null => Ok(false),
            other => Err(DbError::TypeMismatch(format!(
                "WHERE clause must be boolean, got {}",
                other.type_name()
            ))),
        }
    }

    // Three-valued AND/OR.
    fn evaluate_logical(&self, left: &Expr, op: BinaryOp, right: &Expr) -> Result<Value> {
        let l = truth(self.evaluate(left)?)?;
        let r = truth(self.evaluate(right)?)?;
        let result = match op {
            BinaryOp::And => match (l, r) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            },
            _ => match (l, r) {
                (Some(true), _) | (_, Some(true)) => Some(true),
                (Some(false), Some(false)) => Some(false),
                _ => None,
            },
        };
        Ok(result.map(Value::Boolean).unwrap_or(Value::Null))
    }
}

fn truth(value: Value) -> Result<Option<bool>> {
    match value {
        Value::Null => Ok(None),
        Value::Boolean(b) => Ok(Some(b)),
        other => Err(DbError::TypeMismatch(format!(
            "logical operator requires boolean operands, got {}",
            other.type_name()
        ))),
    }
}

fn arithmetic(left: Value, op: BinaryOp, right: Value) -> Result<Value> {
    match (left, right) {
        (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
        (Value::Integer(a), Value::Integer(b)) => {
            let result = match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Subtract => a.checked_sub(b),
                BinaryOp::Multiply => a.checked_mul(b),
                _ => {
                    if b == 0 {
                        return Err(DbError::ExecutionError("division by zero".into()));
                    }
                    a.checked_div(b)
                }
            };
            result
                .map(Value::Integer)
                .ok_or_else(|| DbError::ExecutionError("integer out of range".into()))
        }
        (a, b) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => {
                let result = match op {
                    BinaryOp::Add => x + y,
                    BinaryOp::Subtract => x - y,
                    BinaryOp::Multiply => x * y,
                    _ => {
                        if y == 0.0 {
                            return Err(DbError::ExecutionError("division by zero".into()));
                        }
                        x / y
                    }
                };
                Ok(Value::Float(result))
            }
            _ => Err(DbError::TypeMismatch(format!(
                "arithmetic requires numeric types, got {} and {}",
                a.type_name(),
                b.type_name()
            ))),
        },
    }
}

fn comparison(left: &Value, op: BinaryOp, right: &Value) -> Result<Value> {
    let Some(ordering) = left.sql_cmp(right)? else {
        return Ok(Value::Null);
    };
    let result = match op {
        BinaryOp::Eq => ordering == Ordering::Equal,
        BinaryOp::NotEq => ordering != Ordering::Equal,
        BinaryOp::Lt => ordering == Ordering::Less,
        BinaryOp::LtEq => ordering != Ordering::Greater,
        BinaryOp::Gt => ordering == Ordering::Greater,
        BinaryOp::GtEq => ordering != Ordering::Less,
        other => {
            return Err(DbError::UnsupportedOperation(format!(
                "{:?} is not a comparison",
                other
            )));
        }
    };
    Ok(Value::Boolean(result))
}

/// Primary key pinned by a `pk = <constant>` conjunct of the predicate, if any.
///
/// Lets UPDATE/DELETE/SELECT touch a single row instead of scanning the table,
/// which keeps the read set of a transaction as narrow as the statement allows.
pub fn point_key(
    schema: &TableSchema,
    predicate: Option<&Expr>,
    params: &[Value],
) -> Result<Option<RowKey>> {
    let (Some(predicate), Some(pk_name)) = (predicate, schema.primary_key_name()) else {
        return Ok(None);
    };
    let mut conjuncts = Vec::new();
    collect_conjuncts(predicate, &mut conjuncts);

    let ctx = EvalContext::constant(params);
    for conjunct in conjuncts {
        let Expr::BinaryOp {
            left,
            op: BinaryOp::Eq,
            right,
        } = conjunct
        else {
            continue;
        };
        let constant = match (left.as_ref(), right.as_ref()) {
            (Expr::Column(name), other) | (other, Expr::Column(name))
                if name.eq_ignore_ascii_case(pk_name) && other.is_constant() =>
            {
                other
            }
            _ => continue,
        };
        let value = ctx.evaluate(constant)?;
        // `pk = NULL` never matches; a full scan returns nothing for it.
        if value.is_null() {
            return Ok(None);
        }
        return RowKey::from_value(&value).map(Some).or(Ok(None));
    }
    Ok(None)
}

fn collect_conjuncts<'e>(expr: &'e Expr, out: &mut Vec<&'e Expr>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOp::And,
            right,
        } => {
            collect_conjuncts(left, out);
            collect_conjuncts(right, out);
        }
        other => out.push(other),
    }
}
