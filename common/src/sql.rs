//! Subconjunto de SQL que entiende `SqlMapper`:
//!
//! ```text
//! SELECT <* | col [AS alias], ...> FROM <tabla>
//!   [WHERE <col> <op> <literal> [AND ...]]
//!   [LIMIT n]
//! ```
//!
//! El texto lo parsea `sqlparser`; el AST se baja a `SelectStmt` y todo lo
//! que quede fuera del subconjunto se rechaza. El parseo y la validación de
//! la tabla ocurren antes de tocar la plataforma.

use serde_json::{Map, Number, Value};
use sqlparser::{ast, dialect::GenericDialect, parser::Parser};
use std::cmp::Ordering;

use crate::engine::{op_filter, op_map, Record, Records};

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    All,
    /// (columna, alias)
    Columns(Vec<(String, Option<String>)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub field: String,
    pub op: CmpOp,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStmt {
    pub projection: Projection,
    pub table: String,
    pub predicates: Vec<Predicate>,
    pub limit: Option<usize>,
}

fn bad(what: &str) -> String {
    format!("{} is not supported in SqlMapper", what)
}

/// Nombre de columna: `col` o `t.col` (se queda con la última parte).
fn column(expr: &ast::Expr) -> Result<String, String> {
    match expr {
        ast::Expr::Identifier(id) => Ok(id.value.clone()),
        ast::Expr::CompoundIdentifier(parts) => parts
            .last()
            .map(|id| id.value.clone())
            .ok_or_else(|| bad("empty identifier")),
        other => Err(format!("expected column, found {}", other)),
    }
}

fn number_value(raw: &str, negative: bool) -> Result<Value, String> {
    let raw = if negative {
        format!("-{}", raw)
    } else {
        raw.to_string()
    };
    if let Ok(i) = raw.parse::<i64>() {
        return Ok(Value::Number(i.into()));
    }
    raw.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| format!("bad number literal {}", raw))
}

fn literal(expr: &ast::Expr) -> Result<Value, String> {
    match expr {
        ast::Expr::Value(v) => match v {
            ast::Value::Number(raw, _) => number_value(raw, false),
            ast::Value::SingleQuotedString(s) => Ok(Value::String(s.clone())),
            ast::Value::Boolean(b) => Ok(Value::Bool(*b)),
            ast::Value::Null => Ok(Value::Null),
            other => Err(format!("unsupported literal {}", other)),
        },
        ast::Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => match expr.as_ref() {
            ast::Expr::Value(ast::Value::Number(raw, _)) => number_value(raw, true),
            other => Err(format!("expected literal, found -{}", other)),
        },
        ast::Expr::Nested(inner) => literal(inner),
        other => Err(format!("expected literal, found {}", other)),
    }
}

fn cmp_op(op: &ast::BinaryOperator) -> Option<CmpOp> {
    match op {
        ast::BinaryOperator::Eq => Some(CmpOp::Eq),
        ast::BinaryOperator::NotEq => Some(CmpOp::Ne),
        ast::BinaryOperator::Lt => Some(CmpOp::Lt),
        ast::BinaryOperator::LtEq => Some(CmpOp::Le),
        ast::BinaryOperator::Gt => Some(CmpOp::Gt),
        ast::BinaryOperator::GtEq => Some(CmpOp::Ge),
        _ => None,
    }
}

/// Aplana `a AND b AND ...` en una lista de comparaciones `col <op> literal`.
fn predicates(expr: &ast::Expr, out: &mut Vec<Predicate>) -> Result<(), String> {
    match expr {
        ast::Expr::Nested(inner) => predicates(inner, out),
        ast::Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            predicates(left, out)?;
            predicates(right, out)
        }
        ast::Expr::BinaryOp { left, op, right } => {
            let op = cmp_op(op).ok_or_else(|| bad(&format!("operator {}", op)))?;
            out.push(Predicate {
                field: column(left)?,
                op,
                value: literal(right)?,
            });
            Ok(())
        }
        other => Err(bad(&format!("condition {}", other))),
    }
}

fn projection(items: &[ast::SelectItem]) -> Result<Projection, String> {
    if let [ast::SelectItem::Wildcard(_)] = items {
        return Ok(Projection::All);
    }
    let mut cols = Vec::with_capacity(items.len());
    for item in items {
        match item {
            ast::SelectItem::UnnamedExpr(e) => cols.push((column(e)?, None)),
            ast::SelectItem::ExprWithAlias { expr, alias } => {
                cols.push((column(expr)?, Some(alias.value.clone())))
            }
            _ => return Err(bad("mixing * with columns")),
        }
    }
    Ok(Projection::Columns(cols))
}

fn table(select: &ast::Select) -> Result<String, String> {
    let [from] = select.from.as_slice() else {
        return Err("expected exactly one table in FROM".to_string());
    };
    if !from.joins.is_empty() {
        return Err(bad("JOIN"));
    }
    match &from.relation {
        ast::TableFactor::Table {
            name, alias: None, ..
        } => name
            .0
            .last()
            .map(|id| id.value.clone())
            .ok_or_else(|| bad("empty table name")),
        ast::TableFactor::Table { .. } => Err(bad("table alias")),
        other => Err(bad(&format!("FROM {}", other))),
    }
}

fn lower_select(select: &ast::Select) -> Result<(Projection, String, Vec<Predicate>), String> {
    if select.distinct.is_some() {
        return Err(bad("DISTINCT"));
    }
    if select.top.is_some() || select.into.is_some() {
        return Err(bad("TOP/INTO"));
    }
    if !matches!(&select.group_by, ast::GroupByExpr::Expressions(e) if e.is_empty()) {
        return Err(bad("GROUP BY"));
    }
    if select.having.is_some() {
        return Err(bad("HAVING"));
    }

    let mut preds = Vec::new();
    if let Some(cond) = &select.selection {
        predicates(cond, &mut preds)?;
    }
    Ok((projection(&select.projection)?, table(select)?, preds))
}

fn lower_query(query: &ast::Query) -> Result<SelectStmt, String> {
    if query.with.is_some() {
        return Err(bad("WITH"));
    }
    if !query.order_by.is_empty() {
        return Err(bad("ORDER BY"));
    }
    if query.offset.is_some() || query.fetch.is_some() {
        return Err(bad("OFFSET/FETCH"));
    }

    let ast::SetExpr::Select(select) = query.body.as_ref() else {
        return Err(bad("compound query"));
    };
    let (projection, table, predicates) = lower_select(select)?;

    let limit = match &query.limit {
        None => None,
        Some(ast::Expr::Value(ast::Value::Number(raw, _))) => Some(
            raw.parse::<usize>()
                .map_err(|_| "LIMIT expects a non-negative integer".to_string())?,
        ),
        Some(_) => return Err("LIMIT expects a non-negative integer".to_string()),
    };

    Ok(SelectStmt {
        projection,
        table,
        predicates,
        limit,
    })
}

/// Parsea una sentencia. Sólo se acepta un SELECT dentro del subconjunto.
pub fn parse(sql: &str) -> Result<SelectStmt, String> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql).map_err(|e| e.to_string())?;

    match statements.as_slice() {
        [ast::Statement::Query(query)] => lower_query(query),
        [_] => Err("only SELECT statements are supported".to_string()),
        _ => Err(format!("expected one statement, found {}", statements.len())),
    }
}

/// Parsea y comprueba que la consulta sólo lea de la tabla declarada.
pub fn validate(sql: &str, table_alias: &str) -> Result<SelectStmt, String> {
    let stmt = parse(sql)?;
    if stmt.table != table_alias {
        return Err(format!(
            "table {} is not declared, only {} is visible",
            stmt.table, table_alias
        ));
    }
    Ok(stmt)
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        // los CSV llegan como texto
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn compare(field: &Value, lit: &Value) -> Option<Ordering> {
    match lit {
        Value::Number(_) => as_f64(field)?.partial_cmp(&as_f64(lit)?),
        Value::String(l) => match field {
            Value::String(f) => Some(f.as_str().cmp(l.as_str())),
            Value::Number(n) => Some(n.to_string().as_str().cmp(l.as_str())),
            _ => None,
        },
        Value::Bool(l) => field.as_bool().map(|f| f.cmp(l)),
        Value::Null => Some(if field.is_null() {
            Ordering::Equal
        } else {
            Ordering::Greater
        }),
        _ => None,
    }
}

impl Predicate {
    fn matches(&self, rec: &Record) -> bool {
        let field = rec.get(&self.field).unwrap_or(&Value::Null);
        let Some(ord) = compare(field, &self.value) else {
            // tipos incomparables: sólo != es verdadero
            return self.op == CmpOp::Ne;
        };
        match self.op {
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::Ne => ord != Ordering::Equal,
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Le => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Ge => ord != Ordering::Less,
        }
    }
}

impl SelectStmt {
    /// WHERE -> proyección -> LIMIT sobre los registros de la tabla.
    pub fn execute(&self, input: Records) -> Records {
        let filtered = op_filter(input, |rec| self.predicates.iter().all(|p| p.matches(rec)));

        let mut out = match &self.projection {
            Projection::All => filtered,
            Projection::Columns(cols) => op_map(filtered, |rec| {
                let mut obj = Map::new();
                for (col, alias) in cols {
                    let v = rec.get(col).cloned().unwrap_or(Value::Null);
                    obj.insert(alias.clone().unwrap_or_else(|| col.clone()), v);
                }
                Value::Object(obj)
            }),
        };

        if let Some(n) = self.limit {
            out.truncate(n);
        }
        out
    }
}
