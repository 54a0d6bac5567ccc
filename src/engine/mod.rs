//! A compact reference engine: literal SELECTs, session statements, DML
//! acknowledgements, and `SHOW PROCESSLIST`. It exists so the binary runs
//! and the handler can be exercised end to end; production deployments
//! bring their own [`SqlEngine`].

mod split;

pub use split::split_statement;

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlparser::ast::{self, SelectItem, SetExpr, Statement};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use tracing::debug;

use crate::process::{process_list_rows, process_list_schema, ProcessList};
use crate::session::{SqlContext, AUTOCOMMIT_VAR};
use crate::sql::{
    new_ok_row, ok_result_schema, rows_to_iter, Column, Literal, OkResult, ParsedQuery, Row,
    RowIter, Schema, SqlEngine, SqlError, SqlType, Value,
};

#[derive(Debug, Clone)]
enum PlanExpr {
    Literal(Literal),
    /// Positional bind placeholder, named `v1`..`vN`.
    Placeholder(String),
}

#[derive(Debug, Clone)]
struct Projection {
    name: String,
    expr: PlanExpr,
}

#[derive(Debug, Clone)]
enum PlanKind {
    Select(Vec<Projection>),
    Set { name: String, value: Value },
    Use(String),
    Begin,
    Commit,
    Rollback,
    Dml(OkResult),
    ShowProcessList,
}

/// A plan produced by [`SimpleEngine`].
#[derive(Debug, Clone)]
pub struct SimplePlan {
    kind: PlanKind,
    schema: Schema,
}

impl ParsedQuery for SimplePlan {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct SimpleEngine {
    process_list: Arc<ProcessList>,
    prepared: Mutex<HashMap<u32, HashMap<String, SimplePlan>>>,
}

impl SimpleEngine {
    pub fn new(process_list: Arc<ProcessList>) -> Self {
        Self {
            process_list,
            prepared: Mutex::new(HashMap::new()),
        }
    }

    pub fn process_list(&self) -> Arc<ProcessList> {
        self.process_list.clone()
    }

    fn plan(&self, query: &str) -> Result<SimplePlan, SqlError> {
        let trimmed = query.trim().trim_end_matches(';').trim();
        if trimmed.is_empty() {
            return Err(SqlError::Parse("empty statement".into()));
        }

        let upper = trimmed.to_ascii_uppercase();
        if upper.starts_with("SET ") {
            return plan_set(trimmed);
        }
        if upper.starts_with("USE ") {
            let name = trimmed[4..].trim().trim_matches('`').to_string();
            return Ok(SimplePlan {
                kind: PlanKind::Use(name),
                schema: ok_result_schema(),
            });
        }
        if upper == "BEGIN" || upper.starts_with("START TRANSACTION") {
            return Ok(SimplePlan {
                kind: PlanKind::Begin,
                schema: ok_result_schema(),
            });
        }
        if upper.starts_with("COMMIT") {
            return Ok(SimplePlan {
                kind: PlanKind::Commit,
                schema: ok_result_schema(),
            });
        }
        if upper.starts_with("ROLLBACK") {
            return Ok(SimplePlan {
                kind: PlanKind::Rollback,
                schema: ok_result_schema(),
            });
        }
        if upper == "SHOW PROCESSLIST" || upper == "SHOW FULL PROCESSLIST" {
            return Ok(SimplePlan {
                kind: PlanKind::ShowProcessList,
                schema: process_list_schema(),
            });
        }

        let statements = Parser::parse_sql(&MySqlDialect {}, trimmed)
            .map_err(|e| SqlError::Parse(e.to_string()))?;
        let statement = statements
            .into_iter()
            .next()
            .ok_or_else(|| SqlError::Parse("empty statement".into()))?;

        match statement {
            Statement::Query(q) => plan_select(&q),
            Statement::Insert { source, .. } => {
                let rows_affected = source
                    .as_deref()
                    .and_then(|src| match src.body.as_ref() {
                        SetExpr::Values(values) => Some(values.rows.len() as u64),
                        _ => None,
                    })
                    .unwrap_or(0);
                Ok(SimplePlan {
                    kind: PlanKind::Dml(OkResult::new(rows_affected, 0)),
                    schema: ok_result_schema(),
                })
            }
            Statement::Update { .. } | Statement::Delete { .. } => Ok(SimplePlan {
                kind: PlanKind::Dml(OkResult::new(0, 0)),
                schema: ok_result_schema(),
            }),
            other => Err(SqlError::Analyze(format!(
                "unsupported statement: {}",
                statement_name(&other)
            ))),
        }
    }
}

fn statement_name(stmt: &Statement) -> String {
    stmt.to_string()
        .split_whitespace()
        .next()
        .unwrap_or("statement")
        .to_ascii_uppercase()
}

fn plan_set(stmt: &str) -> Result<SimplePlan, SqlError> {
    let rest = &stmt[4..];
    let (name, value) = rest
        .split_once('=')
        .ok_or_else(|| SqlError::Parse(format!("malformed SET: {stmt}")))?;
    let name = name
        .trim()
        .trim_start_matches("SESSION ")
        .trim_start_matches("session ")
        .trim_start_matches("@@")
        .to_ascii_lowercase();
    let value = parse_set_value(value.trim())?;
    Ok(SimplePlan {
        kind: PlanKind::Set { name, value },
        schema: ok_result_schema(),
    })
}

fn parse_set_value(raw: &str) -> Result<Value, SqlError> {
    let unquoted = raw.trim_matches('\'').trim_matches('"');
    if let Ok(n) = unquoted.parse::<i64>() {
        return Ok(Value::Int64(n));
    }
    match unquoted.to_ascii_lowercase().as_str() {
        "on" | "true" => Ok(Value::Int64(1)),
        "off" | "false" => Ok(Value::Int64(0)),
        "null" => Ok(Value::Null),
        _ => Ok(Value::Str(unquoted.to_string())),
    }
}

fn plan_select(query: &ast::Query) -> Result<SimplePlan, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Analyze("unsupported query shape".into())),
    };
    if !select.from.is_empty() {
        return Err(SqlError::Analyze("table scans are not supported".into()));
    }

    let mut placeholder_count = 0u32;
    let mut projections = Vec::with_capacity(select.projection.len());
    for item in &select.projection {
        let (expr, name) = match item {
            SelectItem::UnnamedExpr(expr) => (expr, expr.to_string()),
            SelectItem::ExprWithAlias { expr, alias } => (expr, alias.value.clone()),
            _ => return Err(SqlError::Analyze("wildcard projections are not supported".into())),
        };
        projections.push(Projection {
            name,
            expr: plan_expr(expr, &mut placeholder_count)?,
        });
    }

    let schema = projection_schema(&projections);
    Ok(SimplePlan {
        kind: PlanKind::Select(projections),
        schema,
    })
}

fn plan_expr(expr: &ast::Expr, placeholders: &mut u32) -> Result<PlanExpr, SqlError> {
    match expr {
        ast::Expr::Value(v) => plan_value(v, placeholders),
        ast::Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => match plan_expr(expr, placeholders)? {
            PlanExpr::Literal(Literal {
                value: Value::Int64(n),
                typ,
            }) => Ok(PlanExpr::Literal(Literal::new(Value::Int64(-n), typ))),
            PlanExpr::Literal(Literal {
                value: Value::Float64(f),
                typ,
            }) => Ok(PlanExpr::Literal(Literal::new(Value::Float64(-f), typ))),
            _ => Err(SqlError::Analyze(format!("unsupported expression: {expr}"))),
        },
        other => Err(SqlError::Analyze(format!("unsupported expression: {other}"))),
    }
}

fn plan_value(value: &ast::Value, placeholders: &mut u32) -> Result<PlanExpr, SqlError> {
    let lit = match value {
        ast::Value::Number(s, _) => {
            if s.contains('.') || s.contains('e') || s.contains('E') {
                let f: f64 = s
                    .parse()
                    .map_err(|_| SqlError::Parse(format!("bad number {s}")))?;
                Literal::new(Value::Float64(f), SqlType::Float64)
            } else {
                let n: i64 = s
                    .parse()
                    .map_err(|_| SqlError::Parse(format!("bad number {s}")))?;
                Literal::new(Value::Int64(n), SqlType::Int64)
            }
        }
        ast::Value::SingleQuotedString(s) | ast::Value::DoubleQuotedString(s) => {
            Literal::new(Value::Str(s.clone()), SqlType::VarChar(s.len() as u32))
        }
        ast::Value::Boolean(b) => Literal::new(Value::Int64(*b as i64), SqlType::Int64),
        ast::Value::Null => Literal::new(Value::Null, SqlType::Null),
        ast::Value::Placeholder(_) => {
            *placeholders += 1;
            return Ok(PlanExpr::Placeholder(format!("v{placeholders}")));
        }
        other => {
            return Err(SqlError::Analyze(format!("unsupported literal: {other}")));
        }
    };
    Ok(PlanExpr::Literal(lit))
}

fn projection_schema(projections: &[Projection]) -> Schema {
    projections
        .iter()
        .map(|p| {
            let typ = match &p.expr {
                PlanExpr::Literal(lit) => lit.typ.clone(),
                // Placeholder types are only known at execute time.
                PlanExpr::Placeholder(_) => SqlType::Text,
            };
            Column::new(p.name.clone(), typ)
        })
        .collect()
}

#[async_trait]
impl SqlEngine for SimpleEngine {
    fn parse(&self, _ctx: &SqlContext, query: &str) -> Result<Box<dyn ParsedQuery>, SqlError> {
        Ok(Box::new(self.plan(query)?))
    }

    fn parse_one(
        &self,
        ctx: &SqlContext,
        query: &str,
    ) -> (Option<Box<dyn ParsedQuery>>, String, String) {
        let (first, remainder) = split_statement(query);
        match self.plan(first) {
            Ok(plan) => (
                Some(Box::new(plan) as Box<dyn ParsedQuery>),
                first.to_string(),
                remainder.to_string(),
            ),
            Err(e) => {
                debug!(conn_id = ctx.conn_id(), error = %e, "parse_one failed");
                (None, first.to_string(), remainder.to_string())
            }
        }
    }

    fn prepare(&self, ctx: &SqlContext, query: &str) -> Result<Box<dyn ParsedQuery>, SqlError> {
        let plan = self.plan(query)?;
        self.prepared
            .lock()
            .unwrap()
            .entry(ctx.conn_id())
            .or_default()
            .insert(query.to_string(), plan.clone());
        Ok(Box::new(plan))
    }

    async fn query_with_bindings(
        &self,
        ctx: &SqlContext,
        query: &str,
        parsed: Option<Box<dyn ParsedQuery>>,
        bindings: Option<HashMap<String, Literal>>,
    ) -> Result<(Schema, Box<dyn RowIter>), SqlError> {
        let plan = match parsed {
            Some(p) => match p.as_any().downcast_ref::<SimplePlan>() {
                Some(plan) => plan.clone(),
                None => self.plan(query)?,
            },
            None => self.plan(query)?,
        };

        match plan.kind {
            PlanKind::Select(projections) => {
                let bindings = bindings.unwrap_or_default();
                let mut row: Row = Vec::with_capacity(projections.len());
                let mut schema = Schema::with_capacity(projections.len());
                for p in &projections {
                    let lit = match &p.expr {
                        PlanExpr::Literal(lit) => lit.clone(),
                        PlanExpr::Placeholder(name) => bindings
                            .get(name)
                            .cloned()
                            .ok_or_else(|| SqlError::Execution(format!("missing binding {name}")))?,
                    };
                    schema.push(Column::new(p.name.clone(), lit.typ));
                    row.push(lit.value);
                }
                Ok((schema, rows_to_iter(vec![row])))
            }
            PlanKind::Set { name, value } => {
                if name == AUTOCOMMIT_VAR {
                    ctx.session().set_variable(AUTOCOMMIT_VAR, value);
                } else {
                    ctx.session().set_variable(&name, value);
                }
                ok_iter()
            }
            PlanKind::Use(db) => {
                ctx.session().set_database(&db);
                ok_iter()
            }
            PlanKind::Begin => {
                ctx.session().begin_transaction();
                ok_iter()
            }
            PlanKind::Commit | PlanKind::Rollback => {
                ctx.session().end_transaction();
                ok_iter()
            }
            PlanKind::Dml(ok) => Ok((ok_result_schema(), rows_to_iter(vec![new_ok_row(ok)]))),
            PlanKind::ShowProcessList => Ok((
                process_list_schema(),
                rows_to_iter(process_list_rows(&self.process_list)),
            )),
        }
    }

    fn close_session(&self, conn_id: u32) {
        self.prepared.lock().unwrap().remove(&conn_id);
    }

    fn release_all_locks(&self, ctx: &SqlContext) -> Result<(), SqlError> {
        let released = ctx.session().take_locks();
        if !released.is_empty() {
            debug!(
                conn_id = ctx.conn_id(),
                count = released.len(),
                "released user locks"
            );
        }
        Ok(())
    }

    fn unlock_tables(&self, _ctx: &SqlContext, _conn_id: u32) -> Result<(), SqlError> {
        Ok(())
    }
}

fn ok_iter() -> Result<(Schema, Box<dyn RowIter>), SqlError> {
    Ok((
        ok_result_schema(),
        rows_to_iter(vec![new_ok_row(OkResult::default())]),
    ))
}
