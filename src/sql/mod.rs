//! Engine-facing data model: schemas, rows, the row iterator contract, and
//! the error kinds shared between the handler and its collaborators.

pub mod engine;
mod error;
mod types;

pub use engine::{MultiStmtMode, ParsedQuery, PrepareData, SqlEngine};
pub use error::{cast_sql_error, SqlError};
pub use types::{BindValue, Literal, SqlType, Value, WireType, BIT_TYPE_MAX_BITS};

use async_trait::async_trait;

use crate::session::SqlContext;

/// One engine row.
pub type Row = Vec<Value>;

/// A column of a result schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub typ: SqlType,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, typ: SqlType) -> Self {
        Self {
            name: name.into(),
            typ,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Ordered result schema.
pub type Schema = Vec<Column>;

/// In-band sentinel describing the outcome of a DML statement.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OkResult {
    pub rows_affected: u64,
    pub insert_id: u64,
    pub info: String,
}

impl OkResult {
    pub fn new(rows_affected: u64, insert_id: u64) -> Self {
        Self {
            rows_affected,
            insert_id,
            info: String::new(),
        }
    }
}

/// Name of the single column in the sentinel schema produced by plans that
/// yield an [`OkResult`] row instead of tabular data.
pub const OK_RESULT_COLUMN: &str = "__ok_result__";

pub fn ok_result_schema() -> Schema {
    vec![Column::new(OK_RESULT_COLUMN, SqlType::Int64)]
}

pub fn is_ok_result_schema(schema: &Schema) -> bool {
    schema.len() == 1 && schema[0].name == OK_RESULT_COLUMN
}

/// True when the row is an [`OkResult`] sentinel.
pub fn is_ok_result(row: &Row) -> bool {
    matches!(row.first(), Some(Value::Ok(_))) && row.len() == 1
}

pub fn new_ok_row(result: OkResult) -> Row {
    vec![Value::Ok(result)]
}

/// Lazy, finite sequence of rows produced by an executed plan.
///
/// `close` must be called exactly once on every exit path; well-behaved
/// iterators tolerate an idempotent second close.
#[async_trait]
pub trait RowIter: Send {
    async fn next(&mut self, ctx: &SqlContext) -> Result<Option<Row>, SqlError>;
    async fn close(&mut self, ctx: &SqlContext) -> Result<(), SqlError>;
}

/// Iterator over a pre-materialized row vector.
pub struct RowsIter {
    rows: std::vec::IntoIter<Row>,
}

#[async_trait]
impl RowIter for RowsIter {
    async fn next(&mut self, _ctx: &SqlContext) -> Result<Option<Row>, SqlError> {
        Ok(self.rows.next())
    }

    async fn close(&mut self, _ctx: &SqlContext) -> Result<(), SqlError> {
        Ok(())
    }
}

pub fn rows_to_iter(rows: Vec<Row>) -> Box<dyn RowIter> {
    Box::new(RowsIter {
        rows: rows.into_iter(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_result_row_detection() {
        let row = new_ok_row(OkResult::new(7, 42));
        assert!(is_ok_result(&row));
        assert!(!is_ok_result(&vec![Value::Int64(1)]));
        assert!(!is_ok_result(&vec![]));
    }

    #[test]
    fn ok_result_schema_detection() {
        assert!(is_ok_result_schema(&ok_result_schema()));
        let plain = vec![Column::new("a", SqlType::Int64)];
        assert!(!is_ok_result_schema(&plain));
    }
}
