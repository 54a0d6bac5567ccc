//! The seam between the protocol handler and the query engine.
//!
//! The handler never parses or executes SQL itself; it drives an engine
//! through this trait and streams whatever iterator comes back.

use std::any::Any;
use std::collections::HashMap;

use async_trait::async_trait;

use super::{Literal, RowIter, Schema, SqlError};
use crate::session::SqlContext;

/// Whether a query string may contain multiple semicolon-separated
/// statements. In `On` mode only the first statement is parsed per pass and
/// the remainder is handed back to the caller verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiStmtMode {
    Off,
    On,
}

/// An engine plan. Opaque to the handler apart from its result schema.
pub trait ParsedQuery: Send + Sync {
    fn schema(&self) -> &Schema;

    /// Downcast hook for the owning engine.
    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
pub trait SqlEngine: Send + Sync {
    /// Parse a single statement.
    fn parse(&self, ctx: &SqlContext, query: &str) -> Result<Box<dyn ParsedQuery>, SqlError>;

    /// Parse only the first statement of a possibly multi-statement string.
    ///
    /// Returns `(plan, first_statement_text, remainder)`. A parse failure
    /// yields `(None, "", query)` so the caller surfaces the error through a
    /// subsequent [`parse`](Self::parse) of the same text.
    fn parse_one(
        &self,
        ctx: &SqlContext,
        query: &str,
    ) -> (Option<Box<dyn ParsedQuery>>, String, String);

    /// Parse and analyze a statement for later execution, caching the plan
    /// keyed by the context's connection id.
    fn prepare(&self, ctx: &SqlContext, query: &str) -> Result<Box<dyn ParsedQuery>, SqlError>;

    /// Execute a plan (parsing `query` first when `parsed` is `None`) and
    /// return the result schema plus a row iterator.
    async fn query_with_bindings(
        &self,
        ctx: &SqlContext,
        query: &str,
        parsed: Option<Box<dyn ParsedQuery>>,
        bindings: Option<HashMap<String, Literal>>,
    ) -> Result<(Schema, Box<dyn RowIter>), SqlError>;

    /// Drop all engine-side state for a closed connection.
    fn close_session(&self, conn_id: u32);

    /// Release every user lock held by the context's session.
    fn release_all_locks(&self, ctx: &SqlContext) -> Result<(), SqlError>;

    /// Release table locks held by the given connection.
    fn unlock_tables(&self, ctx: &SqlContext, conn_id: u32) -> Result<(), SqlError>;
}

/// A prepared statement as delivered by the protocol layer: the statement
/// text plus its bind variables in wire form.
#[derive(Debug, Clone, Default)]
pub struct PrepareData {
    pub statement_id: u32,
    pub query: String,
    pub bindings: HashMap<String, super::BindValue>,
}
