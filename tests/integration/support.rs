//! Shared test scaffolding: a scripted engine, a scripted row iterator, and
//! a collecting result sink.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use marlin::engine::split_statement;
use marlin::handler::{Handler, HandlerOptions, QueryResult, ResultSink};
use marlin::process::ProcessList;
use marlin::server::{Conn, Transport};
use marlin::session::{SessionManager, SqlContext};
use marlin::sql::{
    Literal, ParsedQuery, Row, RowIter, Schema, SqlEngine, SqlError,
};

/// How the scripted iterator behaves before yielding its rows.
#[derive(Debug, Clone, Default)]
pub struct IterScript {
    /// Sleep this long before producing the first row.
    pub delay_before_first: Option<Duration>,
    /// Return an error instead of the row at this index.
    pub fail_at: Option<(usize, String)>,
    /// Instead of producing rows, wait for context cancellation and then
    /// report end-of-stream.
    pub block_until_cancelled: bool,
}

pub struct ScriptedIter {
    rows: std::vec::IntoIter<Row>,
    pos: usize,
    script: IterScript,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl RowIter for ScriptedIter {
    async fn next(&mut self, ctx: &SqlContext) -> Result<Option<Row>, SqlError> {
        if self.script.block_until_cancelled {
            ctx.done().await;
            return Ok(None);
        }
        if self.pos == 0 {
            if let Some(delay) = self.script.delay_before_first {
                tokio::time::sleep(delay).await;
            }
        }
        if let Some((at, msg)) = &self.script.fail_at {
            if self.pos == *at {
                return Err(SqlError::Execution(msg.clone()));
            }
        }
        self.pos += 1;
        Ok(self.rows.next())
    }

    async fn close(&mut self, _ctx: &SqlContext) -> Result<(), SqlError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct ScriptedPlan {
    schema: Schema,
}

impl ParsedQuery for ScriptedPlan {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Engine that serves the same scripted result for every query.
pub struct ScriptedEngine {
    pub schema: Schema,
    pub rows: Vec<Row>,
    pub script: IterScript,
    /// Queries starting with this prefix fail to parse.
    pub reject_prefix: Option<String>,
    pub closes: Arc<AtomicUsize>,
    pub bindings_seen: Mutex<Option<HashMap<String, Literal>>>,
    pub sessions_closed: Arc<AtomicUsize>,
}

impl ScriptedEngine {
    pub fn new(schema: Schema, rows: Vec<Row>) -> Self {
        Self {
            schema,
            rows,
            script: IterScript::default(),
            reject_prefix: None,
            closes: Arc::new(AtomicUsize::new(0)),
            bindings_seen: Mutex::new(None),
            sessions_closed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_script(mut self, script: IterScript) -> Self {
        self.script = script;
        self
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SqlEngine for ScriptedEngine {
    fn parse(&self, _ctx: &SqlContext, query: &str) -> Result<Box<dyn ParsedQuery>, SqlError> {
        if let Some(prefix) = &self.reject_prefix {
            if query.starts_with(prefix.as_str()) {
                return Err(SqlError::Parse(format!("syntax error near {query:?}")));
            }
        }
        Ok(Box::new(ScriptedPlan {
            schema: self.schema.clone(),
        }))
    }

    fn parse_one(
        &self,
        ctx: &SqlContext,
        query: &str,
    ) -> (Option<Box<dyn ParsedQuery>>, String, String) {
        let (first, remainder) = split_statement(query);
        match self.parse(ctx, first) {
            Ok(plan) => (Some(plan), first.to_string(), remainder.to_string()),
            Err(_) => (None, first.to_string(), remainder.to_string()),
        }
    }

    fn prepare(&self, ctx: &SqlContext, query: &str) -> Result<Box<dyn ParsedQuery>, SqlError> {
        self.parse(ctx, query)
    }

    async fn query_with_bindings(
        &self,
        _ctx: &SqlContext,
        _query: &str,
        _parsed: Option<Box<dyn ParsedQuery>>,
        bindings: Option<HashMap<String, Literal>>,
    ) -> Result<(Schema, Box<dyn RowIter>), SqlError> {
        *self.bindings_seen.lock().unwrap() = bindings;
        let iter = ScriptedIter {
            rows: self.rows.clone().into_iter(),
            pos: 0,
            script: self.script.clone(),
            closes: self.closes.clone(),
        };
        Ok((self.schema.clone(), Box::new(iter)))
    }

    fn close_session(&self, _conn_id: u32) {
        self.sessions_closed.fetch_add(1, Ordering::SeqCst);
    }

    fn release_all_locks(&self, ctx: &SqlContext) -> Result<(), SqlError> {
        ctx.session().take_locks();
        Ok(())
    }

    fn unlock_tables(&self, _ctx: &SqlContext, _conn_id: u32) -> Result<(), SqlError> {
        Ok(())
    }
}

/// Sink that copies every delivered batch, optionally failing on one.
#[derive(Default)]
pub struct CollectingSink {
    pub batches: Vec<(QueryResult, bool)>,
    /// Fail the 0-based n-th `send` call.
    pub fail_on_call: Option<usize>,
    calls: usize,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(call: usize) -> Self {
        Self {
            fail_on_call: Some(call),
            ..Default::default()
        }
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.iter().map(|(r, _)| r.rows.len()).collect()
    }
}

#[async_trait]
impl ResultSink for CollectingSink {
    async fn send(&mut self, result: &QueryResult, more: bool) -> Result<(), SqlError> {
        let call = self.calls;
        self.calls += 1;
        if self.fail_on_call == Some(call) {
            return Err(SqlError::Execution("sink rejected batch".into()));
        }
        self.batches.push((result.clone(), more));
        Ok(())
    }
}

/// Handler + registered connection over the given engine.
pub fn setup(engine: Arc<dyn SqlEngine>, options: HandlerOptions) -> (Handler, Conn) {
    setup_with_transport(engine, options, Transport::Other)
}

pub fn setup_with_transport(
    engine: Arc<dyn SqlEngine>,
    options: HandlerOptions,
    transport: Transport,
) -> (Handler, Conn) {
    let process_list = Arc::new(ProcessList::new());
    let sm = Arc::new(SessionManager::new(process_list));
    let handler = Handler::new(engine, sm, options);
    let conn = Conn::new(1, "tester", "127.0.0.1:4000", transport);
    handler.new_connection(&conn);
    (handler, conn)
}

pub fn int_rows(n: usize) -> Vec<Row> {
    (0..n)
        .map(|i| vec![marlin::sql::Value::Int64(i as i64)])
        .collect()
}

pub fn int_schema() -> Schema {
    vec![marlin::sql::Column::new("n", marlin::sql::SqlType::Int64)]
}
