//! The protocol-facing query handler: binds the MySQL command surface
//! (`COM_QUERY`, `COM_STMT_EXECUTE`, ...) to the engine and streams result
//! batches back through a caller-supplied sink.
//!
//! Each query runs as a producer/consumer/liveness-poller triad under a
//! single cancellation scope; see [`Handler::do_query`].

mod bindings;

pub use bindings::bindings_to_exprs;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument};

use crate::metrics::{metrics, ServerEventListener};
use crate::server::{status_flags, Conn, Transport};
use crate::session::{SessionManager, SqlContext};
use crate::sockstate::{self, SockState, SockStateError};
use crate::sql::{
    cast_sql_error, is_ok_result, is_ok_result_schema, BindValue, Literal, MultiStmtMode, OkResult,
    ParsedQuery, PrepareData, Row, RowIter, Schema, SqlEngine, SqlError, Value,
};

/// Rows per result batch delivered to the sink.
pub const ROWS_BATCH: usize = 128;

/// Capacity of the producer → consumer row channel. Four batches of
/// headroom hide iterator latency jitter without unbounded buffering.
const ROW_CHANNEL_CAP: usize = 512;

/// Interval between socket liveness checks.
const TCP_CHECKER_SLEEP: Duration = Duration::from_secs(1);

/// Consumer wake-up interval when no read timeout is configured; firing is
/// a no-op and only lets the loop observe cancellation.
const DEFAULT_ROW_WAIT: Duration = Duration::from_secs(60);

pub const CHARSET_UTF8: u16 = 33;
pub const CHARSET_BINARY: u16 = 63;

/// One column of a wire result set.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub typ: crate::sql::WireType,
    pub charset: u16,
    pub column_length: u32,
    pub flags: u16,
}

pub mod field_flags {
    pub const NOT_NULL: u16 = 0x0001;
    pub const BINARY: u16 = 0x0080;
}

/// A batch of results in wire form. For tabular batches `rows_affected`
/// doubles as the row count; for DML outcomes it carries the affected-row
/// count and `rows` stays empty.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub fields: Vec<Field>,
    pub rows: Vec<Vec<Option<Bytes>>>,
    pub rows_affected: u64,
    pub insert_id: u64,
    pub info: String,
}

impl QueryResult {
    pub fn with_fields(fields: Vec<Field>) -> Self {
        Self {
            fields,
            ..Default::default()
        }
    }
}

/// Receives result batches as they are produced. `more` is true when
/// multi-statement mode still holds unexecuted statements.
#[async_trait]
pub trait ResultSink: Send {
    async fn send(&mut self, result: &QueryResult, more: bool) -> Result<(), SqlError>;
}

/// Construction-time handler options, typically read from the `[handler]`
/// config section.
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    /// Maximum idle time between rows; zero disables the check.
    pub read_timeout: Duration,
    /// Forbid semicolon-separated multi-statements from clients.
    pub disable_multi_stmts: bool,
    /// Truncate logged queries to this length; negative disables query
    /// logging, zero means unlimited.
    pub max_logged_query_len: i64,
    /// Base64-encode logged queries instead of whitespace-normalizing them.
    pub encode_logged_query: bool,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::ZERO,
            disable_multi_stmts: false,
            max_logged_query_len: 1024,
            encode_logged_query: false,
        }
    }
}

/// Connection handler for a SQL engine, implementing the server side of the
/// MySQL command protocol.
pub struct Handler {
    engine: Arc<dyn SqlEngine>,
    sm: Arc<SessionManager>,
    read_timeout: Duration,
    disable_multi_stmts: bool,
    max_logged_query_len: i64,
    encode_logged_query: bool,
    listener: Option<Arc<dyn ServerEventListener>>,
}

impl Handler {
    pub fn new(engine: Arc<dyn SqlEngine>, sm: Arc<SessionManager>, options: HandlerOptions) -> Self {
        Self {
            engine,
            sm,
            read_timeout: options.read_timeout,
            disable_multi_stmts: options.disable_multi_stmts,
            max_logged_query_len: options.max_logged_query_len,
            encode_logged_query: options.encode_logged_query,
            listener: None,
        }
    }

    /// Attach a lifecycle event listener (connection/query metrics).
    pub fn with_listener(mut self, listener: Arc<dyn ServerEventListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.sm
    }

    /// Report a newly established connection.
    pub fn new_connection(&self, conn: &Conn) {
        if let Some(l) = &self.listener {
            l.client_connected();
        }
        self.sm.add_conn(conn);
        conn.set_disable_client_multi_statements(self.disable_multi_stmts);
        info!(
            conn_id = conn.id(),
            disable_client_multi_statements = self.disable_multi_stmts,
            "new connection"
        );
    }

    pub fn com_init_db(&self, conn: &Conn, db: &str) -> Result<(), SqlError> {
        self.sm.set_db(conn, db)
    }

    /// Parse and analyze a statement for later execution. Returns the result
    /// schema fields, or `None` when the plan produces no row schema.
    pub fn com_prepare(&self, conn: &Conn, query: &str) -> Result<Option<Vec<Field>>, SqlError> {
        let ctx = self.sm.new_context_with_query(conn, query)?;
        let analyzed = self
            .engine
            .prepare(&ctx, query)
            .map_err(cast_sql_error)?;
        if is_ok_result_schema(analyzed.schema()) {
            return Ok(None);
        }
        Ok(Some(schema_to_fields(analyzed.schema())))
    }

    /// Execute a prepared plan with its bind variables.
    pub async fn com_stmt_execute(
        &self,
        conn: &Conn,
        prepare: &PrepareData,
        sink: &mut dyn ResultSink,
    ) -> Result<(), SqlError> {
        self.error_wrapped_do_query(
            conn,
            &prepare.query,
            MultiStmtMode::Off,
            Some(&prepare.bindings),
            sink,
        )
        .await
        .map(|_| ())
    }

    /// Execute a single statement.
    pub async fn com_query(
        &self,
        conn: &Conn,
        query: &str,
        sink: &mut dyn ResultSink,
    ) -> Result<(), SqlError> {
        self.error_wrapped_do_query(conn, query, MultiStmtMode::Off, None, sink)
            .await
            .map(|_| ())
    }

    /// Execute the first statement of `query` and return the unexecuted
    /// remainder. Callers iterate until the remainder is empty.
    pub async fn com_multi_query(
        &self,
        conn: &Conn,
        query: &str,
        sink: &mut dyn ResultSink,
    ) -> Result<String, SqlError> {
        self.error_wrapped_do_query(conn, query, MultiStmtMode::On, None, sink)
            .await
    }

    // TODO: implement session reset once the engine exposes it.
    pub fn com_reset_connection(&self, _conn: &Conn) {}

    /// Report a closed connection. Every teardown step runs even if prior
    /// steps fail.
    pub fn connection_closed(&self, conn: &Conn) {
        match self.sm.new_context(conn) {
            Ok(ctx) => {
                if let Err(e) = self.engine.release_all_locks(&ctx) {
                    tracing::error!(conn_id = conn.id(), error = %e, "unable to release all locks on session close");
                }
                if let Err(e) = self.engine.unlock_tables(&ctx, conn.id()) {
                    tracing::error!(conn_id = conn.id(), error = %e, "unable to unlock tables on session close");
                }
            }
            Err(e) => {
                tracing::error!(conn_id = conn.id(), error = %e, "unable to release locks on session close");
            }
        }

        self.engine.close_session(conn.id());
        self.sm.remove_conn(conn);

        if let Some(l) = &self.listener {
            l.client_disconnected();
        }
        info!(conn_id = conn.id(), "connection closed");
    }

    /// Current warning count, for the trailing EOF/OK packet.
    pub fn warning_count(&self, conn: &Conn) -> u16 {
        match self.sm.session(conn) {
            Some(sess) => sess.warning_count(),
            None => 0,
        }
    }

    /// Run `do_query`, record query lifecycle metrics, and cast errors to
    /// their client-facing SQL representation.
    async fn error_wrapped_do_query(
        &self,
        conn: &Conn,
        query: &str,
        mode: MultiStmtMode,
        bindings: Option<&HashMap<String, BindValue>>,
        sink: &mut dyn ResultSink,
    ) -> Result<String, SqlError> {
        let start = Instant::now();
        if let Some(l) = &self.listener {
            l.query_started();
        }

        let result = self
            .do_query(conn, query, mode, bindings, sink)
            .await
            .map_err(cast_sql_error);

        metrics().record_query(result.is_ok(), start.elapsed().as_secs_f64());
        if let Some(l) = &self.listener {
            l.query_completed(result.is_ok(), start.elapsed());
        }

        result
    }

    /// The per-query execution pipeline: parse, bind, register in the
    /// process list, stream rows, update status flags, deregister.
    async fn do_query(
        &self,
        conn: &Conn,
        query: &str,
        mode: MultiStmtMode,
        bindings: Option<&HashMap<String, BindValue>>,
        sink: &mut dyn ResultSink,
    ) -> Result<String, SqlError> {
        let ctx = self.sm.new_context(conn)?;

        let mut query = query.to_string();
        let mut remainder = String::new();
        let mut parsed = None;
        if mode == MultiStmtMode::On {
            let (p, prequery, rest) = self.engine.parse_one(&ctx, &query);
            parsed = p;
            remainder = rest;
            if !prequery.is_empty() {
                query = prequery;
            }
        }

        let ctx = ctx.with_query(&query);
        let more = !remainder.is_empty();

        if self.encode_logged_query || self.max_logged_query_len >= 0 {
            let rendered = self.render_query_for_log(&query);
            ctx.record_query_field(&rendered);
        }
        debug!(parent: ctx.span(), "starting query");

        let start = Instant::now();

        let parsed = match parsed {
            Some(p) => p,
            None => self.engine.parse(&ctx, &query)?,
        };

        trace!(parent: ctx.span(), "beginning execution");

        let sql_bindings = match bindings {
            Some(b) if !b.is_empty() => match bindings_to_exprs(b) {
                Ok(exprs) => Some(exprs),
                Err(e) => {
                    tracing::error!(parent: ctx.span(), error = %e, "error processing bindings");
                    return Err(e);
                }
            },
            _ => None,
        };

        // Register before anything is spawned; the entry is removed exactly
        // once after status flags and the final batch have gone out.
        ctx.process_list().begin_query(&ctx, &query);
        let result = self
            .stream_query(&ctx, conn, &query, parsed, sql_bindings, more, sink)
            .await;
        ctx.process_list().end_query(&ctx);

        match result {
            Ok(()) => {
                debug!(
                    parent: ctx.span(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "query finished"
                );
                Ok(remainder)
            }
            Err(e) => {
                warn!(parent: ctx.span(), error = %e, "error running query");
                Err(e)
            }
        }
    }

    /// Drive the producer/consumer/poller triad for one plan and deliver
    /// batches to the sink.
    #[allow(clippy::too_many_arguments)]
    async fn stream_query(
        &self,
        ctx: &SqlContext,
        conn: &Conn,
        query: &str,
        parsed: Box<dyn ParsedQuery>,
        bindings: Option<HashMap<String, Literal>>,
        more: bool,
        sink: &mut dyn ResultSink,
    ) -> Result<(), SqlError> {
        let (schema, row_iter) = self
            .engine
            .query_with_bindings(ctx, query, Some(parsed), bindings)
            .await?;

        let (tx, mut rx) = mpsc::channel::<Row>(ROW_CHANNEL_CAP);

        // Producer: pull rows off the iterator into the channel. The
        // iterator travels through the task and comes back at join time so
        // it is closed exactly once, after producer and consumer are done.
        let producer = tokio::spawn(
            produce_rows(ctx.clone(), row_iter, tx).instrument(ctx.span().clone()),
        );

        // Liveness poller, under its own sub-scope so the consumer can stop
        // it when the stream completes first.
        let poll_token = ctx.child_token();
        let poller = {
            let ctx = ctx.clone();
            let span = ctx.span().clone();
            let token = poll_token.clone();
            let transport = conn.transport();
            tokio::spawn(
                async move {
                    let res = poll_for_closed_connection(&ctx, token, transport).await;
                    if res.is_err() {
                        ctx.cancel();
                    }
                    res
                }
                .instrument(span),
            )
        };

        let wait_time = if self.read_timeout > Duration::ZERO {
            self.read_timeout
        } else {
            DEFAULT_ROW_WAIT
        };

        let fields = schema_to_fields(&schema);
        let mut result: Option<QueryResult> = None;
        let mut processed_at_least_one_batch = false;

        // Consumer: batch rows and hand them to the sink, waking on the
        // per-row timer to notice timeouts and cancellation.
        let consumer_res: Result<(), SqlError> = {
            let _poll_guard = poll_token.drop_guard();
            let timer = tokio::time::sleep(wait_time);
            tokio::pin!(timer);

            loop {
                let r = result.get_or_insert_with(|| QueryResult::with_fields(fields.clone()));

                if r.rows_affected == ROWS_BATCH as u64 {
                    if let Err(e) = sink.send(r, more).await {
                        break Err(e);
                    }
                    result = None;
                    processed_at_least_one_batch = true;
                    continue;
                }

                tokio::select! {
                    _ = ctx.done() => break Ok(()),
                    row = rx.recv() => {
                        let Some(row) = row else { break Ok(()) };
                        if is_ok_result(&row) {
                            if !r.rows.is_empty() {
                                panic!("got OkResult mixed with row data");
                            }
                            let Value::Ok(ok) = &row[0] else { unreachable!() };
                            result = Some(result_from_ok_result(ok.clone()));
                            continue;
                        }
                        match row_to_wire(&schema, &row) {
                            Ok(output_row) => {
                                trace!(parent: ctx.span(), "spooling result row");
                                r.rows.push(output_row);
                                r.rows_affected += 1;
                            }
                            Err(e) => break Err(e),
                        }
                    }
                    _ = &mut timer => {
                        if self.read_timeout > Duration::ZERO {
                            trace!(parent: ctx.span(), "row read timeout");
                            break Err(SqlError::RowTimeout);
                        }
                    }
                }

                timer.as_mut().reset(tokio::time::Instant::now() + wait_time);
            }
        };
        if consumer_res.is_err() {
            ctx.cancel();
        }
        // Leaving the block dropped the poll guard, cancelling the poller.

        let (producer_res, mut iter) = producer
            .await
            .map_err(|e| SqlError::Execution(format!("row producer failed: {e}")))?;
        let close_res = iter.close(ctx).await;
        let poller_res = poller
            .await
            .map_err(|e| SqlError::Execution(format!("liveness poller failed: {e}")))?;

        let close_err = close_res.err();
        if let Some(e) = &close_err {
            warn!(parent: ctx.span(), error = %e, "error closing row iter");
        }

        // One terminal error propagates; a pipeline error outranks a
        // close error from the iterator.
        if let Some(e) = consumer_res
            .err()
            .or(producer_res.err())
            .or(poller_res.err())
            .or(close_err)
        {
            return Err(e);
        }

        set_conn_status_flags(ctx, conn);

        // A trailing empty batch is only sent when nothing was delivered
        // yet, so empty results still produce their schema.
        if let Some(r) = &result {
            if !(r.rows_affected == 0 && processed_at_least_one_batch) {
                sink.send(r, more).await?;
            }
        }

        Ok(())
    }

    fn render_query_for_log(&self, query: &str) -> String {
        if self.encode_logged_query {
            return BASE64.encode(query.as_bytes());
        }

        static QUERY_WS: OnceLock<Regex> = OnceLock::new();
        let re = QUERY_WS.get_or_init(|| Regex::new(r"[\r\n\t ]+").unwrap());
        let mut s = re.replace_all(query, " ").into_owned();
        if self.max_logged_query_len > 0 && s.len() > self.max_logged_query_len as usize {
            let mut cut = self.max_logged_query_len as usize;
            while !s.is_char_boundary(cut) {
                cut -= 1;
            }
            s.truncate(cut);
            s.push_str("...");
        }
        s
    }
}

/// Producer half of the pipeline. Returns the iterator so the caller can
/// close it after the consumer has also finished.
async fn produce_rows(
    ctx: SqlContext,
    mut iter: Box<dyn RowIter>,
    tx: mpsc::Sender<Row>,
) -> (Result<(), SqlError>, Box<dyn RowIter>) {
    let res = loop {
        if ctx.is_cancelled() {
            break Ok(());
        }
        match iter.next(&ctx).await {
            Ok(Some(row)) => {
                tokio::select! {
                    _ = ctx.done() => break Ok(()),
                    sent = tx.send(row) => {
                        if sent.is_err() {
                            break Ok(());
                        }
                    }
                }
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    if res.is_err() {
        ctx.cancel();
    }
    (res, iter)
}

/// Periodically poll the connection socket to detect a client-side close,
/// returning an error if the socket broke. Exits silently on platforms
/// without socket state checks.
async fn poll_for_closed_connection(
    ctx: &SqlContext,
    token: CancellationToken,
    transport: Transport,
) -> Result<(), SqlError> {
    let Transport::Tcp { raw_fd, local_port } = transport else {
        trace!(parent: ctx.span(), "connection checker exiting, connection isn't TCP");
        return Ok(());
    };

    let inode = match sockstate::socket_inode(raw_fd) {
        Ok(inode) if inode != 0 => inode,
        Ok(_) => return Ok(()),
        Err(SockStateError::Unsupported) => return Ok(()),
        Err(e) => {
            trace!(parent: ctx.span(), error = %e, "connection checker exiting, could not resolve inode");
            return Ok(());
        }
    };

    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = tokio::time::sleep(TCP_CHECKER_SLEEP) => {}
        }

        match sockstate::inode_sock_state(local_port, inode) {
            Ok(SockState::Broken) => {
                warn!(parent: ctx.span(), "socket state is broken, returning error");
                return Err(SqlError::ConnectionWasClosed);
            }
            Ok(SockState::Established) => {
                // The check is not free; the sleep above spaces them out.
            }
            Err(e) => {
                warn!(parent: ctx.span(), error = %e, "connection checker exiting, got err checking sockstate");
                return Ok(());
            }
        }
    }
}

/// Reflect session autocommit and transaction state onto the connection's
/// status flags. This is the only writer of these two bits.
fn set_conn_status_flags(ctx: &SqlContext, conn: &Conn) {
    let session = ctx.session();
    if session.autocommit() {
        conn.set_status_flag(status_flags::SERVER_STATUS_AUTOCOMMIT);
    } else {
        conn.clear_status_flag(status_flags::SERVER_STATUS_AUTOCOMMIT);
    }

    if session.in_transaction() {
        conn.set_status_flag(status_flags::SERVER_STATUS_IN_TRANS);
    } else {
        conn.clear_status_flag(status_flags::SERVER_STATUS_IN_TRANS);
    }
}

pub fn schema_to_fields(schema: &Schema) -> Vec<Field> {
    schema
        .iter()
        .map(|c| {
            let binary = c.typ.is_binary();
            let mut flags = 0;
            if !c.nullable {
                flags |= field_flags::NOT_NULL;
            }
            if binary {
                flags |= field_flags::BINARY;
            }
            Field {
                name: c.name.clone(),
                typ: c.typ.wire_type(),
                charset: if binary { CHARSET_BINARY } else { CHARSET_UTF8 },
                column_length: c.typ.max_response_len(),
                flags,
            }
        })
        .collect()
}

fn row_to_wire(schema: &Schema, row: &Row) -> Result<Vec<Option<Bytes>>, SqlError> {
    let mut out = Vec::with_capacity(row.len());
    for (i, v) in row.iter().enumerate() {
        if v.is_null() {
            out.push(None);
            continue;
        }
        let col = schema.get(i).ok_or_else(|| {
            SqlError::Execution(format!("row has {} values but schema has {}", row.len(), schema.len()))
        })?;
        out.push(Some(col.typ.sql_format(v)?));
    }
    Ok(out)
}

fn result_from_ok_result(ok: OkResult) -> QueryResult {
    QueryResult {
        fields: Vec::new(),
        rows: Vec::new(),
        rows_affected: ok.rows_affected,
        insert_id: ok.insert_id,
        info: ok.info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{Column, SqlType};

    #[test]
    fn schema_to_fields_charsets() {
        let schema = vec![
            Column::new("name", SqlType::VarChar(16)),
            Column::new("payload", SqlType::Blob),
        ];
        let fields = schema_to_fields(&schema);
        assert_eq!(fields[0].charset, CHARSET_UTF8);
        assert_eq!(fields[1].charset, CHARSET_BINARY);
    }

    #[test]
    fn row_to_wire_null_and_values() {
        let schema = vec![
            Column::new("a", SqlType::Int64),
            Column::new("b", SqlType::VarChar(8)),
        ];
        let row = vec![Value::Null, Value::Str("x".into())];
        let wire = row_to_wire(&schema, &row).unwrap();
        assert_eq!(wire[0], None);
        assert_eq!(wire[1], Some(Bytes::from_static(b"x")));
    }

    #[test]
    fn row_wider_than_schema_is_an_error() {
        let schema = vec![Column::new("a", SqlType::Int64)];
        let row = vec![Value::Int64(1), Value::Int64(2)];
        assert!(row_to_wire(&schema, &row).is_err());
    }

    #[test]
    fn query_log_rendering() {
        let pl = Arc::new(crate::process::ProcessList::new());
        let engine = Arc::new(crate::engine::SimpleEngine::new(pl.clone()));
        let sm = Arc::new(SessionManager::new(pl));
        let mk = |max, encode| {
            Handler::new(
                engine.clone(),
                sm.clone(),
                HandlerOptions {
                    max_logged_query_len: max,
                    encode_logged_query: encode,
                    ..Default::default()
                },
            )
        };

        let h = mk(0, false);
        assert_eq!(
            h.render_query_for_log("SELECT\t1\r\n  FROM   dual"),
            "SELECT 1 FROM dual"
        );

        let h = mk(8, false);
        assert_eq!(h.render_query_for_log("SELECT 1 FROM dual"), "SELECT 1...");

        let h = mk(0, true);
        assert_eq!(h.render_query_for_log("SELECT 1"), BASE64.encode("SELECT 1"));
    }

    #[test]
    fn ok_result_conversion() {
        let r = result_from_ok_result(OkResult::new(7, 42));
        assert_eq!(r.rows_affected, 7);
        assert_eq!(r.insert_id, 42);
        assert!(r.rows.is_empty());
        assert!(r.fields.is_empty());
    }
}
