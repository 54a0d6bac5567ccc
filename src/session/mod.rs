//! Per-connection server state and the per-query execution context.
//!
//! The [`SessionManager`] owns the connection-id → session mapping; sessions
//! are created on `NewConnection` and destroyed on `ConnectionClosed`. A
//! [`SqlContext`] is derived from a session for the duration of one query.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{info_span, Span};

use crate::process::ProcessList;
use crate::server::Conn;
use crate::sql::{SqlError, Value};

/// Session variable controlling the autocommit status bit.
pub const AUTOCOMMIT_VAR: &str = "autocommit";

/// Per-connection server state.
#[derive(Debug)]
pub struct Session {
    id: u32,
    user: String,
    host: String,
    database: Mutex<String>,
    vars: Mutex<HashMap<String, Value>>,
    warning_count: AtomicU16,
    in_transaction: AtomicBool,
    locks: Mutex<Vec<String>>,
}

impl Session {
    pub fn new(id: u32, user: impl Into<String>, host: impl Into<String>) -> Self {
        let mut vars = HashMap::new();
        vars.insert(AUTOCOMMIT_VAR.to_string(), Value::Int64(1));
        Self {
            id,
            user: user.into(),
            host: host.into(),
            database: Mutex::new(String::new()),
            vars: Mutex::new(vars),
            warning_count: AtomicU16::new(0),
            in_transaction: AtomicBool::new(false),
            locks: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn database(&self) -> String {
        self.database.lock().unwrap().clone()
    }

    pub fn set_database(&self, name: &str) {
        *self.database.lock().unwrap() = name.to_string();
    }

    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.vars.lock().unwrap().get(name).cloned()
    }

    pub fn set_variable(&self, name: &str, value: Value) {
        self.vars.lock().unwrap().insert(name.to_string(), value);
    }

    /// Truthiness of the `autocommit` session variable.
    pub fn autocommit(&self) -> bool {
        match self.get_variable(AUTOCOMMIT_VAR) {
            Some(Value::Int64(n)) => n != 0,
            Some(Value::Uint64(n)) => n != 0,
            Some(Value::Str(s)) => {
                let s = s.to_ascii_lowercase();
                s == "1" || s == "on" || s == "true"
            }
            Some(Value::Null) | None => false,
            Some(_) => true,
        }
    }

    pub fn warning_count(&self) -> u16 {
        self.warning_count.load(Ordering::Relaxed)
    }

    pub fn add_warning(&self) {
        self.warning_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn clear_warnings(&self) {
        self.warning_count.store(0, Ordering::Relaxed);
    }

    pub fn begin_transaction(&self) {
        self.in_transaction.store(true, Ordering::Relaxed);
    }

    pub fn end_transaction(&self) {
        self.in_transaction.store(false, Ordering::Relaxed);
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::Relaxed)
    }

    pub fn add_lock(&self, name: &str) {
        self.locks.lock().unwrap().push(name.to_string());
    }

    /// Take every held user lock, leaving the session with none.
    pub fn take_locks(&self) -> Vec<String> {
        std::mem::take(&mut *self.locks.lock().unwrap())
    }
}

/// Owns the mapping from connection id to session. All mutations are safe
/// under concurrent `NewConnection`/`ConnectionClosed`.
pub struct SessionManager {
    process_list: Arc<ProcessList>,
    sessions: Mutex<HashMap<u32, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(process_list: Arc<ProcessList>) -> Self {
        Self {
            process_list,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn process_list(&self) -> Arc<ProcessList> {
        self.process_list.clone()
    }

    pub fn add_conn(&self, conn: &Conn) {
        let session = Arc::new(Session::new(conn.id(), conn.user(), conn.peer_host()));
        self.sessions.lock().unwrap().insert(conn.id(), session);
    }

    pub fn remove_conn(&self, conn: &Conn) {
        self.sessions.lock().unwrap().remove(&conn.id());
    }

    pub fn session(&self, conn: &Conn) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().get(&conn.id()).cloned()
    }

    pub fn set_db(&self, conn: &Conn, name: &str) -> Result<(), SqlError> {
        let session = self
            .session(conn)
            .ok_or(SqlError::ConnectionNotFound(conn.id()))?;
        session.set_database(name);
        Ok(())
    }

    /// Derive an execution context for one query on this connection.
    pub fn new_context(&self, conn: &Conn) -> Result<SqlContext, SqlError> {
        self.new_context_with_query(conn, "")
    }

    pub fn new_context_with_query(&self, conn: &Conn, query: &str) -> Result<SqlContext, SqlError> {
        let session = self
            .session(conn)
            .ok_or(SqlError::ConnectionNotFound(conn.id()))?;
        Ok(SqlContext::new(
            session,
            self.process_list.clone(),
            query.to_string(),
        ))
    }
}

/// Short-lived execution context for a single query. Cheap to clone; clones
/// share the session, process list, and cancellation token.
#[derive(Debug, Clone)]
pub struct SqlContext {
    session: Arc<Session>,
    process_list: Arc<ProcessList>,
    query: Arc<str>,
    token: CancellationToken,
    span: Span,
}

impl SqlContext {
    fn new(session: Arc<Session>, process_list: Arc<ProcessList>, query: String) -> Self {
        let span = info_span!("query", conn_id = session.id(), query = tracing::field::Empty);
        Self {
            session,
            process_list,
            query: query.into(),
            token: CancellationToken::new(),
            span,
        }
    }

    pub fn conn_id(&self) -> u32 {
        self.session.id()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn process_list(&self) -> &Arc<ProcessList> {
        &self.process_list
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// A copy of this context carrying a different query string. Session,
    /// process list, token, and span are shared with the original.
    pub fn with_query(&self, query: &str) -> Self {
        let mut ctx = self.clone();
        ctx.query = query.into();
        ctx
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// A token cancelled together with this context, for scoping sub-tasks.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the context is cancelled.
    pub async fn done(&self) {
        self.token.cancelled().await
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Attach the rendered query text to this context's span.
    pub fn record_query_field(&self, rendered: &str) {
        self.span.record("query", rendered);
    }
}

/// Build a standalone context for tests and tools that do not go through a
/// [`SessionManager`].
#[doc(hidden)]
pub fn test_context(conn_id: u32) -> SqlContext {
    SqlContext::new(
        Arc::new(Session::new(conn_id, "test_user", "localhost")),
        Arc::new(ProcessList::new()),
        String::new(),
    )
}
