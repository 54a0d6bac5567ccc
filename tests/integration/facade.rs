//! Facade entry points driven through the reference engine.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use marlin::engine::SimpleEngine;
use marlin::handler::{Handler, HandlerOptions};
use marlin::process::ProcessList;
use marlin::server::{Conn, Transport};
use marlin::session::SessionManager;
use marlin::sql::{BindValue, PrepareData, SqlError, WireType};

use crate::support::CollectingSink;

fn simple_setup() -> (Handler, Conn) {
    let process_list = Arc::new(ProcessList::new());
    let engine = Arc::new(SimpleEngine::new(process_list.clone()));
    let sm = Arc::new(SessionManager::new(process_list));
    let handler = Handler::new(engine, sm, HandlerOptions::default());
    let conn = Conn::new(1, "tester", "127.0.0.1:4000", Transport::Other);
    handler.new_connection(&conn);
    (handler, conn)
}

#[tokio::test]
async fn multi_query_executes_statement_at_a_time() {
    let (handler, conn) = simple_setup();

    let mut sink = CollectingSink::new();
    let remainder = handler
        .com_multi_query(&conn, "SELECT 1; SELECT 2", &mut sink)
        .await
        .unwrap();
    assert_eq!(remainder, "SELECT 2");
    assert_eq!(sink.batches.len(), 1);
    let (batch, more) = &sink.batches[0];
    assert_eq!(batch.rows[0][0], Some(Bytes::from_static(b"1")));
    assert!(more);

    let mut sink = CollectingSink::new();
    let remainder = handler
        .com_multi_query(&conn, &remainder, &mut sink)
        .await
        .unwrap();
    assert_eq!(remainder, "");
    let (batch, more) = &sink.batches[0];
    assert_eq!(batch.rows[0][0], Some(Bytes::from_static(b"2")));
    assert!(!more);
}

#[tokio::test]
async fn stmt_execute_coerces_and_substitutes_bindings() {
    let (handler, conn) = simple_setup();

    let mut bindings = HashMap::new();
    bindings.insert(
        "v1".to_string(),
        BindValue::new(WireType::Int32, Bytes::from_static(b"42")),
    );
    bindings.insert(
        "v2".to_string(),
        BindValue::new(WireType::VarChar, Bytes::from_static(b"hi")),
    );
    let prepare = PrepareData {
        statement_id: 1,
        query: "SELECT ?, ?".to_string(),
        bindings,
    };

    let mut sink = CollectingSink::new();
    handler
        .com_stmt_execute(&conn, &prepare, &mut sink)
        .await
        .unwrap();

    assert_eq!(sink.batches.len(), 1);
    let (batch, _) = &sink.batches[0];
    assert_eq!(batch.rows.len(), 1);
    assert_eq!(batch.rows[0][0], Some(Bytes::from_static(b"42")));
    assert_eq!(batch.rows[0][1], Some(Bytes::from_static(b"hi")));
}

#[tokio::test]
async fn stmt_execute_rejects_unsupported_bind_type() {
    let (handler, conn) = simple_setup();

    let mut bindings = HashMap::new();
    bindings.insert(
        "v1".to_string(),
        BindValue::new(WireType::Json, Bytes::from_static(b"{}")),
    );
    let prepare = PrepareData {
        statement_id: 1,
        query: "SELECT ?".to_string(),
        bindings,
    };

    let mut sink = CollectingSink::new();
    let err = handler
        .com_stmt_execute(&conn, &prepare, &mut sink)
        .await
        .unwrap_err();
    assert_eq!(err.code(), 1235);
    assert!(sink.batches.is_empty());
}

#[tokio::test]
async fn prepare_returns_fields_or_none() {
    let (handler, conn) = simple_setup();

    let fields = handler.com_prepare(&conn, "SELECT 1, 'x'").unwrap().unwrap();
    assert_eq!(fields.len(), 2);

    let none = handler
        .com_prepare(&conn, "INSERT INTO t VALUES (1)")
        .unwrap();
    assert!(none.is_none());
}

#[tokio::test]
async fn init_db_sets_current_database() {
    let (handler, conn) = simple_setup();
    handler.com_init_db(&conn, "inventory").unwrap();
    let session = handler.session_manager().session(&conn).unwrap();
    assert_eq!(session.database(), "inventory");
}

#[tokio::test]
async fn init_db_unknown_connection() {
    let (handler, _) = simple_setup();
    let stranger = Conn::new(99, "ghost", "nowhere", Transport::Other);
    match handler.com_init_db(&stranger, "db") {
        Err(SqlError::ConnectionNotFound(99)) => {}
        other => panic!("expected ConnectionNotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn warning_count_follows_session() {
    let (handler, conn) = simple_setup();
    assert_eq!(handler.warning_count(&conn), 0);

    let session = handler.session_manager().session(&conn).unwrap();
    session.add_warning();
    session.add_warning();
    assert_eq!(handler.warning_count(&conn), 2);

    let stranger = Conn::new(42, "ghost", "nowhere", Transport::Other);
    assert_eq!(handler.warning_count(&stranger), 0);
}

#[tokio::test]
async fn connection_closed_tears_down_every_layer() {
    let process_list = Arc::new(ProcessList::new());
    let engine = Arc::new(SimpleEngine::new(process_list.clone()));
    let sm = Arc::new(SessionManager::new(process_list));
    let handler = Handler::new(engine.clone(), sm, HandlerOptions::default());
    let conn = Conn::new(1, "tester", "127.0.0.1:4000", Transport::Other);
    handler.new_connection(&conn);

    // Session holds a user lock and a cached prepared plan.
    let session = handler.session_manager().session(&conn).unwrap();
    session.add_lock("app_lock");
    handler.com_prepare(&conn, "SELECT 1").unwrap();

    handler.connection_closed(&conn);

    assert!(handler.session_manager().session(&conn).is_none());
    // Closing again must not panic even though the session is gone.
    handler.connection_closed(&conn);
}

#[tokio::test]
async fn show_processlist_reports_the_running_query() {
    let (handler, conn) = simple_setup();

    let mut sink = CollectingSink::new();
    handler
        .com_query(&conn, "SHOW PROCESSLIST", &mut sink)
        .await
        .unwrap();

    assert_eq!(sink.batches.len(), 1);
    let (batch, _) = &sink.batches[0];
    assert_eq!(batch.fields.len(), 8);
    assert_eq!(batch.fields[0].name, "Id");
    assert_eq!(batch.rows.len(), 1);
    // The SHOW PROCESSLIST query itself is registered while it runs.
    assert_eq!(batch.rows[0][0], Some(Bytes::from_static(b"1")));
    assert_eq!(batch.rows[0][6], Some(Bytes::from_static(b"running")));
    assert_eq!(
        batch.rows[0][7],
        Some(Bytes::from_static(b"SHOW PROCESSLIST"))
    );

    // And deregistered afterwards.
    assert!(handler.session_manager().process_list().is_empty());
}

#[tokio::test]
async fn session_statements_flow_through_the_pipeline() {
    let (handler, conn) = simple_setup();
    let session = handler.session_manager().session(&conn).unwrap();

    let mut sink = CollectingSink::new();
    handler
        .com_query(&conn, "SET autocommit = 0", &mut sink)
        .await
        .unwrap();
    assert!(!session.autocommit());
    // The SET result is an OkResult batch.
    assert_eq!(sink.batches[0].0.rows_affected, 0);
    assert!(sink.batches[0].0.fields.is_empty());

    let mut sink = CollectingSink::new();
    handler.com_query(&conn, "BEGIN", &mut sink).await.unwrap();
    assert!(session.in_transaction());
    assert_ne!(
        conn.status() & marlin::server::status_flags::SERVER_STATUS_IN_TRANS,
        0
    );

    let mut sink = CollectingSink::new();
    handler.com_query(&conn, "COMMIT", &mut sink).await.unwrap();
    assert!(!session.in_transaction());
    assert_eq!(
        conn.status() & marlin::server::status_flags::SERVER_STATUS_IN_TRANS,
        0
    );
}

#[tokio::test]
async fn values_render_in_wire_format() {
    let (handler, conn) = simple_setup();
    let mut sink = CollectingSink::new();
    handler
        .com_query(&conn, "SELECT 1.5, 'text', NULL, true", &mut sink)
        .await
        .unwrap();
    let (batch, _) = &sink.batches[0];
    assert_eq!(batch.rows[0][0], Some(Bytes::from_static(b"1.5")));
    assert_eq!(batch.rows[0][1], Some(Bytes::from_static(b"text")));
    assert_eq!(batch.rows[0][2], None);
    assert_eq!(batch.rows[0][3], Some(Bytes::from_static(b"1")));
}
