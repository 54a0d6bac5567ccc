//! Row streaming pipeline behavior: batching, timeouts, cancellation, and
//! resource cleanup.

use std::sync::Arc;
use std::time::Duration;

use marlin::handler::HandlerOptions;
use marlin::server::status_flags;
use marlin::session::AUTOCOMMIT_VAR;
use marlin::sql::{new_ok_row, ok_result_schema, OkResult, Value};

use crate::support::{int_rows, int_schema, CollectingSink, IterScript, ScriptedEngine};

#[tokio::test]
async fn batches_of_128_with_short_tail() {
    let engine = Arc::new(ScriptedEngine::new(int_schema(), int_rows(300)));
    let (handler, conn) = crate::support::setup(engine.clone(), HandlerOptions::default());
    let mut sink = CollectingSink::new();

    handler.com_query(&conn, "SELECT n", &mut sink).await.unwrap();

    assert_eq!(sink.batch_sizes(), vec![128, 128, 44]);
    assert!(sink.batches.iter().all(|(_, more)| !more));
    assert_eq!(engine.close_count(), 1);
    assert!(handler.session_manager().process_list().is_empty());
}

#[tokio::test]
async fn exact_multiple_of_batch_size_sends_no_empty_tail() {
    let engine = Arc::new(ScriptedEngine::new(int_schema(), int_rows(256)));
    let (handler, conn) = crate::support::setup(engine.clone(), HandlerOptions::default());
    let mut sink = CollectingSink::new();

    handler.com_query(&conn, "SELECT n", &mut sink).await.unwrap();

    assert_eq!(sink.batch_sizes(), vec![128, 128]);
    assert_eq!(engine.close_count(), 1);
}

#[tokio::test]
async fn empty_result_delivers_one_empty_batch_with_fields() {
    let engine = Arc::new(ScriptedEngine::new(int_schema(), Vec::new()));
    let (handler, conn) = crate::support::setup(engine.clone(), HandlerOptions::default());
    let mut sink = CollectingSink::new();

    handler.com_query(&conn, "SELECT n", &mut sink).await.unwrap();

    assert_eq!(sink.batches.len(), 1);
    let (batch, more) = &sink.batches[0];
    assert!(batch.rows.is_empty());
    assert_eq!(batch.fields.len(), 1);
    assert_eq!(batch.fields[0].name, "n");
    assert!(!more);
    assert_eq!(engine.close_count(), 1);
}

#[tokio::test]
async fn row_timeout_fires_and_cleans_up() {
    let engine = Arc::new(
        ScriptedEngine::new(int_schema(), int_rows(5)).with_script(IterScript {
            delay_before_first: Some(Duration::from_millis(400)),
            ..Default::default()
        }),
    );
    let (handler, conn) = crate::support::setup(
        engine.clone(),
        HandlerOptions {
            read_timeout: Duration::from_millis(50),
            ..Default::default()
        },
    );
    let mut sink = CollectingSink::new();

    let err = handler
        .com_query(&conn, "SELECT n", &mut sink)
        .await
        .unwrap_err();

    // Cast to the client-facing representation of the row timeout.
    assert_eq!(err.code(), 1159);
    assert!(sink.batches.is_empty());
    assert_eq!(engine.close_count(), 1);
    assert!(handler.session_manager().process_list().is_empty());
}

#[tokio::test]
async fn ok_result_replaces_the_batch() {
    let mut ok = OkResult::new(7, 42);
    ok.info = "Rows matched: 7".to_string();
    let engine = Arc::new(ScriptedEngine::new(
        ok_result_schema(),
        vec![new_ok_row(ok)],
    ));
    let (handler, conn) = crate::support::setup(engine.clone(), HandlerOptions::default());
    let mut sink = CollectingSink::new();

    handler
        .com_query(&conn, "UPDATE t SET x = 1", &mut sink)
        .await
        .unwrap();

    assert_eq!(sink.batches.len(), 1);
    let (batch, more) = &sink.batches[0];
    assert_eq!(batch.rows_affected, 7);
    assert_eq!(batch.insert_id, 42);
    assert_eq!(batch.info, "Rows matched: 7");
    assert!(batch.rows.is_empty());
    assert!(batch.fields.is_empty());
    assert!(!more);
    assert_eq!(engine.close_count(), 1);
}

#[tokio::test]
#[should_panic(expected = "OkResult mixed with row data")]
async fn mixing_ok_result_with_rows_is_fatal() {
    let mut rows = int_rows(1);
    rows.push(new_ok_row(OkResult::new(1, 0)));
    let engine = Arc::new(ScriptedEngine::new(int_schema(), rows));
    let (handler, conn) = crate::support::setup(engine, HandlerOptions::default());
    let mut sink = CollectingSink::new();

    let _ = handler.com_query(&conn, "SELECT n", &mut sink).await;
}

#[tokio::test]
async fn sink_error_cancels_the_query() {
    let engine = Arc::new(ScriptedEngine::new(int_schema(), int_rows(4096)));
    let (handler, conn) = crate::support::setup(engine.clone(), HandlerOptions::default());
    let mut sink = CollectingSink::failing_on(0);

    let err = handler
        .com_query(&conn, "SELECT n", &mut sink)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("sink rejected batch"));
    assert!(sink.batches.is_empty());
    assert_eq!(engine.close_count(), 1);
    assert!(handler.session_manager().process_list().is_empty());
}

#[tokio::test]
async fn iterator_error_propagates_and_closes() {
    let engine = Arc::new(
        ScriptedEngine::new(int_schema(), int_rows(300)).with_script(IterScript {
            fail_at: Some((100, "storage gave up".to_string())),
            ..Default::default()
        }),
    );
    let (handler, conn) = crate::support::setup(engine.clone(), HandlerOptions::default());
    let mut sink = CollectingSink::new();

    let err = handler
        .com_query(&conn, "SELECT n", &mut sink)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("storage gave up"));
    assert_eq!(engine.close_count(), 1);
    assert!(handler.session_manager().process_list().is_empty());
}

#[tokio::test]
async fn parse_error_is_cast_and_skips_registration() {
    let mut engine = ScriptedEngine::new(int_schema(), int_rows(1));
    engine.reject_prefix = Some("BAD".to_string());
    let engine = Arc::new(engine);
    let (handler, conn) = crate::support::setup(engine.clone(), HandlerOptions::default());
    let mut sink = CollectingSink::new();

    let err = handler
        .com_query(&conn, "BAD SYNTAX", &mut sink)
        .await
        .unwrap_err();

    assert_eq!(err.code(), 1064);
    assert_eq!(err.sql_state(), "42000");
    assert_eq!(engine.close_count(), 0);
    assert!(handler.session_manager().process_list().is_empty());
}

#[tokio::test]
async fn status_flags_reflect_session_state() {
    let engine = Arc::new(ScriptedEngine::new(int_schema(), int_rows(1)));
    let (handler, conn) = crate::support::setup(engine.clone(), HandlerOptions::default());
    let session = handler.session_manager().session(&conn).unwrap();

    // Autocommit on, no transaction.
    let mut sink = CollectingSink::new();
    handler.com_query(&conn, "SELECT n", &mut sink).await.unwrap();
    assert_ne!(conn.status() & status_flags::SERVER_STATUS_AUTOCOMMIT, 0);
    assert_eq!(conn.status() & status_flags::SERVER_STATUS_IN_TRANS, 0);

    // Autocommit off, open transaction.
    session.set_variable(AUTOCOMMIT_VAR, Value::Int64(0));
    session.begin_transaction();
    let mut sink = CollectingSink::new();
    handler.com_query(&conn, "SELECT n", &mut sink).await.unwrap();
    assert_eq!(conn.status() & status_flags::SERVER_STATUS_AUTOCOMMIT, 0);
    assert_ne!(conn.status() & status_flags::SERVER_STATUS_IN_TRANS, 0);
}

#[tokio::test]
async fn multi_statement_remainder_round_trip() {
    let engine = Arc::new(ScriptedEngine::new(int_schema(), int_rows(2)));
    let (handler, conn) = crate::support::setup(engine.clone(), HandlerOptions::default());

    let mut sink = CollectingSink::new();
    let remainder = handler
        .com_multi_query(&conn, "SELECT 1; SELECT 2", &mut sink)
        .await
        .unwrap();
    assert_eq!(remainder, "SELECT 2");
    assert!(sink.batches.iter().all(|(_, more)| *more));

    let mut sink = CollectingSink::new();
    let remainder = handler
        .com_multi_query(&conn, &remainder, &mut sink)
        .await
        .unwrap();
    assert_eq!(remainder, "");
    assert!(sink.batches.iter().all(|(_, more)| !more));
}
