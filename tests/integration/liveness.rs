//! Out-of-band disconnect detection through the socket liveness poller.
//!
//! Linux only: the poller reads `/proc/net/tcp`. On other platforms the
//! poller exits immediately and queries rely on the read timeout alone.

#![cfg(target_os = "linux")]

use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use marlin::handler::HandlerOptions;
use marlin::server::Transport;

use crate::support::{int_schema, CollectingSink, IterScript, ScriptedEngine};

#[tokio::test]
async fn broken_peer_socket_aborts_the_query() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let client = std::net::TcpStream::connect(addr).unwrap();
    let (server_stream, _) = listener.accept().await.unwrap();

    let transport = Transport::Tcp {
        raw_fd: server_stream.as_raw_fd(),
        local_port: addr.port(),
    };

    // The engine never produces a row; only the poller can end this query.
    let engine = Arc::new(
        ScriptedEngine::new(int_schema(), Vec::new()).with_script(IterScript {
            block_until_cancelled: true,
            ..Default::default()
        }),
    );
    let (handler, conn) =
        crate::support::setup_with_transport(engine.clone(), HandlerOptions::default(), transport);

    // Close the client side shortly after the query starts.
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        drop(client);
    });

    let started = Instant::now();
    let mut sink = CollectingSink::new();
    let err = handler
        .com_query(&conn, "SELECT n", &mut sink)
        .await
        .unwrap_err();

    // ConnectionWasClosed, cast to its wire representation.
    assert_eq!(err.code(), 1053);
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "poller took too long: {:?}",
        started.elapsed()
    );
    assert_eq!(engine.close_count(), 1);
    assert!(handler.session_manager().process_list().is_empty());

    drop(server_stream);
}

#[tokio::test]
async fn non_tcp_transport_relies_on_timeouts_only() {
    // With Transport::Other the poller exits immediately; the query still
    // completes normally.
    let engine = Arc::new(ScriptedEngine::new(int_schema(), crate::support::int_rows(3)));
    let (handler, conn) = crate::support::setup(engine.clone(), HandlerOptions::default());
    let mut sink = CollectingSink::new();

    handler.com_query(&conn, "SELECT n", &mut sink).await.unwrap();
    assert_eq!(sink.batch_sizes(), vec![3]);
    assert_eq!(engine.close_count(), 1);
}
