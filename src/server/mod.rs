//! Per-connection wire loop: handshake, command dispatch to the query
//! handler, result framing back to the client.

mod conn;
mod results;
mod stmt;

pub use conn::{status_flags, Conn, Transport};
pub use results::WireResultWriter;
pub use stmt::{decode_stmt_execute, PreparedStatements, PreparedStmt};

use std::sync::Arc;

use bytes::Buf;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::handler::{Field, Handler, CHARSET_UTF8};
use crate::protocol::{
    capabilities, column_definition_packet, is_ssl_request, stmt_prepare_ok_packet, ClientCommand,
    EofPacket, ErrPacket, HandshakeResponse, InitialHandshake, OkPacket, Packet, PacketCodec,
};
use crate::sql::{PrepareData, SqlError, WireType};

/// Wire-session errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Client disconnected")]
    ClientDisconnected,
}

/// Run one client session on an accepted stream. `transport` carries the
/// socket descriptor when the stream is TCP, enabling the liveness poller.
pub async fn serve_connection<S>(
    handler: Arc<Handler>,
    stream: S,
    conn_id: u32,
    peer_host: String,
    transport: Transport,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut framed = Framed::new(stream, PacketCodec);

    let handshake = InitialHandshake::new(conn_id);
    framed.send(handshake.encode()).await?;

    let response_packet = framed
        .next()
        .await
        .ok_or(ServerError::ClientDisconnected)??;
    if is_ssl_request(&response_packet.payload) {
        let err = ErrPacket::new(3159, "HY000", "TLS connections are not supported");
        framed.send(err.encode(2, capabilities::DEFAULT_CAPABILITIES)).await?;
        return Err(ServerError::Protocol("client requested TLS".into()));
    }
    let response = HandshakeResponse::parse(&response_packet.payload)
        .ok_or_else(|| ServerError::Protocol("invalid handshake response".into()))?;

    debug!(
        conn_id,
        username = %response.username,
        database = ?response.database,
        "received handshake response"
    );

    let capability_flags = response.capability_flags;
    let conn = Conn::new(conn_id, response.username, peer_host, transport);
    handler.new_connection(&conn);

    if let Some(db) = &response.database {
        if let Err(e) = handler.com_init_db(&conn, db) {
            warn!(conn_id, error = %e, "failed to select startup database");
        }
    }

    // Credentials are accepted as offered; authentication enforcement is a
    // collaborator concern.
    let ok = OkPacket {
        affected_rows: 0,
        last_insert_id: 0,
        status_flags: conn.status(),
        warnings: 0,
    };
    framed.send(ok.encode(2, capability_flags)).await?;
    info!(conn_id, username = %conn.user(), "client authenticated");

    let result = command_loop(&handler, &conn, &mut framed, capability_flags).await;

    handler.connection_closed(&conn);
    result
}

async fn command_loop<S>(
    handler: &Handler,
    conn: &Conn,
    framed: &mut Framed<S, PacketCodec>,
    caps: u32,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut prepared = PreparedStatements::new();

    loop {
        let packet = match framed.next().await {
            Some(Ok(p)) => p,
            Some(Err(e)) => {
                error!(conn_id = conn.id(), error = %e, "client read error");
                return Err(e.into());
            }
            None => {
                info!(conn_id = conn.id(), "client disconnected");
                return Ok(());
            }
        };

        match ClientCommand::parse(&packet.payload) {
            ClientCommand::Quit => {
                info!(conn_id = conn.id(), "client sent QUIT");
                return Ok(());
            }
            ClientCommand::Ping => {
                send_ok(framed, conn, caps).await?;
            }
            ClientCommand::InitDb(db) => match handler.com_init_db(conn, &db) {
                Ok(()) => send_ok(framed, conn, caps).await?,
                Err(e) => send_sql_error(framed, caps, 1, &e).await?,
            },
            ClientCommand::Query(sql) => {
                handle_query(handler, conn, framed, caps, &sql).await?;
            }
            ClientCommand::StmtPrepare(sql) => {
                handle_stmt_prepare(handler, conn, framed, caps, &mut prepared, sql).await?;
            }
            ClientCommand::StmtExecute(payload) => {
                handle_stmt_execute(handler, conn, framed, caps, &prepared, payload).await?;
            }
            ClientCommand::StmtClose(id) => {
                // COM_STMT_CLOSE has no response.
                prepared.remove(id);
            }
            ClientCommand::ResetConnection => {
                handler.com_reset_connection(conn);
                send_ok(framed, conn, caps).await?;
            }
            ClientCommand::FieldList { .. } => {
                framed
                    .send(EofPacket::new(0, conn.status()).encode(1))
                    .await?;
            }
            ClientCommand::Unknown(code, _) => {
                warn!(conn_id = conn.id(), command = code, "unknown command");
                let err = ErrPacket::new(1047, "08S01", "Unknown command");
                framed.send(err.encode(1, caps)).await?;
            }
        }
    }
}

async fn handle_query<S>(
    handler: &Handler,
    conn: &Conn,
    framed: &mut Framed<S, PacketCodec>,
    caps: u32,
    sql: &str,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let multi = caps & capabilities::CLIENT_MULTI_STATEMENTS != 0
        && !conn.client_multi_statements_disabled();

    if !multi {
        let mut writer = WireResultWriter::new(framed, conn, caps);
        match handler.com_query(conn, sql, &mut writer).await {
            Ok(()) => {
                let warnings = handler.warning_count(conn);
                writer.finish(warnings).await.map_err(write_failure)?;
            }
            Err(e) => {
                let seq = writer.seq();
                send_sql_error(framed, caps, seq, &e).await?;
            }
        }
        return Ok(());
    }

    // Multi-statement mode: run one statement per pass until the handler
    // reports an empty remainder.
    let mut query = sql.to_string();
    loop {
        let mut writer = WireResultWriter::new(framed, conn, caps);
        match handler.com_multi_query(conn, &query, &mut writer).await {
            Ok(remainder) => {
                let warnings = handler.warning_count(conn);
                writer.finish(warnings).await.map_err(write_failure)?;
                if remainder.is_empty() {
                    return Ok(());
                }
                query = remainder;
            }
            Err(e) => {
                let seq = writer.seq();
                send_sql_error(framed, caps, seq, &e).await?;
                return Ok(());
            }
        }
    }
}

async fn handle_stmt_prepare<S>(
    handler: &Handler,
    conn: &Conn,
    framed: &mut Framed<S, PacketCodec>,
    caps: u32,
    prepared: &mut PreparedStatements,
    sql: String,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let fields = match handler.com_prepare(conn, &sql) {
        Ok(fields) => fields,
        Err(e) => return send_sql_error(framed, caps, 1, &e).await,
    };

    let column_count = fields.as_ref().map(|f| f.len()).unwrap_or(0) as u16;
    let (stmt_id, stmt) = prepared.insert(sql, fields.clone());
    let param_count = stmt.param_count;

    framed
        .feed(stmt_prepare_ok_packet(1, stmt_id, column_count, param_count))
        .await?;

    let mut seq = 2u8;
    if param_count > 0 {
        let placeholder = Field {
            name: "?".to_string(),
            typ: WireType::VarChar,
            charset: CHARSET_UTF8,
            column_length: 0,
            flags: 0,
        };
        for _ in 0..param_count {
            framed
                .feed(column_definition_packet(seq, &placeholder))
                .await?;
            seq = seq.wrapping_add(1);
        }
        framed
            .feed(EofPacket::new(0, conn.status()).encode(seq))
            .await?;
        seq = seq.wrapping_add(1);
    }
    if let Some(fields) = &fields {
        for field in fields {
            framed.feed(column_definition_packet(seq, field)).await?;
            seq = seq.wrapping_add(1);
        }
        framed
            .feed(EofPacket::new(0, conn.status()).encode(seq))
            .await?;
    }

    SinkExt::<Packet>::flush(framed).await?;
    Ok(())
}

async fn handle_stmt_execute<S>(
    handler: &Handler,
    conn: &Conn,
    framed: &mut Framed<S, PacketCodec>,
    caps: u32,
    prepared: &PreparedStatements,
    payload: bytes::Bytes,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if payload.len() < 4 {
        let err = SqlError::Parse("short COM_STMT_EXECUTE payload".into());
        return send_sql_error(framed, caps, 1, &err).await;
    }
    let mut head = &payload[..4];
    let stmt_id = head.get_u32_le();

    let Some(stmt) = prepared.get(stmt_id) else {
        let err = ErrPacket::new(1243, "HY000", "Unknown prepared statement handler");
        framed.send(err.encode(1, caps)).await?;
        return Ok(());
    };

    let bindings = match decode_stmt_execute(&payload, stmt.param_count) {
        Ok((_, bindings)) => bindings,
        Err(e) => return send_sql_error(framed, caps, 1, &e).await,
    };

    let prep = PrepareData {
        statement_id: stmt_id,
        query: stmt.query.clone(),
        bindings,
    };

    let mut writer = WireResultWriter::new(framed, conn, caps);
    match handler.com_stmt_execute(conn, &prep, &mut writer).await {
        Ok(()) => {
            let warnings = handler.warning_count(conn);
            writer.finish(warnings).await.map_err(write_failure)?;
        }
        Err(e) => {
            let seq = writer.seq();
            send_sql_error(framed, caps, seq, &e).await?;
        }
    }
    Ok(())
}

async fn send_ok<S>(
    framed: &mut Framed<S, PacketCodec>,
    conn: &Conn,
    caps: u32,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let ok = OkPacket {
        affected_rows: 0,
        last_insert_id: 0,
        status_flags: conn.status(),
        warnings: 0,
    };
    framed.send(ok.encode(1, caps)).await?;
    Ok(())
}

async fn send_sql_error<S>(
    framed: &mut Framed<S, PacketCodec>,
    caps: u32,
    seq: u8,
    e: &SqlError,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let err = ErrPacket::new(e.code(), e.sql_state(), &e.to_string());
    framed.send(err.encode(seq, caps)).await?;
    Ok(())
}

fn write_failure(e: SqlError) -> ServerError {
    ServerError::Protocol(e.to_string())
}
