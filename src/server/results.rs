//! Bridges the handler's result sink onto a framed MySQL stream: column
//! definitions and rows go out as they are produced, the terminating OK or
//! EOF packet is written by [`WireResultWriter::finish`].

use async_trait::async_trait;
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use super::conn::{status_flags, Conn};
use crate::handler::{QueryResult, ResultSink};
use crate::protocol::{
    column_count_packet, column_definition_packet, row_packet, EofPacket, OkPacket, Packet,
    PacketCodec,
};
use crate::sql::SqlError;

pub struct WireResultWriter<'a, S> {
    framed: &'a mut Framed<S, PacketCodec>,
    conn: &'a Conn,
    capabilities: u32,
    seq: u8,
    started: bool,
    more: bool,
    ok: Option<(u64, u64, String)>,
}

impl<'a, S> WireResultWriter<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// `seq` continues the sequence of the command packet, so responses
    /// start at 1.
    pub fn new(framed: &'a mut Framed<S, PacketCodec>, conn: &'a Conn, capabilities: u32) -> Self {
        Self {
            framed,
            conn,
            capabilities,
            seq: 1,
            started: false,
            more: false,
            ok: None,
        }
    }

    fn next_seq(&mut self) -> u8 {
        let s = self.seq;
        self.seq = self.seq.wrapping_add(1);
        s
    }

    /// Next unused sequence id, for callers that must continue the
    /// response themselves (e.g. with an ERR packet).
    pub fn seq(&self) -> u8 {
        self.seq
    }

    async fn feed(&mut self, pkt: Packet) -> Result<(), SqlError> {
        self.framed.feed(pkt).await.map_err(io_err)
    }

    /// Whether any batch reached the wire.
    pub fn started(&self) -> bool {
        self.started || self.ok.is_some()
    }

    /// Write the response terminator: an OK packet for DML outcomes, a
    /// trailing EOF for row sets.
    pub async fn finish(&mut self, warnings: u16) -> Result<(), SqlError> {
        let mut status = self.conn.status();
        if self.more {
            status |= status_flags::SERVER_MORE_RESULTS_EXISTS;
        }

        if let Some((affected_rows, last_insert_id, _info)) = self.ok.take() {
            let ok = OkPacket {
                affected_rows,
                last_insert_id,
                status_flags: status,
                warnings,
            };
            let seq = self.next_seq();
            let pkt = ok.encode(seq, self.capabilities);
            self.feed(pkt).await?;
        } else if self.started {
            let seq = self.next_seq();
            let pkt = EofPacket::new(warnings, status).encode(seq);
            self.feed(pkt).await?;
        }

        SinkExt::<Packet>::flush(&mut self.framed).await.map_err(io_err)
    }
}

#[async_trait]
impl<S> ResultSink for WireResultWriter<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, result: &QueryResult, more: bool) -> Result<(), SqlError> {
        self.more = more;

        // A fieldless result is a DML outcome; it becomes the OK packet at
        // finish time.
        if result.fields.is_empty() {
            self.ok = Some((
                result.rows_affected,
                result.insert_id,
                result.info.clone(),
            ));
            return Ok(());
        }

        if !self.started {
            let seq = self.next_seq();
            let pkt = column_count_packet(seq, result.fields.len() as u64);
            self.feed(pkt).await?;
            for field in &result.fields {
                let seq = self.next_seq();
                let pkt = column_definition_packet(seq, field);
                self.feed(pkt).await?;
            }
            let seq = self.next_seq();
            let pkt = EofPacket::new(0, self.conn.status()).encode(seq);
            self.feed(pkt).await?;
            self.started = true;
        }

        for row in &result.rows {
            let seq = self.next_seq();
            let pkt = row_packet(seq, row);
            self.feed(pkt).await?;
        }

        SinkExt::<Packet>::flush(&mut self.framed).await.map_err(io_err)
    }
}

fn io_err(e: std::io::Error) -> SqlError {
    SqlError::Execution(format!("client write failed: {e}"))
}
