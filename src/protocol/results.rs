//! Result-set encoding for the text protocol: column definitions, row
//! packets, EOF, and the `COM_STMT_PREPARE` response.

use bytes::{BufMut, Bytes, BytesMut};

use super::packet::Packet;
use crate::handler::Field;

/// Encode a length-encoded integer
pub fn put_lenenc_int(buf: &mut BytesMut, value: u64) {
    if value < 251 {
        buf.put_u8(value as u8);
    } else if value < 65536 {
        buf.put_u8(0xFC);
        buf.put_u16_le(value as u16);
    } else if value < 16777216 {
        buf.put_u8(0xFD);
        buf.put_u8((value & 0xFF) as u8);
        buf.put_u8(((value >> 8) & 0xFF) as u8);
        buf.put_u8(((value >> 16) & 0xFF) as u8);
    } else {
        buf.put_u8(0xFE);
        buf.put_u64_le(value);
    }
}

pub fn put_lenenc_bytes(buf: &mut BytesMut, data: &[u8]) {
    put_lenenc_int(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

pub fn column_count_packet(sequence_id: u8, count: u64) -> Packet {
    let mut buf = BytesMut::new();
    put_lenenc_int(&mut buf, count);
    Packet::new(sequence_id, buf.freeze())
}

/// ColumnDefinition41 packet.
pub fn column_definition_packet(sequence_id: u8, field: &Field) -> Packet {
    let mut buf = BytesMut::new();

    put_lenenc_bytes(&mut buf, b"def"); // catalog
    put_lenenc_bytes(&mut buf, b""); // schema
    put_lenenc_bytes(&mut buf, b""); // table
    put_lenenc_bytes(&mut buf, b""); // org_table
    put_lenenc_bytes(&mut buf, field.name.as_bytes());
    put_lenenc_bytes(&mut buf, field.name.as_bytes()); // org_name

    buf.put_u8(0x0c); // length of the fixed-size block
    buf.put_u16_le(field.charset);
    buf.put_u32_le(field.column_length);
    buf.put_u8(field.typ.mysql_tag());
    buf.put_u16_le(field.flags);
    buf.put_u8(0); // decimals
    buf.put_u16_le(0); // filler

    Packet::new(sequence_id, buf.freeze())
}

/// Text-protocol row: NULL cells are the 0xFB sentinel, everything else is
/// a length-encoded string.
pub fn row_packet(sequence_id: u8, cells: &[Option<Bytes>]) -> Packet {
    let mut buf = BytesMut::new();
    for cell in cells {
        match cell {
            None => buf.put_u8(0xFB),
            Some(data) => put_lenenc_bytes(&mut buf, data),
        }
    }
    Packet::new(sequence_id, buf.freeze())
}

/// EOF packet (non-DEPRECATE_EOF mode)
#[derive(Debug, Clone)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

impl EofPacket {
    pub fn new(warnings: u16, status_flags: u16) -> Self {
        Self {
            warnings,
            status_flags,
        }
    }

    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();
        buf.put_u8(0xFE);
        buf.put_u16_le(self.warnings);
        buf.put_u16_le(self.status_flags);
        Packet::new(sequence_id, buf.freeze())
    }
}

/// `COM_STMT_PREPARE` OK response header.
pub fn stmt_prepare_ok_packet(
    sequence_id: u8,
    statement_id: u32,
    column_count: u16,
    param_count: u16,
) -> Packet {
    let mut buf = BytesMut::new();
    buf.put_u8(0x00);
    buf.put_u32_le(statement_id);
    buf.put_u16_le(column_count);
    buf.put_u16_le(param_count);
    buf.put_u8(0); // reserved
    buf.put_u16_le(0); // warning count
    Packet::new(sequence_id, buf.freeze())
}
