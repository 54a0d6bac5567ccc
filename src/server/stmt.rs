//! Per-connection prepared-statement registry and `COM_STMT_EXECUTE`
//! binary-protocol decoding.
//!
//! Decoded values keep their wire type but are re-encoded textually, which
//! is what the bind-value coercer consumes.

use std::collections::HashMap;

use bytes::{Buf, Bytes};

use crate::handler::Field;
use crate::sql::{BindValue, SqlError, WireType};

#[derive(Debug, Clone)]
pub struct PreparedStmt {
    pub query: String,
    pub param_count: u16,
    pub fields: Option<Vec<Field>>,
}

/// Statements prepared on one connection, keyed by statement id.
#[derive(Default)]
pub struct PreparedStatements {
    next_id: u32,
    stmts: HashMap<u32, PreparedStmt>,
}

impl PreparedStatements {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            stmts: HashMap::new(),
        }
    }

    pub fn insert(&mut self, query: String, fields: Option<Vec<Field>>) -> (u32, &PreparedStmt) {
        let id = self.next_id;
        self.next_id += 1;
        let param_count = query.matches('?').count() as u16;
        self.stmts.insert(
            id,
            PreparedStmt {
                query,
                param_count,
                fields,
            },
        );
        (id, &self.stmts[&id])
    }

    pub fn get(&self, id: u32) -> Option<&PreparedStmt> {
        self.stmts.get(&id)
    }

    pub fn remove(&mut self, id: u32) {
        self.stmts.remove(&id);
    }
}

/// Decode a `COM_STMT_EXECUTE` payload (without the leading command byte).
/// Returns the statement id and the bind variables named `v1`..`vN`.
pub fn decode_stmt_execute(
    payload: &Bytes,
    param_count: u16,
) -> Result<(u32, HashMap<String, BindValue>), SqlError> {
    let mut buf = payload.clone();
    if buf.remaining() < 9 {
        return Err(SqlError::Parse("short COM_STMT_EXECUTE payload".into()));
    }
    let stmt_id = buf.get_u32_le();
    let _flags = buf.get_u8();
    let _iteration_count = buf.get_u32_le();

    let mut bindings = HashMap::new();
    if param_count == 0 {
        return Ok((stmt_id, bindings));
    }

    let bitmap_len = ((param_count as usize) + 7) / 8;
    if buf.remaining() < bitmap_len + 1 {
        return Err(SqlError::Parse("truncated null bitmap".into()));
    }
    let null_bitmap = buf.copy_to_bytes(bitmap_len);
    let new_params_bound = buf.get_u8();
    if new_params_bound != 1 {
        // Re-using previously bound parameter types is not supported.
        return Err(SqlError::UnsupportedOperation);
    }

    if buf.remaining() < 2 * param_count as usize {
        return Err(SqlError::Parse("truncated parameter types".into()));
    }
    let mut types = Vec::with_capacity(param_count as usize);
    for _ in 0..param_count {
        let tag = buf.get_u8();
        let flag = buf.get_u8();
        types.push(WireType::from_mysql(tag, flag & 0x80 != 0));
    }

    for (i, typ) in types.into_iter().enumerate() {
        let name = format!("v{}", i + 1);
        let is_null = null_bitmap[i / 8] & (1 << (i % 8)) != 0;
        if is_null || typ == WireType::Null {
            bindings.insert(name, BindValue::new(WireType::Null, Bytes::new()));
            continue;
        }
        let value = decode_binary_value(&mut buf, typ)?;
        bindings.insert(name, BindValue::new(typ, value));
    }

    Ok((stmt_id, bindings))
}

/// Decode one binary-protocol value to the textual bytes the coercer
/// expects.
fn decode_binary_value(buf: &mut Bytes, typ: WireType) -> Result<Bytes, SqlError> {
    let short = || SqlError::Parse(format!("truncated {typ:?} parameter"));
    let need = |buf: &Bytes, n: usize| {
        if buf.remaining() < n {
            Err(short())
        } else {
            Ok(())
        }
    };

    let out = match typ {
        WireType::Int8 => {
            need(buf, 1)?;
            Bytes::from((buf.get_u8() as i8).to_string())
        }
        WireType::Uint8 => {
            need(buf, 1)?;
            Bytes::from(buf.get_u8().to_string())
        }
        WireType::Int16 => {
            need(buf, 2)?;
            Bytes::from(buf.get_i16_le().to_string())
        }
        WireType::Uint16 => {
            need(buf, 2)?;
            Bytes::from(buf.get_u16_le().to_string())
        }
        WireType::Int24 | WireType::Int32 => {
            need(buf, 4)?;
            Bytes::from(buf.get_i32_le().to_string())
        }
        WireType::Uint24 | WireType::Uint32 => {
            need(buf, 4)?;
            Bytes::from(buf.get_u32_le().to_string())
        }
        WireType::Int64 => {
            need(buf, 8)?;
            Bytes::from(buf.get_i64_le().to_string())
        }
        WireType::Uint64 => {
            need(buf, 8)?;
            Bytes::from(buf.get_u64_le().to_string())
        }
        WireType::Float32 => {
            need(buf, 4)?;
            Bytes::from(buf.get_f32_le().to_string())
        }
        WireType::Float64 => {
            need(buf, 8)?;
            Bytes::from(buf.get_f64_le().to_string())
        }
        WireType::Year => {
            need(buf, 2)?;
            Bytes::from(buf.get_u16_le().to_string())
        }
        WireType::Date | WireType::Datetime | WireType::Timestamp => {
            decode_binary_datetime(buf, typ)?
        }
        WireType::Time => decode_binary_time(buf)?,
        // Everything else travels as a length-encoded byte string.
        _ => {
            let len = get_lenenc_int(buf).ok_or_else(short)?;
            need(buf, len as usize)?;
            buf.copy_to_bytes(len as usize)
        }
    };
    Ok(out)
}

fn decode_binary_datetime(buf: &mut Bytes, typ: WireType) -> Result<Bytes, SqlError> {
    let short = || SqlError::Parse("truncated datetime parameter".into());
    if buf.remaining() < 1 {
        return Err(short());
    }
    let len = buf.get_u8() as usize;
    if buf.remaining() < len {
        return Err(short());
    }

    let (mut y, mut mo, mut d, mut h, mut mi, mut s, mut micro) = (0u16, 0u8, 0u8, 0u8, 0u8, 0u8, 0u32);
    if len >= 4 {
        y = buf.get_u16_le();
        mo = buf.get_u8();
        d = buf.get_u8();
    }
    if len >= 7 {
        h = buf.get_u8();
        mi = buf.get_u8();
        s = buf.get_u8();
    }
    if len >= 11 {
        micro = buf.get_u32_le();
    }

    let text = if typ == WireType::Date {
        format!("{y:04}-{mo:02}-{d:02}")
    } else if micro > 0 {
        format!("{y:04}-{mo:02}-{d:02} {h:02}:{mi:02}:{s:02}.{micro:06}")
    } else {
        format!("{y:04}-{mo:02}-{d:02} {h:02}:{mi:02}:{s:02}")
    };
    Ok(Bytes::from(text))
}

fn decode_binary_time(buf: &mut Bytes) -> Result<Bytes, SqlError> {
    let short = || SqlError::Parse("truncated time parameter".into());
    if buf.remaining() < 1 {
        return Err(short());
    }
    let len = buf.get_u8() as usize;
    if buf.remaining() < len {
        return Err(short());
    }

    if len == 0 {
        return Ok(Bytes::from_static(b"00:00:00"));
    }
    if len < 8 {
        return Err(short());
    }

    let negative = buf.get_u8() != 0;
    let days = buf.get_u32_le();
    let h = buf.get_u8();
    let mi = buf.get_u8();
    let s = buf.get_u8();
    let micro = if len >= 12 { buf.get_u32_le() } else { 0 };

    let hours = days as u64 * 24 + h as u64;
    let sign = if negative { "-" } else { "" };
    let text = if micro > 0 {
        format!("{sign}{hours:02}:{mi:02}:{s:02}.{micro:06}")
    } else {
        format!("{sign}{hours:02}:{mi:02}:{s:02}")
    };
    Ok(Bytes::from(text))
}

fn get_lenenc_int(buf: &mut Bytes) -> Option<u64> {
    if buf.remaining() < 1 {
        return None;
    }
    match buf.get_u8() {
        v @ 0..=0xFA => Some(v as u64),
        0xFC if buf.remaining() >= 2 => Some(buf.get_u16_le() as u64),
        0xFD if buf.remaining() >= 3 => {
            let (a, b, c) = (buf.get_u8(), buf.get_u8(), buf.get_u8());
            Some(u32::from_le_bytes([a, b, c, 0]) as u64)
        }
        0xFE if buf.remaining() >= 8 => Some(buf.get_u64_le()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn execute_payload(stmt_id: u32, params: &[(u8, bool, &[u8])]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32_le(stmt_id);
        buf.put_u8(0); // flags
        buf.put_u32_le(1); // iteration count
        if !params.is_empty() {
            let bitmap_len = (params.len() + 7) / 8;
            buf.extend_from_slice(&vec![0u8; bitmap_len]);
            buf.put_u8(1); // new params bound
            for (tag, unsigned, _) in params {
                buf.put_u8(*tag);
                buf.put_u8(if *unsigned { 0x80 } else { 0 });
            }
            for (_, _, value) in params {
                buf.extend_from_slice(value);
            }
        }
        buf.freeze()
    }

    #[test]
    fn decodes_int_and_string_params() {
        let mut string_val = BytesMut::new();
        string_val.put_u8(2); // lenenc length
        string_val.extend_from_slice(b"hi");

        let payload = execute_payload(
            3,
            &[
                (0x03, false, &42i32.to_le_bytes()),
                (0x0f, false, &string_val.freeze()[..]),
            ],
        );
        let (stmt_id, bindings) = decode_stmt_execute(&payload, 2).unwrap();
        assert_eq!(stmt_id, 3);
        assert_eq!(bindings["v1"], BindValue::new(WireType::Int32, &b"42"[..]));
        assert_eq!(bindings["v2"], BindValue::new(WireType::VarChar, &b"hi"[..]));
    }

    #[test]
    fn decodes_null_bitmap() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(1);
        buf.put_u8(0);
        buf.put_u32_le(1);
        buf.put_u8(0b0000_0001); // first param null
        buf.put_u8(1);
        buf.put_u8(0x08); // type Int64
        buf.put_u8(0);
        let (_, bindings) = decode_stmt_execute(&buf.freeze(), 1).unwrap();
        assert_eq!(bindings["v1"].typ, WireType::Null);
    }

    #[test]
    fn decodes_binary_datetime() {
        let mut value = BytesMut::new();
        value.put_u8(7);
        value.put_u16_le(2024);
        value.put_u8(2);
        value.put_u8(29);
        value.put_u8(12);
        value.put_u8(30);
        value.put_u8(5);
        let payload = execute_payload(1, &[(0x0c, false, &value.freeze()[..])]);
        let (_, bindings) = decode_stmt_execute(&payload, 1).unwrap();
        assert_eq!(&bindings["v1"].value[..], b"2024-02-29 12:30:05");
    }

    #[test]
    fn registry_assigns_ids_and_counts_params() {
        let mut stmts = PreparedStatements::new();
        let (id, stmt) = stmts.insert("SELECT ?, ?".to_string(), None);
        assert_eq!(id, 1);
        assert_eq!(stmt.param_count, 2);
        let (id2, _) = stmts.insert("SELECT 1".to_string(), None);
        assert_eq!(id2, 2);
        stmts.remove(id);
        assert!(stmts.get(id).is_none());
        assert!(stmts.get(id2).is_some());
    }
}
