//! Coercion of wire-protocol bind variables into engine literals.

use std::collections::HashMap;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;

use crate::sql::{BindValue, Literal, SqlError, SqlType, Value, WireType, BIT_TYPE_MAX_BITS};

/// Convert every bind variable to a typed literal expression. Any
/// unrecognized wire type aborts the conversion with
/// [`SqlError::UnsupportedOperation`].
pub fn bindings_to_exprs(
    bindings: &HashMap<String, BindValue>,
) -> Result<HashMap<String, Literal>, SqlError> {
    let mut out = HashMap::with_capacity(bindings.len());
    for (name, bv) in bindings {
        out.insert(name.clone(), bind_to_literal(bv)?);
    }
    Ok(out)
}

fn bind_to_literal(bv: &BindValue) -> Result<Literal, SqlError> {
    let raw = &bv.value;
    let lit = match bv.typ {
        WireType::Year => {
            let y = convert_year(utf8(raw)?)?;
            Literal::new(Value::Year(y), SqlType::Year)
        }
        t if t.is_signed() => {
            let v = parse_i64_auto(utf8(raw)?)?;
            Literal::new(Value::Int64(v), SqlType::Int64)
        }
        t if t.is_unsigned() => {
            let v = parse_u64_auto(utf8(raw)?)?;
            Literal::new(Value::Uint64(v), SqlType::Uint64)
        }
        t if t.is_float() => {
            let s = utf8(raw)?;
            let v: f64 = s
                .parse()
                .map_err(|_| SqlError::Convert(format!("invalid float {s:?}")))?;
            Literal::new(Value::Float64(v), SqlType::Float64)
        }
        WireType::Decimal => {
            let s = utf8(raw)?;
            let d = Decimal::from_str_exact(s)
                .or_else(|_| Decimal::from_scientific(s))
                .map_err(|_| SqlError::Convert(format!("invalid decimal {s:?}")))?;
            Literal::new(Value::Decimal(d), SqlType::Decimal)
        }
        WireType::Bit => {
            if raw.len() > 8 {
                return Err(SqlError::Convert(format!(
                    "bit value too wide: {} bytes",
                    raw.len()
                )));
            }
            let mut v: u64 = 0;
            for b in raw.iter() {
                v = (v << 8) | *b as u64;
            }
            Literal::new(Value::Bit(v), SqlType::Bit(BIT_TYPE_MAX_BITS))
        }
        WireType::Null => Literal::new(Value::Null, SqlType::Null),
        WireType::Blob => Literal::new(Value::Bytes(raw.clone()), SqlType::Blob),
        WireType::VarBinary => Literal::new(
            Value::Bytes(raw.clone()),
            SqlType::VarBinary(raw.len() as u32),
        ),
        WireType::Binary => {
            Literal::new(Value::Bytes(raw.clone()), SqlType::Binary(raw.len() as u32))
        }
        WireType::Text => Literal::new(Value::Str(utf8(raw)?.to_string()), SqlType::Text),
        WireType::VarChar => Literal::new(
            Value::Str(utf8(raw)?.to_string()),
            SqlType::VarChar(raw.len() as u32),
        ),
        WireType::Char => Literal::new(
            Value::Str(utf8(raw)?.to_string()),
            SqlType::Char(raw.len() as u32),
        ),
        WireType::Date => {
            let s = utf8(raw)?;
            let d = NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map_err(|_| SqlError::Convert(format!("invalid date {s:?}")))?;
            Literal::new(Value::Date(d), SqlType::Date)
        }
        WireType::Datetime | WireType::Timestamp => {
            let s = utf8(raw)?;
            let dt = parse_datetime(s)?;
            let typ = if bv.typ == WireType::Timestamp {
                SqlType::Timestamp
            } else {
                SqlType::Datetime
            };
            Literal::new(Value::Datetime(dt), typ)
        }
        WireType::Time => {
            let micros = parse_time(utf8(raw)?)?;
            Literal::new(Value::Time(micros), SqlType::Time)
        }
        _ => return Err(SqlError::UnsupportedOperation),
    };
    Ok(lit)
}

fn utf8(raw: &[u8]) -> Result<&str, SqlError> {
    std::str::from_utf8(raw).map_err(|_| SqlError::Convert("invalid utf-8 in bind value".into()))
}

fn convert_year(s: &str) -> Result<u16, SqlError> {
    let n: i64 = parse_i64_auto(s)?;
    match n {
        0 => Ok(0),
        1..=69 => Ok((2000 + n) as u16),
        70..=99 => Ok((1900 + n) as u16),
        1901..=2155 => Ok(n as u16),
        _ => Err(SqlError::Convert(format!("year out of range: {s}"))),
    }
}

fn parse_datetime(s: &str) -> Result<NaiveDateTime, SqlError> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(dt);
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| SqlError::Convert(format!("invalid datetime {s:?}")))
}

/// Parse a MySQL TIME value (`[-]HHH:MM:SS[.ffffff]`) to signed
/// microseconds. Hours may exceed 23.
fn parse_time(s: &str) -> Result<i64, SqlError> {
    let bad = || SqlError::Convert(format!("invalid time {s:?}"));
    let (neg, rest) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (hms, frac) = match rest.split_once('.') {
        Some((hms, frac)) => (hms, Some(frac)),
        None => (rest, None),
    };
    let mut parts = hms.split(':');
    let h: u64 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let m: u64 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let sec: u64 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    if parts.next().is_some() || m > 59 || sec > 59 {
        return Err(bad());
    }
    let mut micros = (h * 3600 + m * 60 + sec) * 1_000_000;
    if let Some(frac) = frac {
        if frac.is_empty() || frac.len() > 6 || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(bad());
        }
        let scale = 10u64.pow(6 - frac.len() as u32);
        micros += frac.parse::<u64>().map_err(|_| bad())? * scale;
    }
    let signed = micros as i64;
    Ok(if neg { -signed } else { signed })
}

/// Integer parsing with automatic base detection: `0x`/`0o`/`0b` prefixes
/// select hex, octal, and binary; everything else is decimal.
fn parse_i64_auto(s: &str) -> Result<i64, SqlError> {
    let bad = || SqlError::Convert(format!("invalid integer {s:?}"));
    let (neg, rest) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let magnitude = parse_u64_radix(rest).ok_or_else(bad)?;
    if neg {
        if magnitude > i64::MAX as u64 + 1 {
            return Err(bad());
        }
        Ok((magnitude as i64).wrapping_neg())
    } else {
        i64::try_from(magnitude).map_err(|_| bad())
    }
}

fn parse_u64_auto(s: &str) -> Result<u64, SqlError> {
    let rest = s.strip_prefix('+').unwrap_or(s);
    parse_u64_radix(rest).ok_or_else(|| SqlError::Convert(format!("invalid integer {s:?}")))
}

fn parse_u64_radix(s: &str) -> Option<u64> {
    let (radix, digits) = if let Some(d) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (16, d)
    } else if let Some(d) = s.strip_prefix("0o").or_else(|| s.strip_prefix("0O")) {
        (8, d)
    } else if let Some(d) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
        (2, d)
    } else {
        (10, s)
    };
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, radix).ok()
}
