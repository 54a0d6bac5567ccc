//! Value and type model shared between the engine and the wire layer.

use bytes::Bytes;
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;

use super::error::SqlError;
use super::OkResult;

/// Maximum width of a `BIT` column, used when coercing wire bind values.
pub const BIT_TYPE_MAX_BITS: u8 = 64;

/// Wire-protocol column types, as carried in column definitions and
/// `COM_STMT_EXECUTE` bind variables. Signedness is folded into the variant
/// (the binary protocol transmits it as a separate flag).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireType {
    Int8,
    Int16,
    Int24,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint24,
    Uint32,
    Uint64,
    Float32,
    Float64,
    Decimal,
    Year,
    Bit,
    Null,
    Blob,
    VarBinary,
    Binary,
    Text,
    VarChar,
    Char,
    Date,
    Datetime,
    Timestamp,
    Time,
    Json,
    Enum,
    Set,
    Geometry,
}

impl WireType {
    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            WireType::Int8 | WireType::Int16 | WireType::Int24 | WireType::Int32 | WireType::Int64
        )
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(
            self,
            WireType::Uint8
                | WireType::Uint16
                | WireType::Uint24
                | WireType::Uint32
                | WireType::Uint64
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, WireType::Float32 | WireType::Float64)
    }

    /// Decode a bind-variable type from the binary protocol's (tag, unsigned
    /// flag) pair.
    pub fn from_mysql(tag: u8, unsigned: bool) -> WireType {
        match (tag, unsigned) {
            (0x01, false) => WireType::Int8,
            (0x01, true) => WireType::Uint8,
            (0x02, false) => WireType::Int16,
            (0x02, true) => WireType::Uint16,
            (0x09, false) => WireType::Int24,
            (0x09, true) => WireType::Uint24,
            (0x03, false) => WireType::Int32,
            (0x03, true) => WireType::Uint32,
            (0x08, false) => WireType::Int64,
            (0x08, true) => WireType::Uint64,
            (0x04, _) => WireType::Float32,
            (0x05, _) => WireType::Float64,
            (0x00, _) | (0xf6, _) => WireType::Decimal,
            (0x0d, _) => WireType::Year,
            (0x10, _) => WireType::Bit,
            (0x06, _) => WireType::Null,
            (0xfc, _) => WireType::Blob,
            (0xfd, _) => WireType::VarBinary,
            (0xfe, _) => WireType::Binary,
            (0x0f, _) => WireType::VarChar,
            (0x0a, _) => WireType::Date,
            (0x0c, _) => WireType::Datetime,
            (0x07, _) => WireType::Timestamp,
            (0x0b, _) => WireType::Time,
            (0xf5, _) => WireType::Json,
            (0xf7, _) => WireType::Enum,
            (0xf8, _) => WireType::Set,
            (0xff, _) => WireType::Geometry,
            _ => WireType::Geometry,
        }
    }

    /// Protocol tag for column definition packets.
    pub fn mysql_tag(&self) -> u8 {
        match self {
            WireType::Int8 | WireType::Uint8 => 0x01,
            WireType::Int16 | WireType::Uint16 => 0x02,
            WireType::Int24 | WireType::Uint24 => 0x09,
            WireType::Int32 | WireType::Uint32 => 0x03,
            WireType::Int64 | WireType::Uint64 => 0x08,
            WireType::Float32 => 0x04,
            WireType::Float64 => 0x05,
            WireType::Decimal => 0xf6,
            WireType::Year => 0x0d,
            WireType::Bit => 0x10,
            WireType::Null => 0x06,
            WireType::Blob => 0xfc,
            WireType::VarBinary => 0xfd,
            WireType::Binary => 0xfe,
            WireType::Text => 0xfc,
            WireType::VarChar => 0xfd,
            WireType::Char => 0xfe,
            WireType::Date => 0x0a,
            WireType::Datetime => 0x0c,
            WireType::Timestamp => 0x07,
            WireType::Time => 0x0b,
            WireType::Json => 0xf5,
            WireType::Enum => 0xf7,
            WireType::Set => 0xf8,
            WireType::Geometry => 0xff,
        }
    }
}

/// Engine-side column types. The handler only needs enough structure to
/// project rows to the wire and to type bind-variable literals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlType {
    Year,
    Int64,
    Uint64,
    Float64,
    Decimal,
    Bit(u8),
    Null,
    Binary(u32),
    VarBinary(u32),
    Blob,
    Char(u32),
    VarChar(u32),
    Text,
    LongText,
    Date,
    Datetime,
    Timestamp,
    Time,
}

impl SqlType {
    pub fn wire_type(&self) -> WireType {
        match self {
            SqlType::Year => WireType::Year,
            SqlType::Int64 => WireType::Int64,
            SqlType::Uint64 => WireType::Uint64,
            SqlType::Float64 => WireType::Float64,
            SqlType::Decimal => WireType::Decimal,
            SqlType::Bit(_) => WireType::Bit,
            SqlType::Null => WireType::Null,
            SqlType::Binary(_) => WireType::Binary,
            SqlType::VarBinary(_) => WireType::VarBinary,
            SqlType::Blob => WireType::Blob,
            SqlType::Char(_) => WireType::Char,
            SqlType::VarChar(_) => WireType::VarChar,
            SqlType::Text | SqlType::LongText => WireType::Text,
            SqlType::Date => WireType::Date,
            SqlType::Datetime => WireType::Datetime,
            SqlType::Timestamp => WireType::Timestamp,
            SqlType::Time => WireType::Time,
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(
            self,
            SqlType::Binary(_) | SqlType::VarBinary(_) | SqlType::Blob | SqlType::Bit(_)
        )
    }

    /// Maximum byte length of a textual response value, for column
    /// definition packets.
    pub fn max_response_len(&self) -> u32 {
        match self {
            SqlType::Year => 4,
            SqlType::Int64 | SqlType::Uint64 => 20,
            SqlType::Float64 => 22,
            SqlType::Decimal => 65,
            SqlType::Bit(bits) => *bits as u32,
            SqlType::Null => 0,
            SqlType::Binary(n) | SqlType::VarBinary(n) => *n,
            SqlType::Char(n) | SqlType::VarChar(n) => *n * 4,
            SqlType::Blob => 65_535,
            SqlType::Text => 65_535,
            SqlType::LongText => 4_294_967_295,
            SqlType::Date => 10,
            SqlType::Datetime | SqlType::Timestamp => 26,
            SqlType::Time => 17,
        }
    }

    /// Render a value of this type to its text-protocol representation.
    pub fn sql_format(&self, v: &Value) -> Result<Bytes, SqlError> {
        let out = match (self, v) {
            (_, Value::Null) => Bytes::new(),
            (SqlType::Year, Value::Year(y)) => Bytes::from(format!("{y:04}")),
            (_, Value::Int64(n)) => Bytes::from(n.to_string()),
            (_, Value::Uint64(n)) => Bytes::from(n.to_string()),
            (_, Value::Float64(f)) => Bytes::from(format_float(*f)),
            (_, Value::Decimal(d)) => Bytes::from(d.to_string()),
            (SqlType::Bit(_), Value::Bit(b)) => {
                // Shortest big-endian byte string, at least one byte.
                let be = b.to_be_bytes();
                let skip = be.iter().take_while(|&&x| x == 0).count().min(7);
                Bytes::copy_from_slice(&be[skip..])
            }
            (_, Value::Bytes(b)) => b.clone(),
            (_, Value::Str(s)) => Bytes::from(s.clone()),
            (SqlType::Date, Value::Date(d)) => Bytes::from(d.format("%Y-%m-%d").to_string()),
            (SqlType::Datetime | SqlType::Timestamp, Value::Datetime(dt)) => {
                Bytes::from(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string())
            }
            (SqlType::Time, Value::Time(micros)) => Bytes::from(format_time(*micros)),
            // Lenient fallbacks for engines that hand back loosely typed rows.
            (_, Value::Year(y)) => Bytes::from(y.to_string()),
            (_, Value::Bit(b)) => Bytes::from(b.to_string()),
            (_, Value::Date(d)) => Bytes::from(d.format("%Y-%m-%d").to_string()),
            (_, Value::Datetime(dt)) => Bytes::from(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
            (_, Value::Time(micros)) => Bytes::from(format_time(*micros)),
            (_, Value::Ok(_)) => {
                return Err(SqlError::Execution(
                    "OkResult is not a projectable value".into(),
                ))
            }
        };
        Ok(out)
    }
}

fn format_float(f: f64) -> String {
    if f == f.trunc() && f.abs() < 1e15 {
        format!("{f:.0}")
    } else {
        format!("{f}")
    }
}

fn format_time(micros: i64) -> String {
    let sign = if micros < 0 { "-" } else { "" };
    let abs = micros.unsigned_abs();
    let secs = abs / 1_000_000;
    let frac = abs % 1_000_000;
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if frac == 0 {
        format!("{sign}{h:02}:{m:02}:{s:02}")
    } else {
        format!("{sign}{h:02}:{m:02}:{s:02}.{frac:06}")
    }
}

/// An engine value. `Ok` is the in-band sentinel row for DML outcomes.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int64(i64),
    Uint64(u64),
    Float64(f64),
    Decimal(Decimal),
    Year(u16),
    Bit(u64),
    Bytes(Bytes),
    Str(String),
    Date(NaiveDate),
    Datetime(NaiveDateTime),
    /// Elapsed-time value in microseconds; may be negative.
    Time(i64),
    Ok(OkResult),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// A bind variable as received over the wire: a type tag plus raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct BindValue {
    pub typ: WireType,
    pub value: Bytes,
}

impl BindValue {
    pub fn new(typ: WireType, value: impl Into<Bytes>) -> Self {
        Self {
            typ,
            value: value.into(),
        }
    }
}

/// A typed constant, as produced from a bind variable.
#[derive(Debug, Clone, PartialEq)]
pub struct Literal {
    pub value: Value,
    pub typ: SqlType,
}

impl Literal {
    pub fn new(value: Value, typ: SqlType) -> Self {
        Self { value, typ }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bit_drops_leading_zero_bytes() {
        let out = SqlType::Bit(64).sql_format(&Value::Bit(0x0102)).unwrap();
        assert_eq!(&out[..], &[0x01, 0x02]);
        let zero = SqlType::Bit(64).sql_format(&Value::Bit(0)).unwrap();
        assert_eq!(&zero[..], &[0x00]);
    }

    #[test]
    fn format_time_negative() {
        assert_eq!(format_time(-3_661_000_000), "-01:01:01");
        assert_eq!(format_time(500_000), "00:00:00.500000");
    }

    #[test]
    fn wire_type_roundtrips_signedness() {
        assert_eq!(WireType::from_mysql(0x08, false), WireType::Int64);
        assert_eq!(WireType::from_mysql(0x08, true), WireType::Uint64);
        assert!(WireType::Int24.is_signed());
        assert!(WireType::Uint24.is_unsigned());
        assert!(WireType::Float32.is_float());
    }
}
