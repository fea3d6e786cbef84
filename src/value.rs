//! Decoded scalar values (leaf payloads of the parse tree) and string decoding.

use crate::ast::EnumId;

/// A single decoded leaf value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    Bool(bool),
    Float(f32),
    Double(f64),
    Bytes(Vec<u8>),
    Str(String),
    /// Integer mapped through an `enum:`; `label` is `None` for values the enum does not name.
    Enum {
        enum_id: EnumId,
        name: String,
        value: i128,
        label: Option<String>,
    },
    /// Absent value: unmatched switch without default, false `if` on an instance, null parameter.
    Null,
}

impl Value {
    /// Unsigned integer of the given byte width.
    pub fn unsigned(width: usize, raw: u64) -> Value {
        match width {
            1 => Value::U8(raw as u8),
            2 => Value::U16(raw as u16),
            4 => Value::U32(raw as u32),
            _ => Value::U64(raw),
        }
    }

    /// Signed integer of the given byte width.
    pub fn signed(width: usize, raw: i64) -> Value {
        match width {
            1 => Value::I8(raw as i8),
            2 => Value::I16(raw as i16),
            4 => Value::I32(raw as i32),
            _ => Value::I64(raw),
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U8(x) => Some(*x as u64),
            Value::U16(x) => Some(*x as u64),
            Value::U32(x) => Some(*x as u64),
            Value::U64(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I8(x) => Some(*x as i64),
            Value::I16(x) => Some(*x as i64),
            Value::I32(x) => Some(*x as i64),
            Value::I64(x) => Some(*x),
            Value::U8(x) => Some(*x as i64),
            Value::U16(x) => Some(*x as i64),
            Value::U32(x) => Some(*x as i64),
            Value::U64(x) => i64::try_from(*x).ok(),
            Value::Enum { value, .. } => i64::try_from(*value).ok(),
            _ => None,
        }
    }

    /// Any integer (including enum values) widened to `i128`.
    pub fn as_int(&self) -> Option<i128> {
        match self {
            Value::U64(x) => Some(*x as i128),
            Value::Enum { value, .. } => Some(*value),
            other => other.as_i64().map(|x| x as i128),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(x) => Some(*x as f64),
            Value::Double(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// Normalized encoding names understood by [`decode_str`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Ascii,
    Utf8,
    Latin1,
    Utf16Le,
    Utf16Be,
}

impl Encoding {
    /// Look up a schema encoding name (`UTF-8`, `ascii`, `ISO-8859-1`, `UTF-16LE`, ...).
    pub fn from_name(name: &str) -> Option<Encoding> {
        let norm: String = name
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        match norm.as_str() {
            "ascii" | "usascii" => Some(Encoding::Ascii),
            "utf8" => Some(Encoding::Utf8),
            "iso88591" | "latin1" => Some(Encoding::Latin1),
            "utf16le" => Some(Encoding::Utf16Le),
            "utf16be" => Some(Encoding::Utf16Be),
            _ => None,
        }
    }
}

/// Decode `bytes` as text. Invalid sequences are replaced, as a hex viewer should still show
/// something for damaged strings.
pub fn decode_str(bytes: &[u8], encoding: Encoding) -> String {
    match encoding {
        Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        Encoding::Ascii => bytes
            .iter()
            .map(|&b| if b < 0x80 { b as char } else { char::REPLACEMENT_CHARACTER })
            .collect(),
        Encoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        Encoding::Utf16Le | Encoding::Utf16Be => {
            let units = bytes.chunks_exact(2).map(|c| match encoding {
                Encoding::Utf16Le => u16::from_le_bytes([c[0], c[1]]),
                _ => u16::from_be_bytes([c[0], c[1]]),
            });
            char::decode_utf16(units)
                .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
                .collect()
        }
    }
}
