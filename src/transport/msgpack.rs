//! Minimal MessagePack decoder for inbound sync frames.
//!
//! Covers exactly the formats the chat payloads use: fixint/fixmap/fixarray/
//! fixstr, nil, bool, bin 8/16/32, float 32/64, u/i 8/16/32/64, str 8/16/32,
//! array/map 16/32. Decodes into a tagged `Value` tree whose map keys may be
//! strings or integers; the same payload field can arrive keyed `"10"` or
//! `10` depending on the encoder, so lookups accept both.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bin(Vec<u8>),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
}

impl Value {
    /// Field lookup accepting both string keys and their integer twins.
    pub fn get(&self, key: &str) -> Option<&Value> {
        let Value::Map(entries) = self else {
            return None;
        };
        let as_int: Option<i64> = key.parse().ok();
        entries.iter().find_map(|(k, v)| match k {
            Value::Str(s) if s == key => Some(v),
            Value::Int(i) if Some(*i) == as_int => Some(v),
            Value::UInt(u) if i64::try_from(*u).ok() == as_int && as_int.is_some() => Some(v),
            _ => None,
        })
    }

    /// First present key wins.
    pub fn get_any(&self, keys: &[&str]) -> Option<&Value> {
        keys.iter().find_map(|k| self.get(k))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Stringified scalar: ids sometimes arrive as ints.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Str(s) => Some(s.clone()),
            Value::Int(i) => Some(i.to_string()),
            Value::UInt(u) => Some(u.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::UInt(u) => i64::try_from(*u).ok(),
            Value::Float(f) => Some(*f as i64),
            Value::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn is_map(&self) -> bool {
        matches!(self, Value::Map(_))
    }

    /// Convert a parsed JSON tree into the same shape, so JSON-encoded sync
    /// payloads and MessagePack ones feed one extraction path.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Value::UInt(u)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (Value::Str(k.clone()), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

#[derive(Debug)]
pub struct DecodeError {
    message: String,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "messagepack decode error: {}", self.message)
    }
}

impl std::error::Error for DecodeError {}

fn err(message: impl Into<String>) -> DecodeError {
    DecodeError {
        message: message.into(),
    }
}

pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn decode(mut self) -> Result<Value, DecodeError> {
        self.decode_value()
    }

    fn read_byte(&mut self) -> Result<u8, DecodeError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| err("unexpected end of data"))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(count)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| err("unexpected end of data"))?;
        let buf = &self.data[self.pos..end];
        self.pos = end;
        Ok(buf)
    }

    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.read_bytes(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_str(&mut self, len: usize) -> Result<Value, DecodeError> {
        let bytes = self.read_bytes(len)?;
        let text = std::str::from_utf8(bytes).map_err(|_| err("invalid utf-8 in string"))?;
        Ok(Value::Str(text.to_string()))
    }

    fn decode_array(&mut self, size: usize) -> Result<Value, DecodeError> {
        let mut out = Vec::with_capacity(size.min(1024));
        for _ in 0..size {
            out.push(self.decode_value()?);
        }
        Ok(Value::Array(out))
    }

    fn decode_map(&mut self, size: usize) -> Result<Value, DecodeError> {
        let mut out = Vec::with_capacity(size.min(1024));
        for _ in 0..size {
            let key = self.decode_value()?;
            let value = self.decode_value()?;
            out.push((key, value));
        }
        Ok(Value::Map(out))
    }

    fn decode_value(&mut self) -> Result<Value, DecodeError> {
        let b = self.read_byte()?;
        match b {
            0x00..=0x7f => Ok(Value::UInt(b as u64)),
            0x80..=0x8f => self.decode_map((b & 0x0f) as usize),
            0x90..=0x9f => self.decode_array((b & 0x0f) as usize),
            0xa0..=0xbf => self.read_str((b & 0x1f) as usize),
            0xc0 => Ok(Value::Null),
            0xc2 => Ok(Value::Bool(false)),
            0xc3 => Ok(Value::Bool(true)),
            0xc4 => {
                let len = self.read_byte()? as usize;
                Ok(Value::Bin(self.read_bytes(len)?.to_vec()))
            }
            0xc5 => {
                let len = self.read_u16()? as usize;
                Ok(Value::Bin(self.read_bytes(len)?.to_vec()))
            }
            0xc6 => {
                let len = self.read_u32()? as usize;
                Ok(Value::Bin(self.read_bytes(len)?.to_vec()))
            }
            0xca => {
                let b = self.read_bytes(4)?;
                Ok(Value::Float(
                    f32::from_be_bytes([b[0], b[1], b[2], b[3]]) as f64
                ))
            }
            0xcb => {
                let b = self.read_bytes(8)?;
                Ok(Value::Float(f64::from_be_bytes([
                    b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
                ])))
            }
            0xcc => Ok(Value::UInt(self.read_byte()? as u64)),
            0xcd => Ok(Value::UInt(self.read_u16()? as u64)),
            0xce => Ok(Value::UInt(self.read_u32()? as u64)),
            0xcf => Ok(Value::UInt(self.read_u64()?)),
            0xd0 => Ok(Value::Int(self.read_byte()? as i8 as i64)),
            0xd1 => Ok(Value::Int(self.read_u16()? as i16 as i64)),
            0xd2 => Ok(Value::Int(self.read_u32()? as i32 as i64)),
            0xd3 => Ok(Value::Int(self.read_u64()? as i64)),
            0xd9 => {
                let len = self.read_byte()? as usize;
                self.read_str(len)
            }
            0xda => {
                let len = self.read_u16()? as usize;
                self.read_str(len)
            }
            0xdb => {
                let len = self.read_u32()? as usize;
                self.read_str(len)
            }
            0xdc => {
                let len = self.read_u16()? as usize;
                self.decode_array(len)
            }
            0xdd => {
                let len = self.read_u32()? as usize;
                self.decode_array(len)
            }
            0xde => {
                let len = self.read_u16()? as usize;
                self.decode_map(len)
            }
            0xdf => {
                let len = self.read_u32()? as usize;
                self.decode_map(len)
            }
            0xe0..=0xff => Ok(Value::Int(b as i64 - 256)),
            other => Err(err(format!("unknown format byte 0x{other:02x}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_fixmap_with_mixed_key_types() {
        // {1: "hi", "2": 7}
        let data = [
            0x82, 0x01, 0xa2, b'h', b'i', 0xa1, b'2', 0x07,
        ];
        let value = Decoder::new(&data).decode().unwrap();
        assert_eq!(value.get("1").and_then(Value::as_str), Some("hi"));
        assert_eq!(value.get("2").and_then(Value::as_i64), Some(7));
    }

    #[test]
    fn decodes_nested_arrays_and_nil() {
        // [nil, true, [200], -1]
        let data = [0x94, 0xc0, 0xc3, 0x91, 0xcc, 0xc8, 0xff];
        let value = Decoder::new(&data).decode().unwrap();
        let Value::Array(items) = value else {
            panic!("expected array")
        };
        assert_eq!(items[0], Value::Null);
        assert_eq!(items[1], Value::Bool(true));
        assert_eq!(items[3], Value::Int(-1));
    }

    #[test]
    fn decodes_str8_and_uint16() {
        let mut data = vec![0x82, 0xa1, b'a', 0xd9, 0x03, b'x', b'y', b'z', 0xa1, b'b', 0xcd, 0x01, 0x00];
        let value = Decoder::new(&data).decode().unwrap();
        assert_eq!(value.get("a").and_then(Value::as_str), Some("xyz"));
        assert_eq!(value.get("b").and_then(Value::as_i64), Some(256));
        data.truncate(4);
        assert!(Decoder::new(&data).decode().is_err());
    }

    #[test]
    fn decodes_float64() {
        let mut data = vec![0xcb];
        data.extend_from_slice(&1.5f64.to_be_bytes());
        let value = Decoder::new(&data).decode().unwrap();
        assert_eq!(value, Value::Float(1.5));
    }

    #[test]
    fn json_conversion_matches_lookup_semantics() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"1": {"10": {"content": "hello"}}}"#).unwrap();
        let value = Value::from_json(&json);
        let content = value
            .get("1")
            .and_then(|b| b.get("10"))
            .and_then(|c| c.get("content"))
            .and_then(Value::as_str);
        assert_eq!(content, Some("hello"));
    }

    #[test]
    fn truncated_input_errors_cleanly() {
        let data = [0x92, 0x01];
        assert!(Decoder::new(&data).decode().is_err());
    }
}
