//! AMF0 decoding and encoding for the RTMP command channel.
//!
//! The supported subset is what publish clients actually send: numbers,
//! booleans, strings, anonymous objects, nulls and ECMA arrays. Decoding is
//! bounded by hard limits so a hostile peer cannot balloon memory with a
//! single command message.

use std::collections::BTreeMap;

use crate::core::error::ProtocolError;
use crate::rtmp::{TYPE_AMF0_COMMAND, TYPE_AMF3_COMMAND};

// AMF0 markers
pub const MARKER_NUMBER: u8 = 0x00;
pub const MARKER_BOOLEAN: u8 = 0x01;
pub const MARKER_STRING: u8 = 0x02;
pub const MARKER_OBJECT: u8 = 0x03;
pub const MARKER_NULL: u8 = 0x05;
pub const MARKER_ECMA_ARRAY: u8 = 0x08;
pub const MARKER_OBJECT_END: u8 = 0x09;

// Decode limits
pub const MAX_VALUES: usize = 1000;
pub const MAX_STRING_LEN: usize = 65535;
pub const MAX_OBJECT_KEYS: usize = 500;

/// An AMF0 value in the supported subset.
///
/// Objects use a `BTreeMap` so re-encoding is deterministic (keys sorted
/// lexicographically).
#[derive(Debug, Clone, PartialEq)]
pub enum Amf0Value {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(BTreeMap<String, Amf0Value>),
    Null,
}

impl Amf0Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Amf0Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Amf0Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Amf0Value>> {
        match self {
            Amf0Value::Object(o) => Some(o),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.pos + n > self.buf.len() {
            return Err(ProtocolError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f64(&mut self) -> Result<f64, ProtocolError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(f64::from_bits(u64::from_be_bytes(raw)))
    }
}

enum Decoded {
    Value(Amf0Value),
    ObjectEnd,
}

/// Decode a full sequence of AMF0 values (e.g. one command payload).
pub fn decode_all(payload: &[u8]) -> Result<Vec<Amf0Value>, ProtocolError> {
    let mut r = Reader::new(payload);
    let mut values = Vec::new();
    while !r.is_empty() {
        if values.len() >= MAX_VALUES {
            return Err(ProtocolError::ValueLimit);
        }
        match decode_one(&mut r)? {
            Decoded::Value(v) => values.push(v),
            Decoded::ObjectEnd => return Err(ProtocolError::InvalidMarker(MARKER_OBJECT_END)),
        }
    }
    Ok(values)
}

/// Decode an AMF command payload by message type id: type 20 is raw AMF0,
/// type 17 carries an AMF3 format byte that must be zero before the AMF0
/// body.
pub fn decode_command(type_id: u8, payload: &[u8]) -> Result<Vec<Amf0Value>, ProtocolError> {
    match type_id {
        TYPE_AMF0_COMMAND => decode_all(payload),
        TYPE_AMF3_COMMAND => {
            let Some((&format, body)) = payload.split_first() else {
                return Err(ProtocolError::EmptyAmf3);
            };
            if format != 0 {
                return Err(ProtocolError::UnsupportedAmf3);
            }
            decode_all(body)
        }
        other => Err(ProtocolError::UnexpectedMessageType(other)),
    }
}

fn decode_one(r: &mut Reader<'_>) -> Result<Decoded, ProtocolError> {
    let marker = r.u8()?;
    let value = match marker {
        MARKER_NUMBER => Amf0Value::Number(r.f64()?),
        MARKER_BOOLEAN => Amf0Value::Boolean(r.u8()? != 0),
        MARKER_STRING => Amf0Value::String(decode_string(r)?),
        MARKER_OBJECT => Amf0Value::Object(decode_object(r)?),
        MARKER_NULL => Amf0Value::Null,
        MARKER_ECMA_ARRAY => {
            // The declared count is advisory; the object-end terminator is
            // authoritative.
            let _count = r.u32()?;
            Amf0Value::Object(decode_object(r)?)
        }
        MARKER_OBJECT_END => return Ok(Decoded::ObjectEnd),
        other => return Err(ProtocolError::InvalidMarker(other)),
    };
    Ok(Decoded::Value(value))
}

fn decode_string(r: &mut Reader<'_>) -> Result<String, ProtocolError> {
    let len = r.u16()? as usize;
    if len == 0 {
        return Ok(String::new());
    }
    if len > MAX_STRING_LEN {
        return Err(ProtocolError::StringTooLong);
    }
    let bytes = r.take(len)?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

fn decode_object(r: &mut Reader<'_>) -> Result<BTreeMap<String, Amf0Value>, ProtocolError> {
    let mut obj = BTreeMap::new();
    loop {
        if obj.len() >= MAX_OBJECT_KEYS {
            return Err(ProtocolError::ObjectKeyLimit);
        }
        let key = decode_string(r)?;
        match decode_one(r)? {
            Decoded::ObjectEnd => break,
            Decoded::Value(v) => {
                obj.insert(key, v);
            }
        }
    }
    Ok(obj)
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a sequence of values into a fresh buffer.
pub fn encode_all(values: &[Amf0Value]) -> Vec<u8> {
    let mut out = Vec::new();
    for v in values {
        encode_value(&mut out, v);
    }
    out
}

pub fn encode_value(out: &mut Vec<u8>, value: &Amf0Value) {
    match value {
        Amf0Value::Number(n) => {
            out.push(MARKER_NUMBER);
            out.extend_from_slice(&n.to_bits().to_be_bytes());
        }
        Amf0Value::Boolean(b) => {
            out.push(MARKER_BOOLEAN);
            out.push(u8::from(*b));
        }
        Amf0Value::String(s) => {
            out.push(MARKER_STRING);
            encode_utf8(out, s);
        }
        Amf0Value::Object(map) => {
            out.push(MARKER_OBJECT);
            for (key, v) in map {
                encode_utf8(out, key);
                encode_value(out, v);
            }
            out.extend_from_slice(&[0x00, 0x00, MARKER_OBJECT_END]);
        }
        Amf0Value::Null => out.push(MARKER_NULL),
    }
}

fn encode_utf8(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

/// Convenience for building command objects in tests and responses.
pub fn object(entries: &[(&str, Amf0Value)]) -> Amf0Value {
    Amf0Value::Object(
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_supported_subset() {
        let values = vec![
            Amf0Value::String("connect".into()),
            Amf0Value::Number(1.0),
            object(&[
                ("app", Amf0Value::String("live".into())),
                ("flashVer", Amf0Value::String("FMLE/3.0".into())),
                ("tcUrl", Amf0Value::String("rtmp://host/live".into())),
                ("fpad", Amf0Value::Boolean(false)),
                ("capabilities", Amf0Value::Number(15.0)),
                ("token", Amf0Value::Null),
            ]),
        ];
        let encoded = encode_all(&values);
        let decoded = decode_all(&encoded).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_object_keys_encode_sorted() {
        let obj = object(&[
            ("zeta", Amf0Value::Number(1.0)),
            ("alpha", Amf0Value::Number(2.0)),
        ]);
        let encoded = encode_all(&[obj]);
        let alpha = encoded
            .windows(5)
            .position(|w| w == b"alpha")
            .unwrap();
        let zeta = encoded.windows(4).position(|w| w == b"zeta").unwrap();
        assert!(alpha < zeta);
    }

    #[test]
    fn test_ecma_array_ignores_count() {
        // Count claims 99 entries; the terminator after one entry wins.
        let mut payload = vec![MARKER_ECMA_ARRAY, 0x00, 0x00, 0x00, 99];
        payload.extend_from_slice(&[0x00, 0x03]);
        payload.extend_from_slice(b"key");
        payload.push(MARKER_NUMBER);
        payload.extend_from_slice(&7.0f64.to_bits().to_be_bytes());
        payload.extend_from_slice(&[0x00, 0x00, MARKER_OBJECT_END]);

        let decoded = decode_all(&payload).unwrap();
        let obj = decoded[0].as_object().unwrap();
        assert_eq!(obj.len(), 1);
        assert_eq!(obj["key"].as_number(), Some(7.0));
    }

    #[test]
    fn test_unknown_marker_is_error() {
        let payload = [0x0A, 0x00];
        assert!(matches!(
            decode_all(&payload),
            Err(ProtocolError::InvalidMarker(0x0A))
        ));
    }

    #[test]
    fn test_truncated_value_is_error() {
        let payload = [MARKER_NUMBER, 0x01, 0x02];
        assert!(matches!(
            decode_all(&payload),
            Err(ProtocolError::Truncated)
        ));
    }

    #[test]
    fn test_value_limit() {
        let mut payload = Vec::new();
        for _ in 0..(MAX_VALUES + 1) {
            payload.push(MARKER_NULL);
        }
        assert!(matches!(
            decode_all(&payload),
            Err(ProtocolError::ValueLimit)
        ));
    }

    #[test]
    fn test_object_key_limit() {
        let mut payload = vec![MARKER_OBJECT];
        for i in 0..(MAX_OBJECT_KEYS + 1) {
            let key = format!("k{i}");
            payload.extend_from_slice(&(key.len() as u16).to_be_bytes());
            payload.extend_from_slice(key.as_bytes());
            payload.push(MARKER_NULL);
        }
        payload.extend_from_slice(&[0x00, 0x00, MARKER_OBJECT_END]);
        assert!(matches!(
            decode_all(&payload),
            Err(ProtocolError::ObjectKeyLimit)
        ));
    }

    #[test]
    fn test_amf3_command_unwrapping() {
        let body = encode_all(&[Amf0Value::String("connect".into())]);

        let mut wrapped = vec![0x00];
        wrapped.extend_from_slice(&body);
        let decoded = decode_command(TYPE_AMF3_COMMAND, &wrapped).unwrap();
        assert_eq!(decoded[0].as_str(), Some("connect"));

        assert!(matches!(
            decode_command(TYPE_AMF3_COMMAND, &[]),
            Err(ProtocolError::EmptyAmf3)
        ));
        assert!(matches!(
            decode_command(TYPE_AMF3_COMMAND, &[0x11, 0x00]),
            Err(ProtocolError::UnsupportedAmf3)
        ));
        assert!(matches!(
            decode_command(9, &body),
            Err(ProtocolError::UnexpectedMessageType(9))
        ));
    }
}
