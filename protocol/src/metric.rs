// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Binary metric codec: a length-prefixed, schema-tagged encoding for a
//! [`Payload`] of ordered [`Metric`] values.
//!
//! Wire layout (all multi-byte integers big-endian):
//!
//! ```text
//! Payload  := timestamp:u64 seq:u8 uuid_present:u8 [uuid_len:u16 uuid:bytes] metric_count:u16 metric*
//! Metric   := name_len:u16 name:bytes datatype:u8 timestamp:u64 value
//! ```

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Error decoding a [`Payload`] from bytes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The byte slice ended before a complete payload could be read.
    #[error("payload truncated: expected at least {needed} more byte(s)")]
    Truncated {
        /// Minimum number of additional bytes that were required.
        needed: usize,
    },
    /// A metric name was not valid UTF-8.
    #[error("metric name is not valid UTF-8")]
    InvalidUtf8,
    /// The payload declared metrics or a UUID longer than the remaining bytes support.
    #[error("length field overflowed the remaining payload")]
    LengthOverflow,
}

/// Recognized metric value datatypes. `Unknown` is never produced by an encoder; it is the
/// decoder's sentinel for a tag it does not recognize, so that a single unrecognized metric
/// never aborts the rest of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    /// Decoder-only sentinel for an unrecognized datatype tag.
    Unknown = 0,
    /// Signed 8-bit integer.
    Int8 = 1,
    /// Signed 16-bit integer.
    Int16 = 2,
    /// Signed 32-bit integer.
    Int32 = 3,
    /// Signed 64-bit integer.
    Int64 = 4,
    /// Unsigned 8-bit integer.
    UInt8 = 5,
    /// Unsigned 16-bit integer.
    UInt16 = 6,
    /// Unsigned 32-bit integer.
    UInt32 = 7,
    /// Unsigned 64-bit integer.
    UInt64 = 8,
    /// 32-bit IEEE-754 float.
    Float = 9,
    /// 64-bit IEEE-754 float.
    Double = 10,
    /// Boolean.
    Boolean = 11,
    /// UTF-8 string.
    String = 12,
    /// Opaque byte string.
    Bytes = 13,
}

impl DataType {
    fn from_tag(tag: u8) -> Self {
        match tag {
            1 => Self::Int8,
            2 => Self::Int16,
            3 => Self::Int32,
            4 => Self::Int64,
            5 => Self::UInt8,
            6 => Self::UInt16,
            7 => Self::UInt32,
            8 => Self::UInt64,
            9 => Self::Float,
            10 => Self::Double,
            11 => Self::Boolean,
            12 => Self::String,
            13 => Self::Bytes,
            _ => Self::Unknown,
        }
    }
}

/// The value carried by a [`Metric`]. Exactly one variant is populated, selected by the
/// metric's [`DataType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Signed 8-bit integer value.
    Int8(i8),
    /// Signed 16-bit integer value.
    Int16(i16),
    /// Signed 32-bit integer value.
    Int32(i32),
    /// Signed 64-bit integer value.
    Int64(i64),
    /// Unsigned 8-bit integer value.
    UInt8(u8),
    /// Unsigned 16-bit integer value.
    UInt16(u16),
    /// Unsigned 32-bit integer value.
    UInt32(u32),
    /// Unsigned 64-bit integer value.
    UInt64(u64),
    /// 32-bit float value.
    Float(f32),
    /// 64-bit float value.
    Double(f64),
    /// Boolean value.
    Boolean(bool),
    /// String value.
    String(String),
    /// Opaque byte-string value.
    Bytes(Bytes),
    /// Sentinel for a metric whose datatype tag the decoder did not recognize. The raw
    /// undecoded value bytes are retained so the metric can still be relayed verbatim.
    Opaque(Bytes),
}

impl Value {
    /// The [`DataType`] that this value's variant corresponds to.
    #[must_use]
    pub fn datatype(&self) -> DataType {
        match self {
            Value::Int8(_) => DataType::Int8,
            Value::Int16(_) => DataType::Int16,
            Value::Int32(_) => DataType::Int32,
            Value::Int64(_) => DataType::Int64,
            Value::UInt8(_) => DataType::UInt8,
            Value::UInt16(_) => DataType::UInt16,
            Value::UInt32(_) => DataType::UInt32,
            Value::UInt64(_) => DataType::UInt64,
            Value::Float(_) => DataType::Float,
            Value::Double(_) => DataType::Double,
            Value::Boolean(_) => DataType::Boolean,
            Value::String(_) => DataType::String,
            Value::Bytes(_) => DataType::Bytes,
            Value::Opaque(_) => DataType::Unknown,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Value::Int8(_) | Value::UInt8(_) | Value::Boolean(_) => 1,
            Value::Int16(_) | Value::UInt16(_) => 2,
            Value::Int32(_) | Value::UInt32(_) | Value::Float(_) => 4,
            Value::Int64(_) | Value::UInt64(_) | Value::Double(_) => 8,
            Value::String(s) => 2 + s.len(),
            Value::Bytes(b) | Value::Opaque(b) => 2 + b.len(),
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Value::Int8(v) => buf.put_i8(*v),
            Value::Int16(v) => buf.put_i16(*v),
            Value::Int32(v) => buf.put_i32(*v),
            Value::Int64(v) => buf.put_i64(*v),
            Value::UInt8(v) => buf.put_u8(*v),
            Value::UInt16(v) => buf.put_u16(*v),
            Value::UInt32(v) => buf.put_u32(*v),
            Value::UInt64(v) => buf.put_u64(*v),
            Value::Float(v) => buf.put_f32(*v),
            Value::Double(v) => buf.put_f64(*v),
            Value::Boolean(v) => buf.put_u8(u8::from(*v)),
            Value::String(s) => {
                buf.put_u16(u16::try_from(s.len()).unwrap_or(u16::MAX));
                buf.put_slice(s.as_bytes());
            }
            Value::Bytes(b) | Value::Opaque(b) => {
                buf.put_u16(u16::try_from(b.len()).unwrap_or(u16::MAX));
                buf.put_slice(b);
            }
        }
    }

    fn decode(datatype: DataType, buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(match datatype {
            DataType::Int8 => {
                need(buf, 1)?;
                Value::Int8(buf.get_i8())
            }
            DataType::Int16 => {
                need(buf, 2)?;
                Value::Int16(buf.get_i16())
            }
            DataType::Int32 => {
                need(buf, 4)?;
                Value::Int32(buf.get_i32())
            }
            DataType::Int64 => {
                need(buf, 8)?;
                Value::Int64(buf.get_i64())
            }
            DataType::UInt8 => {
                need(buf, 1)?;
                Value::UInt8(buf.get_u8())
            }
            DataType::UInt16 => {
                need(buf, 2)?;
                Value::UInt16(buf.get_u16())
            }
            DataType::UInt32 => {
                need(buf, 4)?;
                Value::UInt32(buf.get_u32())
            }
            DataType::UInt64 => {
                need(buf, 8)?;
                Value::UInt64(buf.get_u64())
            }
            DataType::Float => {
                need(buf, 4)?;
                Value::Float(buf.get_f32())
            }
            DataType::Double => {
                need(buf, 8)?;
                Value::Double(buf.get_f64())
            }
            DataType::Boolean => {
                need(buf, 1)?;
                Value::Boolean(buf.get_u8() != 0)
            }
            DataType::String => {
                let raw = read_len_prefixed(buf)?;
                Value::String(String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8)?)
            }
            DataType::Bytes => Value::Bytes(read_len_prefixed(buf)?),
            // Unknown tag: length-prefixed so the payload can still be fully consumed.
            DataType::Unknown => Value::Opaque(read_len_prefixed(buf)?),
        })
    }
}

/// A single named, timestamped, typed telemetry value.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    /// `/`-delimited path name, e.g. `breaker/phase_a/current`.
    pub name: String,
    /// Sample timestamp, ms since Unix epoch.
    pub timestamp: u64,
    /// The metric's typed value.
    pub value: Value,
}

impl Metric {
    /// Construct a new metric.
    #[must_use]
    pub fn new(name: impl Into<String>, timestamp: u64, value: Value) -> Self {
        Self {
            name: name.into(),
            timestamp,
            value,
        }
    }

    /// The datatype tag this metric will be encoded with.
    #[must_use]
    pub fn datatype(&self) -> DataType {
        self.value.datatype()
    }
}

/// A decoded or to-be-encoded telemetry payload: a birth or data message body.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    /// Payload-level timestamp, ms since Unix epoch.
    pub timestamp: u64,
    /// Sequence number, 0..255. Never reinterpreted by the codec; callers own wraparound.
    pub seq: u8,
    /// Optional device/session identifier.
    pub uuid: Option<String>,
    /// Ordered metrics. Order is preserved across encode/decode.
    pub metrics: Vec<Metric>,
}

impl Payload {
    /// Construct a new payload.
    #[must_use]
    pub fn new(timestamp: u64, seq: u8, uuid: Option<String>, metrics: Vec<Metric>) -> Self {
        Self {
            timestamp,
            seq,
            uuid,
            metrics,
        }
    }

    /// Encode this payload to its binary wire form.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len_hint());
        buf.put_u64(self.timestamp);
        buf.put_u8(self.seq);
        match &self.uuid {
            Some(uuid) => {
                buf.put_u8(1);
                buf.put_u16(u16::try_from(uuid.len()).unwrap_or(u16::MAX));
                buf.put_slice(uuid.as_bytes());
            }
            None => buf.put_u8(0),
        }
        buf.put_u16(u16::try_from(self.metrics.len()).unwrap_or(u16::MAX));
        for metric in &self.metrics {
            buf.put_u16(u16::try_from(metric.name.len()).unwrap_or(u16::MAX));
            buf.put_slice(metric.name.as_bytes());
            buf.put_u8(metric.datatype() as u8);
            buf.put_u64(metric.timestamp);
            metric.value.encode(&mut buf);
        }
        buf.freeze()
    }

    fn encoded_len_hint(&self) -> usize {
        12 + self
            .metrics
            .iter()
            .map(|m| 11 + m.name.len() + m.value.encoded_len())
            .sum::<usize>()
    }

    /// Decode a payload from its binary wire form.
    ///
    /// # Errors
    /// Returns [`DecodeError`] if the bytes are truncated or a metric name is not valid UTF-8.
    /// An unrecognized datatype tag does NOT error: the metric is recorded with an opaque
    /// sentinel value and decoding continues (spec: decoder tolerates unknown datatypes).
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = Bytes::copy_from_slice(bytes);
        need(&buf, 8)?;
        let timestamp = buf.get_u64();
        need(&buf, 1)?;
        let seq = buf.get_u8();
        need(&buf, 1)?;
        let uuid = if buf.get_u8() != 0 {
            let raw = read_len_prefixed(&mut buf)?;
            Some(String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8)?)
        } else {
            None
        };
        need(&buf, 2)?;
        let count = buf.get_u16();
        let mut metrics = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name_raw = read_len_prefixed(&mut buf)?;
            let name = String::from_utf8(name_raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8)?;
            need(&buf, 1)?;
            let datatype = DataType::from_tag(buf.get_u8());
            need(&buf, 8)?;
            let metric_timestamp = buf.get_u64();
            let value = Value::decode(datatype, &mut buf)?;
            metrics.push(Metric {
                name,
                timestamp: metric_timestamp,
                value,
            });
        }
        Ok(Payload {
            timestamp,
            seq,
            uuid,
            metrics,
        })
    }
}

fn need(buf: &Bytes, n: usize) -> Result<(), DecodeError> {
    if buf.remaining() < n {
        Err(DecodeError::Truncated {
            needed: n - buf.remaining(),
        })
    } else {
        Ok(())
    }
}

fn read_len_prefixed(buf: &mut Bytes) -> Result<Bytes, DecodeError> {
    need(buf, 2)?;
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(DecodeError::LengthOverflow);
    }
    Ok(buf.copy_to_bytes(len))
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::Unknown => "unknown",
            DataType::Int8 => "int8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::UInt8 => "uint8",
            DataType::UInt16 => "uint16",
            DataType::UInt32 => "uint32",
            DataType::UInt64 => "uint64",
            DataType::Float => "float",
            DataType::Double => "double",
            DataType::Boolean => "boolean",
            DataType::String => "string",
            DataType::Bytes => "bytes",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn sample_payload() -> Payload {
        Payload::new(
            1_700_000_000_000,
            7,
            Some("dev-A".to_string()),
            vec![
                Metric::new("Temp", 1_700_000_000_001, Value::Double(22.3)),
                Metric::new("Humid", 1_700_000_000_002, Value::Double(50.0)),
                Metric::new("Online", 1_700_000_000_003, Value::Boolean(true)),
                Metric::new("Label", 1_700_000_000_004, Value::String("ok".to_string())),
                Metric::new("Raw", 1_700_000_000_005, Value::Bytes(Bytes::from_static(b"\x01\x02"))),
            ],
        )
    }

    #[test]
    fn round_trips_well_formed_payload() {
        let payload = sample_payload();
        let encoded = payload.encode();
        let decoded = Payload::decode(&encoded).unwrap();
        assert_eq!(payload, decoded);
    }

    #[test_case(Value::Int8(-5) ; "int8")]
    #[test_case(Value::Int16(-500) ; "int16")]
    #[test_case(Value::Int32(-70_000) ; "int32")]
    #[test_case(Value::Int64(-5_000_000_000) ; "int64")]
    #[test_case(Value::UInt8(5) ; "uint8")]
    #[test_case(Value::UInt16(500) ; "uint16")]
    #[test_case(Value::UInt32(70_000) ; "uint32")]
    #[test_case(Value::UInt64(5_000_000_000) ; "uint64")]
    #[test_case(Value::Float(1.5) ; "float")]
    #[test_case(Value::Double(1.5) ; "double")]
    #[test_case(Value::Boolean(false) ; "boolean")]
    #[test_case(Value::String("hi".to_string()) ; "string")]
    #[test_case(Value::Bytes(Bytes::from_static(b"xyz")) ; "bytes")]
    fn round_trips_every_datatype(value: Value) {
        let payload = Payload::new(1, 0, None, vec![Metric::new("m", 1, value)]);
        let decoded = Payload::decode(&payload.encode()).unwrap();
        assert_eq!(payload, decoded);
    }

    #[test]
    fn preserves_metric_order() {
        let payload = sample_payload();
        let decoded = Payload::decode(&payload.encode()).unwrap();
        let names: Vec<_> = decoded.metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["Temp", "Humid", "Online", "Label", "Raw"]);
    }

    #[test]
    fn unknown_datatype_tag_becomes_opaque_sentinel_without_aborting() {
        let mut buf = BytesMut::new();
        buf.put_u64(1); // payload timestamp
        buf.put_u8(0); // seq
        buf.put_u8(0); // no uuid
        buf.put_u16(2); // two metrics

        // metric 1: unknown tag 200, followed by a 3-byte opaque value
        buf.put_u16(4);
        buf.put_slice(b"weir");
        buf.put_u8(200);
        buf.put_u64(2);
        buf.put_u16(3);
        buf.put_slice(b"abc");

        // metric 2: a normal, recognizable metric that must still decode
        buf.put_u16(4);
        buf.put_slice(b"good");
        buf.put_u8(DataType::Boolean as u8);
        buf.put_u64(3);
        buf.put_u8(1);

        let decoded = Payload::decode(&buf).unwrap();
        assert_eq!(decoded.metrics.len(), 2);
        assert_eq!(decoded.metrics[0].datatype(), DataType::Unknown);
        assert!(matches!(decoded.metrics[0].value, Value::Opaque(_)));
        assert_eq!(decoded.metrics[1].value, Value::Boolean(true));
    }

    #[test]
    fn truncated_payload_is_an_error_not_a_panic() {
        let bytes = [0u8; 4];
        assert!(Payload::decode(&bytes).is_err());
    }

    #[test]
    fn seq_is_never_reinterpreted_by_the_codec() {
        for seq in [0u8, 1, 127, 255] {
            let payload = Payload::new(1, seq, None, vec![]);
            let decoded = Payload::decode(&payload.encode()).unwrap();
            assert_eq!(decoded.seq, seq);
        }
    }
}
