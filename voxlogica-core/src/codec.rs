//! Canonical serialization of operator results to and from store payloads.
//!
//! Every frame is `[type-tag | format-version | body]`. The layout is a
//! frozen contract: changing it requires bumping the runtime version, so
//! previously persisted records become opaque historical data instead of
//! being misread. Encoding is deterministic: the same logical value always
//! yields byte-equal payloads.

use crate::value::{Dtype, Image2d, LazySeqPlan, NdArray, OpaqueValue, Volume3d, VoxValue};
use thiserror::Error;

/// Current frame version, written after the tag byte of every frame.
pub const FORMAT_VERSION: u8 = 1;

const TAG_NULL: u8 = 0x00;
const TAG_INT: u8 = 0x01;
const TAG_FLOAT: u8 = 0x02;
const TAG_BOOL: u8 = 0x03;
const TAG_STR: u8 = 0x04;
const TAG_BYTES: u8 = 0x05;
const TAG_ARRAY: u8 = 0x06;
const TAG_IMAGE: u8 = 0x07;
const TAG_VOLUME: u8 = 0x08;
const TAG_SEQ: u8 = 0x09;
const TAG_MAP: u8 = 0x0a;
const TAG_LAZY: u8 = 0x0b;
const TAG_OPAQUE: u8 = 0x0f;

const LAZY_RANGE: u8 = 0;
const LAZY_MAP: u8 = 1;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("payload truncated at offset {0}")]
    Truncated(usize),

    #[error("unknown type tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("codec version {0} unsupported (current {FORMAT_VERSION})")]
    CodecVersionUnsupported(u8),

    #[error("invalid utf-8 in string body")]
    InvalidUtf8,

    #[error("invalid frame: {0}")]
    Malformed(String),
}

/// Encode a value into a framed payload.
pub fn encode(value: &VoxValue) -> Vec<u8> {
    let mut buf = Vec::new();
    write_frame(&mut buf, value);
    buf
}

/// Decode a framed payload. Total modulo format version.
pub fn decode(bytes: &[u8]) -> Result<VoxValue, CodecError> {
    let mut cursor = Cursor { buf: bytes, pos: 0 };
    let value = read_frame(&mut cursor)?;
    if cursor.pos != bytes.len() {
        return Err(CodecError::Malformed(format!(
            "{} trailing byte(s)",
            bytes.len() - cursor.pos
        )));
    }
    Ok(value)
}

// ─── Encoding ─────────────────────────────────────────────────

fn write_frame(buf: &mut Vec<u8>, value: &VoxValue) {
    match value {
        VoxValue::Null => {
            buf.push(TAG_NULL);
            buf.push(FORMAT_VERSION);
        }
        VoxValue::Int(v) => {
            buf.push(TAG_INT);
            buf.push(FORMAT_VERSION);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        VoxValue::Float(v) => {
            buf.push(TAG_FLOAT);
            buf.push(FORMAT_VERSION);
            buf.extend_from_slice(&v.to_bits().to_be_bytes());
        }
        VoxValue::Bool(v) => {
            buf.push(TAG_BOOL);
            buf.push(FORMAT_VERSION);
            buf.push(u8::from(*v));
        }
        VoxValue::Str(s) => {
            buf.push(TAG_STR);
            buf.push(FORMAT_VERSION);
            write_bytes(buf, s.as_bytes());
        }
        VoxValue::Bytes(b) => {
            buf.push(TAG_BYTES);
            buf.push(FORMAT_VERSION);
            write_bytes(buf, b);
        }
        VoxValue::Array(a) => {
            buf.push(TAG_ARRAY);
            buf.push(FORMAT_VERSION);
            write_array_body(buf, a.dtype, &a.shape, &a.data);
        }
        VoxValue::Image(i) => {
            buf.push(TAG_IMAGE);
            buf.push(FORMAT_VERSION);
            buf.push(i.channels);
            write_array_body(buf, i.dtype, &[i.width, i.height], &i.data);
        }
        VoxValue::Volume(v) => {
            buf.push(TAG_VOLUME);
            buf.push(FORMAT_VERSION);
            write_array_body(buf, v.dtype, &[v.width, v.height, v.depth], &v.data);
        }
        VoxValue::Seq(items) => {
            buf.push(TAG_SEQ);
            buf.push(FORMAT_VERSION);
            buf.extend_from_slice(&(items.len() as u32).to_be_bytes());
            for item in items {
                write_frame(buf, item);
            }
        }
        VoxValue::Map(map) => {
            buf.push(TAG_MAP);
            buf.push(FORMAT_VERSION);
            buf.extend_from_slice(&(map.len() as u32).to_be_bytes());
            // BTreeMap iteration order keeps the frame deterministic.
            for (key, item) in map {
                write_bytes(buf, key.as_bytes());
                write_frame(buf, item);
            }
        }
        VoxValue::Lazy(plan) => {
            buf.push(TAG_LAZY);
            buf.push(FORMAT_VERSION);
            write_lazy_body(buf, plan);
        }
        VoxValue::Opaque(o) => {
            buf.push(TAG_OPAQUE);
            buf.push(FORMAT_VERSION);
            write_bytes(buf, o.type_name.as_bytes());
            // serde_json maps are sorted by key, so this stays byte-stable.
            let body = serde_json::to_vec(&o.body).unwrap_or_default();
            write_bytes(buf, &body);
        }
    }
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn write_array_body(buf: &mut Vec<u8>, dtype: Dtype, shape: &[u64], data: &[u8]) {
    buf.push(dtype.tag());
    buf.push(shape.len() as u8);
    for dim in shape {
        buf.extend_from_slice(&dim.to_be_bytes());
    }
    buf.extend_from_slice(&(data.len() as u64).to_be_bytes());
    buf.extend_from_slice(data);
}

fn write_lazy_body(buf: &mut Vec<u8>, plan: &LazySeqPlan) {
    match plan {
        LazySeqPlan::Range { start, stop, step } => {
            buf.push(LAZY_RANGE);
            buf.extend_from_slice(&start.to_be_bytes());
            buf.extend_from_slice(&stop.to_be_bytes());
            buf.extend_from_slice(&step.to_be_bytes());
        }
        LazySeqPlan::Map { operator, source } => {
            buf.push(LAZY_MAP);
            write_bytes(buf, operator.as_bytes());
            write_lazy_body(buf, source);
        }
    }
}

// ─── Decoding ─────────────────────────────────────────────────

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or(CodecError::Truncated(self.pos))?;
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or(CodecError::Truncated(self.pos))?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn len_prefixed(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn string(&mut self) -> Result<String, CodecError> {
        std::str::from_utf8(self.len_prefixed()?)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8)
    }
}

fn read_frame(c: &mut Cursor<'_>) -> Result<VoxValue, CodecError> {
    let tag = c.u8()?;
    let version = c.u8()?;
    if version != FORMAT_VERSION {
        return Err(CodecError::CodecVersionUnsupported(version));
    }
    match tag {
        TAG_NULL => Ok(VoxValue::Null),
        TAG_INT => Ok(VoxValue::Int(c.i64()?)),
        TAG_FLOAT => Ok(VoxValue::Float(f64::from_bits(c.u64()?))),
        TAG_BOOL => Ok(VoxValue::Bool(c.u8()? != 0)),
        TAG_STR => Ok(VoxValue::Str(c.string()?)),
        TAG_BYTES => Ok(VoxValue::Bytes(c.len_prefixed()?.to_vec())),
        TAG_ARRAY => {
            let (dtype, shape, data) = read_array_body(c)?;
            Ok(VoxValue::Array(NdArray { dtype, shape, data }))
        }
        TAG_IMAGE => {
            let channels = c.u8()?;
            let (dtype, shape, data) = read_array_body(c)?;
            if shape.len() != 2 {
                return Err(CodecError::Malformed(format!(
                    "image frame with {} dims",
                    shape.len()
                )));
            }
            Ok(VoxValue::Image(Image2d {
                width: shape[0],
                height: shape[1],
                channels,
                dtype,
                data,
            }))
        }
        TAG_VOLUME => {
            let (dtype, shape, data) = read_array_body(c)?;
            if shape.len() != 3 {
                return Err(CodecError::Malformed(format!(
                    "volume frame with {} dims",
                    shape.len()
                )));
            }
            Ok(VoxValue::Volume(Volume3d {
                width: shape[0],
                height: shape[1],
                depth: shape[2],
                dtype,
                data,
            }))
        }
        TAG_SEQ => {
            let count = c.u32()? as usize;
            let mut items = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                items.push(read_frame(c)?);
            }
            Ok(VoxValue::Seq(items))
        }
        TAG_MAP => {
            let count = c.u32()? as usize;
            let mut map = std::collections::BTreeMap::new();
            for _ in 0..count {
                let key = c.string()?;
                let value = read_frame(c)?;
                map.insert(key, value);
            }
            Ok(VoxValue::Map(map))
        }
        TAG_LAZY => Ok(VoxValue::Lazy(read_lazy_body(c)?)),
        TAG_OPAQUE => {
            let type_name = c.string()?;
            let body: serde_json::Value = serde_json::from_slice(c.len_prefixed()?)
                .map_err(|e| CodecError::Malformed(format!("opaque body: {e}")))?;
            Ok(VoxValue::Opaque(OpaqueValue { type_name, body }))
        }
        other => Err(CodecError::UnknownTag(other)),
    }
}

fn read_array_body(c: &mut Cursor<'_>) -> Result<(Dtype, Vec<u64>, Vec<u8>), CodecError> {
    let dtype = Dtype::from_tag(c.u8()?)
        .ok_or_else(|| CodecError::Malformed("unknown dtype tag".into()))?;
    let ndim = c.u8()? as usize;
    let mut shape = Vec::with_capacity(ndim);
    for _ in 0..ndim {
        shape.push(c.u64()?);
    }
    let data_len = c.u64()? as usize;
    let expected: u64 = shape.iter().product::<u64>() * dtype.size() as u64;
    if data_len as u64 != expected {
        return Err(CodecError::Malformed(format!(
            "array data is {data_len} bytes, shape wants {expected}"
        )));
    }
    Ok((dtype, shape, c.take(data_len)?.to_vec()))
}

fn read_lazy_body(c: &mut Cursor<'_>) -> Result<LazySeqPlan, CodecError> {
    match c.u8()? {
        LAZY_RANGE => Ok(LazySeqPlan::Range {
            start: c.i64()?,
            stop: c.i64()?,
            step: c.i64()?,
        }),
        LAZY_MAP => {
            let operator = c.string()?;
            let source = Box::new(read_lazy_body(c)?);
            Ok(LazySeqPlan::Map { operator, source })
        }
        other => Err(CodecError::Malformed(format!("lazy plan kind {other}"))),
    }
}
