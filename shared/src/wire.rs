//! Codec for the engine's native binary value serialization.
//!
//! Every value starts with a 4-byte little-endian header: the low 16 bits
//! select the type tag, the high 16 bits are a flag field. Flag bit 0 marks
//! the "wide" (64-bit) variant of the int and float tags. Strings are
//! length-prefixed and zero-padded so the stream stays 4-byte aligned.
//! Container payloads carry an element count whose top bit is a legacy
//! "shared" marker that must be masked off, never interpreted.
//!
//! The root value of a full packet is always a mapping; any other root type
//! is a protocol error.

use std::collections::HashMap;

use thiserror::Error;

use crate::math::{Plane, Quaternion, Vector3};

const TAG_NIL: u16 = 0;
const TAG_BOOL: u16 = 1;
const TAG_INT: u16 = 2;
const TAG_FLOAT: u16 = 3;
const TAG_STRING: u16 = 4;
const TAG_VECTOR3: u16 = 7;
const TAG_PLANE: u16 = 9;
const TAG_QUAT: u16 = 10;
const TAG_DICTIONARY: u16 = 18;
const TAG_ARRAY: u16 = 19;

/// Flag bit 0: 64-bit payload for the int/float tags.
const FLAG_WIDE: u16 = 1;

/// Top bit of a container count is a legacy shared-instance marker.
const COUNT_MASK: u32 = 0x7fff_ffff;

/// Decoded in-memory form of one wire value.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Vector3(Vector3),
    Quaternion(Quaternion),
    Plane(Plane),
    List(Vec<WireValue>),
    Mapping(HashMap<String, WireValue>),
    /// Sentinel for a tag this decoder does not understand. Sibling values
    /// are still attempted, but a packet containing one of these is
    /// untrustworthy and callers may discard it wholesale.
    Unsupported(u16),
}

impl WireValue {
    /// Look up a key on a mapping value. Returns None for non-mappings.
    pub fn get(&self, key: &str) -> Option<&WireValue> {
        match self {
            WireValue::Mapping(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            WireValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view regardless of wire width.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            WireValue::Int(v) => Some(*v as i64),
            WireValue::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Float view regardless of wire width.
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            WireValue::Float(v) => Some(*v),
            WireValue::Double(v) => Some(*v as f32),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            WireValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_vector3(&self) -> Option<Vector3> {
        match self {
            WireValue::Vector3(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[WireValue]> {
        match self {
            WireValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// True if this value or anything nested inside it is the
    /// unsupported-tag sentinel.
    pub fn contains_unsupported(&self) -> bool {
        match self {
            WireValue::Unsupported(_) => true,
            WireValue::List(items) => items.iter().any(WireValue::contains_unsupported),
            WireValue::Mapping(map) => map.values().any(WireValue::contains_unsupported),
            _ => false,
        }
    }
}

impl From<&str> for WireValue {
    fn from(v: &str) -> Self {
        WireValue::Str(v.to_string())
    }
}

impl From<String> for WireValue {
    fn from(v: String) -> Self {
        WireValue::Str(v)
    }
}

impl From<i32> for WireValue {
    fn from(v: i32) -> Self {
        WireValue::Int(v)
    }
}

impl From<i64> for WireValue {
    fn from(v: i64) -> Self {
        WireValue::Int64(v)
    }
}

impl From<f32> for WireValue {
    fn from(v: f32) -> Self {
        WireValue::Float(v)
    }
}

impl From<bool> for WireValue {
    fn from(v: bool) -> Self {
        WireValue::Bool(v)
    }
}

impl From<Vector3> for WireValue {
    fn from(v: Vector3) -> Self {
        WireValue::Vector3(v)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum WireError {
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEof(usize),
    #[error("packet root must be a mapping, got tag {0}")]
    NonMappingRoot(u16),
    #[error("string payload is not valid utf-8")]
    InvalidUtf8,
}

/// Decode one packet. The root must be a mapping; trailing bytes after the
/// root value are ignored, matching the engine's own reader.
pub fn decode(bytes: &[u8]) -> Result<WireValue, WireError> {
    let mut reader = Reader::new(bytes);
    let value = read_value(&mut reader)?;
    match value {
        WireValue::Mapping(_) => Ok(value),
        WireValue::Unsupported(tag) => Err(WireError::NonMappingRoot(tag)),
        other => Err(WireError::NonMappingRoot(tag_of(&other))),
    }
}

/// Encode one value. Never fails for representable values; feeding the
/// unsupported-tag sentinel back in is a programming error and panics.
pub fn encode(value: &WireValue) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    write_value(&mut out, value);
    out
}

fn tag_of(value: &WireValue) -> u16 {
    match value {
        WireValue::Null => TAG_NIL,
        WireValue::Bool(_) => TAG_BOOL,
        WireValue::Int(_) | WireValue::Int64(_) => TAG_INT,
        WireValue::Float(_) | WireValue::Double(_) => TAG_FLOAT,
        WireValue::Str(_) => TAG_STRING,
        WireValue::Vector3(_) => TAG_VECTOR3,
        WireValue::Plane(_) => TAG_PLANE,
        WireValue::Quaternion(_) => TAG_QUAT,
        WireValue::Mapping(_) => TAG_DICTIONARY,
        WireValue::List(_) => TAG_ARRAY,
        WireValue::Unsupported(tag) => *tag,
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.pos + n > self.buf.len() {
            return Err(WireError::UnexpectedEof(self.pos));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, WireError> {
        Ok(self.u32()? as i32)
    }

    fn i64(&mut self) -> Result<i64, WireError> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn f32(&mut self) -> Result<f32, WireError> {
        Ok(f32::from_bits(self.u32()?))
    }

    fn f64(&mut self) -> Result<f64, WireError> {
        Ok(f64::from_bits(self.i64()? as u64))
    }
}

fn read_value(r: &mut Reader<'_>) -> Result<WireValue, WireError> {
    let header = r.u32()?;
    let tag = (header & 0xffff) as u16;
    let flags = (header >> 16) as u16;
    let wide = flags & FLAG_WIDE != 0;

    let value = match tag {
        TAG_NIL => WireValue::Null,
        TAG_BOOL => WireValue::Bool(r.u32()? != 0),
        TAG_INT if wide => WireValue::Int64(r.i64()?),
        TAG_INT => WireValue::Int(r.i32()?),
        TAG_FLOAT if wide => WireValue::Double(r.f64()?),
        TAG_FLOAT => WireValue::Float(r.f32()?),
        TAG_STRING => WireValue::Str(read_string(r)?),
        TAG_VECTOR3 => WireValue::Vector3(read_vector3(r)?),
        TAG_PLANE => {
            let normal = read_vector3(r)?;
            let d = r.f32()?;
            WireValue::Plane(Plane::new(normal, d))
        }
        TAG_QUAT => {
            let (x, y, z, w) = (r.f32()?, r.f32()?, r.f32()?, r.f32()?);
            WireValue::Quaternion(Quaternion::new(x, y, z, w))
        }
        TAG_DICTIONARY => read_mapping(r)?,
        TAG_ARRAY => {
            let count = r.u32()? & COUNT_MASK;
            let mut items = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                items.push(read_value(r)?);
            }
            WireValue::List(items)
        }
        other => WireValue::Unsupported(other),
    };
    Ok(value)
}

fn read_vector3(r: &mut Reader<'_>) -> Result<Vector3, WireError> {
    let (x, y, z) = (r.f32()?, r.f32()?, r.f32()?);
    Ok(Vector3::new(x, y, z))
}

fn read_string(r: &mut Reader<'_>) -> Result<String, WireError> {
    let len = r.u32()? as usize;
    let bytes = r.take(len)?;
    let text = std::str::from_utf8(bytes)
        .map_err(|_| WireError::InvalidUtf8)?
        .to_string();
    // consume alignment padding so the next header starts on a 4-byte boundary
    let pad = (4 - len % 4) % 4;
    r.take(pad)?;
    Ok(text)
}

fn read_mapping(r: &mut Reader<'_>) -> Result<WireValue, WireError> {
    let count = r.u32()? & COUNT_MASK;
    let mut map = HashMap::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let key = read_value(r)?;
        let WireValue::Str(key) = key else {
            // A non-string key means the container is unusable from here on.
            // Abort this mapping and hand back what decoded so far.
            return Ok(WireValue::Mapping(map));
        };
        let value = read_value(r)?;
        map.insert(key, value);
    }
    Ok(WireValue::Mapping(map))
}

fn write_header(out: &mut Vec<u8>, tag: u16, flags: u16) {
    out.extend_from_slice(&((tag as u32) | ((flags as u32) << 16)).to_le_bytes());
}

fn write_vector3(out: &mut Vec<u8>, v: &Vector3) {
    out.extend_from_slice(&v.x.to_le_bytes());
    out.extend_from_slice(&v.y.to_le_bytes());
    out.extend_from_slice(&v.z.to_le_bytes());
}

fn write_string_payload(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
    let pad = (4 - s.len() % 4) % 4;
    out.extend_from_slice(&[0u8; 3][..pad]);
}

fn write_value(out: &mut Vec<u8>, value: &WireValue) {
    match value {
        WireValue::Null => write_header(out, TAG_NIL, 0),
        WireValue::Bool(v) => {
            write_header(out, TAG_BOOL, 0);
            out.extend_from_slice(&(*v as u32).to_le_bytes());
        }
        WireValue::Int(v) => {
            write_header(out, TAG_INT, 0);
            out.extend_from_slice(&v.to_le_bytes());
        }
        WireValue::Int64(v) => {
            write_header(out, TAG_INT, FLAG_WIDE);
            out.extend_from_slice(&v.to_le_bytes());
        }
        WireValue::Float(v) => {
            write_header(out, TAG_FLOAT, 0);
            out.extend_from_slice(&v.to_le_bytes());
        }
        WireValue::Double(v) => {
            write_header(out, TAG_FLOAT, FLAG_WIDE);
            out.extend_from_slice(&v.to_le_bytes());
        }
        WireValue::Str(s) => {
            write_header(out, TAG_STRING, 0);
            write_string_payload(out, s);
        }
        WireValue::Vector3(v) => {
            write_header(out, TAG_VECTOR3, 0);
            write_vector3(out, v);
        }
        WireValue::Plane(p) => {
            write_header(out, TAG_PLANE, 0);
            write_vector3(out, &p.normal);
            out.extend_from_slice(&p.d.to_le_bytes());
        }
        WireValue::Quaternion(q) => {
            write_header(out, TAG_QUAT, 0);
            for f in [q.x, q.y, q.z, q.w] {
                out.extend_from_slice(&f.to_le_bytes());
            }
        }
        WireValue::List(items) => {
            // Lists go out under the mapping tag as an integer-indexed pair
            // sequence. Deliberate: peers decode that shape today, so the
            // asymmetry against the dedicated list tag stays as observed.
            write_header(out, TAG_DICTIONARY, 0);
            out.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for (index, item) in items.iter().enumerate() {
                write_value(out, &WireValue::Int(index as i32));
                write_value(out, item);
            }
        }
        WireValue::Mapping(map) => {
            write_header(out, TAG_DICTIONARY, 0);
            out.extend_from_slice(&(map.len() as u32).to_le_bytes());
            for (key, item) in map {
                write_header(out, TAG_STRING, 0);
                write_string_payload(out, key);
                write_value(out, item);
            }
        }
        WireValue::Unsupported(tag) => {
            panic!("attempted to encode unsupported wire tag {tag}")
        }
    }
}
