//! GGUF container header reader.
//!
//! Only the header and the metadata key/value section are parsed; tensor
//! infos and tensor data are left to the engine. This is enough to validate a
//! model file up front and to learn its architecture, embedding width and
//! context length without loading weights.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use thiserror::Error;

pub const GGUF_MAGIC: [u8; 4] = *b"GGUF";

/// Versions with 64-bit lengths. Version 1 used 32-bit lengths and is rejected.
const SUPPORTED_VERSIONS: [u32; 2] = [2, 3];

const MAX_STRING_LEN: u64 = 1 << 24;
const MAX_ARRAY_LEN: u64 = 1 << 24;
const MAX_KV_COUNT: u64 = 1 << 16;
const MAX_ARRAY_DEPTH: usize = 4;

#[derive(Debug, Error)]
pub enum GgufError {
    #[error("i/o error reading GGUF: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a GGUF file (magic {0:02x?})")]
    BadMagic([u8; 4]),
    #[error("unsupported GGUF version {0}")]
    UnsupportedVersion(u32),
    #[error("unknown metadata value type {0}")]
    InvalidValueType(u32),
    #[error("{what} length {len} exceeds limit")]
    TooLarge { what: &'static str, len: u64 },
    #[error("metadata string is not valid UTF-8")]
    Utf8,
    #[error("metadata arrays nested too deeply")]
    TooDeep,
}

/// A typed metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum GgufValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    String(String),
    Array(Vec<GgufValue>),
    U64(u64),
    I64(i64),
    F64(f64),
}

impl GgufValue {
    fn type_id(&self) -> u32 {
        match self {
            Self::U8(_) => 0,
            Self::I8(_) => 1,
            Self::U16(_) => 2,
            Self::I16(_) => 3,
            Self::U32(_) => 4,
            Self::I32(_) => 5,
            Self::F32(_) => 6,
            Self::Bool(_) => 7,
            Self::String(_) => 8,
            Self::Array(_) => 9,
            Self::U64(_) => 10,
            Self::I64(_) => 11,
            Self::F64(_) => 12,
        }
    }

    /// Any integer type, widened.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::U8(v) => Some(v.into()),
            Self::I8(v) => Some(v.into()),
            Self::U16(v) => Some(v.into()),
            Self::I16(v) => Some(v.into()),
            Self::U32(v) => Some(v.into()),
            Self::I32(v) => Some(v.into()),
            Self::U64(v) => i64::try_from(v).ok(),
            Self::I64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Self::Bool(b) => Some(b),
            _ => None,
        }
    }
}

impl std::fmt::Display for GgufValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s:?}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::F32(v) => write!(f, "{v}"),
            Self::F64(v) => write!(f, "{v}"),
            Self::Array(items) => write!(f, "[{} items]", items.len()),
            other => match other.as_i64() {
                Some(v) => write!(f, "{v}"),
                None => write!(f, "{other:?}"),
            },
        }
    }
}

/// Parsed GGUF header.
#[derive(Debug, Clone)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata: BTreeMap<String, GgufValue>,
}

impl GgufHeader {
    pub fn get(&self, key: &str) -> Option<&GgufValue> {
        self.metadata.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(GgufValue::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(GgufValue::as_i64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(GgufValue::as_bool)
    }

    /// `general.architecture`, e.g. `"qwen3"` or `"bert"`.
    pub fn architecture(&self) -> Option<&str> {
        self.get_str("general.architecture")
    }

    fn arch_i64(&self, suffix: &str) -> Option<i64> {
        let arch = self.architecture()?;
        self.get_i64(&format!("{arch}.{suffix}"))
    }

    pub fn embedding_length(&self) -> Option<u32> {
        self.arch_i64("embedding_length").and_then(|v| u32::try_from(v).ok())
    }

    pub fn context_length(&self) -> Option<u32> {
        self.arch_i64("context_length").and_then(|v| u32::try_from(v).ok())
    }

    pub fn pooling_type(&self) -> Option<i64> {
        self.arch_i64("pooling_type")
    }

    pub fn name(&self) -> Option<&str> {
        self.get_str("general.name")
    }
}

/// Read the header of the GGUF file at `path`.
pub fn read_header(path: impl AsRef<Path>) -> Result<GgufHeader, GgufError> {
    let file = File::open(path.as_ref())?;
    parse_header(&mut BufReader::new(file))
}

/// Parse a GGUF header from any reader positioned at offset 0.
pub fn parse_header<R: Read>(reader: &mut R) -> Result<GgufHeader, GgufError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != GGUF_MAGIC {
        return Err(GgufError::BadMagic(magic));
    }

    let version = read_u32(reader)?;
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(GgufError::UnsupportedVersion(version));
    }

    let tensor_count = read_u64(reader)?;
    let kv_count = read_u64(reader)?;
    if kv_count > MAX_KV_COUNT {
        return Err(GgufError::TooLarge {
            what: "metadata",
            len: kv_count,
        });
    }

    let mut metadata = BTreeMap::new();
    for _ in 0..kv_count {
        let key = read_string(reader)?;
        let value_type = read_u32(reader)?;
        let value = read_value(reader, value_type, 0)?;
        metadata.insert(key, value);
    }

    Ok(GgufHeader {
        version,
        tensor_count,
        metadata,
    })
}

fn read_value<R: Read>(reader: &mut R, value_type: u32, depth: usize) -> Result<GgufValue, GgufError> {
    Ok(match value_type {
        0 => GgufValue::U8(read_array::<R, 1>(reader)?[0]),
        1 => GgufValue::I8(i8::from_le_bytes(read_array(reader)?)),
        2 => GgufValue::U16(u16::from_le_bytes(read_array(reader)?)),
        3 => GgufValue::I16(i16::from_le_bytes(read_array(reader)?)),
        4 => GgufValue::U32(read_u32(reader)?),
        5 => GgufValue::I32(i32::from_le_bytes(read_array(reader)?)),
        6 => GgufValue::F32(f32::from_le_bytes(read_array(reader)?)),
        7 => GgufValue::Bool(read_array::<R, 1>(reader)?[0] != 0),
        8 => GgufValue::String(read_string(reader)?),
        9 => {
            if depth >= MAX_ARRAY_DEPTH {
                return Err(GgufError::TooDeep);
            }
            let item_type = read_u32(reader)?;
            let len = read_u64(reader)?;
            if len > MAX_ARRAY_LEN {
                return Err(GgufError::TooLarge { what: "array", len });
            }
            let mut items = Vec::with_capacity(len.min(4096) as usize);
            for _ in 0..len {
                items.push(read_value(reader, item_type, depth + 1)?);
            }
            GgufValue::Array(items)
        }
        10 => GgufValue::U64(read_u64(reader)?),
        11 => GgufValue::I64(i64::from_le_bytes(read_array(reader)?)),
        12 => GgufValue::F64(f64::from_le_bytes(read_array(reader)?)),
        other => return Err(GgufError::InvalidValueType(other)),
    })
}

fn read_array<R: Read, const N: usize>(reader: &mut R) -> Result<[u8; N], GgufError> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, GgufError> {
    Ok(u32::from_le_bytes(read_array(reader)?))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64, GgufError> {
    Ok(u64::from_le_bytes(read_array(reader)?))
}

fn read_string<R: Read>(reader: &mut R) -> Result<String, GgufError> {
    let len = read_u64(reader)?;
    if len > MAX_STRING_LEN {
        return Err(GgufError::TooLarge { what: "string", len });
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| GgufError::Utf8)
}

/// Writes metadata-only GGUF files (version 3, zero tensors).
///
/// Such a file is a complete model for the reference backend.
#[derive(Debug, Default, Clone)]
pub struct GgufWriter {
    metadata: Vec<(String, GgufValue)>,
}

impl GgufWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, key: impl Into<String>, value: GgufValue) -> Self {
        self.metadata.push((key.into(), value));
        self
    }

    pub fn add_str(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add(key, GgufValue::String(value.into()))
    }

    pub fn add_u32(self, key: impl Into<String>, value: u32) -> Self {
        self.add(key, GgufValue::U32(value))
    }

    pub fn add_bool(self, key: impl Into<String>, value: bool) -> Self {
        self.add(key, GgufValue::Bool(value))
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), GgufError> {
        writer.write_all(&GGUF_MAGIC)?;
        writer.write_all(&3u32.to_le_bytes())?;
        writer.write_all(&0u64.to_le_bytes())?;
        writer.write_all(&(self.metadata.len() as u64).to_le_bytes())?;
        for (key, value) in &self.metadata {
            write_string(writer, key)?;
            writer.write_all(&value.type_id().to_le_bytes())?;
            write_value(writer, value)?;
        }
        Ok(())
    }

    pub fn write_file(&self, path: impl AsRef<Path>) -> Result<(), GgufError> {
        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }
}

fn write_string<W: Write>(writer: &mut W, s: &str) -> Result<(), GgufError> {
    writer.write_all(&(s.len() as u64).to_le_bytes())?;
    writer.write_all(s.as_bytes())?;
    Ok(())
}

fn write_value<W: Write>(writer: &mut W, value: &GgufValue) -> Result<(), GgufError> {
    match value {
        GgufValue::U8(v) => writer.write_all(&[*v])?,
        GgufValue::I8(v) => writer.write_all(&v.to_le_bytes())?,
        GgufValue::U16(v) => writer.write_all(&v.to_le_bytes())?,
        GgufValue::I16(v) => writer.write_all(&v.to_le_bytes())?,
        GgufValue::U32(v) => writer.write_all(&v.to_le_bytes())?,
        GgufValue::I32(v) => writer.write_all(&v.to_le_bytes())?,
        GgufValue::F32(v) => writer.write_all(&v.to_le_bytes())?,
        GgufValue::Bool(v) => writer.write_all(&[u8::from(*v)])?,
        GgufValue::String(s) => write_string(writer, s)?,
        GgufValue::Array(items) => {
            // Mixed-type arrays are not representable; the first item decides.
            let item_type = items.first().map(GgufValue::type_id).unwrap_or(4);
            writer.write_all(&item_type.to_le_bytes())?;
            writer.write_all(&(items.len() as u64).to_le_bytes())?;
            for item in items {
                write_value(writer, item)?;
            }
        }
        GgufValue::U64(v) => writer.write_all(&v.to_le_bytes())?,
        GgufValue::I64(v) => writer.write_all(&v.to_le_bytes())?,
        GgufValue::F64(v) => writer.write_all(&v.to_le_bytes())?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample() -> Vec<u8> {
        let mut buf = Vec::new();
        GgufWriter::new()
            .add_str("general.architecture", "qwen3")
            .add_str("general.name", "Qwen3-Embedding-0.6B")
            .add_u32("qwen3.embedding_length", 1024)
            .add_u32("qwen3.context_length", 32768)
            .add("qwen3.pooling_type", GgufValue::U32(3))
            .add_bool("tokenizer.ggml.add_bos_token", false)
            .add(
                "tokenizer.ggml.tokens",
                GgufValue::Array(vec![
                    GgufValue::String("<unk>".into()),
                    GgufValue::String("<s>".into()),
                ]),
            )
            .write_to(&mut buf)
            .unwrap();
        buf
    }

    #[test]
    fn parses_written_header() {
        let header = parse_header(&mut Cursor::new(sample())).unwrap();
        assert_eq!(header.version, 3);
        assert_eq!(header.tensor_count, 0);
        assert_eq!(header.architecture(), Some("qwen3"));
        assert_eq!(header.name(), Some("Qwen3-Embedding-0.6B"));
        assert_eq!(header.embedding_length(), Some(1024));
        assert_eq!(header.context_length(), Some(32768));
        assert_eq!(header.pooling_type(), Some(3));
        assert_eq!(header.get_bool("tokenizer.ggml.add_bos_token"), Some(false));
        match header.get("tokenizer.ggml.tokens") {
            Some(GgufValue::Array(items)) => assert_eq!(items.len(), 2),
            other => panic!("unexpected tokens value: {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample();
        bytes[0] = b'X';
        let err = parse_header(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, GgufError::BadMagic(_)));
    }

    #[test]
    fn rejects_version_one() {
        let mut bytes = sample();
        bytes[4..8].copy_from_slice(&1u32.to_le_bytes());
        let err = parse_header(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, GgufError::UnsupportedVersion(1)));
    }

    #[test]
    fn truncated_file_is_an_io_error() {
        let bytes = sample();
        let err = parse_header(&mut Cursor::new(&bytes[..bytes.len() - 3])).unwrap_err();
        assert!(matches!(err, GgufError::Io(_)));
    }

    #[test]
    fn unknown_value_type_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&GGUF_MAGIC);
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.extend_from_slice(&3u64.to_le_bytes());
        buf.extend_from_slice(b"key");
        buf.extend_from_slice(&42u32.to_le_bytes());
        let err = parse_header(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, GgufError::InvalidValueType(42)));
    }

    #[test]
    fn oversized_string_is_rejected_before_allocating() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&GGUF_MAGIC);
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.extend_from_slice(&u64::MAX.to_le_bytes());
        let err = parse_header(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, GgufError::TooLarge { what: "string", .. }));
    }
}
