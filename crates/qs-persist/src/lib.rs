#![forbid(unsafe_code)]

//! Snapshot persistence and the DUMP/RESTORE value-blob codec.
//!
//! Both formats are length-prefixed binary with a SHA-256 integrity
//! footer. Snapshots are written to a temp file and renamed into place,
//! so a crash mid-save leaves the previous snapshot intact. Snapshots
//! are best-effort: writes since the last save are lost on crash.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};

const SNAPSHOT_MAGIC: &[u8; 4] = b"QSDB";
const BLOB_MAGIC: &[u8; 4] = b"QSVB";
pub const FORMAT_VERSION: u32 = 1;

const TAG_STR: u8 = 1;
const TAG_HASH: u8 = 2;
const TAG_LIST: u8 = 3;
const TAG_SET: u8 = 4;
const TAG_ZSET: u8 = 5;

/// Serializable mirror of the store's value union. Pair vectors rather
/// than maps so the codec stays independent of container choices.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotValue {
    Str(Vec<u8>),
    Hash(Vec<(Vec<u8>, Vec<u8>)>),
    List(Vec<Vec<u8>>),
    Set(Vec<Vec<u8>>),
    ZSet(Vec<(Vec<u8>, f64)>),
}

/// A full dataset dump: `(db index, entries)` for each non-empty db.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub dbs: Vec<(u32, Vec<(Vec<u8>, SnapshotValue)>)>,
}

#[derive(Debug)]
pub enum SnapshotError {
    Truncated,
    BadMagic,
    UnsupportedVersion(u32),
    BadValueTag(u8),
    ChecksumMismatch { expected: String, actual: String },
    Io(io::Error),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::Truncated => write!(f, "snapshot truncated"),
            SnapshotError::BadMagic => write!(f, "not a quasar snapshot"),
            SnapshotError::UnsupportedVersion(v) => {
                write!(f, "unsupported snapshot version {v}")
            }
            SnapshotError::BadValueTag(tag) => write!(f, "unknown value tag {tag}"),
            SnapshotError::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected}, got {actual}")
            }
            SnapshotError::Io(err) => write!(f, "snapshot io error: {err}"),
        }
    }
}

impl std::error::Error for SnapshotError {}

impl From<io::Error> for SnapshotError {
    fn from(err: io::Error) -> Self {
        SnapshotError::Io(err)
    }
}

#[must_use]
pub fn encode_snapshot(snapshot: &Snapshot) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(SNAPSHOT_MAGIC);
    put_u32(&mut out, FORMAT_VERSION);
    put_u32(&mut out, snapshot.dbs.len() as u32);
    for (index, entries) in &snapshot.dbs {
        put_u32(&mut out, *index);
        put_u32(&mut out, entries.len() as u32);
        for (key, value) in entries {
            put_bytes(&mut out, key);
            put_value(&mut out, value);
        }
    }
    seal(out)
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<Snapshot, SnapshotError> {
    let body = unseal(bytes)?;
    let mut r = Reader::new(body);
    if r.take(4)? != SNAPSHOT_MAGIC {
        return Err(SnapshotError::BadMagic);
    }
    let version = r.u32()?;
    if version != FORMAT_VERSION {
        return Err(SnapshotError::UnsupportedVersion(version));
    }
    let db_count = r.u32()? as usize;
    let mut dbs = Vec::with_capacity(db_count);
    for _ in 0..db_count {
        let index = r.u32()?;
        let entry_count = r.u32()? as usize;
        let mut entries = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            let key = r.bytes()?;
            let value = read_value(&mut r)?;
            entries.push((key, value));
        }
        dbs.push((index, entries));
    }
    Ok(Snapshot { dbs })
}

/// Serialize a single value the way DUMP replies carry it.
#[must_use]
pub fn encode_value_blob(value: &SnapshotValue) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(BLOB_MAGIC);
    put_u32(&mut out, FORMAT_VERSION);
    put_value(&mut out, value);
    seal(out)
}

pub fn decode_value_blob(bytes: &[u8]) -> Result<SnapshotValue, SnapshotError> {
    let body = unseal(bytes)?;
    let mut r = Reader::new(body);
    if r.take(4)? != BLOB_MAGIC {
        return Err(SnapshotError::BadMagic);
    }
    let version = r.u32()?;
    if version != FORMAT_VERSION {
        return Err(SnapshotError::UnsupportedVersion(version));
    }
    read_value(&mut r)
}

/// Write the snapshot next to `path` and rename into place.
pub fn save_to_path(path: &Path, snapshot: &Snapshot) -> Result<(), SnapshotError> {
    let encoded = encode_snapshot(snapshot);
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_owned());
    let temp = path.with_file_name(format!("temp-{file_name}"));
    fs::write(&temp, &encoded)?;
    fs::rename(&temp, path)?;
    Ok(())
}

/// Load a snapshot, `Ok(None)` when the file does not exist.
pub fn load_from_path(path: &Path) -> Result<Option<Snapshot>, SnapshotError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    decode_snapshot(&bytes).map(Some)
}

fn seal(mut body: Vec<u8>) -> Vec<u8> {
    let digest = Sha256::digest(&body);
    body.extend_from_slice(&digest);
    body
}

fn unseal(bytes: &[u8]) -> Result<&[u8], SnapshotError> {
    if bytes.len() < 32 {
        return Err(SnapshotError::Truncated);
    }
    let (body, footer) = bytes.split_at(bytes.len() - 32);
    let digest = Sha256::digest(body);
    if digest.as_slice() != footer {
        return Err(SnapshotError::ChecksumMismatch {
            expected: hex::encode(footer),
            actual: hex::encode(digest),
        });
    }
    Ok(body)
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

fn put_value(out: &mut Vec<u8>, value: &SnapshotValue) {
    match value {
        SnapshotValue::Str(bytes) => {
            out.push(TAG_STR);
            put_bytes(out, bytes);
        }
        SnapshotValue::Hash(fields) => {
            out.push(TAG_HASH);
            put_u32(out, fields.len() as u32);
            for (field, value) in fields {
                put_bytes(out, field);
                put_bytes(out, value);
            }
        }
        SnapshotValue::List(items) => {
            out.push(TAG_LIST);
            put_u32(out, items.len() as u32);
            for item in items {
                put_bytes(out, item);
            }
        }
        SnapshotValue::Set(members) => {
            out.push(TAG_SET);
            put_u32(out, members.len() as u32);
            for member in members {
                put_bytes(out, member);
            }
        }
        SnapshotValue::ZSet(scored) => {
            out.push(TAG_ZSET);
            put_u32(out, scored.len() as u32);
            for (member, score) in scored {
                put_bytes(out, member);
                out.extend_from_slice(&score.to_le_bytes());
            }
        }
    }
}

fn read_value(r: &mut Reader<'_>) -> Result<SnapshotValue, SnapshotError> {
    match r.u8()? {
        TAG_STR => Ok(SnapshotValue::Str(r.bytes()?)),
        TAG_HASH => {
            let count = r.u32()? as usize;
            let mut fields = Vec::with_capacity(count);
            for _ in 0..count {
                let field = r.bytes()?;
                let value = r.bytes()?;
                fields.push((field, value));
            }
            Ok(SnapshotValue::Hash(fields))
        }
        TAG_LIST => {
            let count = r.u32()? as usize;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(r.bytes()?);
            }
            Ok(SnapshotValue::List(items))
        }
        TAG_SET => {
            let count = r.u32()? as usize;
            let mut members = Vec::with_capacity(count);
            for _ in 0..count {
                members.push(r.bytes()?);
            }
            Ok(SnapshotValue::Set(members))
        }
        TAG_ZSET => {
            let count = r.u32()? as usize;
            let mut scored = Vec::with_capacity(count);
            for _ in 0..count {
                let member = r.bytes()?;
                let score = r.f64()?;
                scored.push((member, score));
            }
            Ok(SnapshotValue::ZSet(scored))
        }
        tag => Err(SnapshotError::BadValueTag(tag)),
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

    fn take(&mut self, n: usize) -> Result<&'a [u8], SnapshotError> {
        if self.buf.len() - self.pos < n {
            return Err(SnapshotError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, SnapshotError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, SnapshotError> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn f64(&mut self) -> Result<f64, SnapshotError> {
        let raw = self.take(8)?;
        let mut bytes = [0_u8; 8];
        bytes.copy_from_slice(raw);
        Ok(f64::from_le_bytes(bytes))
    }

    fn bytes(&mut self) -> Result<Vec<u8>, SnapshotError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}
