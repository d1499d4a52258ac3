//! On-disk record format for store segments.
//!
//! A segment is a flat sequence of records:
//!
//! ```text
//! crc32c: u32 LE | kind: u8 | key_len: u32 LE | value_len: u32 LE | key | value
//! ```
//!
//! The checksum covers everything after itself. Tombstones carry an empty value.

use std::io;
use std::path::{Path, PathBuf};

use crc32c::crc32c;

/// Fixed bytes in front of every record's key.
pub(crate) const HEADER_LEN: usize = 4 + 1 + 4 + 4;

/// File extension of segment files.
pub(crate) const SEGMENT_EXT: &str = "vlog";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordKind {
    Value,
    Tombstone,
}

impl RecordKind {
    fn flag(self) -> u8 {
        match self {
            RecordKind::Value => 0,
            RecordKind::Tombstone => 1,
        }
    }

    fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            0 => Some(RecordKind::Value),
            1 => Some(RecordKind::Tombstone),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Record<'a> {
    pub kind: RecordKind,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DecodeError {
    /// The buffer ends inside the record.
    Truncated,
    /// Checksum mismatch or unknown kind flag.
    Invalid,
}

/// Appends the encoding of one record to `out` and returns its length.
pub(crate) fn encode(kind: RecordKind, key: &[u8], value: &[u8], out: &mut Vec<u8>) -> usize {
    let start = out.len();
    out.extend_from_slice(&[0; 4]);
    out.push(kind.flag());
    out.extend_from_slice(&(key.len() as u32).to_le_bytes());
    out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(value);

    let crc = crc32c(&out[start + 4..]);
    out[start..start + 4].copy_from_slice(&crc.to_le_bytes());
    out.len() - start
}

/// Decodes the record at the front of `buf`, returning it and its length.
pub(crate) fn decode(buf: &[u8]) -> Result<(Record<'_>, usize), DecodeError> {
    if buf.len() < HEADER_LEN {
        return Err(DecodeError::Truncated);
    }
    let crc = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let flag = buf[4];
    let key_len = u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
    let value_len = u32::from_le_bytes([buf[9], buf[10], buf[11], buf[12]]) as usize;

    let total = HEADER_LEN + key_len + value_len;
    if buf.len() < total {
        return Err(DecodeError::Truncated);
    }
    if crc32c(&buf[4..total]) != crc {
        return Err(DecodeError::Invalid);
    }
    let kind = RecordKind::from_flag(flag).ok_or(DecodeError::Invalid)?;

    let key_end = HEADER_LEN + key_len;
    Ok((
        Record {
            kind,
            key: &buf[HEADER_LEN..key_end],
            value: &buf[key_end..total],
        },
        total,
    ))
}

/// Where and why a scan stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ScanStop {
    pub offset: u64,
    pub error: DecodeError,
    /// `true` when the failing record extends to (or past) the end of the buffer.
    pub at_tail: bool,
}

/// Walks every record in `buf`, calling `visit(offset, record, len)`.
pub(crate) fn scan<'a, F>(buf: &'a [u8], mut visit: F) -> Result<(), ScanStop>
where
    F: FnMut(u64, Record<'a>, u32),
{
    let mut pos = 0usize;
    while pos < buf.len() {
        match decode(&buf[pos..]) {
            Ok((record, len)) => {
                visit(pos as u64, record, len as u32);
                pos += len;
            }
            Err(error) => {
                return Err(ScanStop {
                    offset: pos as u64,
                    error,
                    at_tail: error == DecodeError::Truncated || declared_end(&buf[pos..]) >= buf.len() - pos,
                });
            }
        }
    }
    Ok(())
}

// Length the header at the front of `buf` claims for its record.
fn declared_end(buf: &[u8]) -> usize {
    if buf.len() < HEADER_LEN {
        return buf.len();
    }
    let key_len = u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
    let value_len = u32::from_le_bytes([buf[9], buf[10], buf[11], buf[12]]) as usize;
    HEADER_LEN.saturating_add(key_len).saturating_add(value_len)
}

pub(crate) fn segment_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("{id:06}.{SEGMENT_EXT}"))
}

fn parse_segment_id(name: &str) -> Option<u32> {
    name.strip_suffix(SEGMENT_EXT)?
        .strip_suffix('.')?
        .parse()
        .ok()
}

/// Lists the segment ids present in `dir`, oldest first.
pub(crate) fn list_segments(dir: &Path) -> io::Result<Vec<u32>> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(id) = entry.file_name().to_str().and_then(parse_segment_id) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}
