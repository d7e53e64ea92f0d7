//! Raft snapshot codec (§4.9 Snapshot format, R2/R3).
//!
//! Two formats:
//! - **Monolithic**: a fixed header (`magic`, `version`, `flags`,
//!   `original_length`) followed by a single compressed body and an
//!   optional CRC32C trailer. Used for `get_snapshot_builder`/
//!   `install_snapshot` round-trips of the whole key/value state machine.
//! - **Streaming records**: `KV`/`Custom`/`EOF` tagged records, used when a
//!   snapshot is replayed incrementally instead of materialised in full.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAGIC: u32 = 0x5241_4654; // "RAFT"
const VERSION: u8 = 1;

const FLAG_CRC32C: u8 = 0b0000_0001;
const FLAG_GZIP: u8 = 0b0000_0010; // unset => snappy

/// Typed decode failures (§4.9 Snapshots, R3), distinguishing "the bytes are
/// corrupt" from transport-level/IO trouble so callers can return
/// `RaftError::SnapshotCorrupted` specifically rather than a generic IO
/// error.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot buffer too short")]
    TooShort,
    #[error("snapshot checksum mismatch")]
    ChecksumMismatch,
    #[error("bad snapshot magic")]
    BadMagic,
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u8),
    #[error("decompression failed: {0}")]
    Decompress(#[from] io::Error),
    #[error("snapshot body deserialisation failed: {0}")]
    Deserialize(#[from] serde_json::Error),
}

impl SnapshotError {
    /// True for every outcome that means the bytes themselves are bad, as
    /// opposed to a decompression/deserialisation failure that could in
    /// principle also come from a non-corruption bug.
    pub fn is_corrupted(&self) -> bool {
        matches!(
            self,
            SnapshotError::TooShort
                | SnapshotError::ChecksumMismatch
                | SnapshotError::BadMagic
                | SnapshotError::UnsupportedVersion(_)
        )
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MonolithicBody {
    kv: BTreeMap<String, Vec<u8>>,
}

/// Encodes the full key/value state into the monolithic snapshot format:
/// `magic(4) | version(1) | flags(1) | original_length(8) | body | crc32c(4)`.
pub fn encode_monolithic(kv: &BTreeMap<String, Vec<u8>>) -> io::Result<Vec<u8>> {
    let plain = serde_json::to_vec(&MonolithicBody { kv: kv.clone() })
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let original_length = plain.len() as u64;

    let mut compressed = Vec::new();
    {
        let mut encoder = snap::write::FrameEncoder::new(&mut compressed);
        encoder.write_all(&plain)?;
        encoder.flush()?;
    }

    let mut out = Vec::with_capacity(14 + compressed.len() + 4);
    out.extend_from_slice(&MAGIC.to_be_bytes());
    out.push(VERSION);
    out.push(FLAG_CRC32C);
    out.extend_from_slice(&original_length.to_be_bytes());
    out.extend_from_slice(&compressed);

    let checksum = crc32c::crc32c(&out);
    out.extend_from_slice(&checksum.to_be_bytes());
    Ok(out)
}

/// Decodes a buffer produced by [`encode_monolithic`]. Rejects a bad magic,
/// unsupported version, or a checksum mismatch (R2/R3: corrupt snapshots
/// must never be silently accepted, and must fail as a distinguishable
/// [`SnapshotError`] rather than an opaque IO error).
pub fn decode_monolithic(buf: &[u8]) -> Result<BTreeMap<String, Vec<u8>>, SnapshotError> {
    if buf.len() < 14 + 4 {
        return Err(SnapshotError::TooShort);
    }

    let (header_and_body, checksum_bytes) = buf.split_at(buf.len() - 4);
    let expected: u32 = u32::from_be_bytes(checksum_bytes.try_into().unwrap());
    let actual = crc32c::crc32c(header_and_body);
    if actual != expected {
        return Err(SnapshotError::ChecksumMismatch);
    }

    let magic = u32::from_be_bytes(header_and_body[0..4].try_into().unwrap());
    if magic != MAGIC {
        return Err(SnapshotError::BadMagic);
    }
    let version = header_and_body[4];
    if version != VERSION {
        return Err(SnapshotError::UnsupportedVersion(version));
    }
    let flags = header_and_body[5];
    let original_length = u64::from_be_bytes(header_and_body[6..14].try_into().unwrap());
    let compressed = &header_and_body[14..];

    let mut plain = Vec::with_capacity(original_length as usize);
    if flags & FLAG_GZIP != 0 {
        flate2::read::GzDecoder::new(compressed).read_to_end(&mut plain)?;
    } else {
        snap::read::FrameDecoder::new(compressed).read_to_end(&mut plain)?;
    }

    let body: MonolithicBody = serde_json::from_slice(&plain)?;
    Ok(body.kv)
}

/// Streaming record tags for incremental snapshot transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Kv { key: String, value: Vec<u8> },
    Custom { tag: String, bytes: Vec<u8> },
    Eof,
}

const TAG_KV: u8 = 1;
const TAG_CUSTOM: u8 = 2;
const TAG_EOF: u8 = 0xFF;

pub fn write_record<W: Write>(w: &mut W, record: &Record) -> io::Result<()> {
    match record {
        Record::Kv { key, value } => {
            w.write_all(&[TAG_KV])?;
            write_framed(w, key.as_bytes())?;
            write_framed(w, value)?;
        }
        Record::Custom { tag, bytes } => {
            w.write_all(&[TAG_CUSTOM])?;
            write_framed(w, tag.as_bytes())?;
            write_framed(w, bytes)?;
        }
        Record::Eof => w.write_all(&[TAG_EOF])?,
    }
    Ok(())
}

fn write_framed<W: Write>(w: &mut W, bytes: &[u8]) -> io::Result<()> {
    w.write_all(&(bytes.len() as u32).to_be_bytes())?;
    w.write_all(bytes)
}

fn read_framed<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Reads one record. Returns `Ok(Record::Eof)` at the terminator, or an
/// `UnexpectedEof` if the stream ends before a terminator is seen.
pub fn read_record<R: Read>(r: &mut R) -> io::Result<Record> {
    let mut tag = [0u8; 1];
    r.read_exact(&mut tag)?;
    match tag[0] {
        TAG_KV => {
            let key = String::from_utf8_lossy(&read_framed(r)?).into_owned();
            let value = read_framed(r)?;
            Ok(Record::Kv { key, value })
        }
        TAG_CUSTOM => {
            let tag = String::from_utf8_lossy(&read_framed(r)?).into_owned();
            let bytes = read_framed(r)?;
            Ok(Record::Custom { tag, bytes })
        }
        TAG_EOF => Ok(Record::Eof),
        other => Err(io::Error::new(io::ErrorKind::InvalidData, format!("unknown record tag {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monolithic_round_trips_through_snappy() {
        let mut kv = BTreeMap::new();
        kv.insert("a".to_string(), b"1".to_vec());
        kv.insert("b".to_string(), b"2".to_vec());

        let encoded = encode_monolithic(&kv).unwrap();
        let decoded = decode_monolithic(&encoded).unwrap();
        assert_eq!(decoded, kv);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let mut kv = BTreeMap::new();
        kv.insert("a".to_string(), b"1".to_vec());
        let mut encoded = encode_monolithic(&kv).unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;

        let err = decode_monolithic(&encoded).unwrap_err();
        assert!(matches!(err, SnapshotError::ChecksumMismatch));
        assert!(err.is_corrupted());
    }

    #[test]
    fn truncated_buffer_is_rejected_not_panicked() {
        let err = decode_monolithic(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, SnapshotError::TooShort));
        assert!(err.is_corrupted());
    }

    #[test]
    fn streaming_records_round_trip_and_terminate_with_eof() {
        let mut buf = Vec::new();
        write_record(&mut buf, &Record::Kv { key: "k".into(), value: b"v".to_vec() }).unwrap();
        write_record(&mut buf, &Record::Custom { tag: "meta".into(), bytes: b"x".to_vec() }).unwrap();
        write_record(&mut buf, &Record::Eof).unwrap();

        let mut cursor = io::Cursor::new(buf);
        assert_eq!(read_record(&mut cursor).unwrap(), Record::Kv { key: "k".into(), value: b"v".to_vec() });
        assert_eq!(read_record(&mut cursor).unwrap(), Record::Custom { tag: "meta".into(), bytes: b"x".to_vec() });
        assert_eq!(read_record(&mut cursor).unwrap(), Record::Eof);
    }
}
