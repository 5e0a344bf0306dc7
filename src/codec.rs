//! # Payload Encoding and the CAR Container
//!
//! Two byte-level concerns live here:
//!
//! - checksums and timestamps for rows in the event log
//! - the CAR-style container used to export a repository or to ship the
//!   blocks a commit introduced
//!
//! ## Container Format
//!
//! ```text
//! ┌──────────────┬──────────────────────────────┐
//! │ varint(len)  │ {"version":1,"roots":[cid]}  │   header (JSON)
//! ├──────────────┼──────────────┬───────────────┤
//! │ varint(len)  │ cid (32 B)   │ block bytes   │   frame 1
//! ├──────────────┼──────────────┼───────────────┤
//! │ varint(len)  │ cid (32 B)   │ block bytes   │   frame 2
//! └──────────────┴──────────────┴───────────────┘
//! ```
//!
//! `len` counts everything after the varint. Frames are self-verifying: the
//! reader rehashes every block and rejects the container if any CID does not
//! match its bytes.

use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use integer_encoding::{VarInt, VarIntWriter};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{BlockMap, Cid};

/// Container version written into every header.
pub const CAR_VERSION: u64 = 1;

// =============================================================================
// Helper Functions
// =============================================================================

/// Computes a checksum for an event payload.
///
/// XXH3-64, stored alongside the payload and re-checked on decode.
pub fn compute_checksum(data: &[u8]) -> i64 {
    xxhash_rust::xxh3::xxh3_64(data) as i64
}

/// Returns the current time in milliseconds since Unix epoch.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Unsigned Varints
// =============================================================================

/// Reads a varint from the front of `input`, returning it and the bytes used.
pub fn read_varint(input: &[u8]) -> Result<(u64, usize)> {
    u64::decode_var(input)
        .ok_or_else(|| Error::Unprocessable("truncated or oversized varint".into()))
}

/// Reads a varint length prefix and checks it fits in the `remaining` bytes.
fn read_length(input: &[u8], remaining: usize, what: &str) -> Result<(usize, usize)> {
    let (len, used) = read_varint(input)?;
    usize::try_from(len)
        .ok()
        .filter(|len| *len <= remaining.saturating_sub(used))
        .map(|len| (len, used))
        .ok_or_else(|| Error::Unprocessable(format!("{} of {} bytes overruns the container", what, len)))
}

// =============================================================================
// CAR Writer
// =============================================================================

#[derive(Serialize, Deserialize)]
struct CarHeader {
    version: u64,
    roots: Vec<Cid>,
}

/// Streams a block container into any [`Write`] sink.
///
/// # Example
///
/// ```rust,ignore
/// let mut car = CarWriter::new(Vec::new(), &head)?;
/// car.write_block(&cid, &bytes)?;
/// let bytes = car.finish()?;
/// ```
pub struct CarWriter<W: Write> {
    out: W,
    blocks_written: usize,
}

impl<W: Write> CarWriter<W> {
    /// Writes the header declaring `root` and returns the writer.
    pub fn new(mut out: W, root: &Cid) -> Result<Self> {
        let header = serde_json::to_vec(&CarHeader {
            version: CAR_VERSION,
            roots: vec![*root],
        })?;
        out.write_varint(header.len())?;
        out.write_all(&header)?;

        Ok(Self {
            out,
            blocks_written: 0,
        })
    }

    /// Appends one block frame.
    pub fn write_block(&mut self, cid: &Cid, data: &[u8]) -> Result<()> {
        self.out.write_varint(Cid::LEN + data.len())?;
        self.out.write_all(cid.as_bytes())?;
        self.out.write_all(data)?;
        self.blocks_written += 1;
        Ok(())
    }

    pub fn blocks_written(&self) -> usize {
        self.blocks_written
    }

    /// Flushes and returns the underlying sink.
    pub fn finish(mut self) -> Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Encodes `blocks` into an in-memory container rooted at `root`.
pub fn blocks_to_car(root: &Cid, blocks: &BlockMap) -> Result<Vec<u8>> {
    let mut car = CarWriter::new(Vec::with_capacity(blocks.byte_size() + 64), root)?;
    for (cid, data) in blocks.iter() {
        car.write_block(cid, data)?;
    }
    car.finish()
}

// =============================================================================
// CAR Reader
// =============================================================================

/// Decodes a container into its declared root and its blocks.
///
/// # Errors
///
/// `Error::Unprocessable` on truncation, a malformed header, a header without
/// exactly one root, or a frame whose bytes do not hash to its CID.
pub fn read_car(bytes: &[u8]) -> Result<(Cid, BlockMap)> {
    let (header_len, used) = read_length(bytes, bytes.len(), "container header")?;
    let mut pos = used;
    let header_end = pos + header_len;
    let header: CarHeader = serde_json::from_slice(&bytes[pos..header_end])
        .map_err(|e| Error::Unprocessable(format!("malformed container header: {}", e)))?;
    if header.version != CAR_VERSION || header.roots.len() != 1 {
        return Err(Error::Unprocessable(format!(
            "unsupported container header (version {}, {} roots)",
            header.version,
            header.roots.len()
        )));
    }
    pos = header_end;

    let mut blocks = BlockMap::new();
    while pos < bytes.len() {
        let (frame_len, used) = read_length(&bytes[pos..], bytes.len() - pos, "block frame")?;
        pos += used;
        if frame_len < Cid::LEN {
            return Err(Error::Unprocessable(format!(
                "short block frame at offset {}",
                pos
            )));
        }
        let cid = Cid::from_raw_bytes(&bytes[pos..pos + Cid::LEN])?;
        let data = &bytes[pos + Cid::LEN..pos + frame_len];
        if !cid.verifies(data) {
            return Err(Error::Unprocessable(format!("block {} does not match its hash", cid)));
        }
        blocks.set(cid, data.to_vec());
        pos += frame_len;
    }

    Ok((header.roots[0], blocks))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_deterministic() {
        assert_eq!(compute_checksum(b"payload"), compute_checksum(b"payload"));
        assert_ne!(compute_checksum(b"data1"), compute_checksum(b"data2"));
    }

    #[test]
    fn test_varint_rejects_truncation() {
        let encoded = 300u64.encode_var_vec();
        assert_eq!(read_varint(&encoded).unwrap(), (300, encoded.len()));
        assert!(read_varint(&[0x80, 0x80]).is_err());
        assert!(read_varint(&[]).is_err());
    }

    #[test]
    fn test_car_carries_root_and_blocks() {
        let mut blocks = BlockMap::new();
        let root = blocks.add(b"root block".to_vec());
        blocks.add(b"leaf".to_vec());

        let bytes = blocks_to_car(&root, &blocks).unwrap();
        let (decoded_root, decoded) = read_car(&bytes).unwrap();

        assert_eq!(decoded_root, root);
        assert_eq!(decoded, blocks);
    }

    #[test]
    fn test_truncated_car_is_unprocessable() {
        let mut blocks = BlockMap::new();
        let root = blocks.add(b"some block bytes".to_vec());
        let bytes = blocks_to_car(&root, &blocks).unwrap();

        let err = read_car(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, Error::Unprocessable(_)));
    }

    #[test]
    fn test_tampered_block_is_rejected() {
        let mut blocks = BlockMap::new();
        let root = blocks.add(b"original".to_vec());
        let mut bytes = blocks_to_car(&root, &blocks).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        assert!(matches!(read_car(&bytes), Err(Error::Unprocessable(_))));
    }

    fn header_only(root: &Cid) -> Vec<u8> {
        CarWriter::new(Vec::new(), root).unwrap().finish().unwrap()
    }

    #[test]
    fn test_huge_frame_length_is_unprocessable() {
        let root = Cid::for_bytes(b"root");
        for len in [u64::MAX, u64::MAX - 4, usize::MAX as u64 - 8] {
            let mut bytes = header_only(&root);
            bytes.extend_from_slice(&len.encode_var_vec());
            bytes.extend_from_slice(&[0u8; 40]);
            assert!(matches!(read_car(&bytes), Err(Error::Unprocessable(_))));
        }
    }

    #[test]
    fn test_huge_header_length_is_unprocessable() {
        let mut bytes = u64::MAX.encode_var_vec();
        bytes.extend_from_slice(b"{}");
        assert!(matches!(read_car(&bytes), Err(Error::Unprocessable(_))));
    }
}
