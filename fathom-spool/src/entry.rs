//! Spool entry format.
//!
//! Each spool file holds exactly one entry:
//!
//! ```text
//! +----------+----------+----------+----------+
//! |  CRC32   |  Length  | Sequence | Payload  |
//! | (4 bytes)| (4 bytes)| (8 bytes)| (N bytes)|
//! +----------+----------+----------+----------+
//! ```
//!
//! - CRC32: Checksum of Length + Sequence + Payload (NOT including CRC itself)
//! - Length: Payload length in bytes
//! - Sequence: Batch sequence number, equal to the file name
//!
//! All integers are stored in little-endian format.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use fathom_core::BatchSeq;

use crate::error::{SpoolError, SpoolResult};
use crate::limits::ENTRY_PAYLOAD_SIZE_BYTES_MAX;

/// Size of the entry header in bytes.
pub const ENTRY_HEADER_SIZE: usize = 16; // 4 + 4 + 8

/// Entry header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    /// CRC32 checksum of the rest of the entry.
    pub crc: u32,
    /// Length of the payload in bytes.
    pub length: u32,
    /// Sequence number of the batch.
    pub seq: BatchSeq,
}

impl EntryHeader {
    /// Creates a header for a payload.
    ///
    /// # Errors
    /// Returns `EntryTooLarge` if the payload exceeds the limit.
    pub fn new(seq: BatchSeq, payload: &[u8]) -> SpoolResult<Self> {
        if payload.len() > ENTRY_PAYLOAD_SIZE_BYTES_MAX as usize {
            return Err(SpoolError::EntryTooLarge {
                size: payload.len() as u64,
                max: ENTRY_PAYLOAD_SIZE_BYTES_MAX,
            });
        }

        #[allow(clippy::cast_possible_truncation)] // Checked against the limit above.
        let length = payload.len() as u32;

        Ok(Self {
            crc: Self::compute_crc(length, seq, payload),
            length,
            seq,
        })
    }

    fn compute_crc(length: u32, seq: BatchSeq, payload: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&length.to_le_bytes());
        hasher.update(&seq.get().to_le_bytes());
        hasher.update(payload);
        hasher.finalize()
    }
}

/// A spooled batch: header plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolEntry {
    /// Entry header.
    pub header: EntryHeader,
    /// Entry payload.
    pub payload: Bytes,
}

impl SpoolEntry {
    /// Creates a new entry.
    ///
    /// # Errors
    /// Returns an error if the payload is too large.
    pub fn new(seq: BatchSeq, payload: Bytes) -> SpoolResult<Self> {
        let header = EntryHeader::new(seq, &payload)?;
        Ok(Self { header, payload })
    }

    /// Returns the sequence number.
    #[must_use]
    pub const fn seq(&self) -> BatchSeq {
        self.header.seq
    }

    /// Encodes the entry into a fresh buffer.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ENTRY_HEADER_SIZE + self.payload.len());
        buf.put_u32_le(self.header.crc);
        buf.put_u32_le(self.header.length);
        buf.put_u64_le(self.header.seq.get());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decodes and verifies an entry read from `file`.
    ///
    /// # Errors
    /// Returns `InvalidEntry` for truncated or oversized data and
    /// `ChecksumMismatch` if the CRC does not match.
    pub fn decode(mut data: Bytes, file: &str) -> SpoolResult<Self> {
        if data.remaining() < ENTRY_HEADER_SIZE {
            return Err(SpoolError::InvalidEntry {
                file: file.to_string(),
                reason: "file too small for header",
            });
        }

        let crc = data.get_u32_le();
        let length = data.get_u32_le();
        let seq = BatchSeq::new(data.get_u64_le());

        if length > ENTRY_PAYLOAD_SIZE_BYTES_MAX {
            return Err(SpoolError::InvalidEntry {
                file: file.to_string(),
                reason: "length exceeds maximum",
            });
        }
        if data.remaining() != length as usize {
            return Err(SpoolError::InvalidEntry {
                file: file.to_string(),
                reason: "payload length does not match header",
            });
        }

        let expected = EntryHeader::compute_crc(length, seq, &data);
        if expected != crc {
            return Err(SpoolError::ChecksumMismatch {
                file: file.to_string(),
                expected,
                actual: crc,
            });
        }

        Ok(Self {
            header: EntryHeader { crc, length, seq },
            payload: data,
        })
    }
}
