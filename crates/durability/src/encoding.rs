//! WAL frame encoding with CRC32 checksums
//!
//! Frame layout (little-endian):
//!
//! ```text
//! +-----------+-----------+------------------------+
//! | len: u32  | crc: u32  | payload: bincode bytes |
//! +-----------+-----------+------------------------+
//! ```
//!
//! `crc` covers the payload only. A frame whose bytes end early is
//! `Incomplete` (a torn tail after a crash); a frame whose checksum does not
//! match is `ChecksumMismatch` (corruption).

use crate::wal::{WalEntry, WalError};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

/// Bytes preceding every payload
pub const FRAME_HEADER_SIZE: usize = 8;

/// Largest payload accepted on decode; anything larger is treated as corrupt
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024 * 1024;

/// Encode one entry into a self-delimiting frame
pub fn encode_entry(entry: &WalEntry) -> Result<Vec<u8>, WalError> {
    let payload =
        bincode::serialize(entry).map_err(|e| WalError::Serialization(e.to_string()))?;
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(WalError::Serialization(format!(
            "entry of {} bytes exceeds frame limit",
            payload.len()
        )));
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.write_u32::<LittleEndian>(payload.len() as u32)?;
    frame.write_u32::<LittleEndian>(crc32fast::hash(&payload))?;
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode the frame at the start of `buf`
///
/// Returns the entry and the number of bytes consumed.
pub fn decode_entry(buf: &[u8], offset: u64) -> Result<(WalEntry, usize), WalError> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Err(WalError::Incomplete {
            offset,
            have: buf.len(),
            needed: FRAME_HEADER_SIZE,
        });
    }

    let len = LittleEndian::read_u32(&buf[0..4]) as usize;
    let expected = LittleEndian::read_u32(&buf[4..8]);
    if len > MAX_FRAME_PAYLOAD {
        return Err(WalError::ChecksumMismatch {
            offset,
            expected,
            actual: 0,
        });
    }

    let total = FRAME_HEADER_SIZE + len;
    if buf.len() < total {
        return Err(WalError::Incomplete {
            offset,
            have: buf.len(),
            needed: total,
        });
    }

    let payload = &buf[FRAME_HEADER_SIZE..total];
    let actual = crc32fast::hash(payload);
    if actual != expected {
        return Err(WalError::ChecksumMismatch {
            offset,
            expected,
            actual,
        });
    }

    let entry: WalEntry =
        bincode::deserialize(payload).map_err(|e| WalError::Serialization(e.to_string()))?;
    Ok((entry, total))
}
