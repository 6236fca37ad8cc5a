//! Binary record format for the write-ahead log
//!
//! Every record is a fixed 16-byte header followed by a payload:
//!
//! ```text
//!   [0..4]   magic:     "TSWL"
//!   [4..8]   length:    u32 LE  - payload length in bytes
//!   [8..12]  checksum:  u32 LE  - CRC32C of the payload
//!   [12]     operation: u8      - 1 = set, 2 = delete
//!   [13..16] reserved:  zero
//!   payload: key_len(u16 LE) + key + value
//! ```
//!
//! The value length is implied by `length - 2 - key_len`.

use std::path::Path;

use crate::error::{StoreError, StoreResult};

/// Magic bytes opening every record
pub const MAGIC: [u8; 4] = *b"TSWL";

/// Header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Bytes of payload preceding the key
const KEY_LEN_SIZE: usize = 2;

/// Logged mutation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    /// Insert or overwrite a key
    Set = 1,
    /// Remove a key
    Delete = 2,
}

impl Operation {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Operation::Set),
            2 => Some(Operation::Delete),
            _ => None,
        }
    }
}

/// Decoded record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub length: u32,
    pub checksum: u32,
    pub operation: u8,
}

impl RecordHeader {
    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12] = self.operation;
        buf
    }

    /// Parse a header, or report the bytes found where the magic should be.
    pub fn parse(bytes: &[u8], path: &Path, offset: u64) -> StoreResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(StoreError::TornWrite {
                path: path.to_path_buf(),
                expected_size: HEADER_SIZE as u32,
                available_bytes: bytes.len() as u64,
                offset,
            });
        }
        if bytes[0..4] != MAGIC {
            let mut found_bytes = [0u8; 4];
            found_bytes.copy_from_slice(&bytes[0..4]);
            return Err(StoreError::NoMagicFound { path: path.to_path_buf(), offset, found_bytes });
        }
        Ok(Self {
            length: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            checksum: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            operation: bytes[12],
        })
    }
}

/// A decoded log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub operation: Operation,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Encode one record, rejecting keys/values above the configured limits
/// before anything is allocated.
pub fn encode_record(
    key: &[u8],
    value: &[u8],
    op: Operation,
    max_key_size: usize,
    max_value_size: usize,
) -> StoreResult<Vec<u8>> {
    if key.len() > max_key_size || key.len() > u16::MAX as usize {
        return Err(StoreError::OversizedEntry {
            entry_size: key.len() as u64,
            max_size: max_key_size as u64,
            component: "key".to_string(),
        });
    }
    if value.len() > max_value_size {
        return Err(StoreError::OversizedEntry {
            entry_size: value.len() as u64,
            max_size: max_value_size as u64,
            component: "value".to_string(),
        });
    }

    let payload_len = KEY_LEN_SIZE + key.len() + value.len();
    let mut buffer = Vec::with_capacity(HEADER_SIZE + payload_len);
    buffer.extend_from_slice(&[0u8; HEADER_SIZE]);
    buffer.extend_from_slice(&(key.len() as u16).to_le_bytes());
    buffer.extend_from_slice(key);
    buffer.extend_from_slice(value);

    let header = RecordHeader {
        length: payload_len as u32,
        checksum: crc32c::crc32c(&buffer[HEADER_SIZE..]),
        operation: op as u8,
    };
    buffer[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
    Ok(buffer)
}

/// Decode one complete record (header + payload) read from `path` at `offset`.
pub fn decode_record(data: &[u8], path: &Path, offset: u64) -> StoreResult<Record> {
    let header = RecordHeader::parse(data, path, offset)?;
    let payload_end = HEADER_SIZE + header.length as usize;
    if data.len() < payload_end {
        return Err(StoreError::TornWrite {
            path: path.to_path_buf(),
            expected_size: header.length,
            available_bytes: (data.len() - HEADER_SIZE) as u64,
            offset,
        });
    }

    let payload = &data[HEADER_SIZE..payload_end];
    let actual = crc32c::crc32c(payload);
    if actual != header.checksum {
        return Err(StoreError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: header.checksum,
            actual,
            offset,
        });
    }

    let corrupted = |reason: String| StoreError::WalCorrupted { path: path.to_path_buf(), offset, reason };

    let operation = Operation::from_byte(header.operation)
        .ok_or_else(|| corrupted(format!("invalid operation type: {}", header.operation)))?;
    if payload.len() < KEY_LEN_SIZE {
        return Err(corrupted("payload too short for key length".to_string()));
    }
    let key_len = u16::from_le_bytes([payload[0], payload[1]]) as usize;
    let key_end = KEY_LEN_SIZE + key_len;
    if payload.len() < key_end {
        return Err(corrupted(format!("key length {} exceeds payload of {} bytes", key_len, payload.len())));
    }

    Ok(Record {
        operation,
        key: payload[KEY_LEN_SIZE..key_end].to_vec(),
        value: payload[key_end..].to_vec(),
    })
}
