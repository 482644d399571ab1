// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TFRecord framing.
//!
//! Each record is laid out as:
//!
//! ```text
//! u64  length          (little endian)
//! u32  masked_crc32c(length bytes)
//! [u8; length] data
//! u32  masked_crc32c(data)
//! ```
//!
//! The writer appends to an in-memory buffer so a partially written shard can
//! be checkpointed as plain bytes and continued later with
//! [`TfRecordWriter::resume`].

use crate::error::MediaError;

const CRC32C_POLY: u32 = 0x82F6_3B78;
const MASK_DELTA: u32 = 0xA282_EAD8;

const CRC32C_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC32C_POLY
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// CRC32C (Castagnoli).
pub fn crc32c(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &byte in data {
        crc = CRC32C_TABLE[((crc ^ byte as u32) & 0xFF) as usize] ^ (crc >> 8);
    }
    !crc
}

/// CRC32C masked the way TFRecord stores it.
pub fn masked_crc32c(data: &[u8]) -> u32 {
    let crc = crc32c(data);
    crc.rotate_right(15).wrapping_add(MASK_DELTA)
}

/// Appends TFRecord frames to a byte buffer.
#[derive(Debug, Default, Clone)]
pub struct TfRecordWriter {
    buf: Vec<u8>,
    records: usize,
}

impl TfRecordWriter {
    /// Empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue after `bytes`, a previously checkpointed buffer holding
    /// `records` complete frames.
    pub fn resume(bytes: Vec<u8>, records: usize) -> Self {
        Self {
            buf: bytes,
            records,
        }
    }

    /// Append one record.
    pub fn write_record(&mut self, data: &[u8]) {
        let len = (data.len() as u64).to_le_bytes();
        self.buf.extend_from_slice(&len);
        self.buf.extend_from_slice(&masked_crc32c(&len).to_le_bytes());
        self.buf.extend_from_slice(data);
        self.buf.extend_from_slice(&masked_crc32c(data).to_le_bytes());
        self.records += 1;
    }

    /// Records written, including resumed ones.
    pub fn record_count(&self) -> usize {
        self.records
    }

    /// Bytes written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Take the buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Iterates the records of a TFRecord buffer, verifying checksums.
///
/// A record cut short at the end of the buffer (a file still being written)
/// is reported as [`MediaError::CorruptRecord`] with reason `"truncated"`.
pub struct TfRecordReader<'a> {
    data: &'a [u8],
    offset: usize,
}

/// Reason reported for a record cut short by the end of the buffer.
pub const TRUNCATED: &str = "truncated";

impl<'a> TfRecordReader<'a> {
    /// Read `data` from the start.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn corrupt(&self, reason: &'static str) -> MediaError {
        MediaError::CorruptRecord {
            offset: self.offset,
            reason,
        }
    }
}

impl<'a> Iterator for TfRecordReader<'a> {
    type Item = Result<&'a [u8], MediaError>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.data[self.offset..];
        if rest.is_empty() {
            return None;
        }
        if rest.len() < 12 {
            let err = self.corrupt(TRUNCATED);
            self.offset = self.data.len();
            return Some(Err(err));
        }

        let (len_bytes, tail) = rest.split_at(8);
        let (len_crc, tail) = tail.split_at(4);
        let stored_len_crc = u32::from_le_bytes([len_crc[0], len_crc[1], len_crc[2], len_crc[3]]);
        if masked_crc32c(len_bytes) != stored_len_crc {
            let err = self.corrupt("length checksum mismatch");
            self.offset = self.data.len();
            return Some(Err(err));
        }

        let mut len_array = [0u8; 8];
        len_array.copy_from_slice(len_bytes);
        let len = u64::from_le_bytes(len_array) as usize;
        if tail.len() < len.saturating_add(4) {
            let err = self.corrupt(TRUNCATED);
            self.offset = self.data.len();
            return Some(Err(err));
        }

        let (record, tail) = tail.split_at(len);
        let stored_crc = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
        if masked_crc32c(record) != stored_crc {
            let err = self.corrupt("data checksum mismatch");
            self.offset = self.data.len();
            return Some(Err(err));
        }

        self.offset += 12 + len + 4;
        Some(Ok(record))
    }
}
