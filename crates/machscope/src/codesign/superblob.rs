//! SuperBlob parsing for Apple code signatures
//!
//! The SuperBlob is the top-level container for all code signature components.
//! It contains a header followed by an index of blob entries, each pointing
//! to embedded blobs (CodeDirectory, requirements, entitlements, CMS signature, etc.)
//!
//! ## Structure
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ SuperBlob Header (12 bytes)        │
//! │  - magic: 0xfade0cc0 (4 bytes)     │
//! │  - length: total size (4 bytes)    │
//! │  - count: number of blobs (4 bytes)│
//! ├────────────────────────────────────┤
//! │ Index Entry 0 (8 bytes)            │
//! │  - slot_type (4 bytes)             │
//! │  - offset (4 bytes)                │
//! ├────────────────────────────────────┤
//! │ ... more index entries             │
//! ├────────────────────────────────────┤
//! │ Blob 0 data (magic, length, ...)   │
//! ├────────────────────────────────────┤
//! │ ... more blob data                 │
//! └────────────────────────────────────┘
//! ```
//!
//! All fields are big-endian regardless of the image's byte order.

use super::constants::*;
use crate::{Error, Result};
use scroll::{Pread, BE};

/// Size of the SuperBlob header in bytes (magic + length + count)
const SUPERBLOB_HEADER_SIZE: usize = 12;

/// Size of each index entry in bytes (slot_type + offset)
const INDEX_ENTRY_SIZE: usize = 8;

/// One validated index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobIndex {
    /// Slot type (see `CSSLOT_*`)
    pub slot: u32,
    /// Offset of the sub-blob from the superblob start
    pub offset: u32,
    /// Magic of the sub-blob
    pub magic: u32,
    /// Length of the sub-blob, header included
    pub length: u32,
}

/// A parsed superblob borrowing the signature bytes.
#[derive(Debug, Clone)]
pub struct SuperBlob<'a> {
    data: &'a [u8],
    /// Declared total length
    pub length: u32,
    entries: Vec<BlobIndex>,
}

fn malformed(msg: String) -> Error {
    Error::MalformedSignature(msg)
}

impl<'a> SuperBlob<'a> {
    /// Parse and validate the header and index.
    ///
    /// Every index entry is checked to point past the index, inside the
    /// declared length, at a sub-blob whose own length stays inside the
    /// superblob and whose magic agrees with its slot.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < SUPERBLOB_HEADER_SIZE {
            return Err(malformed(format!(
                "superblob of {} bytes is shorter than its header",
                data.len()
            )));
        }
        let read = |off: usize| -> Result<u32> {
            data.pread_with::<u32>(off, BE)
                .map_err(|e| malformed(format!("superblob read at {:#x}: {}", off, e)))
        };

        let magic = read(0)?;
        if magic != CSMAGIC_EMBEDDED_SIGNATURE {
            return Err(malformed(format!("bad superblob magic {:#010x}", magic)));
        }
        let length = read(4)?;
        let count = read(8)?;
        let total = length as usize;
        if total > data.len() || total < SUPERBLOB_HEADER_SIZE {
            return Err(malformed(format!(
                "superblob length {:#x} does not fit blob of {:#x} bytes",
                length,
                data.len()
            )));
        }
        if count == 0 && total > SUPERBLOB_HEADER_SIZE {
            return Err(malformed(format!(
                "superblob has no entries but a length of {:#x}",
                length
            )));
        }
        let index_end = (count as usize)
            .checked_mul(INDEX_ENTRY_SIZE)
            .and_then(|n| n.checked_add(SUPERBLOB_HEADER_SIZE))
            .filter(|&end| end <= total)
            .ok_or_else(|| malformed(format!("index of {} entries exceeds superblob", count)))?;

        let mut entries = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let at = SUPERBLOB_HEADER_SIZE + i * INDEX_ENTRY_SIZE;
            let slot = read(at)?;
            let offset = read(at + 4)?;
            let start = offset as usize;
            if start < index_end || start + BLOB_HEADER_SIZE > total {
                return Err(malformed(format!(
                    "{} blob offset {:#x} outside {:#x}..{:#x}",
                    slot_name(slot),
                    offset,
                    index_end,
                    total
                )));
            }
            let blob_magic = read(start)?;
            let blob_len = read(start + 4)?;
            if (blob_len as usize) < BLOB_HEADER_SIZE || start + blob_len as usize > total {
                return Err(malformed(format!(
                    "{} blob at {:#x} declares length {:#x} past superblob end {:#x}",
                    slot_name(slot),
                    offset,
                    blob_len,
                    total
                )));
            }
            if let Some(expected) = expected_magic(slot) {
                if expected != blob_magic {
                    return Err(malformed(format!(
                        "slot {:#x} ({}) holds blob magic {:#010x}, expected {:#010x}",
                        slot,
                        slot_name(slot),
                        blob_magic,
                        expected
                    )));
                }
            }
            entries.push(BlobIndex {
                slot,
                offset,
                magic: blob_magic,
                length: blob_len,
            });
        }

        tracing::debug!(count = entries.len(), length, "parsed superblob");
        Ok(Self {
            data,
            length,
            entries,
        })
    }

    /// Index entries in on-disk order.
    pub fn entries(&self) -> &[BlobIndex] {
        &self.entries
    }

    /// Bytes of one sub-blob, header included.
    pub fn blob(&self, entry: &BlobIndex) -> &'a [u8] {
        let start = entry.offset as usize;
        &self.data[start..start + entry.length as usize]
    }

    /// First entry in `slot`, if present.
    pub fn find(&self, slot: u32) -> Option<&BlobIndex> {
        self.entries.iter().find(|e| e.slot == slot)
    }
}
