//! Index map: image coordinates to directory entry offsets.
//!
//! # Block Layout
//!
//! ```text
//! 4 bytes       INDEX_MAP_HEADER
//! 4 bytes       entry count
//! 20 bytes × N  channel, slice, frame, position, IFD offset
//! ```
//!
//! Entries are unordered; readers rebuild a lookup table from them.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::TiffError;
use crate::format::blocks::{BLOCK_HEADER_SIZE, INDEX_ENTRY_SIZE, INDEX_MAP_HEADER};
use crate::format::tiff::ByteOrder;
use crate::metadata::ImageCoords;

/// Offsets of the directory entries of every non-blank image in one file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexMap {
    entries: HashMap<ImageCoords, u32>,
}

impl IndexMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an entry, returning the offset it replaces if the coordinates
    /// were already present.
    pub fn insert(&mut self, coords: ImageCoords, offset: u32) -> Option<u32> {
        self.entries.insert(coords, offset)
    }

    pub fn get(&self, coords: &ImageCoords) -> Option<u32> {
        self.entries.get(coords).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ImageCoords, &u32)> {
        self.entries.iter()
    }

    /// Size of the encoded block for `entries` entries.
    #[inline]
    pub fn block_len_for(entries: usize) -> u64 {
        BLOCK_HEADER_SIZE + entries as u64 * INDEX_ENTRY_SIZE
    }

    /// Size of this map's encoded block.
    pub fn block_len(&self) -> u64 {
        Self::block_len_for(self.len())
    }

    /// Encode the block.
    pub fn encode(&self, order: ByteOrder) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.block_len() as usize);
        order.put_u32(&mut buf, INDEX_MAP_HEADER);
        order.put_u32(&mut buf, self.entries.len() as u32);
        for (coords, &offset) in &self.entries {
            for component in coords.components() {
                order.put_u32(&mut buf, component);
            }
            order.put_u32(&mut buf, offset);
        }
        debug_assert_eq!(buf.len() as u64, self.block_len());
        buf.freeze()
    }

    /// Decode a block starting at its header.
    pub fn decode(order: ByteOrder, bytes: &[u8]) -> Result<Self, TiffError> {
        let header_len = BLOCK_HEADER_SIZE as usize;
        if bytes.len() < header_len {
            return Err(TiffError::FileTooSmall {
                required: BLOCK_HEADER_SIZE,
                actual: bytes.len() as u64,
            });
        }

        let magic = order.read_u32(bytes);
        if magic != INDEX_MAP_HEADER {
            return Err(TiffError::InvalidBlockHeader {
                block: "index map",
                expected: INDEX_MAP_HEADER,
                actual: magic,
            });
        }

        let count = order.read_u32(&bytes[4..]) as usize;
        let required = Self::block_len_for(count);
        if (bytes.len() as u64) < required {
            return Err(TiffError::FileTooSmall {
                required,
                actual: bytes.len() as u64,
            });
        }

        let mut entries = HashMap::with_capacity(count);
        for record in bytes[header_len..required as usize].chunks_exact(INDEX_ENTRY_SIZE as usize) {
            let value = |i: usize| order.read_u32(&record[i * 4..]);
            let coords = ImageCoords::new(value(0), value(1), value(2), value(3));
            entries.insert(coords, value(4));
        }

        Ok(Self { entries })
    }
}
