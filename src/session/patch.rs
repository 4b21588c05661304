//! Deferred writes into bytes already laid out.
//!
//! Several fields point at data that only exists once a file is finished: the
//! header slots of the trailer blocks, the two image descriptions and the
//! ImageJ tags of the first directory entry, and the next-IFD field of the last
//! entry. They are recorded here as (site, bytes) pairs and submitted together
//! when the session finalizes. Sites never overlap the bytes written after
//! them, so the order of resolution only matters between patches of one site.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::error::WriteError;
use crate::format::blocks::{encode_count_and_offset, encode_offset_slot};
use crate::format::tiff::ByteOrder;
use crate::io::{WriteBuffer, WriteScheduler, WriteTarget};

/// One deferred write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    /// Absolute file position
    pub site: u64,
    pub bytes: Bytes,
}

/// Patches waiting for the next finalize step.
#[derive(Debug)]
pub struct PatchTable {
    order: ByteOrder,
    patches: Vec<Patch>,
}

impl PatchTable {
    pub fn new(order: ByteOrder) -> Self {
        Self {
            order,
            patches: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    /// Record a single 32-bit value.
    pub fn record_u32(&mut self, site: u64, value: u32) {
        self.patches.push(Patch {
            site,
            bytes: Bytes::copy_from_slice(&self.order.u32_bytes(value)),
        });
    }

    /// Record a header slot: block magic followed by the block offset.
    pub fn record_slot(&mut self, site: u64, magic: u32, offset: u64) -> Result<(), WriteError> {
        let bytes = encode_offset_slot(self.order, magic, offset)?;
        self.patches.push(Patch { site, bytes });
        Ok(())
    }

    /// Record the count and offset of a tag record whose record starts at
    /// `record_site`.
    pub fn record_tag_value(&mut self, record_site: u64, count: u32, offset: u64) -> Result<(), WriteError> {
        let bytes = encode_count_and_offset(self.order, count, offset)?;
        // Skip the tag id and field type
        self.patches.push(Patch {
            site: record_site + 4,
            bytes,
        });
        Ok(())
    }

    /// Submit every recorded patch to the scheduler, in recording order.
    pub fn resolve(&mut self, scheduler: &WriteScheduler, target: &Arc<WriteTarget>) -> Result<(), WriteError> {
        debug!("Resolving {} patches in {}", self.patches.len(), target.name);
        for patch in self.patches.drain(..) {
            scheduler.write(target, patch.site, vec![WriteBuffer::Shared(patch.bytes)])?;
        }
        Ok(())
    }
}
