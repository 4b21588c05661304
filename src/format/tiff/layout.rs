//! Directory entry (IFD) layout.
//!
//! One directory entry is written per image, followed directly by its payload:
//!
//! ```text
//! 2 bytes        entry count
//! N × 12 bytes   tag records (tag, type, count, value-or-offset)
//! 4 bytes        next IFD offset (end of this entry's payload)
//! 6 bytes        bits-per-sample triplet (RGB only)
//! P bytes        pixels (single strip)
//! 16 bytes       x/y resolution rationals
//! M bytes        per-image metadata string
//! ```
//!
//! Entries are contiguous, so the next-IFD field of every entry points at the
//! byte right after its own payload. The session zeroes the field of the last
//! entry when the file is finished.
//!
//! The first entry of a file carries four extra tags whose values are only
//! known at close: two ImageDescription slots (OME-XML and ImageJ header) and
//! the two ImageJ metadata tags. Their absolute positions are returned so the
//! session can patch them later.

use bytes::{BufMut, Bytes, BytesMut};

use super::parser::ByteOrder;
use super::tags::{
    FieldType, TiffTag, COMPRESSION_NONE, PHOTOMETRIC_BLACK_IS_ZERO, PHOTOMETRIC_RGB,
    RESOLUTION_UNIT_CENTIMETER,
};
use crate::error::WriteError;
use crate::io::WriteBuffer;
use crate::metadata::SummaryMetadata;

// =============================================================================
// Constants
// =============================================================================

/// Tag records in every directory entry.
pub const BASE_ENTRIES: u16 = 13;

/// Additional tag records in the first directory entry of a file.
pub const FIRST_ENTRY_EXTRA: u16 = 4;

/// Size of one tag record in bytes.
pub const TAG_RECORD_SIZE: u64 = 12;

/// Two resolution rationals (x and y).
pub const RESOLUTION_BYTES: u64 = 16;

/// Metadata string written for blank entries.
pub const BLANK_METADATA: &str = "NULL ";

// =============================================================================
// IfdLayout
// =============================================================================

/// Image parameters fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IfdLayout {
    pub byte_order: ByteOrder,
    pub width: u32,
    pub height: u32,
    /// Bytes per sample (1, 2 or 3)
    pub byte_depth: u8,
    pub rgb: bool,
    /// Pixels per centimeter as (numerator, denominator)
    pub resolution: (u32, u32),
}

impl IfdLayout {
    /// Derive the layout from summary metadata.
    pub fn from_summary(summary: &SummaryMetadata, byte_order: ByteOrder) -> Self {
        Self {
            byte_order,
            width: summary.width,
            height: summary.height,
            byte_depth: summary.byte_depth(),
            rgb: summary.is_rgb(),
            resolution: summary.resolution(),
        }
    }

    #[inline]
    pub fn samples_per_pixel(&self) -> u16 {
        if self.rgb {
            3
        } else {
            1
        }
    }

    #[inline]
    pub fn bits_per_sample(&self) -> u16 {
        self.byte_depth as u16 * 8
    }

    /// Size of the packed pixel payload.
    pub fn bytes_per_image(&self) -> u64 {
        self.width as u64
            * self.height as u64
            * self.byte_depth as u64
            * self.samples_per_pixel() as u64
    }

    /// Number of tag records in an entry.
    #[inline]
    pub const fn entry_count(first: bool) -> u16 {
        if first {
            BASE_ENTRIES + FIRST_ENTRY_EXTRA
        } else {
            BASE_ENTRIES
        }
    }

    /// Bytes of the entry block: count, records, next offset, bits triplet.
    pub fn block_len(&self, first: bool) -> u64 {
        2 + Self::entry_count(first) as u64 * TAG_RECORD_SIZE + 4 + if self.rgb { 6 } else { 0 }
    }

    /// Total bytes of one entry including its payload.
    pub fn encoded_len(&self, first: bool, metadata_len: usize) -> u64 {
        self.block_len(first) + self.bytes_per_image() + RESOLUTION_BYTES + metadata_len as u64
    }

    fn resolution_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RESOLUTION_BYTES as usize);
        let (numerator, denominator) = self.resolution;
        for _ in 0..2 {
            self.byte_order.put_u32(&mut buf, numerator);
            self.byte_order.put_u32(&mut buf, denominator);
        }
        buf.freeze()
    }
}

// =============================================================================
// Encoded Entry
// =============================================================================

/// Absolute positions of the tag records patched when the file is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirstEntrySites {
    pub ome_description: u64,
    pub imagej_description: u64,
    pub imagej_byte_counts: u64,
    pub imagej_metadata: u64,
}

/// One encoded directory entry ready to be written at `offset`.
#[derive(Debug)]
pub struct EncodedIfd {
    /// Absolute position of the entry count
    pub offset: u64,
    /// Exact number of bytes in `buffers`
    pub len: u64,
    /// Absolute position of the next-IFD field
    pub next_ifd_site: u64,
    /// Patch sites, present only for the first entry of a file
    pub first_sites: Option<FirstEntrySites>,
    /// Entry block, pixels, resolution, metadata, in file order
    pub buffers: Vec<WriteBuffer>,
}

/// Writes 12-byte tag records into an entry block.
struct RecordWriter {
    buf: BytesMut,
    order: ByteOrder,
    base: u64,
}

impl RecordWriter {
    /// Append a record and return its absolute file position.
    fn record(&mut self, tag: TiffTag, field_type: FieldType, count: u32, value: u32) -> u64 {
        let site = self.base + self.buf.len() as u64;
        self.order.put_u16(&mut self.buf, tag.as_u16());
        self.order.put_u16(&mut self.buf, field_type.as_u16());
        self.order.put_u32(&mut self.buf, count);
        if field_type == FieldType::Short && count == 1 {
            // Left-justified in the 4-byte value field
            self.order.put_u16(&mut self.buf, value as u16);
            self.buf.put_u16(0);
        } else {
            self.order.put_u32(&mut self.buf, value);
        }
        site
    }
}

/// Narrow a file offset to the 32-bit field of classic TIFF.
pub fn checked_offset(offset: u64) -> Result<u32, WriteError> {
    u32::try_from(offset).map_err(|_| WriteError::OffsetOverflow(offset))
}

/// Encode one directory entry at `offset`.
///
/// `pixels` must already be packed to `layout.bytes_per_image()` bytes.
///
/// # Errors
/// Returns `OffsetOverflow` if any part of the entry would lie beyond the
/// 32-bit offset range of classic TIFF.
pub fn encode_ifd(
    layout: &IfdLayout,
    offset: u64,
    first: bool,
    pixels: WriteBuffer,
    metadata: &str,
) -> Result<EncodedIfd, WriteError> {
    let len = layout.encoded_len(first, metadata.len());
    checked_offset(offset + len)?;

    let entry_count = IfdLayout::entry_count(first);
    let records_end = offset + 2 + entry_count as u64 * TAG_RECORD_SIZE;
    let next_ifd_site = records_end;
    let pixel_bytes = layout.bytes_per_image();

    let mut data_offset = records_end + 4;
    let bits_offset = data_offset;
    if layout.rgb {
        data_offset += 6;
    }
    let strip_offset = data_offset;
    data_offset += pixel_bytes;
    let x_resolution_offset = data_offset;
    let y_resolution_offset = data_offset + 8;
    data_offset += RESOLUTION_BYTES;
    let metadata_offset = data_offset;
    let next_ifd_offset = metadata_offset + metadata.len() as u64;
    debug_assert_eq!(next_ifd_offset, offset + len);

    let mut w = RecordWriter {
        buf: BytesMut::with_capacity(layout.block_len(first) as usize),
        order: layout.byte_order,
        base: offset,
    };
    w.order.put_u16(&mut w.buf, entry_count);

    let order = layout.byte_order;
    let bits = layout.bits_per_sample();
    let samples = layout.samples_per_pixel();

    w.record(TiffTag::ImageWidth, FieldType::Long, 1, layout.width);
    w.record(TiffTag::ImageLength, FieldType::Long, 1, layout.height);
    if layout.rgb {
        w.record(TiffTag::BitsPerSample, FieldType::Short, 3, checked_offset(bits_offset)?);
    } else {
        w.record(TiffTag::BitsPerSample, FieldType::Short, 1, bits as u32);
    }
    w.record(TiffTag::Compression, FieldType::Short, 1, COMPRESSION_NONE as u32);
    let photometric = if layout.rgb {
        PHOTOMETRIC_RGB
    } else {
        PHOTOMETRIC_BLACK_IS_ZERO
    };
    w.record(TiffTag::PhotometricInterpretation, FieldType::Short, 1, photometric as u32);

    let description_sites = if first {
        let ome = w.record(TiffTag::ImageDescription, FieldType::Ascii, 0, 0);
        let imagej = w.record(TiffTag::ImageDescription, FieldType::Ascii, 0, 0);
        Some((ome, imagej))
    } else {
        None
    };

    w.record(TiffTag::StripOffsets, FieldType::Long, 1, checked_offset(strip_offset)?);
    w.record(TiffTag::SamplesPerPixel, FieldType::Short, 1, samples as u32);
    w.record(TiffTag::RowsPerStrip, FieldType::Short, 1, layout.height);
    w.record(TiffTag::StripByteCounts, FieldType::Long, 1, checked_offset(pixel_bytes)?);
    w.record(TiffTag::XResolution, FieldType::Rational, 1, checked_offset(x_resolution_offset)?);
    w.record(TiffTag::YResolution, FieldType::Rational, 1, checked_offset(y_resolution_offset)?);
    w.record(TiffTag::ResolutionUnit, FieldType::Short, 1, RESOLUTION_UNIT_CENTIMETER as u32);

    let first_sites = match description_sites {
        Some((ome_description, imagej_description)) => {
            let imagej_byte_counts = w.record(TiffTag::ImageJMetadataByteCounts, FieldType::Long, 0, 0);
            let imagej_metadata = w.record(TiffTag::ImageJMetadata, FieldType::Byte, 0, 0);
            Some(FirstEntrySites {
                ome_description,
                imagej_description,
                imagej_byte_counts,
                imagej_metadata,
            })
        }
        None => None,
    };

    w.record(
        TiffTag::ImageMetadata,
        FieldType::Ascii,
        metadata.len() as u32,
        checked_offset(metadata_offset)?,
    );
    order.put_u32(&mut w.buf, checked_offset(next_ifd_offset)?);

    if layout.rgb {
        for _ in 0..3 {
            order.put_u16(&mut w.buf, bits);
        }
    }
    debug_assert_eq!(w.buf.len() as u64, layout.block_len(first));

    let buffers = vec![
        WriteBuffer::Shared(w.buf.freeze()),
        pixels,
        WriteBuffer::Shared(layout.resolution_payload()),
        WriteBuffer::Shared(Bytes::copy_from_slice(metadata.as_bytes())),
    ];

    Ok(EncodedIfd {
        offset,
        len,
        next_ifd_site,
        first_sites,
        buffers,
    })
}

// =============================================================================
// Tests
// =============================================================================
