//! TIFF encoding for streamed multipage files.
//!
//! This module lays out classic TIFF structures into byte buffers.
//!
//! # Key Concepts
//!
//! - **Byte order**: declared once in the file header (II = little-endian,
//!   MM = big-endian). Every multi-byte value respects it.
//!
//! - **IFD (Image File Directory)**: one per image, holding its dimensions,
//!   encoding and pointers to its pixel strip and metadata.
//!
//! - **Inline vs offset values**: values of up to 4 bytes are stored in the
//!   entry itself, larger values at an offset in the entry's payload.
//!
//! - **Forward references**: some fields point at data written later. Their
//!   positions are recorded and patched when the file is finished.

mod layout;
mod pack;
mod parser;
mod tags;

pub use layout::{
    checked_offset, encode_ifd, EncodedIfd, FirstEntrySites, IfdLayout, BASE_ENTRIES, BLANK_METADATA,
    FIRST_ENTRY_EXTRA, RESOLUTION_BYTES, TAG_RECORD_SIZE,
};
pub use pack::{blank_pixels, pack_pixels, pack_rgb_u16, pack_rgb_u8};
pub use parser::{ByteOrder, TiffHeader, TIFF_HEADER_SIZE, VERSION_TIFF};
pub use tags::{
    FieldType, TiffTag, COMPRESSION_NONE, PHOTOMETRIC_BLACK_IS_ZERO, PHOTOMETRIC_RGB,
    RESOLUTION_UNIT_CENTIMETER,
};
