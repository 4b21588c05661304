//! On-disk format of multipage acquisition files.
//!
//! The file is a classic TIFF whose header is extended with pointers to
//! private metadata blocks:
//!
//! - [`tiff`]: directory entries (IFDs), tags, byte order and pixel packing
//! - [`blocks`]: file header, summary, display settings, comments and ImageJ
//!   metadata blocks

pub mod blocks;
pub mod tiff;

pub use blocks::{
    encode_comments, encode_display_settings, encode_file_header, encode_imagej_metadata,
    imagej_info, ImageJDescription, ImageJMetadata, FILE_HEADER_SIZE,
};
