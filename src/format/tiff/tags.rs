//! TIFF tag and field type definitions.
//!
//! This module defines the vocabulary for writing multipage files:
//! - Field types that determine how values are encoded
//! - Tag IDs for the fixed tag set written in every directory entry
//!
//! Only classic TIFF (32-bit offsets) is written.

// =============================================================================
// TIFF Field Types
// =============================================================================

/// TIFF field types that determine how values are encoded.
///
/// Note: We only define types actually written by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FieldType {
    /// Unsigned 8-bit integer (1 byte)
    Byte = 1,

    /// 8-bit ASCII character (1 byte)
    Ascii = 2,

    /// Unsigned 16-bit integer (2 bytes)
    Short = 3,

    /// Unsigned 32-bit integer (4 bytes)
    Long = 4,

    /// Two LONGs: numerator and denominator (8 bytes)
    Rational = 5,
}

impl FieldType {
    /// Size of a single value of this type in bytes.
    #[inline]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            FieldType::Byte => 1,
            FieldType::Ascii => 1,
            FieldType::Short => 2,
            FieldType::Long => 4,
            FieldType::Rational => 8,
        }
    }

    /// Create a FieldType from its numeric value.
    ///
    /// Returns `None` for unsupported or unknown type values.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(FieldType::Byte),
            2 => Some(FieldType::Ascii),
            3 => Some(FieldType::Short),
            4 => Some(FieldType::Long),
            5 => Some(FieldType::Rational),
            _ => None,
        }
    }

    /// Get the numeric type code.
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Maximum bytes that can be stored inline in a classic TIFF IFD entry.
    pub const INLINE_THRESHOLD: usize = 4;

    /// Check if a value with this type and count fits inline in the
    /// 4-byte value field.
    #[inline]
    pub fn fits_inline(self, count: u32) -> bool {
        self.size_in_bytes() as u64 * count as u64 <= Self::INLINE_THRESHOLD as u64
    }
}

// =============================================================================
// TIFF Tags
// =============================================================================

/// TIFF tag IDs written by this crate, in the order they appear in an entry.
///
/// Tags must be written in ascending numeric order. The ImageJ tags and the
/// image descriptions appear only in the first directory entry of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum TiffTag {
    // -------------------------------------------------------------------------
    // Basic Image Structure
    // -------------------------------------------------------------------------
    /// Image width in pixels
    ImageWidth = 256,

    /// Image height (length) in pixels
    ImageLength = 257,

    /// Bits per sample (one value, or three for RGB)
    BitsPerSample = 258,

    /// Compression scheme (always 1 = none)
    Compression = 259,

    /// Photometric interpretation (1 = BlackIsZero, 2 = RGB)
    PhotometricInterpretation = 262,

    /// Description string (OME-XML and ImageJ header, first entry only)
    ImageDescription = 270,

    /// Number of components per pixel (3 for RGB)
    SamplesPerPixel = 277,

    // -------------------------------------------------------------------------
    // Strip Organization (one strip per image)
    // -------------------------------------------------------------------------
    /// Byte offset of the single pixel strip
    StripOffsets = 273,

    /// Row count per strip (the full image height)
    RowsPerStrip = 278,

    /// Byte count of the single pixel strip
    StripByteCounts = 279,

    // -------------------------------------------------------------------------
    // Resolution
    // -------------------------------------------------------------------------
    /// Pixels per unit in X direction
    XResolution = 282,

    /// Pixels per unit in Y direction
    YResolution = 283,

    /// Unit of resolution (3 = centimeter)
    ResolutionUnit = 296,

    // -------------------------------------------------------------------------
    // ImageJ and private metadata
    // -------------------------------------------------------------------------
    /// Byte counts of each ImageJ metadata field
    ImageJMetadataByteCounts = 50838,

    /// ImageJ metadata payload (display ranges, LUTs, info)
    ImageJMetadata = 50839,

    /// Per-image JSON metadata string
    ImageMetadata = 51123,
}

impl TiffTag {
    /// Create a TiffTag from its numeric value.
    ///
    /// Returns `None` for tags this crate never writes.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            256 => Some(TiffTag::ImageWidth),
            257 => Some(TiffTag::ImageLength),
            258 => Some(TiffTag::BitsPerSample),
            259 => Some(TiffTag::Compression),
            262 => Some(TiffTag::PhotometricInterpretation),
            270 => Some(TiffTag::ImageDescription),
            273 => Some(TiffTag::StripOffsets),
            277 => Some(TiffTag::SamplesPerPixel),
            278 => Some(TiffTag::RowsPerStrip),
            279 => Some(TiffTag::StripByteCounts),
            282 => Some(TiffTag::XResolution),
            283 => Some(TiffTag::YResolution),
            296 => Some(TiffTag::ResolutionUnit),
            50838 => Some(TiffTag::ImageJMetadataByteCounts),
            50839 => Some(TiffTag::ImageJMetadata),
            51123 => Some(TiffTag::ImageMetadata),
            _ => None,
        }
    }

    /// Get the numeric tag ID.
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

// =============================================================================
// Fixed Tag Values
// =============================================================================

/// Compression value for uncompressed data.
pub const COMPRESSION_NONE: u16 = 1;

/// Photometric interpretation: grayscale, black is zero.
pub const PHOTOMETRIC_BLACK_IS_ZERO: u16 = 1;

/// Photometric interpretation: RGB.
pub const PHOTOMETRIC_RGB: u16 = 2;

/// Resolution unit: centimeter.
pub const RESOLUTION_UNIT_CENTIMETER: u16 = 3;

// =============================================================================
// Tests
// =============================================================================
