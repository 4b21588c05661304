//! Private metadata blocks surrounding the image directory chain.
//!
//! # File Header
//!
//! ```text
//! 0-7    TIFF header (byte order, 42, first IFD offset)
//! 8-15   index map offset header + index map offset
//! 16-23  display settings offset header + display settings offset
//! 24-31  comments offset header + comments offset
//! 32-39  summary metadata header + summary length
//! 40..   summary metadata JSON, then the first IFD
//! ```
//!
//! The three offset slots are zero until the file is finished. Each trailer
//! block starts with an 8-byte header (magic, length) followed by its payload.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::{Map, Value};

use super::tiff::{checked_offset, ByteOrder, VERSION_TIFF};
use crate::error::WriteError;
use crate::metadata::ChannelDisplay;

// =============================================================================
// Constants
// =============================================================================

/// Size of the extended file header preceding the summary metadata.
pub const FILE_HEADER_SIZE: u64 = 40;

/// Size of every block header.
pub const BLOCK_HEADER_SIZE: u64 = 8;

pub const INDEX_MAP_OFFSET_HEADER: u32 = 54773648;
pub const INDEX_MAP_HEADER: u32 = 3453623;
pub const DISPLAY_SETTINGS_OFFSET_HEADER: u32 = 483765892;
pub const DISPLAY_SETTINGS_HEADER: u32 = 347834724;
pub const COMMENTS_OFFSET_HEADER: u32 = 99384722;
pub const COMMENTS_HEADER: u32 = 84720485;
pub const SUMMARY_MD_HEADER: u32 = 2355492;

/// Header slot holding the index map offset.
pub const INDEX_MAP_SLOT: u64 = 8;
/// Header slot holding the display settings offset.
pub const DISPLAY_SETTINGS_SLOT: u64 = 16;
/// Header slot holding the comments offset.
pub const COMMENTS_SLOT: u64 = 24;

/// Bytes per index map entry: channel, slice, frame, position, offset.
pub const INDEX_ENTRY_SIZE: u64 = 20;

/// Space reserved per channel for display settings JSON.
pub const DISPLAY_SETTINGS_BYTES_PER_CHANNEL: u64 = 256;

/// ImageJ version announced in the description string.
pub const IMAGEJ_VERSION: &str = "1.54f";

const IJ_MAGIC: u32 = 0x494a_494a; // "IJIJ"
const IJ_INFO: u32 = 0x696e_666f; // "info"
const IJ_RANGES: u32 = 0x7261_6e67; // "rang"
const IJ_LUTS: u32 = 0x6c75_7473; // "luts"

/// Number of ImageJ field types written (info, ranges, LUTs).
const IJ_TYPE_COUNT: u32 = 3;

/// Bytes in one ImageJ lookup table (256 entries per color component).
pub const LUT_SIZE: usize = 768;

/// Upper bound of a rendered [`ImageJDescription`], NUL included.
pub const IMAGEJ_DESCRIPTION_RESERVE: u64 = 256;

// =============================================================================
// File Header
// =============================================================================

/// Encode the 40-byte file header for a summary of `summary_len` bytes.
///
/// The first IFD directly follows the summary metadata.
pub fn encode_file_header(order: ByteOrder, summary_len: usize) -> Result<Bytes, WriteError> {
    let summary_len = checked_offset(summary_len as u64)?;
    let first_ifd = checked_offset(FILE_HEADER_SIZE + summary_len as u64)?;

    let mut buf = BytesMut::with_capacity(FILE_HEADER_SIZE as usize);
    buf.put_slice(&order.marker());
    order.put_u16(&mut buf, VERSION_TIFF);
    order.put_u32(&mut buf, first_ifd);
    // Offset slots, patched when the file is finished
    buf.put_bytes(0, 24);
    order.put_u32(&mut buf, SUMMARY_MD_HEADER);
    order.put_u32(&mut buf, summary_len);
    Ok(buf.freeze())
}

/// Encode an 8-byte header slot value: offset header magic and block offset.
pub fn encode_offset_slot(order: ByteOrder, magic: u32, offset: u64) -> Result<Bytes, WriteError> {
    let mut buf = BytesMut::with_capacity(8);
    order.put_u32(&mut buf, magic);
    order.put_u32(&mut buf, checked_offset(offset)?);
    Ok(buf.freeze())
}

/// Encode a (count, offset) pair patched into the value part of a tag record.
pub fn encode_count_and_offset(order: ByteOrder, count: u32, offset: u64) -> Result<Bytes, WriteError> {
    let mut buf = BytesMut::with_capacity(8);
    order.put_u32(&mut buf, count);
    order.put_u32(&mut buf, checked_offset(offset)?);
    Ok(buf.freeze())
}

// =============================================================================
// Display Settings and Comments
// =============================================================================

/// Reserved length of the display settings block for `channels` channels.
#[inline]
pub fn display_settings_reserve(channels: u32) -> u64 {
    channels as u64 * DISPLAY_SETTINGS_BYTES_PER_CHANNEL
}

/// Encode the display settings block.
///
/// The payload is the channel settings as a JSON array, zero-padded to the
/// per-channel reservation. The reservation grows when the JSON is longer.
pub fn encode_display_settings(
    order: ByteOrder,
    channels: &[ChannelDisplay],
    num_channels: u32,
) -> Result<Bytes, WriteError> {
    let json = serde_json::to_string(channels).map_err(crate::error::MetadataError::from)?;
    let reserved = display_settings_reserve(num_channels).max(json.len() as u64);
    let reserved = checked_offset(reserved)?;

    let mut buf = BytesMut::with_capacity(BLOCK_HEADER_SIZE as usize + reserved as usize);
    order.put_u32(&mut buf, DISPLAY_SETTINGS_HEADER);
    order.put_u32(&mut buf, reserved);
    buf.put_slice(json.as_bytes());
    buf.put_bytes(0, reserved as usize - json.len());
    Ok(buf.freeze())
}

/// Encode the comments block.
pub fn encode_comments(order: ByteOrder, comments: &Map<String, Value>) -> Result<Bytes, WriteError> {
    let json = Value::Object(comments.clone()).to_string();
    let len = checked_offset(json.len() as u64)?;

    let mut buf = BytesMut::with_capacity(BLOCK_HEADER_SIZE as usize + json.len());
    order.put_u32(&mut buf, COMMENTS_HEADER);
    order.put_u32(&mut buf, len);
    buf.put_slice(json.as_bytes());
    Ok(buf.freeze())
}

// =============================================================================
// ImageJ Metadata
// =============================================================================

/// The two buffers referenced by the ImageJ metadata tags.
#[derive(Debug, Clone)]
pub struct ImageJMetadata {
    /// Byte count of each field, referenced by tag 50838
    pub counts: Bytes,
    /// Field contents, referenced by tag 50839
    pub payload: Bytes,
}

impl ImageJMetadata {
    /// Number of values in the counts buffer.
    pub fn count_entries(&self) -> u32 {
        (self.counts.len() / 4) as u32
    }
}

/// Text stored in the ImageJ info field.
pub fn imagej_info(summary_json: &str, comment: Option<&str>) -> String {
    match comment {
        Some(comment) if !comment.is_empty() => {
            format!("Acquisition comments: \n{}\n\n\n{}", comment, summary_json)
        }
        _ => summary_json.to_string(),
    }
}

/// Build the ImageJ metadata sub-blocks.
///
/// `channels` must hold one entry per channel; missing settings are the
/// caller's responsibility.
pub fn encode_imagej_metadata(order: ByteOrder, info: &str, channels: &[ChannelDisplay]) -> ImageJMetadata {
    let info_units: Vec<u16> = info.encode_utf16().collect();
    let header_len = 4 + IJ_TYPE_COUNT * 8;
    let info_len = info_units.len() as u32 * 2;
    let ranges_len = channels.len() as u32 * 16;

    let mut counts = BytesMut::with_capacity(12 + 4 * channels.len());
    order.put_u32(&mut counts, header_len);
    order.put_u32(&mut counts, info_len);
    order.put_u32(&mut counts, ranges_len);
    for _ in channels {
        order.put_u32(&mut counts, LUT_SIZE as u32);
    }

    let payload_len = (header_len + info_len + ranges_len) as usize + LUT_SIZE * channels.len();
    let mut payload = BytesMut::with_capacity(payload_len);
    order.put_u32(&mut payload, IJ_MAGIC);
    for (kind, count) in [
        (IJ_INFO, 1),
        (IJ_RANGES, 1),
        (IJ_LUTS, channels.len() as u32),
    ] {
        order.put_u32(&mut payload, kind);
        order.put_u32(&mut payload, count);
    }
    for unit in info_units {
        order.put_u16(&mut payload, unit);
    }
    // Integral ranges, as announced in the description
    for channel in channels {
        order.put_f64(&mut payload, channel.min.trunc());
        order.put_f64(&mut payload, channel.max.trunc());
    }
    for channel in channels {
        payload.put_slice(&make_lut(channel.rgb(), channel.gamma));
    }
    debug_assert_eq!(payload.len(), payload_len);

    ImageJMetadata {
        counts: counts.freeze(),
        payload: payload.freeze(),
    }
}

/// Combined length of both ImageJ metadata buffers for `info` and
/// `channels` channels.
pub fn imagej_metadata_len(info: &str, channels: usize) -> u64 {
    let channels = channels as u64;
    let counts = 4 * (IJ_TYPE_COUNT as u64 + channels);
    let header = 4 + IJ_TYPE_COUNT as u64 * 8;
    let info = info.encode_utf16().count() as u64 * 2;
    counts + header + info + channels * (16 + LUT_SIZE as u64)
}

/// Upper bound of [`imagej_metadata_len`] once an acquisition comment of at
/// most `max_comment_len` UTF-8 bytes is prefixed to the summary.
pub fn imagej_metadata_bound(summary_json: &str, max_comment_len: u64, channels: usize) -> u64 {
    // A UTF-8 byte never yields more than one UTF-16 unit
    imagej_metadata_len(&imagej_info(summary_json, Some(" ")), channels) + 2 * max_comment_len
}

/// Lookup table ramping from black to `color` with the given gamma.
///
/// Laid out as 256 reds, then 256 greens, then 256 blues.
pub fn make_lut(color: (u8, u8, u8), gamma: f64) -> [u8; LUT_SIZE] {
    let gamma = if gamma.is_finite() && gamma > 0.0 { gamma } else { 1.0 };
    let mut lut = [0u8; LUT_SIZE];
    let (r, g, b) = color;
    for x in 0..256 {
        let scale = (x as f64 / 256.0).powf(gamma);
        lut[x] = (r as f64 * scale) as u8;
        lut[256 + x] = (g as f64 * scale) as u8;
        lut[512 + x] = (b as f64 * scale) as u8;
    }
    lut
}

// =============================================================================
// ImageJ Description
// =============================================================================

/// Hyperstack parameters announced in the ImageJ description string.
#[derive(Debug, Clone, Copy)]
pub struct ImageJDescription<'a> {
    pub channels: u32,
    pub slices: u32,
    pub frames: u32,
    pub slices_first: bool,
    pub z_step_um: f64,
    /// Display settings of the first channel, if any were supplied
    pub first_channel: Option<&'a ChannelDisplay>,
}

impl ImageJDescription<'_> {
    /// Render the NUL-terminated description text.
    pub fn render(&self) -> String {
        let mut lines = vec![format!("ImageJ={}", IMAGEJ_VERSION)];
        if self.channels > 1 {
            lines.push(format!("channels={}", self.channels));
        }
        if self.slices > 1 {
            lines.push(format!("slices={}", self.slices));
        }
        if self.frames > 1 {
            lines.push(format!("frames={}", self.frames));
        }
        if self.channels > 1 || self.slices > 1 || self.frames > 1 {
            lines.push("hyperstack=true".to_string());
        }
        if self.channels > 1 && self.slices > 1 && self.slices_first {
            lines.push("order=zct".to_string());
        }
        // Micrometers, consistent with the resolution tags
        lines.push("unit=um".to_string());
        if self.slices > 1 {
            lines.push(format!("spacing={}", java_double(self.z_step_um)));
        }
        if let Some(display) = self.first_channel {
            if self.channels == 1 {
                lines.push(format!("min={}", java_double(display.min.trunc())));
                lines.push(format!("max={}", java_double(display.max.trunc())));
            } else {
                match display.display_mode {
                    Some(1) => lines.push("mode=composite".to_string()),
                    Some(2) => lines.push("mode=color".to_string()),
                    Some(3) => lines.push("mode=gray".to_string()),
                    _ => {}
                }
            }
        }

        let mut text = lines.join("\n");
        text.push('\n');
        text.push('\0');
        text
    }
}

/// Format a double the way ImageJ's own parser expects it.
///
/// Integral values keep one decimal (`2.0`), very large or small magnitudes
/// use an exponent (`1.0E-4`).
pub fn java_double(value: f64) -> String {
    if !value.is_finite() {
        return if value.is_nan() {
            "NaN".to_string()
        } else if value > 0.0 {
            "Infinity".to_string()
        } else {
            "-Infinity".to_string()
        };
    }
    let magnitude = value.abs();
    if value == 0.0 || (1e-3..1e7).contains(&magnitude) {
        let text = value.to_string();
        if text.contains('.') {
            text
        } else {
            format!("{}.0", text)
        }
    } else {
        let text = format!("{:E}", value);
        match text.split_once('E') {
            Some((mantissa, exponent)) if !mantissa.contains('.') => {
                format!("{}.0E{}", mantissa, exponent)
            }
            _ => text,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
