//! Acquisition metadata consumed by the writer.
//!
//! - [`SummaryMetadata`]: acquisition-wide parameters, fixed when a file is opened
//! - [`ImageRecord`]: one acquired image with its coordinates and free-form tags
//! - [`DisplayAndComments`]: display settings and comments supplied at close
//!
//! Summary and per-image metadata arrive as JSON objects. Numeric fields are
//! accepted either as JSON numbers or as numeric strings, since acquisition
//! software commonly stores both.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::MetadataError;

/// Key removed from summary metadata before it is written.
const SUMMARY_COMMENT_KEY: &str = "Comment";

/// Key removed from per-image tags before they are written.
const IMAGE_SUMMARY_KEY: &str = "Summary";

/// Default z-step in micrometers when the summary does not declare one.
const DEFAULT_Z_STEP_UM: f64 = 1.0;

// =============================================================================
// Pixel Type
// =============================================================================

/// Pixel type as declared in the summary metadata `PixelType` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PixelType {
    Gray8,
    Gray16,
    Gray32,
    Rgb24,
    Rgb32,
    Rgb64,
    /// Unrecognized type; written with the default depth of 2 bytes
    Other(String),
}

impl PixelType {
    /// Bytes per sample for this pixel type.
    pub fn byte_depth(&self) -> u8 {
        match self {
            PixelType::Gray8 | PixelType::Rgb24 | PixelType::Rgb32 => 1,
            PixelType::Gray16 | PixelType::Rgb64 => 2,
            PixelType::Gray32 => 3,
            PixelType::Other(_) => 2,
        }
    }

    /// Whether images carry three color samples per pixel.
    pub fn is_rgb(&self) -> bool {
        matches!(self, PixelType::Rgb24 | PixelType::Rgb32 | PixelType::Rgb64)
    }
}

impl FromStr for PixelType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "GRAY8" => PixelType::Gray8,
            "GRAY16" => PixelType::Gray16,
            "GRAY32" => PixelType::Gray32,
            "RGB24" => PixelType::Rgb24,
            "RGB32" => PixelType::Rgb32,
            "RGB64" => PixelType::Rgb64,
            other => PixelType::Other(other.to_string()),
        })
    }
}

impl fmt::Display for PixelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelType::Gray8 => "GRAY8",
            PixelType::Gray16 => "GRAY16",
            PixelType::Gray32 => "GRAY32",
            PixelType::Rgb24 => "RGB24",
            PixelType::Rgb32 => "RGB32",
            PixelType::Rgb64 => "RGB64",
            PixelType::Other(name) => name,
        };
        f.write_str(name)
    }
}

// =============================================================================
// Summary Metadata
// =============================================================================

/// Acquisition-wide metadata, parsed once when a file session opens.
#[derive(Debug, Clone)]
pub struct SummaryMetadata {
    /// The original JSON object, minus the `Comment` key
    raw: Map<String, Value>,

    pub width: u32,
    pub height: u32,
    pub pixel_type: PixelType,
    pub channels: u32,
    pub frames: u32,
    pub slices: u32,
    pub positions: u32,

    /// Physical pixel size in micrometers, if known
    pub pixel_size_um: Option<f64>,

    /// Distance between slices in micrometers
    pub z_step_um: f64,

    /// Whether slices are acquired before channels (ImageJ `order=zct`)
    pub slices_first: bool,
}

impl SummaryMetadata {
    /// Parse summary metadata from a JSON object.
    ///
    /// # Errors
    /// - `InvalidField` if the value is not an object or a field is malformed
    /// - `MissingField` if `Width`, `Height` or `PixelType` is absent
    pub fn from_json(value: &Value) -> Result<Self, MetadataError> {
        let mut raw = value
            .as_object()
            .cloned()
            .ok_or_else(|| MetadataError::InvalidField {
                field: "summary",
                message: "expected a JSON object".to_string(),
            })?;
        raw.remove(SUMMARY_COMMENT_KEY);

        let width = required_u32(&raw, "Width")?;
        let height = required_u32(&raw, "Height")?;
        let pixel_type: PixelType = raw
            .get("PixelType")
            .and_then(Value::as_str)
            .ok_or(MetadataError::MissingField("PixelType"))?
            .parse()
            .unwrap_or(PixelType::Other(String::new()));

        if let PixelType::Other(ref name) = pixel_type {
            warn!(
                "Unrecognized pixel type '{}', assuming {} bytes per sample",
                name,
                pixel_type.byte_depth()
            );
        }

        let pixel_size_um = optional_f64(&raw, "PixelSizeUm")?
            .or(optional_f64(&raw, "PixelSize_um")?);

        Ok(Self {
            width,
            height,
            pixel_type,
            channels: optional_u32(&raw, "Channels")?.unwrap_or(1).max(1),
            frames: optional_u32(&raw, "Frames")?.unwrap_or(1).max(1),
            slices: optional_u32(&raw, "Slices")?.unwrap_or(1).max(1),
            positions: optional_u32(&raw, "Positions")?.unwrap_or(1).max(1),
            pixel_size_um,
            z_step_um: optional_f64(&raw, "z-step_um")?.unwrap_or(DEFAULT_Z_STEP_UM),
            slices_first: raw
                .get("SlicesFirst")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            raw,
        })
    }

    /// Bytes per sample.
    #[inline]
    pub fn byte_depth(&self) -> u8 {
        self.pixel_type.byte_depth()
    }

    /// Whether images are RGB.
    #[inline]
    pub fn is_rgb(&self) -> bool {
        self.pixel_type.is_rgb()
    }

    /// Size of one packed image's pixel payload in bytes.
    pub fn bytes_per_image(&self) -> u64 {
        let samples = if self.is_rgb() { 3 } else { 1 };
        self.width as u64 * self.height as u64 * self.byte_depth() as u64 * samples
    }

    /// Number of images the acquisition is expected to produce for one position.
    pub fn expected_images(&self) -> u64 {
        self.frames as u64 * self.channels as u64 * self.slices as u64
    }

    /// TIFF resolution rational (numerator, denominator) in pixels per centimeter.
    pub fn resolution(&self) -> (u32, u32) {
        let cm_per_pixel = 0.0001 * self.pixel_size_um.unwrap_or(1.0);
        if !(cm_per_pixel > 0.0) || !cm_per_pixel.is_finite() {
            return (1, 1);
        }
        if cm_per_pixel.log10() >= 0.0 {
            (1, cm_per_pixel as u32)
        } else {
            ((1.0 / cm_per_pixel) as u32, 1)
        }
    }

    /// Compact JSON text, as stored in the summary block.
    pub fn to_json_string(&self) -> String {
        Value::Object(self.raw.clone()).to_string()
    }

    /// Indented JSON text, used for the ImageJ info field.
    pub fn to_pretty_json(&self) -> String {
        serde_json::to_string_pretty(&self.raw).unwrap_or_default()
    }

    /// Raw access to the underlying JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.raw
    }
}

fn number_field(map: &Map<String, Value>, field: &'static str) -> Result<Option<f64>, MetadataError> {
    match map.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|e| MetadataError::InvalidField {
                field,
                message: format!("'{}' is not a number: {}", s, e),
            }),
        Some(other) => Err(MetadataError::InvalidField {
            field,
            message: format!("expected a number, got {}", other),
        }),
    }
}

fn optional_f64(map: &Map<String, Value>, field: &'static str) -> Result<Option<f64>, MetadataError> {
    number_field(map, field)
}

fn optional_u32(map: &Map<String, Value>, field: &'static str) -> Result<Option<u32>, MetadataError> {
    match number_field(map, field)? {
        None => Ok(None),
        Some(v) if v >= 0.0 && v <= u32::MAX as f64 && v.fract() == 0.0 => Ok(Some(v as u32)),
        Some(v) => Err(MetadataError::InvalidField {
            field,
            message: format!("expected a non-negative integer, got {}", v),
        }),
    }
}

fn required_u32(map: &Map<String, Value>, field: &'static str) -> Result<u32, MetadataError> {
    optional_u32(map, field)?.ok_or(MetadataError::MissingField(field))
}

// =============================================================================
// Image Coordinates
// =============================================================================

/// Position of one image in the acquisition's channel/slice/frame/position space.
///
/// The label form `"channel_slice_frame_position"` is the key format used by
/// the index map and by readers of these files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageCoords {
    pub channel: u32,
    pub slice: u32,
    pub frame: u32,
    pub position: u32,
}

impl ImageCoords {
    pub const fn new(channel: u32, slice: u32, frame: u32, position: u32) -> Self {
        Self {
            channel,
            slice,
            frame,
            position,
        }
    }

    /// Read coordinates from the conventional `*Index` tags, defaulting to 0.
    pub fn from_tags(tags: &Map<String, Value>) -> Result<Self, MetadataError> {
        Ok(Self {
            channel: optional_u32(tags, "ChannelIndex")?.unwrap_or(0),
            slice: optional_u32(tags, "SliceIndex")?.unwrap_or(0),
            frame: optional_u32(tags, "FrameIndex")?.unwrap_or(0),
            position: optional_u32(tags, "PositionIndex")?.unwrap_or(0),
        })
    }

    /// Components in the order they are serialized.
    pub fn components(&self) -> [u32; 4] {
        [self.channel, self.slice, self.frame, self.position]
    }
}

impl fmt::Display for ImageCoords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.channel, self.slice, self.frame, self.position
        )
    }
}

impl FromStr for ImageCoords {
    type Err = MetadataError;

    fn from_str(label: &str) -> Result<Self, Self::Err> {
        let invalid = |message: String| MetadataError::InvalidField {
            field: "label",
            message,
        };

        let parts: Vec<&str> = label.split('_').collect();
        if parts.len() != 4 {
            return Err(invalid(format!(
                "expected 4 components in '{}', got {}",
                label,
                parts.len()
            )));
        }

        let mut values = [0u32; 4];
        for (slot, part) in values.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .map_err(|e| invalid(format!("'{}' in '{}': {}", part, label, e)))?;
        }

        Ok(Self::new(values[0], values[1], values[2], values[3]))
    }
}

// =============================================================================
// Image Record
// =============================================================================

/// Raw pixel samples as delivered by the acquisition layer.
///
/// Both variants are cheap to clone, so a record can be handed to the writer
/// while the caller keeps its own reference until the write completes.
#[derive(Debug, Clone)]
pub enum PixelBuffer {
    /// 8-bit samples, or raw bytes for deeper types
    U8(Bytes),
    /// 16-bit samples
    U16(Arc<[u16]>),
}

impl PixelBuffer {
    /// Number of samples in the buffer.
    pub fn sample_count(&self) -> usize {
        match self {
            PixelBuffer::U8(bytes) => bytes.len(),
            PixelBuffer::U16(samples) => samples.len(),
        }
    }
}

impl From<Vec<u8>> for PixelBuffer {
    fn from(value: Vec<u8>) -> Self {
        PixelBuffer::U8(Bytes::from(value))
    }
}

impl From<Vec<u16>> for PixelBuffer {
    fn from(value: Vec<u16>) -> Self {
        PixelBuffer::U16(value.into())
    }
}

/// One acquired image plus its metadata.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub pixels: PixelBuffer,
    pub width: u32,
    pub height: u32,
    /// Bytes per sample (1, 2 or 3)
    pub byte_depth: u8,
    pub rgb: bool,
    pub coords: ImageCoords,
    /// Free-form tags (string, number or bool values)
    pub tags: Map<String, Value>,
}

impl ImageRecord {
    /// Build a record, reading coordinates from the `*Index` tags.
    pub fn new(
        pixels: impl Into<PixelBuffer>,
        width: u32,
        height: u32,
        byte_depth: u8,
        rgb: bool,
        tags: Map<String, Value>,
    ) -> Result<Self, MetadataError> {
        let coords = ImageCoords::from_tags(&tags)?;
        Ok(Self {
            pixels: pixels.into(),
            width,
            height,
            byte_depth,
            rgb,
            coords,
            tags,
        })
    }

    /// Override the coordinates.
    pub fn with_coords(mut self, coords: ImageCoords) -> Self {
        self.coords = coords;
        self
    }

    /// The per-image metadata string stored after the pixels.
    ///
    /// The `Summary` tag is dropped, the coordinate tags are filled in when
    /// missing, and a trailing space terminates the text.
    pub fn metadata_string(&self) -> String {
        let mut tags = self.tags.clone();
        tags.remove(IMAGE_SUMMARY_KEY);
        let coords = [
            ("ChannelIndex", self.coords.channel),
            ("SliceIndex", self.coords.slice),
            ("FrameIndex", self.coords.frame),
            ("PositionIndex", self.coords.position),
        ];
        for (key, value) in coords {
            tags.entry(key).or_insert_with(|| Value::from(value));
        }
        let mut text = Value::Object(tags).to_string();
        text.push(' ');
        text
    }
}

// =============================================================================
// Display Settings and Comments
// =============================================================================

/// Display settings for one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChannelDisplay {
    /// Packed 0xRRGGBB color
    #[serde(default = "default_color")]
    pub color: i32,
    #[serde(default)]
    pub min: f64,
    #[serde(default)]
    pub max: f64,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    /// 1 = composite, 2 = color, 3 = grayscale
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_mode: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

fn default_color() -> i32 {
    0xFF_FF_FF
}

fn default_gamma() -> f64 {
    1.0
}

impl ChannelDisplay {
    /// Full-range white display for the given byte depth.
    pub fn full_range(byte_depth: u8) -> Self {
        let bits = (byte_depth.clamp(1, 3) as u32) * 8;
        Self {
            color: default_color(),
            min: 0.0,
            max: ((1u64 << bits) - 1) as f64,
            gamma: default_gamma(),
            display_mode: None,
            name: None,
        }
    }

    /// Red, green and blue components of the channel color.
    pub fn rgb(&self) -> (u8, u8, u8) {
        let c = self.color as u32;
        (((c >> 16) & 0xFF) as u8, ((c >> 8) & 0xFF) as u8, (c & 0xFF) as u8)
    }
}

/// Display settings and free-text comments supplied when a file is closed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DisplayAndComments {
    #[serde(default)]
    pub channels: Vec<ChannelDisplay>,
    #[serde(default)]
    pub comments: Map<String, Value>,
}

impl DisplayAndComments {
    /// Settings for `channel`, falling back to a full-range default.
    pub fn channel(&self, channel: usize, byte_depth: u8) -> ChannelDisplay {
        self.channels
            .get(channel)
            .cloned()
            .unwrap_or_else(|| ChannelDisplay::full_range(byte_depth))
    }

    /// The acquisition-level comment, if one was entered.
    pub fn summary_comment(&self) -> Option<&str> {
        self.comments
            .get("Summary")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

// =============================================================================
// Tests
// =============================================================================
