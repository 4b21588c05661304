//! Reading back files written by [`FileSession`](crate::session::FileSession).
//!
//! This is not a general TIFF reader: it understands the extended header,
//! the private metadata blocks and the fixed directory entry layout produced
//! by this crate, which is enough to browse a file while it is written and to
//! verify it afterwards.

use std::fs::File;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::TiffError;
use crate::format::blocks::{
    BLOCK_HEADER_SIZE, COMMENTS_HEADER, COMMENTS_OFFSET_HEADER, COMMENTS_SLOT,
    DISPLAY_SETTINGS_HEADER, DISPLAY_SETTINGS_OFFSET_HEADER, DISPLAY_SETTINGS_SLOT,
    FILE_HEADER_SIZE, INDEX_MAP_OFFSET_HEADER, INDEX_MAP_SLOT, SUMMARY_MD_HEADER,
};
use crate::format::tiff::{ByteOrder, FieldType, TiffHeader, TiffTag, TAG_RECORD_SIZE};
use crate::io::read_exact_at;
use crate::metadata::ChannelDisplay;
use crate::session::IndexMap;

/// Upper bound on directory entries followed by [`MultipageReader::ifd_offsets`].
const MAX_CHAIN_LENGTH: usize = 1_000_000;

/// Decoded directory entry.
#[derive(Debug, Clone, PartialEq)]
pub struct IfdInfo {
    pub offset: u64,
    pub entry_count: u16,
    pub width: u32,
    pub height: u32,
    pub bits_per_sample: u16,
    pub samples_per_pixel: u16,
    pub strip_offset: u32,
    pub strip_byte_count: u32,
    pub resolution: (u32, u32),
    pub next_ifd_offset: u32,
    /// Non-empty ImageDescription values
    pub descriptions: Vec<String>,
    /// Per-image metadata string
    pub metadata: String,
}

/// One raw 12-byte tag record.
#[derive(Debug, Clone, Copy)]
struct TagRecord {
    tag: u16,
    field_type: u16,
    count: u32,
    value: [u8; 4],
}

/// Reader for multipage acquisition files.
#[derive(Debug)]
pub struct MultipageReader {
    file: File,
    path: PathBuf,
    file_size: u64,
    header: TiffHeader,
    summary: Map<String, Value>,
    index_map: Option<IndexMap>,
    display_settings: Option<Vec<ChannelDisplay>>,
    comments: Option<Map<String, Value>>,
}

impl MultipageReader {
    /// Open a file and read its header and metadata blocks.
    ///
    /// Blocks whose header slot has not been written yet (the file was never
    /// finished or closed) are reported as absent.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TiffError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let file_size = file.metadata()?.len();

        let mut raw = [0u8; FILE_HEADER_SIZE as usize];
        if file_size < FILE_HEADER_SIZE {
            return Err(TiffError::FileTooSmall {
                required: FILE_HEADER_SIZE,
                actual: file_size,
            });
        }
        read_exact_at(&file, &mut raw, 0)?;
        let header = TiffHeader::parse(&raw, file_size)?;
        let order = header.byte_order;

        let magic = order.read_u32(&raw[32..]);
        if magic != SUMMARY_MD_HEADER {
            return Err(TiffError::InvalidBlockHeader {
                block: "summary metadata",
                expected: SUMMARY_MD_HEADER,
                actual: magic,
            });
        }
        let summary_len = order.read_u32(&raw[36..]) as u64;
        let summary_bytes = read_range(&file, file_size, FILE_HEADER_SIZE, summary_len)?;
        let summary = parse_object("summary metadata", &summary_bytes)?;

        let mut reader = Self {
            file,
            path,
            file_size,
            header,
            summary,
            index_map: None,
            display_settings: None,
            comments: None,
        };

        if let Some(offset) = reader.slot(&raw, INDEX_MAP_SLOT, INDEX_MAP_OFFSET_HEADER) {
            reader.index_map = Some(reader.read_index_map(offset)?);
        }
        if let Some(offset) = reader.slot(&raw, DISPLAY_SETTINGS_SLOT, DISPLAY_SETTINGS_OFFSET_HEADER) {
            let payload = reader.read_block(offset, "display settings", DISPLAY_SETTINGS_HEADER)?;
            let json = trim_nul(&payload);
            let channels = serde_json::from_slice(json).map_err(|e| TiffError::InvalidPayload {
                block: "display settings",
                message: e.to_string(),
            })?;
            reader.display_settings = Some(channels);
        }
        if let Some(offset) = reader.slot(&raw, COMMENTS_SLOT, COMMENTS_OFFSET_HEADER) {
            let payload = reader.read_block(offset, "comments", COMMENTS_HEADER)?;
            reader.comments = Some(parse_object("comments", &payload)?);
        }

        debug!(
            "Opened {} ({} bytes, index map {})",
            reader.path.display(),
            file_size,
            if reader.index_map.is_some() { "present" } else { "absent" }
        );
        Ok(reader)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.header.byte_order
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn first_ifd_offset(&self) -> u64 {
        self.header.first_ifd_offset
    }

    /// Summary metadata as stored in the file.
    pub fn summary(&self) -> &Map<String, Value> {
        &self.summary
    }

    /// The index map, once the file has been finished.
    pub fn index_map(&self) -> Option<&IndexMap> {
        self.index_map.as_ref()
    }

    /// Display settings, once the file has been closed.
    pub fn display_settings(&self) -> Option<&[ChannelDisplay]> {
        self.display_settings.as_deref()
    }

    /// Comments, once the file has been closed.
    pub fn comments(&self) -> Option<&Map<String, Value>> {
        self.comments.as_ref()
    }

    /// Read the summary metadata bytes exactly as written.
    pub fn summary_bytes(&self) -> Result<Vec<u8>, TiffError> {
        let mut raw = [0u8; 4];
        read_exact_at(&self.file, &mut raw, 36)?;
        let len = self.byte_order().read_u32(&raw) as u64;
        read_range(&self.file, self.file_size, FILE_HEADER_SIZE, len)
    }

    /// Decode the directory entry at `offset`.
    pub fn read_ifd(&self, offset: u64) -> Result<IfdInfo, TiffError> {
        let order = self.byte_order();
        let count_bytes = read_range(&self.file, self.file_size, offset, 2)
            .map_err(|_| TiffError::InvalidIfdOffset(offset))?;
        let entry_count = order.read_u16(&count_bytes);

        let block_len = entry_count as u64 * TAG_RECORD_SIZE + 4;
        let block = read_range(&self.file, self.file_size, offset + 2, block_len)?;
        let records: Vec<TagRecord> = block[..block.len() - 4]
            .chunks_exact(TAG_RECORD_SIZE as usize)
            .map(|r| TagRecord {
                tag: order.read_u16(r),
                field_type: order.read_u16(&r[2..]),
                count: order.read_u32(&r[4..]),
                value: [r[8], r[9], r[10], r[11]],
            })
            .collect();
        let next_ifd_offset = order.read_u32(&block[block.len() - 4..]);

        let find = |tag: TiffTag| records.iter().find(|r| r.tag == tag.as_u16());
        let require = |tag: TiffTag, name: &'static str| find(tag).ok_or(TiffError::MissingTag(name));
        let scalar = |record: &TagRecord| match FieldType::from_u16(record.field_type) {
            Some(FieldType::Short) => order.read_u16(&record.value) as u32,
            _ => order.read_u32(&record.value),
        };

        let bits = require(TiffTag::BitsPerSample, "BitsPerSample")?;
        let bits_per_sample = if bits.count == 1 {
            scalar(bits) as u16
        } else {
            let at = order.read_u32(&bits.value) as u64;
            order.read_u16(&read_range(&self.file, self.file_size, at, 2)?)
        };

        let samples_per_pixel = find(TiffTag::SamplesPerPixel).map(|r| scalar(r) as u16).unwrap_or(1);

        let x_resolution = require(TiffTag::XResolution, "XResolution")?;
        let rational = read_range(
            &self.file,
            self.file_size,
            order.read_u32(&x_resolution.value) as u64,
            8,
        )?;
        let resolution = (order.read_u32(&rational), order.read_u32(&rational[4..]));

        let mut descriptions = Vec::new();
        for record in records.iter().filter(|r| r.tag == TiffTag::ImageDescription.as_u16()) {
            if record.count > 0 {
                let text = self.read_ascii(record)?;
                descriptions.push(text);
            }
        }

        let metadata = match find(TiffTag::ImageMetadata) {
            Some(record) => self.read_ascii(record)?,
            None => String::new(),
        };

        Ok(IfdInfo {
            offset,
            entry_count,
            width: scalar(require(TiffTag::ImageWidth, "ImageWidth")?),
            height: scalar(require(TiffTag::ImageLength, "ImageLength")?),
            bits_per_sample,
            samples_per_pixel,
            strip_offset: scalar(require(TiffTag::StripOffsets, "StripOffsets")?),
            strip_byte_count: scalar(require(TiffTag::StripByteCounts, "StripByteCounts")?),
            resolution,
            next_ifd_offset,
            descriptions,
            metadata,
        })
    }

    /// Raw pixel bytes of a directory entry.
    pub fn read_pixels(&self, ifd: &IfdInfo) -> Result<Vec<u8>, TiffError> {
        read_range(
            &self.file,
            self.file_size,
            ifd.strip_offset as u64,
            ifd.strip_byte_count as u64,
        )
    }

    /// Offsets of every directory entry, following the next-IFD chain.
    pub fn ifd_offsets(&self) -> Result<Vec<u64>, TiffError> {
        let mut offsets = Vec::new();
        let mut offset = self.first_ifd_offset();
        while offset != 0 && offsets.len() < MAX_CHAIN_LENGTH {
            let ifd = self.read_ifd(offset)?;
            offsets.push(offset);
            offset = ifd.next_ifd_offset as u64;
        }
        Ok(offsets)
    }

    fn read_ascii(&self, record: &TagRecord) -> Result<String, TiffError> {
        let order = self.byte_order();
        let bytes = if FieldType::Ascii.fits_inline(record.count) {
            record.value[..record.count as usize].to_vec()
        } else {
            let at = order.read_u32(&record.value) as u64;
            read_range(&self.file, self.file_size, at, record.count as u64)?
        };
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Offset stored in a header slot, if the slot carries `magic`.
    fn slot(&self, header: &[u8], slot: u64, magic: u32) -> Option<u64> {
        let order = self.byte_order();
        let at = slot as usize;
        (order.read_u32(&header[at..]) == magic).then(|| order.read_u32(&header[at + 4..]) as u64)
    }

    fn read_index_map(&self, offset: u64) -> Result<IndexMap, TiffError> {
        let head = read_range(&self.file, self.file_size, offset, BLOCK_HEADER_SIZE)?;
        let count = self.byte_order().read_u32(&head[4..]) as usize;
        let block = read_range(&self.file, self.file_size, offset, IndexMap::block_len_for(count))?;
        IndexMap::decode(self.byte_order(), &block)
    }

    /// Payload of a block whose header carries `magic`.
    fn read_block(&self, offset: u64, block: &'static str, magic: u32) -> Result<Vec<u8>, TiffError> {
        let order = self.byte_order();
        let head = read_range(&self.file, self.file_size, offset, BLOCK_HEADER_SIZE)?;
        let actual = order.read_u32(&head);
        if actual != magic {
            return Err(TiffError::InvalidBlockHeader {
                block,
                expected: magic,
                actual,
            });
        }
        let len = order.read_u32(&head[4..]) as u64;
        read_range(&self.file, self.file_size, offset + BLOCK_HEADER_SIZE, len)
    }
}

fn read_range(file: &File, file_size: u64, offset: u64, len: u64) -> Result<Vec<u8>, TiffError> {
    if offset.saturating_add(len) > file_size {
        return Err(TiffError::FileTooSmall {
            required: offset.saturating_add(len),
            actual: file_size,
        });
    }
    let mut buf = vec![0u8; len as usize];
    read_exact_at(file, &mut buf, offset)?;
    Ok(buf)
}

fn trim_nul(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &bytes[..end]
}

fn parse_object(block: &'static str, bytes: &[u8]) -> Result<Map<String, Value>, TiffError> {
    let value: Value = serde_json::from_slice(bytes).map_err(|e| TiffError::InvalidPayload {
        block,
        message: e.to_string(),
    })?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(TiffError::InvalidPayload {
            block,
            message: format!("expected a JSON object, got {}", other),
        }),
    }
}
