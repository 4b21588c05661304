//! Directory entry layout tests.
//!
//! Tests verify:
//! - Tag counts of the first and later entries
//! - RGB packing drops the fourth byte of each pixel
//! - Resolution tags derived from the pixel size
//! - Per-image metadata string contents

use std::fs;

use serde_json::Value;

use mptiff_writer::format::tiff::{pack_rgb_u16, pack_rgb_u8, FieldType, TiffTag};
use mptiff_writer::{
    ByteOrder, DisplayAndComments, ImageCoords, IfdLayout, MultipageReader, SchedulerMode,
    SummaryMetadata,
};

use super::test_utils::{
    find_tag, gray8_image, open_session, raw_tags, rgb32_image, summary, summary_json, test_config,
};

const MIB: u64 = 1024 * 1024;

// =============================================================================
// Tag Records
// =============================================================================

#[test]
fn test_first_entry_has_extra_tags() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tags.tif");
    let mut session = open_session(&path, summary(8, 8, "GRAY8", 1, 1, 3), test_config(4 * MIB, SchedulerMode::Synchronous));
    for frame in 0..3 {
        session
            .append(&gray8_image(8, 8, ImageCoords::new(0, 0, frame, 0)))
            .unwrap();
    }
    session.close(None, &DisplayAndComments::default()).unwrap();

    let bytes = fs::read(&path).unwrap();
    let reader = MultipageReader::open(&path).unwrap();
    let offsets = reader.ifd_offsets().unwrap();
    assert_eq!(offsets.len(), 3);

    let order = ByteOrder::LittleEndian;
    let counts: Vec<usize> = offsets
        .iter()
        .map(|&o| raw_tags(&bytes, order, o as usize).len())
        .collect();
    assert_eq!(counts, vec![17, 13, 13]);

    for &offset in &offsets {
        let tags = raw_tags(&bytes, order, offset as usize);
        let ids: Vec<u16> = tags.iter().map(|t| t.tag).collect();
        assert!(ids.windows(2).all(|w| w[0] <= w[1]), "tags out of order: {:?}", ids);

        let strip = find_tag(&tags, TiffTag::StripOffsets.as_u16()).unwrap();
        let next = order.read_u32(&bytes[offset as usize + 2 + tags.len() * 12..]);
        // Pixels directly follow the entry block of a gray image
        assert_eq!(strip.value as u64, offset + 2 + tags.len() as u64 * 12 + 4);
        if offset != *offsets.last().unwrap() {
            assert!(next as u64 > offset);
        } else {
            assert_eq!(next, 0);
        }
    }
}

#[test]
fn test_resolution_from_pixel_size() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("res.tif");
    let mut session = open_session(&path, summary(8, 8, "GRAY8", 1, 1, 1), test_config(4 * MIB, SchedulerMode::Synchronous));
    assert_eq!(session.layout().resolution, (20000, 1));
    session
        .append(&gray8_image(8, 8, ImageCoords::default()))
        .unwrap();
    session.close(None, &DisplayAndComments::default()).unwrap();

    let bytes = fs::read(&path).unwrap();
    let order = ByteOrder::LittleEndian;
    let first = order.read_u32(&bytes[4..]) as usize;
    let tags = raw_tags(&bytes, order, first);

    let x = find_tag(&tags, TiffTag::XResolution.as_u16()).unwrap();
    let y = find_tag(&tags, TiffTag::YResolution.as_u16()).unwrap();
    assert_eq!(x.field_type, FieldType::Rational as u16);
    assert_eq!(y.value, x.value + 8);
    assert_eq!(order.read_u32(&bytes[x.value as usize..]), 20000);
    assert_eq!(order.read_u32(&bytes[x.value as usize + 4..]), 1);

    let unit = find_tag(&tags, TiffTag::ResolutionUnit.as_u16()).unwrap();
    assert_eq!(order.read_u16(&unit.value.to_le_bytes()), 3);
}

#[test]
fn test_resolution_without_pixel_size() {
    let mut json = summary_json(8, 8, "GRAY8", 1, 1, 1);
    json.as_object_mut().unwrap().remove("PixelSize_um");
    let summary = SummaryMetadata::from_json(&json).unwrap();
    let layout = IfdLayout::from_summary(&summary, ByteOrder::LittleEndian);
    assert_eq!(layout.resolution, (10000, 1));
}

// =============================================================================
// Pixel Packing
// =============================================================================

#[test]
fn test_rgb_packing_drops_fourth_byte() {
    let src = [1u8, 2, 3, 255, 4, 5, 6, 255, 7, 8, 9, 255];
    let packed = pack_rgb_u8(&src);
    assert_eq!(packed.len(), src.len() / 4 * 3);
    assert_eq!(packed, vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);

    let wide = [100u16, 200, 300, 0xFFFF, 400, 500, 600, 0xFFFF];
    assert_eq!(pack_rgb_u16(&wide), vec![100, 200, 300, 400, 500, 600]);
}

#[test]
fn test_rgb_entry_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rgb.tif");
    let image = rgb32_image(4, 2, ImageCoords::default());
    let mut session = open_session(&path, summary(4, 2, "RGB32", 1, 1, 1), test_config(4 * MIB, SchedulerMode::Synchronous));
    session.append(&image).unwrap();
    session.close(None, &DisplayAndComments::default()).unwrap();

    let reader = MultipageReader::open(&path).unwrap();
    let ifd = reader.read_ifd(reader.first_ifd_offset()).unwrap();
    let pixels = reader.read_pixels(&ifd).unwrap();
    assert_eq!(pixels.len(), 4 * 2 * 3);

    let source = match &image.pixels {
        mptiff_writer::PixelBuffer::U8(bytes) => bytes.to_vec(),
        other => panic!("unexpected buffer {:?}", other),
    };
    assert_eq!(pixels, pack_rgb_u8(&source));

    // Bits per sample is an offset to a triplet of 8s
    let bytes = fs::read(&path).unwrap();
    let order = ByteOrder::LittleEndian;
    let tags = raw_tags(&bytes, order, ifd.offset as usize);
    let bits = find_tag(&tags, TiffTag::BitsPerSample.as_u16()).unwrap();
    assert_eq!(bits.count, 3);
    let at = bits.value as usize;
    let triplet: Vec<u16> = (0..3).map(|i| order.read_u16(&bytes[at + 2 * i..])).collect();
    assert_eq!(triplet, vec![8, 8, 8]);
}

// =============================================================================
// Per-Image Metadata
// =============================================================================

#[test]
fn test_metadata_string_stored_after_pixels() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("md.tif");
    let mut image = gray8_image(8, 8, ImageCoords::new(0, 0, 0, 0));
    image
        .tags
        .insert("Summary".into(), Value::from("duplicated summary"));
    let expected = image.metadata_string();
    assert!(expected.ends_with(' '));
    assert!(!expected.contains("duplicated summary"));

    let mut session = open_session(&path, summary(8, 8, "GRAY8", 1, 1, 1), test_config(4 * MIB, SchedulerMode::Synchronous));
    session.append(&image).unwrap();
    session.close(None, &DisplayAndComments::default()).unwrap();

    let reader = MultipageReader::open(&path).unwrap();
    let ifd = reader.read_ifd(reader.first_ifd_offset()).unwrap();
    assert_eq!(ifd.metadata, expected);

    let parsed: Value = serde_json::from_str(ifd.metadata.trim_end()).unwrap();
    assert_eq!(parsed["Exposure-ms"], 10.0);
    assert_eq!(parsed["FrameIndex"], 0);
    assert!(parsed.get("Summary").is_none());

    // Metadata sits right after the 16 resolution bytes
    let pixels_end = ifd.strip_offset as u64 + ifd.strip_byte_count as u64;
    let bytes = fs::read(&path).unwrap();
    let tags = raw_tags(&bytes, ByteOrder::LittleEndian, ifd.offset as usize);
    let metadata = find_tag(&tags, TiffTag::ImageMetadata.as_u16()).unwrap();
    assert_eq!(metadata.value as u64, pixels_end + 16);
}
