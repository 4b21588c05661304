//! File session integration tests.
//!
//! Tests verify:
//! - Offsets advance by exactly the bytes of each entry
//! - Index map entries point at valid directory entries
//! - Written files decode with an independent TIFF decoder
//! - Blank entries keep the directory chain continuous
//! - Capacity rejection happens at the predicted image
//! - Closed files stay below the size ceiling
//! - Backpressure bounds the write queue
//! - Closing metadata (descriptions, ImageJ blocks, display settings, comments)

use std::fs;
use std::sync::Arc;

use serde_json::{Map, Value};

use mptiff_writer::format::blocks::{
    imagej_metadata_bound, FILE_HEADER_SIZE, IMAGEJ_DESCRIPTION_RESERVE,
};
use mptiff_writer::format::tiff::TiffTag;
use mptiff_writer::{
    AppendOutcome, ByteOrder, ChannelDisplay, DisplayAndComments, FileSession, ImageCoords,
    IndexMap, MultipageReader, SchedulerMode, SessionState, SummaryMetadata, WriterConfig,
};

use super::test_utils::{
    find_tag, gray16_image, gray8_image, open_session, raw_tags, rgb32_image, sample, scheduler,
    summary, summary_json, test_config, RecordingAbortHook,
};

const MIB: u64 = 1024 * 1024;

fn display(channels: usize) -> DisplayAndComments {
    let channels = (0..channels)
        .map(|c| ChannelDisplay {
            color: if c == 0 { 0x00FF00 } else { 0xFF0000 },
            min: 10.0,
            max: 4000.0,
            gamma: 1.0,
            display_mode: Some(2),
            name: Some(format!("ch{}", c)),
        })
        .collect();
    let mut comments = Map::new();
    comments.insert("Summary".into(), Value::from("two channel test"));
    DisplayAndComments { channels, comments }
}

// =============================================================================
// Offset Accounting
// =============================================================================

#[test]
fn test_offsets_advance_by_exact_entry_length() {
    for mode in [SchedulerMode::Synchronous, SchedulerMode::Asynchronous] {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acq.tif");
        let mut session = open_session(&path, summary(64, 32, "GRAY16", 3, 1, 2), test_config(8 * MIB, mode));

        for frame in 0..2 {
            for channel in 0..3 {
                let image = gray16_image(64, 32, ImageCoords::new(channel, 0, frame, 0));
                let before = session.file_position();
                let first = session.image_count() == 0;
                let exact = session.layout().encoded_len(first, image.metadata_string().len());

                let outcome = session.append(&image).unwrap();
                assert_eq!(outcome, AppendOutcome::Written { offset: before });
                assert_eq!(session.file_position(), before + exact);
                assert!(session.file_position() < 8 * MIB);
            }
        }

        let closed = session.close(None, &display(3)).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), session.file_position());
        assert_eq!(closed.index_map.len(), 6);
    }
}

#[test]
fn test_index_map_points_at_directory_entries() {
    for order in [ByteOrder::LittleEndian, ByteOrder::BigEndian] {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acq.tif");
        let config = WriterConfig {
            byte_order: order,
            ..test_config(4 * MIB, SchedulerMode::Asynchronous)
        };
        let mut session = open_session(&path, summary(16, 16, "GRAY8", 2, 3, 1), config);

        for slice in 0..3 {
            for channel in 0..2 {
                session
                    .append(&gray8_image(16, 16, ImageCoords::new(channel, slice, 0, 0)))
                    .unwrap();
            }
        }
        session.append_blank(ImageCoords::new(0, 3, 0, 0)).unwrap();
        let closed = session.close(None, &display(2)).unwrap();

        let bytes = fs::read(&path).unwrap();
        assert_eq!(closed.index_map.len(), 6);
        for (coords, &offset) in closed.index_map.iter() {
            let entries = order.read_u16(&bytes[offset as usize..]);
            assert!((13..=19).contains(&entries), "{} has {} entries", coords, entries);

            let tags = raw_tags(&bytes, order, offset as usize);
            let metadata = find_tag(&tags, TiffTag::ImageMetadata.as_u16()).unwrap();
            let text = &bytes[metadata.value as usize..(metadata.value + metadata.count) as usize];
            let parsed: Value = serde_json::from_slice(text).unwrap();
            assert_eq!(parsed["ChannelIndex"], coords.channel);
            assert_eq!(parsed["SliceIndex"], coords.slice);
        }

        let reader = MultipageReader::open(&path).unwrap();
        assert_eq!(reader.byte_order(), order);
        assert_eq!(reader.index_map(), Some(&closed.index_map));
    }
}

// =============================================================================
// Decoding With an Independent Reader
// =============================================================================

#[test]
fn test_gray16_decodes_with_tiff_decoder() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gray16.tif");
    let coords = ImageCoords::new(0, 0, 0, 0);
    let mut session = open_session(&path, summary(40, 30, "GRAY16", 1, 1, 2), test_config(4 * MIB, SchedulerMode::Asynchronous));
    session.append(&gray16_image(40, 30, coords)).unwrap();
    session
        .append(&gray16_image(40, 30, ImageCoords::new(0, 0, 1, 0)))
        .unwrap();
    session.close(None, &display(1)).unwrap();

    let decoded = image::open(&path).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (40, 30));
    let luma = decoded.as_luma16().expect("16-bit grayscale");
    assert_eq!(luma.get_pixel(0, 0).0[0], sample(0, coords));
    assert_eq!(luma.get_pixel(5, 2).0[0], sample(2 * 40 + 5, coords));
}

#[test]
fn test_gray8_big_endian_decodes_with_tiff_decoder() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gray8.tif");
    let config = WriterConfig {
        byte_order: ByteOrder::BigEndian,
        ..test_config(4 * MIB, SchedulerMode::Synchronous)
    };
    let coords = ImageCoords::new(0, 0, 0, 0);
    let mut session = open_session(&path, summary(20, 10, "GRAY8", 1, 1, 1), config);
    session.append(&gray8_image(20, 10, coords)).unwrap();
    session.close(None, &DisplayAndComments::default()).unwrap();

    let decoded = image::open(&path).unwrap();
    let luma = decoded.as_luma8().expect("8-bit grayscale");
    assert_eq!((luma.width(), luma.height()), (20, 10));
    assert_eq!(luma.get_pixel(3, 1).0[0], sample(23, coords) as u8);
}

#[test]
fn test_rgb_decodes_with_tiff_decoder() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rgb.tif");
    let coords = ImageCoords::new(0, 0, 0, 0);
    let mut session = open_session(&path, summary(8, 4, "RGB32", 1, 1, 1), test_config(4 * MIB, SchedulerMode::Synchronous));
    session.append(&rgb32_image(8, 4, coords)).unwrap();
    session.close(None, &DisplayAndComments::default()).unwrap();

    let decoded = image::open(&path).unwrap();
    let rgb = decoded.as_rgb8().expect("8-bit RGB");
    assert_eq!((rgb.width(), rgb.height()), (8, 4));
    let base = sample(9, coords) as u8;
    assert_eq!(
        rgb.get_pixel(1, 1).0,
        [base, base.wrapping_add(1), base.wrapping_add(2)]
    );

    let reader = MultipageReader::open(&path).unwrap();
    let ifd = reader.read_ifd(reader.first_ifd_offset()).unwrap();
    assert_eq!(ifd.samples_per_pixel, 3);
    assert_eq!(ifd.bits_per_sample, 8);
    assert_eq!(ifd.strip_byte_count, 8 * 4 * 3);
}

// =============================================================================
// Two Channel Acquisition
// =============================================================================

#[test]
fn test_two_channel_acquisition() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("two.tif");
    let json = summary_json(512, 512, "GRAY16", 2, 1, 1);
    let summary = SummaryMetadata::from_json(&json).unwrap();
    let mut session = open_session(&path, summary, test_config(8 * MIB, SchedulerMode::Asynchronous));

    for channel in 0..2 {
        let outcome = session
            .append(&gray16_image(512, 512, ImageCoords::new(channel, 0, 0, 0)))
            .unwrap();
        assert!(outcome.is_written());
    }
    session.finish().unwrap();

    let bytes = fs::read(&path).unwrap();
    let order = ByteOrder::LittleEndian;
    let index_offset = order.read_u32(&bytes[12..]) as usize;
    let index = IndexMap::decode(order, &bytes[index_offset..]).unwrap();
    assert_eq!(order.read_u32(&bytes[index_offset + 4..]), 2);
    assert_eq!(index.len(), 2);

    let summary_len = order.read_u32(&bytes[36..]) as usize;
    let stored = &bytes[FILE_HEADER_SIZE as usize..FILE_HEADER_SIZE as usize + summary_len];
    assert_eq!(stored, json.to_string().as_bytes());
    assert_eq!(order.read_u32(&bytes[4..]) as usize, 40 + summary_len);

    session.close(None, &display(2)).unwrap();
}

// =============================================================================
// Blank Entries and the Directory Chain
// =============================================================================

#[test]
fn test_blank_then_real_entry_chain() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blank.tif");
    let mut session = open_session(&path, summary(16, 8, "GRAY16", 1, 1, 3), test_config(4 * MIB, SchedulerMode::Asynchronous));

    let blank = session.append_blank(ImageCoords::new(0, 0, 0, 0)).unwrap();
    let real = session
        .append(&gray16_image(16, 8, ImageCoords::new(0, 0, 1, 0)))
        .unwrap();
    let blank_again = session.append_blank(ImageCoords::new(0, 0, 2, 0)).unwrap();
    let closed = session.close(None, &display(1)).unwrap();

    let offsets: Vec<u64> = [blank, real, blank_again]
        .iter()
        .map(|outcome| match outcome {
            AppendOutcome::Written { offset } => *offset,
            AppendOutcome::FileFull => panic!("unexpected FileFull"),
        })
        .collect();

    let reader = MultipageReader::open(&path).unwrap();
    assert_eq!(reader.ifd_offsets().unwrap(), offsets);

    let first = reader.read_ifd(offsets[0]).unwrap();
    assert_eq!(first.next_ifd_offset as u64, offsets[1]);
    assert_eq!(first.metadata, "NULL ");
    assert!(reader.read_pixels(&first).unwrap().iter().all(|&b| b == 0));

    let last = reader.read_ifd(offsets[2]).unwrap();
    assert_eq!(last.next_ifd_offset, 0);

    // Only the real image is indexed
    assert_eq!(closed.index_map.len(), 1);
    assert_eq!(
        closed.index_map.get(&ImageCoords::new(0, 0, 1, 0)),
        Some(offsets[1] as u32)
    );
}

// =============================================================================
// Capacity
// =============================================================================

#[test]
fn test_capacity_rejection_at_predicted_image() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("full.tif");
    let max_file_size = 2 * MIB;
    let config = test_config(max_file_size, SchedulerMode::Synchronous);
    let comments_reserve = config.comments_reserve;
    let mut session = open_session(&path, summary(128, 128, "GRAY16", 2, 1, 100), config);

    // ImageJ metadata, description, both block headers, display settings and comments
    let closing = imagej_metadata_bound(&session.summary().to_pretty_json(), comments_reserve, 2)
        + IMAGEJ_DESCRIPTION_RESERVE
        + 16
        + 2 * 256
        + comments_reserve;
    assert_eq!(session.closing_reserve(), closing);

    // Predict the first image that no longer fits
    let mut position = session.file_position();
    let mut predicted = None;
    for n in 0..100u32 {
        let image = gray16_image(128, 128, ImageCoords::new(n % 2, 0, n / 2, 0));
        let entry = session.layout().encoded_len(n == 0, image.metadata_string().len());
        let required = position + entry + 8 + 20 * (n as u64 + 1) + closing;
        if required >= max_file_size {
            predicted = Some(n);
            break;
        }
        position += entry;
    }
    let predicted = predicted.unwrap();

    for n in 0..100u32 {
        let image = gray16_image(128, 128, ImageCoords::new(n % 2, 0, n / 2, 0));
        let fits = session.has_space_to_write(&image, 0);
        let before = session.file_position();
        let outcome = session.append(&image).unwrap();
        if n < predicted {
            assert!(fits);
            assert!(outcome.is_written());
        } else {
            assert!(!fits);
            assert_eq!(outcome, AppendOutcome::FileFull);
            assert_eq!(session.file_position(), before);
            break;
        }
    }
    assert_eq!(session.index_map().len(), predicted as usize);

    let closed = session.close(None, &display(2)).unwrap();
    assert!(fs::metadata(&closed.path).unwrap().len() < max_file_size);
}

// =============================================================================
// Finish and Close
// =============================================================================

#[test]
fn test_finished_file_is_browsable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("partial.tif");
    let mut session = open_session(&path, summary(16, 16, "GRAY8", 1, 1, 5), test_config(4 * MIB, SchedulerMode::Asynchronous));
    for frame in 0..2 {
        session
            .append(&gray8_image(16, 16, ImageCoords::new(0, 0, frame, 0)))
            .unwrap();
    }
    session.finish().unwrap();
    assert_eq!(session.state(), SessionState::Finishing);

    let reader = MultipageReader::open(&path).unwrap();
    assert_eq!(reader.index_map().map(IndexMap::len), Some(2));
    assert!(reader.display_settings().is_none());
    assert!(reader.comments().is_none());
    assert_eq!(reader.ifd_offsets().unwrap().len(), 2);

    let decoded = image::open(&path).unwrap();
    assert_eq!(decoded.width(), 16);
}

#[test]
fn test_close_writes_descriptions_and_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("closed.tif");
    let config = WriterConfig {
        ome_tiff: true,
        ..test_config(4 * MIB, SchedulerMode::Asynchronous)
    };
    let mut session = open_session(&path, summary(16, 16, "GRAY16", 2, 3, 4), config);
    for slice in 0..3 {
        for channel in 0..2 {
            session
                .append(&gray16_image(16, 16, ImageCoords::new(channel, slice, 0, 0)))
                .unwrap();
        }
    }
    session.set_aborted_num_frames(2);
    let ome = "<?xml version=\"1.0\"?><OME/>";
    let settings = display(2);
    session.close(Some(ome), &settings).unwrap();

    let reader = MultipageReader::open(&path).unwrap();
    let first = reader.read_ifd(reader.first_ifd_offset()).unwrap();
    assert_eq!(first.entry_count, 17);
    assert_eq!(first.descriptions.len(), 2);
    assert_eq!(first.descriptions[0], ome);
    assert_eq!(
        first.descriptions[1],
        "ImageJ=1.54f\nchannels=2\nslices=3\nframes=2\nhyperstack=true\norder=zct\nunit=um\nspacing=2.0\nmode=color\n\0"
    );
    assert_eq!(first.resolution, (20000, 1));

    let second = reader.read_ifd(first.next_ifd_offset as u64).unwrap();
    assert_eq!(second.entry_count, 13);
    assert!(second.descriptions.is_empty());

    assert_eq!(reader.display_settings(), Some(&settings.channels[..]));
    assert_eq!(reader.comments(), Some(&settings.comments));
}

#[test]
fn test_imagej_metadata_tags_patched() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ij.tif");
    let mut session = open_session(&path, summary(8, 8, "GRAY16", 2, 1, 1), test_config(4 * MIB, SchedulerMode::Synchronous));
    for channel in 0..2 {
        session
            .append(&gray16_image(8, 8, ImageCoords::new(channel, 0, 0, 0)))
            .unwrap();
    }
    let settings = display(2);
    session.close(None, &settings).unwrap();

    let bytes = fs::read(&path).unwrap();
    let order = ByteOrder::LittleEndian;
    let first = order.read_u32(&bytes[4..]) as usize;
    let tags = raw_tags(&bytes, order, first);

    let counts = find_tag(&tags, TiffTag::ImageJMetadataByteCounts.as_u16()).unwrap();
    assert_eq!(counts.count, 3 + 2);
    let counts_at = counts.value as usize;
    let info_len = order.read_u32(&bytes[counts_at + 4..]) as usize;
    assert_eq!(order.read_u32(&bytes[counts_at..]), 28);
    assert_eq!(order.read_u32(&bytes[counts_at + 8..]), 32);

    let payload = find_tag(&tags, TiffTag::ImageJMetadata.as_u16()).unwrap();
    assert_eq!(payload.count as usize, 28 + info_len + 32 + 2 * 768);
    let at = payload.value as usize;
    assert_eq!(&bytes[at..at + 4], &[0x4a, 0x49, 0x4a, 0x49]);

    // Info text begins with the acquisition comment, in UTF-16
    let info: Vec<u16> = bytes[at + 28..at + 28 + info_len]
        .chunks_exact(2)
        .map(|c| order.read_u16(c))
        .collect();
    let info = String::from_utf16(&info).unwrap();
    assert!(info.starts_with("Acquisition comments: \ntwo channel test\n\n\n{"));

    let ranges = at + 28 + info_len;
    assert_eq!(order.read_f64(&bytes[ranges..]), 10.0);
    assert_eq!(order.read_f64(&bytes[ranges + 8..]), 4000.0);

    // Unused OME slot stays empty
    let descriptions: Vec<_> = tags
        .iter()
        .filter(|t| t.tag == TiffTag::ImageDescription.as_u16())
        .collect();
    assert_eq!(descriptions.len(), 2);
    assert_eq!(descriptions[0].count, 0);
    assert!(descriptions[1].count > 0);
}

#[test]
fn test_summary_comment_removed_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("comment.tif");
    let mut json = summary_json(8, 8, "GRAY8", 1, 1, 1);
    json["Comment"] = Value::from("private note");
    let summary = SummaryMetadata::from_json(&json).unwrap();
    let mut session = open_session(&path, summary, test_config(4 * MIB, SchedulerMode::Synchronous));
    session.close(None, &DisplayAndComments::default()).unwrap();

    let reader = MultipageReader::open(&path).unwrap();
    assert!(reader.summary().get("Comment").is_none());
    assert_eq!(reader.summary().get("Width"), Some(&Value::from(8)));
}

/// Append 64x64 GRAY8 frames until the session reports full.
fn fill(session: &mut FileSession) -> u32 {
    let mut frame = 0;
    while session
        .append(&gray8_image(64, 64, ImageCoords::new(0, 0, frame, 0)))
        .unwrap()
        .is_written()
    {
        frame += 1;
    }
    frame
}

fn large_summary_config() -> (SummaryMetadata, WriterConfig) {
    let mut json = summary_json(64, 64, "GRAY8", 1, 1, 1000);
    json["Notes"] = Value::from("n".repeat(100_000));
    let config = WriterConfig {
        comments_reserve: 1024,
        ..test_config(MIB, SchedulerMode::Synchronous)
    };
    (SummaryMetadata::from_json(&json).unwrap(), config)
}

#[test]
fn test_closed_file_stays_below_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ceiling.tif");
    let (summary, config) = large_summary_config();
    let mut session = open_session(&path, summary, config);

    let written = fill(&mut session);
    assert!(written > 100);
    let settings = display(1);
    session.close(None, &settings).unwrap();

    let len = fs::metadata(&path).unwrap().len();
    assert!(len < MIB, "final length {} exceeds ceiling {}", len, MIB);
    assert_eq!(len, session.file_position());

    // Everything fit inside its reservation
    let reader = MultipageReader::open(&path).unwrap();
    assert_eq!(reader.comments(), Some(&settings.comments));
    assert_eq!(reader.display_settings(), Some(&settings.channels[..]));
    assert_eq!(reader.index_map().map(IndexMap::len), Some(written as usize));
}

#[test]
fn test_oversized_comments_dropped_at_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("comments.tif");
    let (summary, config) = large_summary_config();
    let mut session = open_session(&path, summary, config);
    fill(&mut session);

    let mut settings = display(1);
    settings
        .comments
        .insert("Summary".into(), Value::from("c".repeat(50_000)));
    session.close(None, &settings).unwrap();

    let len = fs::metadata(&path).unwrap().len();
    assert!(len < MIB, "final length {} exceeds ceiling {}", len, MIB);
    let reader = MultipageReader::open(&path).unwrap();
    assert!(reader.comments().is_none());
    assert_eq!(reader.display_settings(), Some(&settings.channels[..]));
}

#[test]
fn test_announced_comments_are_reserved() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("announced.tif");
    let (summary, config) = large_summary_config();
    let mut session = open_session(&path, summary, config);

    let mut settings = display(1);
    settings
        .comments
        .insert("Summary".into(), Value::from("c".repeat(50_000)));
    let before = session.closing_reserve();
    session.reserve_display_and_comments(&settings).unwrap();
    // Comment bytes count once in the block and twice as UTF-16 in ImageJ info
    assert!(session.closing_reserve() >= before + 3 * (50_000 - 1024));
    fill(&mut session);
    session.close(None, &settings).unwrap();

    let len = fs::metadata(&path).unwrap().len();
    assert!(len < MIB, "final length {} exceeds ceiling {}", len, MIB);
    let reader = MultipageReader::open(&path).unwrap();
    assert_eq!(reader.comments(), Some(&settings.comments));
}

// =============================================================================
// Backpressure
// =============================================================================

#[test]
fn test_backpressure_bounds_queue() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("burst.tif");
    let shared = scheduler(SchedulerMode::Asynchronous);
    let config = WriterConfig {
        backpressure_threshold: 2,
        ..test_config(8 * MIB, SchedulerMode::Asynchronous)
    };
    let mut session = FileSession::create(
        &path,
        summary(128, 128, "GRAY16", 1, 1, 60),
        config,
        Arc::clone(&shared),
        &RecordingAbortHook::default(),
    )
    .unwrap();

    for frame in 0..60 {
        let image = gray16_image(128, 128, ImageCoords::new(0, 0, frame, 0));
        assert!(session.append(&image).unwrap().is_written());
        // At most the threshold plus the entry just submitted
        assert!(shared.pending() <= 3, "{} tasks pending", shared.pending());
    }
    session.close(None, &display(1)).unwrap();

    let reader = MultipageReader::open(&path).unwrap();
    let offsets = reader.ifd_offsets().unwrap();
    assert_eq!(offsets.len(), 60);
    for (frame, &offset) in offsets.iter().enumerate() {
        let ifd = reader.read_ifd(offset).unwrap();
        let parsed: Value = serde_json::from_str(ifd.metadata.trim_end()).unwrap();
        assert_eq!(parsed["FrameIndex"], frame as u32);

        let pixels = reader.read_pixels(&ifd).unwrap();
        let coords = ImageCoords::new(0, 0, frame as u32, 0);
        assert_eq!(u16::from_le_bytes([pixels[2], pixels[3]]), sample(1, coords));
    }
}
