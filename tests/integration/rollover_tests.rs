//! Rollover tests.
//!
//! Tests verify:
//! - Files report full before crossing the size ceiling
//! - Every image lands in exactly one file when continuing in a new file
//! - Sessions sharing one scheduler stay independent

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use mptiff_writer::{
    AppendOutcome, DisplayAndComments, FileSession, ImageCoords, MultipageReader, SchedulerMode,
};

use super::test_utils::{gray16_image, sample, scheduler, summary, test_config, RecordingAbortHook};

const MIB: u64 = 1024 * 1024;

#[test]
fn test_rollover_keeps_every_image() {
    let dir = tempfile::tempdir().unwrap();
    let shared = scheduler(SchedulerMode::Asynchronous);
    let hook = RecordingAbortHook::default();
    let config = test_config(MIB, SchedulerMode::Asynchronous);
    let summary = summary(256, 256, "GRAY16", 2, 1, 12);

    let mut paths: Vec<PathBuf> = Vec::new();
    let open_next = |paths: &mut Vec<PathBuf>| {
        let path = dir.path().join(format!("acq_{}.tif", paths.len()));
        paths.push(path.clone());
        FileSession::create(path, summary.clone(), config.clone(), Arc::clone(&shared), &hook).unwrap()
    };

    let mut session = open_next(&mut paths);
    let mut expected = HashSet::new();
    for frame in 0..12 {
        for channel in 0..2 {
            let coords = ImageCoords::new(channel, 0, frame, 0);
            let image = gray16_image(256, 256, coords);
            if session.append(&image).unwrap() == AppendOutcome::FileFull {
                assert!(session.image_count() > 0);
                session.close(None, &DisplayAndComments::default()).unwrap();
                session = open_next(&mut paths);
                assert!(session.append(&image).unwrap().is_written());
            }
            expected.insert(coords);
        }
    }
    session.close(None, &DisplayAndComments::default()).unwrap();
    assert!(hook.aborted.lock().unwrap().is_empty());
    assert!(paths.len() > 1, "24 images of 128 KiB cannot fit in one 1 MiB file");

    let mut seen = HashSet::new();
    for path in &paths {
        assert!(fs::metadata(path).unwrap().len() < MIB);

        let reader = MultipageReader::open(path).unwrap();
        let index_map = reader.index_map().unwrap();
        assert!(!index_map.is_empty());
        for (coords, &offset) in index_map.iter() {
            assert!(seen.insert(*coords), "{} stored twice", coords);

            let ifd = reader.read_ifd(offset as u64).unwrap();
            let pixels = reader.read_pixels(&ifd).unwrap();
            assert_eq!(pixels.len(), 256 * 256 * 2);
            let last = 256 * 256 - 1;
            let value = u16::from_le_bytes([pixels[2 * last], pixels[2 * last + 1]]);
            assert_eq!(value, sample(last, *coords));
        }
        assert_eq!(reader.ifd_offsets().unwrap().len(), index_map.len());
    }
    assert_eq!(seen, expected);
}

#[test]
fn test_sessions_share_scheduler() {
    let dir = tempfile::tempdir().unwrap();
    let shared = scheduler(SchedulerMode::Asynchronous);
    let hook = RecordingAbortHook::default();
    let config = test_config(4 * MIB, SchedulerMode::Asynchronous);

    let mut sessions: Vec<FileSession> = (0..3)
        .map(|i| {
            FileSession::create(
                dir.path().join(format!("pos_{}.tif", i)),
                summary(32, 32, "GRAY16", 1, 1, 4),
                config.clone(),
                Arc::clone(&shared),
                &hook,
            )
            .unwrap()
        })
        .collect();

    // Interleave writes across files the way multi-position acquisitions do
    for frame in 0..4 {
        for (position, session) in sessions.iter_mut().enumerate() {
            let coords = ImageCoords::new(0, 0, frame, position as u32);
            session.append(&gray16_image(32, 32, coords)).unwrap();
        }
    }

    for (position, session) in sessions.iter_mut().enumerate() {
        let closed = session.close(None, &DisplayAndComments::default()).unwrap();
        assert_eq!(closed.index_map.len(), 4);
        assert!(closed
            .index_map
            .iter()
            .all(|(coords, _)| coords.position == position as u32));

        let reader = MultipageReader::open(&closed.path).unwrap();
        assert_eq!(reader.ifd_offsets().unwrap().len(), 4);
    }
}
