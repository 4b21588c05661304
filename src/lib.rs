//! # mptiff-writer
//!
//! A streaming writer for multipage TIFF files produced by microscopy
//! acquisitions.
//!
//! Images are appended one at a time while the acquisition runs, without
//! holding the dataset in memory. Each file is a classic TIFF readable by any
//! TIFF reader and by ImageJ as a hyperstack, extended with private blocks
//! (summary metadata, index map, display settings, comments) for fast random
//! access.
//!
//! ## Features
//!
//! - **Streaming**: each image becomes one directory entry appended to the file
//! - **Background writes**: disk I/O runs on a shared worker thread, in order
//! - **Size ceiling**: files report "full" so the caller can roll over
//! - **Random access**: an index map locates every image by its coordinates
//! - **ImageJ compatible**: hyperstack description, display ranges and LUTs
//!
//! ## Architecture
//!
//! - [`io`] - Buffer pool, positioned file I/O and the write scheduler
//! - [`mod@format`] - TIFF directory entries and private metadata blocks
//! - [`session`] - One file being written, from header to trailer
//! - [`metadata`] - Summary metadata, image records, display settings
//! - [`reader`] - Reading back written files
//! - [`config`] - Writer settings and CLI types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mptiff_writer::{
//!     DisplayAndComments, FileSession, ImageRecord, SummaryMetadata, WriteError,
//!     WriteScheduler, WriterConfig,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let summary = SummaryMetadata::from_json(&serde_json::json!({
//!         "Width": 512, "Height": 512, "PixelType": "GRAY16", "Channels": 2,
//!     }))?;
//!     let config = WriterConfig::default();
//!     let scheduler = WriteScheduler::global(config.scheduler_mode)?;
//!     let on_abort = |_: &std::path::Path, e: &WriteError| eprintln!("abort: {}", e);
//!
//!     let mut session = FileSession::create("out.ome.tif", summary, config, scheduler, &on_abort)?;
//!     for channel in 0..2u32 {
//!         let mut tags = serde_json::Map::new();
//!         tags.insert("ChannelIndex".into(), channel.into());
//!         let image = ImageRecord::new(vec![0u16; 512 * 512], 512, 512, 2, false, tags)?;
//!         session.append(&image)?;
//!     }
//!     let closed = session.close(None, &DisplayAndComments::default())?;
//!     println!("{} images indexed", closed.index_map.len());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod format;
pub mod io;
pub mod metadata;
pub mod reader;
pub mod session;

// Re-export commonly used types
pub use config::{Cli, Command, WriterConfig};
pub use error::{MetadataError, TiffError, WriteError};
pub use format::tiff::{ByteOrder, IfdLayout};
pub use io::{BufferPool, SchedulerMode, WriteScheduler};
pub use metadata::{
    ChannelDisplay, DisplayAndComments, ImageCoords, ImageRecord, PixelBuffer, PixelType,
    SummaryMetadata,
};
pub use reader::{IfdInfo, MultipageReader};
pub use session::{
    AbortHook, AppendOutcome, ClosedFile, FileSession, IndexMap, SessionState,
};
