//! Configuration for the multipage TIFF writer.
//!
//! Library users build a [`WriterConfig`] directly. The `mptiff-writer` binary
//! parses the same settings from the command line or from environment
//! variables with the `MPTIFF_` prefix:
//!
//! - `MPTIFF_MAX_FILE_SIZE` - Size ceiling per file in bytes (default: 4 GiB)
//! - `MPTIFF_SYNC` - Write on the calling thread instead of a worker (default: false)
//! - `MPTIFF_BIG_ENDIAN` - Write big-endian files (default: false)
//! - `MPTIFF_OME_TIFF` - Reserve space for and write OME-XML (default: false)
//!
//! # Example
//!
//! ```ignore
//! use mptiff_writer::config::WriterConfig;
//!
//! let config = WriterConfig {
//!     max_file_size: 512 * 1024 * 1024,
//!     ..WriterConfig::default()
//! };
//! config.validate()?;
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::error::WriteError;
use crate::format::tiff::ByteOrder;
use crate::io::SchedulerMode;

// =============================================================================
// Default Values
// =============================================================================

/// Default size ceiling: the 32-bit offset limit of classic TIFF.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Pending write tasks above which `append` stalls the producer.
pub const DEFAULT_BACKPRESSURE_THRESHOLD: usize = 20;

/// Space kept free for the comments block.
pub const DEFAULT_COMMENTS_RESERVE: u64 = 1024 * 1024;

/// Extra safety margin in the capacity check.
pub const DEFAULT_EXTRA_PADDING: u64 = 5_000_000;

/// Smallest accepted size ceiling.
const MIN_FILE_SIZE: u64 = 1024 * 1024;

// =============================================================================
// Writer Configuration
// =============================================================================

/// Settings shared by every file session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterConfig {
    /// Size ceiling of one physical file in bytes
    pub max_file_size: u64,

    /// How writes reach the disk
    pub scheduler_mode: SchedulerMode,

    /// Byte order of every multi-byte value in the file
    pub byte_order: ByteOrder,

    /// Whether OME-XML is written into the first image description
    pub ome_tiff: bool,

    /// Pending write tasks above which `append` stalls
    pub backpressure_threshold: usize,

    /// Bytes reserved for the comments block
    pub comments_reserve: u64,

    /// Extra bytes kept free when checking capacity
    pub extra_padding: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            scheduler_mode: SchedulerMode::Asynchronous,
            byte_order: ByteOrder::LittleEndian,
            ome_tiff: false,
            backpressure_threshold: DEFAULT_BACKPRESSURE_THRESHOLD,
            comments_reserve: DEFAULT_COMMENTS_RESERVE,
            extra_padding: DEFAULT_EXTRA_PADDING,
        }
    }
}

impl WriterConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), WriteError> {
        if self.max_file_size > DEFAULT_MAX_FILE_SIZE {
            return Err(WriteError::InvalidConfig(format!(
                "max_file_size {} exceeds the classic TIFF limit of {} bytes",
                self.max_file_size, DEFAULT_MAX_FILE_SIZE
            )));
        }
        if self.max_file_size < MIN_FILE_SIZE {
            return Err(WriteError::InvalidConfig(format!(
                "max_file_size must be at least {} bytes",
                MIN_FILE_SIZE
            )));
        }
        if self.backpressure_threshold == 0 {
            return Err(WriteError::InvalidConfig(
                "backpressure_threshold must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// CLI Arguments
// =============================================================================

/// mptiff-writer - Streaming multipage TIFF writer for microscopy acquisitions.
#[derive(Parser, Debug, Clone)]
#[command(name = "mptiff-writer")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Write a synthetic acquisition, rolling over to new files when full.
    Simulate(SimulateConfig),

    /// Print the header, summary and index map of a written file.
    Inspect(InspectConfig),
}

/// Options shared by every command that writes files.
#[derive(Args, Debug, Clone)]
pub struct WriterArgs {
    /// Size ceiling of one file in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_FILE_SIZE, env = "MPTIFF_MAX_FILE_SIZE")]
    pub max_file_size: u64,

    /// Write on the calling thread instead of a background worker.
    #[arg(long, default_value_t = false, env = "MPTIFF_SYNC")]
    pub sync: bool,

    /// Write big-endian (MM) files.
    #[arg(long, default_value_t = false, env = "MPTIFF_BIG_ENDIAN")]
    pub big_endian: bool,

    /// Write an OME-XML description into each file.
    #[arg(long, default_value_t = false, env = "MPTIFF_OME_TIFF")]
    pub ome_tiff: bool,
}

impl WriterArgs {
    /// Map the arguments onto a writer configuration.
    pub fn to_writer_config(&self) -> WriterConfig {
        WriterConfig {
            max_file_size: self.max_file_size,
            scheduler_mode: if self.sync {
                SchedulerMode::Synchronous
            } else {
                SchedulerMode::Asynchronous
            },
            byte_order: if self.big_endian {
                ByteOrder::BigEndian
            } else {
                ByteOrder::LittleEndian
            },
            ome_tiff: self.ome_tiff,
            ..WriterConfig::default()
        }
    }
}

/// Synthetic acquisition parameters.
#[derive(Args, Debug, Clone)]
pub struct SimulateConfig {
    /// Directory receiving the files.
    #[arg(short, long, default_value = ".")]
    pub output: PathBuf,

    /// Base name of the files (`<prefix>_MMStack.ome.tif`, `<prefix>_MMStack_1.ome.tif`, ...).
    #[arg(long, default_value = "acquisition")]
    pub prefix: String,

    #[arg(long, default_value_t = 512)]
    pub width: u32,

    #[arg(long, default_value_t = 512)]
    pub height: u32,

    /// Pixel type (GRAY8, GRAY16, RGB32, RGB64).
    #[arg(long, default_value = "GRAY16")]
    pub pixel_type: String,

    #[arg(long, default_value_t = 1)]
    pub channels: u32,

    #[arg(long, default_value_t = 1)]
    pub slices: u32,

    #[arg(long, default_value_t = 10)]
    pub frames: u32,

    /// Physical pixel size in micrometers.
    #[arg(long, default_value_t = 1.0)]
    pub pixel_size_um: f64,

    #[command(flatten)]
    pub writer: WriterArgs,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl SimulateConfig {
    /// Validate the acquisition parameters.
    pub fn validate(&self) -> Result<(), String> {
        if self.width == 0 || self.height == 0 {
            return Err("width and height must be greater than 0".to_string());
        }
        if self.channels == 0 || self.slices == 0 || self.frames == 0 {
            return Err("channels, slices and frames must be greater than 0".to_string());
        }
        if self.prefix.is_empty() {
            return Err("prefix must not be empty".to_string());
        }
        Ok(())
    }
}

/// File inspection options.
#[derive(Args, Debug, Clone)]
pub struct InspectConfig {
    /// File to inspect.
    pub path: PathBuf,

    /// Also list every index map entry.
    #[arg(long, default_value_t = false)]
    pub entries: bool,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

// =============================================================================
// Tests
// =============================================================================
