//! mptiff-writer - Streaming multipage TIFF writer.
//!
//! `simulate` writes a synthetic acquisition, rolling over to a new file each
//! time one reaches its size ceiling. `inspect` prints what a written file
//! contains.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde_json::{json, Map, Value};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mptiff_writer::{
    config::{Cli, Command, InspectConfig, SimulateConfig, WriterConfig},
    AppendOutcome, ChannelDisplay, DisplayAndComments, FileSession, ImageCoords, ImageRecord,
    MultipageReader, PixelBuffer, PixelType, SummaryMetadata, WriteError, WriteScheduler,
};

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Simulate(config) => run_simulate(config),
        Command::Inspect(config) => run_inspect(config),
    }
}

fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "mptiff_writer=debug"
    } else {
        "mptiff_writer=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

// =============================================================================
// Simulate Command
// =============================================================================

/// Channel colors cycled through in synthetic display settings.
const CHANNEL_COLORS: [i32; 4] = [0x00FF00, 0xFF00FF, 0x00FFFF, 0xFFFFFF];

fn run_simulate(config: SimulateConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }
    let writer_config = config.writer.to_writer_config();
    if let Err(e) = writer_config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    match simulate(&config, writer_config) {
        Ok(files) => {
            info!("Wrote {} file(s):", files.len());
            for file in files {
                info!("  {}", file.display());
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Acquisition failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Name of the `index`-th file of an acquisition.
fn file_name(prefix: &str, index: usize) -> String {
    if index == 0 {
        format!("{}_MMStack.ome.tif", prefix)
    } else {
        format!("{}_MMStack_{}.ome.tif", prefix, index)
    }
}

fn simulate(config: &SimulateConfig, writer_config: WriterConfig) -> Result<Vec<PathBuf>, WriteError> {
    let summary_json = json!({
        "Prefix": config.prefix,
        "Width": config.width,
        "Height": config.height,
        "PixelType": config.pixel_type,
        "Channels": config.channels,
        "Slices": config.slices,
        "Frames": config.frames,
        "Positions": 1,
        "PixelSize_um": config.pixel_size_um,
        "z-step_um": 1.0,
        "SlicesFirst": true,
        "ChNames": (0..config.channels).map(|c| format!("Channel {}", c)).collect::<Vec<_>>(),
    });
    let summary = SummaryMetadata::from_json(&summary_json)?;
    let display = synthetic_display(&summary);

    let scheduler = WriteScheduler::global(writer_config.scheduler_mode)?;
    let abort = |path: &Path, e: &WriteError| {
        error!("Stopping acquisition, {} could not be created: {}", path.display(), e);
    };

    let mut files = Vec::new();
    let open_next = |files: &mut Vec<PathBuf>| -> Result<FileSession, WriteError> {
        let path = config.output.join(file_name(&config.prefix, files.len()));
        files.push(path.clone());
        let mut session = FileSession::create(
            path,
            summary.clone(),
            writer_config.clone(),
            Arc::clone(&scheduler),
            &abort,
        )?;
        session.reserve_display_and_comments(&display)?;
        Ok(session)
    };

    let mut session = open_next(&mut files)?;
    for frame in 0..config.frames {
        for slice in 0..config.slices {
            for channel in 0..config.channels {
                let image = synthetic_image(&summary, ImageCoords::new(channel, slice, frame, 0))?;
                if session.append(&image)? == AppendOutcome::FileFull {
                    info!("{} is full, continuing in a new file", session.path().display());
                    session.close(None, &display)?;
                    session = open_next(&mut files)?;
                    if session.append(&image)? == AppendOutcome::FileFull {
                        return Err(WriteError::InvalidConfig(
                            "a single image does not fit below max_file_size".to_string(),
                        ));
                    }
                }
            }
        }
    }
    session.close(None, &display)?;
    Ok(files)
}

fn synthetic_display(summary: &SummaryMetadata) -> DisplayAndComments {
    let channels = (0..summary.channels as usize)
        .map(|c| ChannelDisplay {
            color: CHANNEL_COLORS[c % CHANNEL_COLORS.len()],
            display_mode: Some(1),
            name: Some(format!("Channel {}", c)),
            ..ChannelDisplay::full_range(summary.byte_depth())
        })
        .collect();
    let mut comments = Map::new();
    comments.insert("Summary".to_string(), Value::from("Synthetic acquisition"));
    DisplayAndComments { channels, comments }
}

/// A diagonal ramp that shifts with the image coordinates.
fn synthetic_image(summary: &SummaryMetadata, coords: ImageCoords) -> Result<ImageRecord, WriteError> {
    let width = summary.width as usize;
    let height = summary.height as usize;
    let samples = if summary.is_rgb() { 4 } else { 1 };
    let shift = (coords.frame * 7 + coords.slice * 3 + coords.channel * 50) as usize;
    let ramp = (0..width * height * samples).map(move |i| {
        let pixel = i / samples;
        (pixel % width + pixel / width + shift) as u32
    });

    let pixels = match summary.pixel_type {
        PixelType::Gray8 | PixelType::Rgb24 | PixelType::Rgb32 => {
            PixelBuffer::from(ramp.map(|v| v as u8).collect::<Vec<u8>>())
        }
        _ => PixelBuffer::from(ramp.map(|v| (v * 16) as u16).collect::<Vec<u16>>()),
    };

    let mut tags = Map::new();
    tags.insert("ChannelIndex".to_string(), Value::from(coords.channel));
    tags.insert("SliceIndex".to_string(), Value::from(coords.slice));
    tags.insert("FrameIndex".to_string(), Value::from(coords.frame));
    tags.insert("PositionIndex".to_string(), Value::from(coords.position));
    tags.insert("Camera".to_string(), Value::from("Synthetic"));

    ImageRecord::new(
        pixels,
        summary.width,
        summary.height,
        summary.byte_depth(),
        summary.is_rgb(),
        tags,
    )
    .map_err(WriteError::from)
}

// =============================================================================
// Inspect Command
// =============================================================================

fn run_inspect(config: InspectConfig) -> ExitCode {
    if config.verbose {
        init_logging(true);
    }

    let reader = match MultipageReader::open(&config.path) {
        Ok(reader) => reader,
        Err(e) => {
            eprintln!("Error: {}: {}", config.path.display(), e);
            return ExitCode::FAILURE;
        }
    };

    println!("File:        {}", reader.path().display());
    println!("Size:        {} bytes", reader.file_size());
    println!("Byte order:  {:?}", reader.byte_order());
    println!("First IFD:   {}", reader.first_ifd_offset());

    let summary = reader.summary();
    for key in ["Width", "Height", "PixelType", "Channels", "Slices", "Frames", "Positions"] {
        if let Some(value) = summary.get(key) {
            println!("{:<12} {}", format!("{}:", key), value);
        }
    }

    match reader.index_map() {
        Some(index_map) => {
            println!("Index map:   {} entries", index_map.len());
            if config.entries {
                let mut entries: Vec<_> = index_map.iter().collect();
                entries.sort();
                for (coords, offset) in entries {
                    println!("  {:<16} {}", coords.to_string(), offset);
                }
            }
            if !index_map.is_empty() {
                match reader.read_ifd(reader.first_ifd_offset()) {
                    Ok(ifd) => println!(
                        "First image: {}x{}, {} bits, {} samples, {} tags",
                        ifd.width, ifd.height, ifd.bits_per_sample, ifd.samples_per_pixel, ifd.entry_count
                    ),
                    Err(e) => {
                        eprintln!("Error: first directory entry: {}", e);
                        return ExitCode::FAILURE;
                    }
                }
            }
        }
        None => println!("Index map:   absent (file was not finished)"),
    }

    match reader.display_settings() {
        Some(channels) => println!("Display:     {} channel(s)", channels.len()),
        None => println!("Display:     absent (file was not closed)"),
    }
    if let Some(comments) = reader.comments() {
        println!("Comments:    {}", Value::Object(comments.clone()));
    }

    ExitCode::SUCCESS
}
