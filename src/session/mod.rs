//! One physical multipage TIFF file being written.
//!
//! A [`FileSession`] moves through `Opening → Writing → Finishing → Closed`:
//!
//! - **Opening**: the file is pre-allocated to its estimated size, then the
//!   header and summary metadata are written.
//! - **Writing**: each accepted image appends one directory entry with its
//!   pixels and metadata right after the previous one.
//! - **Finishing**: the directory chain is terminated and the index map is
//!   written. The file is readable from here on.
//! - **Closed**: the ImageJ metadata, image descriptions, display settings and
//!   comments are written and the file is truncated to its used length.
//!
//! A session becomes `Aborted` when a write on its behalf fails.
//!
//! # Threading
//!
//! Every method takes `&mut self`: a session is owned by exactly one producer
//! thread. Offsets, the index map and the patch table are computed on that
//! thread ahead of the disk writes, which the [`WriteScheduler`] carries out in
//! submission order. Only the buffer pool and the failure flag are shared with
//! the write worker.

mod index;
mod patch;

pub use index::IndexMap;
pub use patch::{Patch, PatchTable};

use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::config::WriterConfig;
use crate::error::WriteError;
use crate::format::blocks::{
    display_settings_reserve, encode_comments, encode_display_settings, encode_file_header,
    encode_imagej_metadata, imagej_info, imagej_metadata_bound, imagej_metadata_len,
    ImageJDescription, BLOCK_HEADER_SIZE, COMMENTS_OFFSET_HEADER, COMMENTS_SLOT,
    DISPLAY_SETTINGS_OFFSET_HEADER, DISPLAY_SETTINGS_SLOT, FILE_HEADER_SIZE,
    IMAGEJ_DESCRIPTION_RESERVE, INDEX_MAP_OFFSET_HEADER, INDEX_MAP_SLOT,
};
use crate::format::tiff::{
    blank_pixels, encode_ifd, pack_pixels, FirstEntrySites, IfdLayout, BLANK_METADATA,
};
use crate::io::{BufferPool, SchedulerMode, SessionHealth, WriteBuffer, WriteScheduler, WriteTarget};
use crate::metadata::{DisplayAndComments, ImageCoords, ImageRecord, SummaryMetadata};

/// Base allowance for the estimated file size.
const ESTIMATE_BASE_BYTES: u64 = 2_000_000;

/// Per-image allowance for directory entry and metadata in the estimate.
const ESTIMATE_BYTES_PER_IMAGE: u64 = 2000;

/// Poll interval while waiting for the write queue to drain.
const BACKPRESSURE_POLL: Duration = Duration::from_millis(5);

// =============================================================================
// Public Types
// =============================================================================

/// Lifecycle state of a [`FileSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opening,
    Writing,
    Finishing,
    Closed,
    Aborted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Opening => "opening",
            SessionState::Writing => "writing",
            SessionState::Finishing => "finishing",
            SessionState::Closed => "closed",
            SessionState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Notified when a file cannot be opened for lack of disk space.
///
/// The acquisition is expected to stop when this fires.
pub trait AbortHook {
    fn abort(&self, path: &Path, error: &WriteError);
}

impl<F> AbortHook for F
where
    F: Fn(&Path, &WriteError),
{
    fn abort(&self, path: &Path, error: &WriteError) {
        self(path, error)
    }
}

/// Result of offering an image to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The image's directory entry starts at `offset`
    Written { offset: u64 },
    /// The image would push the file past its size ceiling; nothing was written
    FileFull,
}

impl AppendOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, AppendOutcome::Written { .. })
    }
}

/// What the reader needs once a file is closed.
#[derive(Debug)]
pub struct ClosedFile {
    pub path: PathBuf,
    pub index_map: IndexMap,
    pub file: Arc<File>,
}

/// Optional blocks written by [`FileSession::close`].
struct ClosingBlocks<'a> {
    ome_xml: Option<&'a str>,
    settings: Option<Bytes>,
    comments: Option<Bytes>,
}

/// Estimated final size of a file, used to pre-allocate it.
pub fn estimated_file_size(summary: &SummaryMetadata, summary_len: usize, max_file_size: u64) -> u64 {
    let per_image = summary.bytes_per_image() + ESTIMATE_BYTES_PER_IMAGE;
    let estimate = (summary_len as u64)
        .saturating_add(ESTIMATE_BASE_BYTES)
        .saturating_add(summary.expected_images().saturating_mul(per_image));
    estimate.min(max_file_size)
}

// =============================================================================
// FileSession
// =============================================================================

/// Writer for one physical file.
pub struct FileSession {
    path: PathBuf,
    config: WriterConfig,
    scheduler: Arc<WriteScheduler>,
    target: Arc<WriteTarget>,
    summary: SummaryMetadata,
    layout: IfdLayout,
    state: SessionState,

    /// Next free byte; every append advances it by the exact entry length
    position: u64,
    /// Directory entries written, blank ones included
    entries_written: u64,
    first_sites: Option<FirstEntrySites>,
    last_next_ifd_site: Option<u64>,
    index_map: IndexMap,
    patches: PatchTable,

    /// Frame count announced in the ImageJ description
    frames: u32,
    /// Bytes reserved for OME-XML in the capacity check
    ome_reserve: u64,
    /// ImageJ metadata length without the acquisition comment
    imagej_reserve: u64,
    /// Payload bytes reserved for the comments block
    comments_reserve: u64,
    /// Payload bytes reserved for the display settings block
    display_reserve: u64,
}

impl fmt::Debug for FileSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSession")
            .field("path", &self.path)
            .field("state", &self.state)
            .field("position", &self.position)
            .field("entries_written", &self.entries_written)
            .finish()
    }
}

impl FileSession {
    /// Create the file and write its header and summary metadata.
    ///
    /// The file is first extended to its estimated final size. If that fails
    /// (disk full), `abort_hook` is notified and `AllocationFailed` returned.
    pub fn create(
        path: impl AsRef<Path>,
        summary: SummaryMetadata,
        config: WriterConfig,
        scheduler: Arc<WriteScheduler>,
        abort_hook: &dyn AbortHook,
    ) -> Result<Self, WriteError> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let summary_json = summary.to_json_string();
        let estimated = estimated_file_size(&summary, summary_json.len(), config.max_file_size);
        if let Err(source) = file.set_len(estimated) {
            let err = WriteError::AllocationFailed {
                path: path.clone(),
                requested: estimated,
                source,
            };
            error!("Could not allocate {}: {}", path.display(), err);
            abort_hook.abort(&path, &err);
            return Err(err);
        }

        let target = Arc::new(WriteTarget {
            file: Arc::new(file),
            pool: Arc::new(BufferPool::new()),
            health: Arc::new(SessionHealth::default()),
            name: path.display().to_string(),
        });

        let layout = IfdLayout::from_summary(&summary, config.byte_order);
        let frames = summary.frames;
        let comments_reserve = config.comments_reserve;
        let display_reserve = display_settings_reserve(summary.channels);
        let imagej_reserve =
            imagej_metadata_bound(&summary.to_pretty_json(), 0, summary.channels as usize);
        let mut session = Self {
            path,
            patches: PatchTable::new(config.byte_order),
            config,
            scheduler,
            target,
            summary,
            layout,
            state: SessionState::Opening,
            position: 0,
            entries_written: 0,
            first_sites: None,
            last_next_ifd_site: None,
            index_map: IndexMap::new(),
            frames,
            ome_reserve: 0,
            imagej_reserve,
            comments_reserve,
            display_reserve,
        };

        session.write_header(summary_json)?;
        session.state = SessionState::Writing;

        info!(
            "Opened {} ({}x{}, {} bytes per image, {} bytes allocated)",
            session.path.display(),
            session.layout.width,
            session.layout.height,
            session.layout.bytes_per_image(),
            estimated
        );
        Ok(session)
    }

    fn write_header(&mut self, summary_json: String) -> Result<(), WriteError> {
        let header = encode_file_header(self.config.byte_order, summary_json.len())?;
        let summary_len = summary_json.len() as u64;
        self.scheduler.write(
            &self.target,
            0,
            vec![header.into(), Bytes::from(summary_json).into()],
        )?;
        self.position = FILE_HEADER_SIZE + summary_len;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Offset at which the next directory entry would start.
    pub fn file_position(&self) -> u64 {
        self.position
    }

    /// Number of directory entries written, blank entries included.
    pub fn image_count(&self) -> u64 {
        self.entries_written
    }

    pub fn index_map(&self) -> &IndexMap {
        &self.index_map
    }

    pub fn layout(&self) -> &IfdLayout {
        &self.layout
    }

    pub fn summary(&self) -> &SummaryMetadata {
        &self.summary
    }

    /// The underlying file, for readers that browse it while it is written.
    pub fn file(&self) -> &Arc<File> {
        &self.target.file
    }

    /// Announce fewer frames than planned, after an acquisition was stopped early.
    pub fn set_aborted_num_frames(&mut self, frames: u32) {
        debug!("{}: frame count set to {} after abort", self.path.display(), frames);
        self.frames = frames;
    }

    /// Reserve `len` bytes for OME-XML in later capacity checks.
    ///
    /// Only taken into account when OME output is enabled.
    pub fn reserve_ome_metadata(&mut self, len: u64) {
        self.ome_reserve = len;
    }

    // -------------------------------------------------------------------------
    // Capacity
    // -------------------------------------------------------------------------

    /// Whether `image` fits below the size ceiling, together with everything
    /// that still has to be written when the file is closed.
    pub fn has_space_to_write(&self, image: &ImageRecord, ome_metadata_len: u64) -> bool {
        self.has_space_for(image.metadata_string().len(), ome_metadata_len)
    }

    /// Grow the closing reservations to hold `display`.
    ///
    /// Display settings and comments larger than their default reservation
    /// are only guaranteed a place in the file when announced here before
    /// the file fills up.
    pub fn reserve_display_and_comments(&mut self, display: &DisplayAndComments) -> Result<(), WriteError> {
        let order = self.config.byte_order;
        let settings = encode_display_settings(order, &display.channels, self.summary.channels)?;
        let comments = encode_comments(order, &display.comments)?;
        self.display_reserve = self
            .display_reserve
            .max(settings.len() as u64 - BLOCK_HEADER_SIZE);
        self.comments_reserve = self
            .comments_reserve
            .max(comments.len() as u64 - BLOCK_HEADER_SIZE);
        Ok(())
    }

    /// Bytes kept free for everything `close` writes after the index map.
    ///
    /// The ImageJ metadata holds the summary and the acquisition comment,
    /// which is part of the comments block and bounded by its reservation.
    pub fn closing_reserve(&self) -> u64 {
        // A UTF-8 byte of the comment never yields more than one UTF-16 unit
        self.imagej_reserve
            + 2 * self.comments_reserve
            + IMAGEJ_DESCRIPTION_RESERVE
            + 2 * BLOCK_HEADER_SIZE
            + self.display_reserve
            + self.comments_reserve
            + self.config.extra_padding
    }

    fn has_space_for(&self, metadata_len: usize, ome_metadata_len: u64) -> bool {
        let first = self.entries_written == 0;
        let mut required = self.position
            + self.layout.encoded_len(first, metadata_len)
            + IndexMap::block_len_for(self.index_map.len() + 1)
            + self.closing_reserve();
        if self.config.ome_tiff {
            required += ome_metadata_len;
        }
        required < self.config.max_file_size
    }

    // -------------------------------------------------------------------------
    // Writing
    // -------------------------------------------------------------------------

    /// Append one image.
    ///
    /// Returns `FileFull` without writing anything when the image does not
    /// fit; the caller is expected to continue in a new file.
    pub fn append(&mut self, image: &ImageRecord) -> Result<AppendOutcome, WriteError> {
        self.check_health()?;
        self.require_state("append", SessionState::Writing)?;
        self.wait_for_queue();

        let metadata = image.metadata_string();
        if !self.has_space_for(metadata.len(), self.ome_reserve) {
            debug!(
                "{} is full at {} bytes, rejecting image {}",
                self.path.display(),
                self.position,
                image.coords
            );
            return Ok(AppendOutcome::FileFull);
        }

        if image.width != self.layout.width
            || image.height != self.layout.height
            || image.byte_depth != self.layout.byte_depth
            || image.rgb != self.layout.rgb
        {
            warn!(
                "Image {} is {}x{} ({} bytes, rgb={}) but {} expects {}x{} ({} bytes, rgb={})",
                image.coords,
                image.width,
                image.height,
                image.byte_depth,
                image.rgb,
                self.path.display(),
                self.layout.width,
                self.layout.height,
                self.layout.byte_depth,
                self.layout.rgb
            );
        }

        let pixels = pack_pixels(&self.layout, &image.pixels, &self.target.pool);
        let offset = self.write_entry(pixels, &metadata)?;

        // Offsets were checked against the 32-bit limit when encoding
        if let Some(previous) = self.index_map.insert(image.coords, offset as u32) {
            warn!(
                "Image {} written twice to {}, replacing entry at {}",
                image.coords,
                self.path.display(),
                previous
            );
        }
        Ok(AppendOutcome::Written { offset })
    }

    /// Append a blank entry standing in for an image that never arrived.
    ///
    /// Blank entries keep the directory chain continuous but are not indexed.
    pub fn append_blank(&mut self, coords: ImageCoords) -> Result<AppendOutcome, WriteError> {
        self.check_health()?;
        self.require_state("append a blank image", SessionState::Writing)?;
        self.wait_for_queue();

        if !self.has_space_for(BLANK_METADATA.len(), self.ome_reserve) {
            return Ok(AppendOutcome::FileFull);
        }

        debug!("Writing blank entry for {} in {}", coords, self.path.display());
        let pixels = WriteBuffer::Shared(blank_pixels(&self.layout));
        let offset = self.write_entry(pixels, BLANK_METADATA)?;
        Ok(AppendOutcome::Written { offset })
    }

    fn write_entry(&mut self, pixels: WriteBuffer, metadata: &str) -> Result<u64, WriteError> {
        let first = self.entries_written == 0;
        let encoded = encode_ifd(&self.layout, self.position, first, pixels, metadata)?;
        if first {
            self.first_sites = encoded.first_sites;
        }

        let offset = encoded.offset;
        self.scheduler.write(&self.target, offset, encoded.buffers)?;
        self.position += encoded.len;
        self.last_next_ifd_site = Some(encoded.next_ifd_site);
        self.entries_written += 1;
        Ok(offset)
    }

    /// Stall while the write queue is deeper than the configured threshold.
    fn wait_for_queue(&self) {
        if self.scheduler.mode() == SchedulerMode::Synchronous {
            return;
        }
        let threshold = self.config.backpressure_threshold;
        let mut stalled = false;
        while self.scheduler.pending() > threshold {
            if !stalled {
                warn!(
                    "Write queue holds {} tasks (threshold {}), waiting for the disk to catch up",
                    self.scheduler.pending(),
                    threshold
                );
                stalled = true;
            }
            std::thread::sleep(BACKPRESSURE_POLL);
        }
    }

    // -------------------------------------------------------------------------
    // Finalization
    // -------------------------------------------------------------------------

    /// Terminate the directory chain and write the index map.
    ///
    /// The file stays open and readable. May be called once; `close` calls it
    /// when it has not run.
    pub fn finish(&mut self) -> Result<(), WriteError> {
        self.check_health()?;
        self.require_state("finish", SessionState::Writing)?;
        self.state = SessionState::Finishing;

        match self.last_next_ifd_site {
            Some(site) => self.patches.record_u32(site, 0),
            None => warn!("Finishing {} without any images", self.path.display()),
        }

        let index_offset = self.position;
        self.patches
            .record_slot(INDEX_MAP_SLOT, INDEX_MAP_OFFSET_HEADER, index_offset)?;
        let block = self.index_map.encode(self.config.byte_order);
        self.position += block.len() as u64;
        self.scheduler
            .write(&self.target, index_offset, vec![block.into()])?;

        self.patches.resolve(&self.scheduler, &self.target)?;
        self.scheduler.flush()?;
        self.check_health()?;

        debug!(
            "Finished {}: {} entries, {} indexed",
            self.path.display(),
            self.entries_written,
            self.index_map.len()
        );
        Ok(())
    }

    /// Write the closing metadata and truncate the file to its used length.
    ///
    /// `ome_xml` is written into the first image description when OME output
    /// is enabled. Runs [`finish`](Self::finish) first if needed.
    ///
    /// Blocks larger than their reservation are dropped with a warning when
    /// they would push the file past its size ceiling: OME-XML first, then
    /// the comments (and the acquisition comment in the ImageJ info), then
    /// the display settings.
    pub fn close(&mut self, ome_xml: Option<&str>, display: &DisplayAndComments) -> Result<ClosedFile, WriteError> {
        self.check_health()?;
        match self.state {
            SessionState::Writing => self.finish()?,
            SessionState::Finishing => {}
            state => {
                return Err(WriteError::InvalidState {
                    operation: "close",
                    state,
                })
            }
        }

        let order = self.config.byte_order;
        let mut closing = ClosingBlocks {
            ome_xml: match ome_xml {
                Some(xml) if self.config.ome_tiff => Some(xml),
                Some(_) => {
                    debug!("OME output disabled, not writing OME-XML");
                    None
                }
                None => None,
            },
            settings: Some(encode_display_settings(order, &display.channels, self.summary.channels)?),
            comments: Some(encode_comments(order, &display.comments)?),
        };
        let description = ImageJDescription {
            channels: self.summary.channels,
            slices: self.summary.slices,
            frames: self.frames,
            slices_first: self.summary.slices_first,
            z_step_um: self.summary.z_step_um,
            first_channel: display.channels.first(),
        }
        .render();
        self.fit_closing_blocks(&mut closing, &description, display);

        match self.first_sites {
            Some(sites) => {
                let comment = closing.comments.as_ref().and(display.summary_comment());
                self.write_imagej_metadata(&sites, display, comment)?;
                if let Some(xml) = closing.ome_xml {
                    self.write_description(sites.ome_description, xml)?;
                }
                self.write_description(sites.imagej_description, &description)?;
            }
            None => warn!(
                "No images in {}, skipping ImageJ metadata and descriptions",
                self.path.display()
            ),
        }

        if let Some(settings) = closing.settings {
            self.write_block(DISPLAY_SETTINGS_SLOT, DISPLAY_SETTINGS_OFFSET_HEADER, settings)?;
        }
        if let Some(comments) = closing.comments {
            self.write_block(COMMENTS_SLOT, COMMENTS_OFFSET_HEADER, comments)?;
        }

        self.patches.resolve(&self.scheduler, &self.target)?;
        self.scheduler.set_len(&self.target, self.position)?;
        self.scheduler.flush()?;
        self.check_health()?;
        self.state = SessionState::Closed;

        info!(
            "Closed {}: {} images, {} bytes",
            self.path.display(),
            self.index_map.len(),
            self.position
        );
        Ok(ClosedFile {
            path: self.path.clone(),
            index_map: self.index_map.clone(),
            file: Arc::clone(&self.target.file),
        })
    }

    /// Final length of the file if `closing` were written as is.
    fn closing_len(&self, closing: &ClosingBlocks<'_>, description: &str, display: &DisplayAndComments) -> u64 {
        let mut len = self.position;
        if self.first_sites.is_some() {
            let comment = closing.comments.as_ref().and(display.summary_comment());
            let info = imagej_info(&self.summary.to_pretty_json(), comment);
            len += imagej_metadata_len(&info, self.summary.channels as usize);
            len += description.len() as u64;
            len += closing.ome_xml.map_or(0, |xml| xml.len() as u64);
        }
        len + closing.settings.as_ref().map_or(0, |b| b.len() as u64)
            + closing.comments.as_ref().map_or(0, |b| b.len() as u64)
    }

    fn fit_closing_blocks(&self, closing: &mut ClosingBlocks<'_>, description: &str, display: &DisplayAndComments) {
        let ceiling = self.config.max_file_size;
        if self.closing_len(closing, description, display) < ceiling {
            return;
        }
        if let Some(xml) = closing.ome_xml.take() {
            warn!(
                "OME-XML of {} bytes does not fit below {} bytes in {}, not writing it",
                xml.len(),
                ceiling,
                self.path.display()
            );
            if self.closing_len(closing, description, display) < ceiling {
                return;
            }
        }
        if let Some(comments) = closing.comments.take() {
            warn!(
                "Comments of {} bytes exceed their reservation in {}, not writing them",
                comments.len(),
                self.path.display()
            );
            if self.closing_len(closing, description, display) < ceiling {
                return;
            }
        }
        if let Some(settings) = closing.settings.take() {
            warn!(
                "Display settings of {} bytes exceed their reservation in {}, not writing them",
                settings.len(),
                self.path.display()
            );
        }
    }

    fn write_imagej_metadata(
        &mut self,
        sites: &FirstEntrySites,
        display: &DisplayAndComments,
        comment: Option<&str>,
    ) -> Result<(), WriteError> {
        let byte_depth = self.layout.byte_depth;
        let channels: Vec<_> = (0..self.summary.channels as usize)
            .map(|c| display.channel(c, byte_depth))
            .collect();
        let info = imagej_info(&self.summary.to_pretty_json(), comment);
        let metadata = encode_imagej_metadata(self.config.byte_order, &info, &channels);

        let counts_offset = self.position;
        let payload_offset = counts_offset + metadata.counts.len() as u64;
        self.patches
            .record_tag_value(sites.imagej_byte_counts, metadata.count_entries(), counts_offset)?;
        self.patches.record_tag_value(
            sites.imagej_metadata,
            metadata.payload.len() as u32,
            payload_offset,
        )?;

        self.position = payload_offset + metadata.payload.len() as u64;
        self.scheduler.write(
            &self.target,
            counts_offset,
            vec![metadata.counts.into(), metadata.payload.into()],
        )
    }

    fn write_description(&mut self, site: u64, text: &str) -> Result<(), WriteError> {
        let offset = self.position;
        self.patches
            .record_tag_value(site, text.len() as u32, offset)?;
        self.position += text.len() as u64;
        self.scheduler.write(
            &self.target,
            offset,
            vec![Bytes::copy_from_slice(text.as_bytes()).into()],
        )
    }

    fn write_block(&mut self, slot: u64, magic: u32, block: Bytes) -> Result<(), WriteError> {
        let offset = self.position;
        self.patches.record_slot(slot, magic, offset)?;
        self.position += block.len() as u64;
        self.scheduler.write(&self.target, offset, vec![block.into()])
    }

    // -------------------------------------------------------------------------
    // State Checks
    // -------------------------------------------------------------------------

    /// Surface a failed background write, moving the session to `Aborted`.
    fn check_health(&mut self) -> Result<(), WriteError> {
        if let Err(e) = self.target.health.check() {
            if self.state != SessionState::Aborted {
                error!("{} aborted: {}", self.path.display(), e);
                self.state = SessionState::Aborted;
            }
            return Err(e);
        }
        Ok(())
    }

    fn require_state(&self, operation: &'static str, expected: SessionState) -> Result<(), WriteError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(WriteError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }
}

impl Drop for FileSession {
    fn drop(&mut self) {
        if matches!(self.state, SessionState::Writing | SessionState::Finishing) {
            warn!("{} dropped before it was closed", self.path.display());
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
