//! Write scheduler for positioned file writes.
//!
//! Structural bookkeeping (offsets, index map, patch sites) is computed on the
//! producer thread ahead of time; the scheduler only moves finished byte
//! buffers to disk. Two modes are available:
//!
//! - **Synchronous**: every task runs inline on the calling thread
//! - **Asynchronous**: one dedicated worker thread drains a bounded FIFO queue
//!
//! In both modes tasks execute in strict submission order, so the byte ranges
//! of one session always reach the file in the order they were laid out.
//!
//! # Failure Policy
//!
//! A failed write is logged and recorded on the owning session's
//! [`SessionHealth`]; the worker keeps draining later tasks so other sessions
//! sharing it are unaffected. The session reports the failure on its next call.

use std::fs::File;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use super::pool::BufferPool;
use super::positioned::write_all_at;
use crate::error::WriteError;

/// Maximum number of queued tasks before `submit` blocks.
pub const QUEUE_CAPACITY: usize = 256;

static GLOBAL_SCHEDULER: Mutex<Option<Arc<WriteScheduler>>> = Mutex::new(None);

// =============================================================================
// Write Targets
// =============================================================================

/// Failure flag shared between a session and the worker writing for it.
#[derive(Debug, Default)]
pub struct SessionHealth {
    failure: OnceLock<String>,
}

impl SessionHealth {
    /// Record a failure. Only the first one is kept.
    pub fn fail(&self, message: String) {
        let _ = self.failure.set(message);
    }

    /// Whether a write for this session has failed.
    pub fn is_failed(&self) -> bool {
        self.failure.get().is_some()
    }

    /// Return the recorded failure as an error.
    pub fn check(&self) -> Result<(), WriteError> {
        match self.failure.get() {
            Some(message) => Err(WriteError::AsyncWriteFailed(message.clone())),
            None => Ok(()),
        }
    }
}

/// Everything the worker needs to write on behalf of one session.
#[derive(Debug)]
pub struct WriteTarget {
    pub file: Arc<File>,
    pub pool: Arc<BufferPool>,
    pub health: Arc<SessionHealth>,
    /// File name used in log messages
    pub name: String,
}

/// A buffer handed to the scheduler.
#[derive(Debug)]
pub enum WriteBuffer {
    /// Shared or freshly built bytes, dropped after the write
    Shared(Bytes),
    /// Buffer checked out of the session's pool, returned after the write
    Pooled(Vec<u8>),
}

impl WriteBuffer {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            WriteBuffer::Shared(bytes) => bytes,
            WriteBuffer::Pooled(buf) => buf,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Bytes> for WriteBuffer {
    fn from(value: Bytes) -> Self {
        WriteBuffer::Shared(value)
    }
}

/// A unit of work for the scheduler.
#[derive(Debug)]
pub enum WriteTask {
    /// Write the buffers back to back starting at `position`
    Write {
        target: Arc<WriteTarget>,
        position: u64,
        buffers: Vec<WriteBuffer>,
    },
    /// Set the file length
    SetLen { target: Arc<WriteTarget>, len: u64 },
    /// Signal once every earlier task has run
    Flush(oneshot::Sender<()>),
}

// =============================================================================
// Write Scheduler
// =============================================================================

/// How write tasks are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerMode {
    /// Run each task inline on the submitting thread
    Synchronous,
    /// Queue tasks for a single background worker
    #[default]
    Asynchronous,
}

/// Executes write tasks in FIFO order, inline or on a worker thread.
pub struct WriteScheduler {
    mode: SchedulerMode,
    sender: Option<mpsc::Sender<WriteTask>>,
    pending: Arc<AtomicUsize>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for WriteScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteScheduler")
            .field("mode", &self.mode)
            .field("pending", &self.pending())
            .finish()
    }
}

impl WriteScheduler {
    /// Create a scheduler. Asynchronous mode spawns its worker thread.
    ///
    /// Asynchronous submission blocks the caller when the queue is full and
    /// must therefore not be used from inside an async runtime.
    pub fn new(mode: SchedulerMode) -> Result<Self, WriteError> {
        let pending = Arc::new(AtomicUsize::new(0));

        let (sender, worker) = match mode {
            SchedulerMode::Synchronous => (None, None),
            SchedulerMode::Asynchronous => {
                let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
                let worker_pending = Arc::clone(&pending);
                let handle = std::thread::Builder::new()
                    .name("mptiff-writer".to_string())
                    .spawn(move || run_worker(rx, worker_pending))?;
                (Some(tx), Some(handle))
            }
        };

        Ok(Self {
            mode,
            sender,
            pending,
            worker,
        })
    }

    /// The process-wide scheduler shared by all sessions.
    ///
    /// The mode is fixed by the first call; later calls requesting a
    /// different mode get the existing scheduler and a warning.
    pub fn global(mode: SchedulerMode) -> Result<Arc<Self>, WriteError> {
        let mut slot = GLOBAL_SCHEDULER
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(existing) = slot.as_ref() {
            if existing.mode != mode {
                warn!(
                    "Write scheduler already running in {:?} mode, ignoring request for {:?}",
                    existing.mode, mode
                );
            }
            return Ok(Arc::clone(existing));
        }

        let scheduler = Arc::new(Self::new(mode)?);
        *slot = Some(Arc::clone(&scheduler));
        Ok(scheduler)
    }

    /// The execution mode.
    #[inline]
    pub fn mode(&self) -> SchedulerMode {
        self.mode
    }

    /// Number of submitted tasks that have not finished executing.
    #[inline]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Submit a task for execution.
    pub fn submit(&self, task: WriteTask) -> Result<(), WriteError> {
        match &self.sender {
            None => {
                execute(task);
                Ok(())
            }
            Some(sender) => {
                self.pending.fetch_add(1, Ordering::AcqRel);
                sender.blocking_send(task).map_err(|_| {
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    WriteError::SchedulerClosed
                })
            }
        }
    }

    /// Submit buffers to be written back to back at `position`.
    pub fn write(
        &self,
        target: &Arc<WriteTarget>,
        position: u64,
        buffers: Vec<WriteBuffer>,
    ) -> Result<(), WriteError> {
        self.submit(WriteTask::Write {
            target: Arc::clone(target),
            position,
            buffers,
        })
    }

    /// Submit a file length change.
    pub fn set_len(&self, target: &Arc<WriteTarget>, len: u64) -> Result<(), WriteError> {
        self.submit(WriteTask::SetLen {
            target: Arc::clone(target),
            len,
        })
    }

    /// Block until every task submitted so far has executed.
    pub fn flush(&self) -> Result<(), WriteError> {
        if self.sender.is_none() {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.submit(WriteTask::Flush(tx))?;
        rx.blocking_recv().map_err(|_| WriteError::SchedulerClosed)
    }
}

impl Drop for WriteScheduler {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what is queued and exit
        self.sender.take();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("Write worker panicked");
            }
        }
    }
}

fn run_worker(mut rx: mpsc::Receiver<WriteTask>, pending: Arc<AtomicUsize>) {
    debug!("Write worker started");
    while let Some(task) = rx.blocking_recv() {
        match task {
            // Counted out before signalling, so a returning flush sees an empty queue
            WriteTask::Flush(done) => {
                pending.fetch_sub(1, Ordering::AcqRel);
                let _ = done.send(());
            }
            task => {
                execute(task);
                pending.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
    debug!("Write worker stopped");
}

fn execute(task: WriteTask) {
    match task {
        WriteTask::Write {
            target,
            position,
            buffers,
        } => {
            let mut offset = position;
            let mut result = Ok(());
            for buffer in &buffers {
                if result.is_ok() {
                    result = write_all_at(&target.file, buffer.as_slice(), offset);
                }
                offset += buffer.len() as u64;
            }
            if let Err(e) = result {
                error!(
                    "Write of {} bytes at offset {} in {} failed: {}",
                    offset - position,
                    position,
                    target.name,
                    e
                );
                target
                    .health
                    .fail(format!("write at offset {} failed: {}", position, e));
            }
            for buffer in buffers {
                if let WriteBuffer::Pooled(buf) = buffer {
                    target.pool.checkin(buf);
                }
            }
        }
        WriteTask::SetLen { target, len } => {
            if let Err(e) = target.file.set_len(len) {
                error!("Setting length of {} to {} failed: {}", target.name, len, e);
                target
                    .health
                    .fail(format!("set length to {} failed: {}", len, e));
            }
        }
        WriteTask::Flush(done) => {
            let _ = done.send(());
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
