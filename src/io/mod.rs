mod pool;
mod positioned;
mod scheduler;

pub use pool::{BufferPool, MAX_POOLED_BUFFERS};
pub use positioned::{read_exact_at, write_all_at};
pub use scheduler::{
    SchedulerMode, SessionHealth, WriteBuffer, WriteScheduler, WriteTarget, WriteTask,
    QUEUE_CAPACITY,
};
