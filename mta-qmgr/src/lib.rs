//! The Queue Manager (spec §4.5): single-process, single-threaded
//! destination scheduler. Concurrency across delivery attempts is achieved
//! by handing Entries off to delivery agent processes spawned through the
//! Supervisor, not by threading within this crate.

pub mod arena;
pub mod scheduler;
pub mod types;

pub use arena::Handle;
pub use scheduler::{
    next_backoff_deadline, ConnectionOutcome, Finalization, RecipientOutcome, Router, Scheduler,
    SchedulerError,
};
pub use types::{
    Entry, EntryState, Job, Queue, RecipientSlot, Transport, DEAD_FAILURE_THRESHOLD, DEAD_MAX_DELAY,
    DEAD_MIN_DELAY,
};
