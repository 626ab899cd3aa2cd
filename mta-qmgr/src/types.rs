//! The four scheduling entity kinds (spec §4.5.2-§4.5.4): `Transport`,
//! `Queue`, `Job` and `Entry`. `Peer` (spec's "the subset of the Queue's
//! `todo` belonging to this Peer") is folded into `Queue` here: the
//! distilled spec never gives Peer fields independent from its owning
//! Queue, so a separate arena for it would have nothing of its own to
//! hold. See `DESIGN.md`.

use std::{collections::VecDeque, time::Duration};

use mta_types::QueueId;

use crate::arena::Handle;

/// One named-hop Transport (spec §4.5.2): owns the recipient-slot limit new
/// Jobs are granted and the monotonically increasing blocker tag (spec
/// §4.5.3), always odd, incremented by two.
pub struct Transport {
    pub name: String,
    pub recipient_limit: u32,
    pub window: usize,
    pub blocker_tag: u64,
    pub queues: Vec<Handle<Queue>>,
    pub job_list: Vec<Handle<Job>>,
    pub candidate_cursor: usize,
}

impl Transport {
    pub fn new(name: impl Into<String>, recipient_limit: u32, window: usize) -> Transport {
        Transport {
            name: name.into(),
            recipient_limit,
            window,
            blocker_tag: 1,
            queues: Vec::new(),
            job_list: Vec::new(),
            candidate_cursor: 0,
        }
    }

    /// Advances the blocker tag (kept odd) and resets the candidate cursor,
    /// per spec §4.5.3: "on any `entry_done` that restores slack... the
    /// Transport's `blocker_tag` advances, the candidate cursor resets to
    /// the head of the job list".
    pub fn advance_blocker_tag(&mut self) {
        self.blocker_tag = self.blocker_tag.wrapping_add(2);
        self.candidate_cursor = 0;
    }
}

/// A destination reached via one Transport, keyed by next-hop identifier
/// (spec §4.5.2). Dead-site state lives here (spec §4.5.4).
pub struct Queue {
    pub transport: Handle<Transport>,
    pub nexthop: String,
    pub todo: VecDeque<Handle<Entry>>,
    pub busy: Vec<Handle<Entry>>,
    pub busy_refcount: usize,
    pub todo_refcount: usize,
    pub window: usize,
    /// Set when this Queue hit `busy_refcount == window`; compared against
    /// the Transport's current `blocker_tag` to decide whether the stamp is
    /// still valid (spec §4.5.3).
    pub blocker_tag: Option<u64>,
    pub dead: bool,
    pub consecutive_failures: u32,
    pub dead_delay: Duration,
    pub dead_until: Option<std::time::Instant>,
}

/// Minimum and maximum backoff for a dead Queue's retry timer (spec
/// §4.5.4: "armed (`min_delay`, doubling up to `max_delay`)").
pub const DEAD_MIN_DELAY: Duration = Duration::from_secs(60);
pub const DEAD_MAX_DELAY: Duration = Duration::from_secs(4 * 3600);
/// Consecutive-failure threshold past which a Queue is declared dead.
pub const DEAD_FAILURE_THRESHOLD: u32 = 3;

impl Queue {
    pub fn new(transport: Handle<Transport>, nexthop: impl Into<String>, window: usize) -> Queue {
        Queue {
            transport,
            nexthop: nexthop.into(),
            todo: VecDeque::new(),
            busy: Vec::new(),
            busy_refcount: 0,
            todo_refcount: 0,
            window,
            blocker_tag: None,
            dead: false,
            consecutive_failures: 0,
            dead_delay: DEAD_MIN_DELAY,
            dead_until: None,
        }
    }

    /// Whether this Queue's dead-timer has expired and it should be
    /// reconsidered as a delivery candidate (spec §4.5.4).
    pub fn dead_timer_expired(&self, now: std::time::Instant) -> bool {
        match self.dead_until {
            Some(deadline) => now >= deadline,
            None => true,
        }
    }

    /// Arms (or re-arms, doubling) the dead-site retry timer.
    pub fn mark_dead(&mut self, now: std::time::Instant) {
        self.dead = true;
        self.window = 0;
        self.dead_until = Some(now + self.dead_delay);
        self.dead_delay = std::cmp::min(self.dead_delay * 2, DEAD_MAX_DELAY);
    }

    pub fn revive(&mut self, original_window: usize) {
        self.dead = false;
        self.consecutive_failures = 0;
        self.dead_delay = DEAD_MIN_DELAY;
        self.dead_until = None;
        self.window = original_window;
    }
}

/// A message's scheduling state for one Transport (spec §4.5.2, §4.5.5's
/// "recipient-slot rebalance"). Multiple Jobs for the same message (one per
/// Transport it routes recipients to) are linked via
/// [`crate::Scheduler`]'s `message_jobs` map, which is what the rebalance
/// walk in §4.5.5 traverses.
pub struct Job {
    pub message: QueueId,
    pub transport: Handle<Transport>,
    pub rcpt_limit: u32,
    pub rcpt_count: u32,
    /// Byte offset of the next unread recipient record in the queue file;
    /// zero once every recipient has been read into some Entry (spec
    /// §4.5.5: "no more unread recipients on disk (`rcpt_offset == 0`)").
    pub rcpt_offset: u64,
    pub selected_entries: u32,
    /// Negative once the Job is retired (all its recipients dispatched and
    /// it is no longer admitting new ones); spec §9's "sponsor job...
    /// `stack_level < 0` (retired)".
    pub stack_level: i32,
}

impl Job {
    pub fn new(message: QueueId, transport: Handle<Transport>, rcpt_limit: u32) -> Job {
        Job {
            message,
            transport,
            rcpt_limit,
            rcpt_count: 0,
            rcpt_offset: 0,
            selected_entries: 0,
            stack_level: 0,
        }
    }

    pub fn is_retired(&self) -> bool {
        self.stack_level < 0
    }

    pub fn has_slack(&self) -> bool {
        self.rcpt_count < self.rcpt_limit
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryState {
    Todo,
    Busy,
}

/// Up to `recipient_limit` recipients of one message, routed to one Queue
/// (spec §4.5.2).
pub struct Entry {
    pub job: Handle<Job>,
    pub queue: Handle<Queue>,
    pub recipients: Vec<RecipientSlot>,
    pub state: EntryState,
}

#[derive(Clone, Debug)]
pub struct RecipientSlot {
    pub address: String,
    /// Byte offset of this recipient's `Rcpt` record in the queue file, so
    /// completion can tombstone it in place.
    pub offset: u64,
}
