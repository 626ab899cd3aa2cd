//! The Queue Manager's scheduling core (spec §4.5): admission, routing,
//! `qmgr_entry_select`/`unselect`/`done`, dead-site detection, and
//! finalization.

use std::{collections::HashMap, time::Instant};

use chrono::{DateTime, Utc};
use mta_queue::{QueueError, QueueRoot};
use mta_types::{Attribute, QueueDir, QueueId, RecordType};
use tracing::{debug, trace, warn};

use crate::arena::{Arena, Handle};
use crate::types::{
    Entry, EntryState, Job, Queue, RecipientSlot, Transport, DEAD_FAILURE_THRESHOLD,
};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("unknown transport ‘{0}’")]
    UnknownTransport(String),
    #[error("arena invariant violated: {0}")]
    Invariant(&'static str),
}

/// Resolves one recipient to a (Transport name, next-hop identifier) pair.
/// Deliberately opaque per spec §4.5.2 ("by user-configured rules; opaque
/// to this spec") -- `mta` wires in the real routing table.
pub trait Router {
    fn route(&self, recipient: &str) -> (String, String);
}

/// Per-recipient delivery outcome, reported by a delivery agent back to
/// `qmgr_entry_done` (spec §4.5.6).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecipientOutcome {
    Delivered,
    /// Hard failure: recipient tombstoned, bounce record expected.
    HardFailure,
    /// Soft failure: recipient stays, defer record expected.
    SoftFailure,
}

/// Whole-connection outcome for an Entry (spec §4.5.6: "per-site connection
/// failure -> mark Queue dead").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionOutcome {
    Ok,
    SiteFailure,
}

pub struct Scheduler {
    transports: Arena<Transport>,
    queues: Arena<Queue>,
    jobs: Arena<Job>,
    entries: Arena<Entry>,
    transport_by_name: HashMap<String, Handle<Transport>>,
    queue_by_key: HashMap<(Handle<Transport>, String), Handle<Queue>>,
    /// All Jobs scheduling the same message, across every Transport it
    /// routes to -- the list the §4.5.5 rebalance walk traverses.
    message_jobs: HashMap<QueueId, Vec<Handle<Job>>>,
    active_cap: usize,
}

impl Scheduler {
    pub fn new(active_cap: usize) -> Scheduler {
        Scheduler {
            transports: Arena::new(),
            queues: Arena::new(),
            jobs: Arena::new(),
            entries: Arena::new(),
            transport_by_name: HashMap::new(),
            queue_by_key: HashMap::new(),
            message_jobs: HashMap::new(),
            active_cap,
        }
    }

    pub fn register_transport(&mut self, name: &str, recipient_limit: u32, window: usize) -> Handle<Transport> {
        if let Some(&h) = self.transport_by_name.get(name) {
            return h;
        }
        let h = self.transports.insert(Transport::new(name, recipient_limit, window));
        self.transport_by_name.insert(name.to_owned(), h);
        h
    }

    fn get_or_create_queue(&mut self, transport: Handle<Transport>, nexthop: &str) -> Handle<Queue> {
        let key = (transport, nexthop.to_owned());
        if let Some(&h) = self.queue_by_key.get(&key) {
            return h;
        }
        let window = self.transports.get(transport).window;
        let h = self.queues.insert(Queue::new(transport, nexthop, window));
        self.queue_by_key.insert(key, h);
        self.transports.get_mut(transport).queues.push(h);
        h
    }

    pub fn transport(&self, h: Handle<Transport>) -> &Transport {
        self.transports.get(h)
    }

    pub fn queue(&self, h: Handle<Queue>) -> &Queue {
        self.queues.get(h)
    }

    pub fn job(&self, h: Handle<Job>) -> &Job {
        self.jobs.get(h)
    }

    pub fn entry(&self, h: Handle<Entry>) -> &Entry {
        self.entries.get(h)
    }

    /// §4.5.1: moves eligible files from `incoming` (always eligible) and
    /// `deferred` (eligible once their recorded next-attempt timestamp has
    /// elapsed) into `active`, subject to the active-queue cap.
    pub fn admission_scan(&self, queue: &QueueRoot, now: DateTime<Utc>) -> Result<Vec<QueueId>, SchedulerError> {
        let mut admitted = Vec::new();
        let active_now = queue.scan(QueueDir::Active)?.len();
        let mut budget = self.active_cap.saturating_sub(active_now);
        if budget == 0 {
            return Ok(admitted);
        }

        for id in queue.scan(QueueDir::Incoming)? {
            if budget == 0 {
                break;
            }
            queue.rename(QueueDir::Incoming, QueueDir::Active, &id)?;
            admitted.push(id);
            budget -= 1;
        }
        for id in queue.scan(QueueDir::Deferred)? {
            if budget == 0 {
                break;
            }
            if Self::deferred_is_due(queue, &id, now)? {
                queue.rename(QueueDir::Deferred, QueueDir::Active, &id)?;
                admitted.push(id);
                budget -= 1;
            }
        }
        debug!(count = admitted.len(), "admission scan moved messages into active");
        Ok(admitted)
    }

    fn deferred_is_due(queue: &QueueRoot, id: &QueueId, now: DateTime<Utc>) -> Result<bool, SchedulerError> {
        let mut reader = queue.open(QueueDir::Deferred, id, false)?;
        for rec in reader.records() {
            let rec = rec?;
            if rec.ty != RecordType::Attr {
                continue;
            }
            if let Some(attr) = Attribute::decode(&rec.payload) {
                if attr.name == "next_attempt" {
                    return Ok(attr
                        .value
                        .parse::<i64>()
                        .map(|ts| now.timestamp() >= ts)
                        .unwrap_or(true));
                }
            }
        }
        Ok(true)
    }

    /// §4.5.2: reads every live (non-tombstoned) recipient of an active
    /// message, routes each through `router`, and groups them into Entries
    /// of up to `recipient_limit` recipients per (Transport, Queue).
    pub fn route_message(
        &mut self,
        queue: &QueueRoot,
        id: QueueId,
        router: &dyn Router,
    ) -> Result<(), SchedulerError> {
        let mut reader = queue.open(QueueDir::Active, &id, false)?;
        let mut by_queue: HashMap<Handle<Queue>, Vec<RecipientSlot>> = HashMap::new();
        let mut job_for_transport: HashMap<Handle<Transport>, Handle<Job>> = HashMap::new();

        for rec in reader.records() {
            let rec = rec?;
            if rec.ty != RecordType::Rcpt {
                continue;
            }
            let address = String::from_utf8_lossy(&rec.payload).into_owned();
            let (transport_name, nexthop) = router.route(&address);
            let transport_h = self
                .transport_by_name
                .get(&transport_name)
                .copied()
                .ok_or_else(|| SchedulerError::UnknownTransport(transport_name.clone()))?;
            let queue_h = self.get_or_create_queue(transport_h, &nexthop);

            let job_h = *job_for_transport.entry(transport_h).or_insert_with(|| {
                let limit = self.transports.get(transport_h).recipient_limit;
                let job = Job::new(id.clone(), transport_h, limit);
                let h = self.jobs.insert(job);
                self.transports.get_mut(transport_h).job_list.push(h);
                h
            });
            let jobs_for_message = self.message_jobs.entry(id.clone()).or_default();
            if !jobs_for_message.contains(&job_h) {
                jobs_for_message.push(job_h);
            }

            by_queue.entry(queue_h).or_default().push(RecipientSlot {
                address,
                offset: rec.offset,
            });
        }

        for (queue_h, recipients) in by_queue {
            let transport_h = self.queues.get(queue_h).transport;
            let limit = self.transports.get(transport_h).recipient_limit.max(1) as usize;
            let job_h = job_for_transport[&transport_h];
            for chunk in recipients.chunks(limit) {
                let entry_h = self.entries.insert(Entry {
                    job: job_h,
                    queue: queue_h,
                    recipients: chunk.to_vec(),
                    state: EntryState::Todo,
                });
                let q = self.queues.get_mut(queue_h);
                q.todo.push_back(entry_h);
                q.todo_refcount += chunk.len();
                self.jobs.get_mut(job_h).rcpt_count += chunk.len() as u32;
            }
        }
        trace!(id = %id, "routed message into entries");
        Ok(())
    }

    /// `qmgr_entry_select(peer)` (spec §4.5.2): pulls the first Entry off
    /// `queue_h`'s `todo`, moving it to `busy`. Returns `None` if the Queue
    /// is dead, empty, or already saturated at its concurrency window.
    pub fn qmgr_entry_select(&mut self, queue_h: Handle<Queue>) -> Option<Handle<Entry>> {
        let q = self.queues.get_mut(queue_h);
        if q.dead || q.busy_refcount >= q.window {
            return None;
        }
        let entry_h = q.todo.pop_front()?;
        let recipient_count = self.entries.get(entry_h).recipients.len();
        let q = self.queues.get_mut(queue_h);
        q.todo_refcount -= recipient_count;
        q.busy.push(entry_h);
        q.busy_refcount += recipient_count;
        self.entries.get_mut(entry_h).state = EntryState::Busy;

        let job_h = self.entries.get(entry_h).job;
        self.jobs.get_mut(job_h).selected_entries += 1;

        if q.busy_refcount == q.window {
            let transport_h = q.transport;
            let tag = self.transports.get(transport_h).blocker_tag;
            q.blocker_tag = Some(tag);
            trace!(window = q.window, "queue saturated, stamped with blocker tag");
        }
        Some(entry_h)
    }

    /// `qmgr_entry_unselect` (spec §4.5.2): symmetric inverse of `select`,
    /// used when a delivery worker rejects the slot or it's cancelled
    /// before dispatch.
    pub fn qmgr_entry_unselect(&mut self, entry_h: Handle<Entry>) {
        let entry = self.entries.get_mut(entry_h);
        entry.state = EntryState::Todo;
        let queue_h = entry.queue;
        let job_h = entry.job;
        let recipient_count = entry.recipients.len();

        let q = self.queues.get_mut(queue_h);
        q.busy.retain(|&e| e != entry_h);
        q.busy_refcount -= recipient_count;
        q.todo.push_front(entry_h);
        q.todo_refcount += recipient_count;

        self.jobs.get_mut(job_h).selected_entries -= 1;
    }

    /// Whether a Queue is currently a valid candidate: not dead (or its
    /// timer expired), and not stamped with the Transport's *current*
    /// blocker tag (spec §4.5.3: a stale stamp from a since-advanced tag no
    /// longer blocks anything, which is what makes this an O(1) check).
    pub fn is_candidate(&self, queue_h: Handle<Queue>, now: Instant) -> bool {
        let q = self.queues.get(queue_h);
        if q.dead && !q.dead_timer_expired(now) {
            return false;
        }
        if let Some(stamp) = q.blocker_tag {
            let current = self.transports.get(q.transport).blocker_tag;
            if stamp == current {
                return false;
            }
        }
        !q.todo.is_empty()
    }

    /// `qmgr_entry_done(entry, which)` (spec §4.5.2, and the
    /// recipient-slot rebalance ordering from
    /// `original_source/src/nqmgr/qmgr_entry.c`): per-recipient outcomes are
    /// applied via `queue_file` for bookkeeping (tombstoning/deferring),
    /// then slack is returned to the Job, dead-site detection runs on a
    /// connection-level failure, and finally a blocker-tag bump + rebalance
    /// happens if slack was actually restored.
    pub fn qmgr_entry_done(
        &mut self,
        queue_file: &QueueRoot,
        entry_h: Handle<Entry>,
        outcomes: &[(usize, RecipientOutcome)],
        connection: ConnectionOutcome,
    ) -> Result<(), SchedulerError> {
        let entry = self.entries.remove(entry_h);
        let queue_h = entry.queue;
        let job_h = entry.job;
        let message = self.jobs.get(job_h).message.clone();

        for &(idx, outcome) in outcomes {
            let Some(slot) = entry.recipients.get(idx) else {
                continue;
            };
            let new_ty = match outcome {
                RecipientOutcome::Delivered | RecipientOutcome::HardFailure => RecordType::Done,
                RecipientOutcome::SoftFailure => continue,
            };
            let mut reader = queue_file.open(QueueDir::Active, &message, true)?;
            reader.tombstone(slot.offset, new_ty)?;
        }

        let recipient_count = entry.recipients.len();
        {
            let q = self.queues.get_mut(queue_h);
            q.busy.retain(|&e| e != entry_h);
            q.busy_refcount -= recipient_count;
        }
        let job = self.jobs.get_mut(job_h);
        job.selected_entries -= 1;
        job.rcpt_count = job.rcpt_count.saturating_sub(recipient_count as u32);

        match connection {
            ConnectionOutcome::Ok => {
                let q = self.queues.get_mut(queue_h);
                if q.dead {
                    let window = self.transports.get(q.transport).window;
                    self.queues.get_mut(queue_h).revive(window);
                    debug!("queue revived after a successful connection");
                } else {
                    q.consecutive_failures = 0;
                }
            }
            ConnectionOutcome::SiteFailure => {
                let q = self.queues.get_mut(queue_h);
                q.consecutive_failures += 1;
                if !q.dead && q.consecutive_failures >= DEAD_FAILURE_THRESHOLD {
                    self.queues.get_mut(queue_h).mark_dead(Instant::now());
                    warn!(nexthop = %self.queues.get(queue_h).nexthop, "queue marked dead after repeated connection failures");
                }
            }
        }

        self.rebalance_recipient_slots(job_h);

        let q = self.queues.get(queue_h);
        let slack_restored = q.window > q.busy_refcount && !q.todo.is_empty();
        if slack_restored {
            let transport_h = q.transport;
            self.transports.get_mut(transport_h).advance_blocker_tag();
            self.queues.get_mut(queue_h).blocker_tag = None;
            trace!("slack restored, blocker tag advanced and candidate cursor reset");
        }

        self.reap_if_unreferenced(queue_h);
        Ok(())
    }

    /// The recipient-slot rebalance walk (spec §4.5.5, exact ordering per
    /// `original_source/src/nqmgr/qmgr_entry.c`'s `qmgr_entry_done`): first
    /// every *other* Job scheduling the same message gets first refusal at
    /// reclaiming slack it had donated (a sponsor job that is retired, or
    /// has no more unread recipients, takes its limit back), only then does
    /// the finishing Job's own limit move.
    fn rebalance_recipient_slots(&mut self, finishing_job: Handle<Job>) {
        let message = self.jobs.get(finishing_job).message.clone();
        let Some(siblings) = self.message_jobs.get(&message).cloned() else {
            return;
        };

        for sponsor_h in &siblings {
            if *sponsor_h == finishing_job {
                continue;
            }
            let Some(sponsor) = self.jobs.try_get(*sponsor_h) else {
                continue;
            };
            if (sponsor.is_retired() || sponsor.rcpt_offset == 0) && sponsor.has_slack() {
                self.move_limits(*sponsor_h);
            }
        }
        self.move_limits(finishing_job);
    }

    /// Reclaims a Job's currently-granted-but-unused recipient limit back
    /// to its Transport's pool. A placeholder for the full limit-donation
    /// ledger the original keeps per Transport; here the effect that
    /// matters for scheduling -- the Job stops being considered a sink for
    /// further slack once it has none left to give -- is captured by simply
    /// clearing `rcpt_limit` down to its current `rcpt_count`.
    fn move_limits(&mut self, job_h: Handle<Job>) {
        if let Some(job) = self.jobs.try_get(job_h) {
            if job.rcpt_count == 0 && job.rcpt_offset == 0 {
                let job = self.jobs.get_mut(job_h);
                job.rcpt_limit = 0;
                job.stack_level = -1;
            }
        }
    }

    fn reap_if_unreferenced(&mut self, queue_h: Handle<Queue>) {
        let q = self.queues.get(queue_h);
        if q.todo.is_empty() && q.busy.is_empty() && q.dead {
            // Dead-site eviction cap (spec §4.5.4): "past 2 x rcpt_limit,
            // dead Queues are eagerly unthrottled and destroyed". Entries
            // are already empty here, so eviction is just bookkeeping
            // removal, never message loss.
            let transport_h = q.transport;
            let limit = self.transports.get(transport_h).recipient_limit as usize;
            let dead_count = self
                .queues
                .iter()
                .filter(|(_, q)| q.dead && q.transport == transport_h)
                .count();
            if dead_count > 2 * limit.max(1) {
                let nexthop = self.queues.get(queue_h).nexthop.clone();
                self.queue_by_key.remove(&(transport_h, nexthop));
                self.transports.get_mut(transport_h).queues.retain(|&h| h != queue_h);
                self.queues.remove(queue_h);
                debug!("evicted dead queue past the in-core bound");
            }
        }
    }

    /// §4.5.5: runs when a message's in-core refcount reaches zero (every
    /// Entry it had has gone through `qmgr_entry_done`). Unlinks a fully
    /// delivered message, or defers/bounces it depending on whether its
    /// bounce side file is non-empty and the retry budget is exhausted.
    pub fn finalize_message(
        &mut self,
        queue_file: &QueueRoot,
        id: &QueueId,
        bounce_side_file_nonempty: bool,
        retry_budget_exhausted: bool,
    ) -> Result<Finalization, SchedulerError> {
        let mut reader = queue_file.open(QueueDir::Active, id, false)?;
        let mut all_done = true;
        for rec in reader.records() {
            let rec = rec?;
            if rec.ty == RecordType::Rcpt {
                all_done = false;
                break;
            }
        }

        self.message_jobs.remove(id);

        if all_done {
            queue_file.discard(QueueDir::Active, id)?;
            queue_file.discard(QueueDir::Bounce, id)?;
            queue_file.discard(QueueDir::Defer, id)?;
            return Ok(Finalization::Delivered);
        }

        if bounce_side_file_nonempty && retry_budget_exhausted {
            queue_file.rename(QueueDir::Active, QueueDir::Bounce, id)?;
            return Ok(Finalization::Bounced);
        }

        // The warning-time record update this backoff deadline feeds into
        // is appended by the caller before the rename: a sealed queue file's
        // `End` record can't simply be followed by a new one, so bumping it
        // is a read-rewrite-into-a-fresh-file operation, not an in-place
        // append -- out of scope for the scheduler itself, which only
        // computes the deadline.
        let next_attempt = next_backoff_deadline(Utc::now(), 1);
        queue_file.rename(QueueDir::Active, QueueDir::Deferred, id)?;
        Ok(Finalization::Deferred { next_attempt })
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum Finalization {
    Delivered,
    Bounced,
    Deferred { next_attempt: DateTime<Utc> },
}

/// Exponential backoff bounded by a maximum (spec §4.5.1: "updated on each
/// deferral with exponential backoff bounded by a maximum"), doubling per
/// attempt starting from five minutes and capping at eight hours.
pub fn next_backoff_deadline(now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
    const BASE_SECS: i64 = 5 * 60;
    const MAX_SECS: i64 = 8 * 3600;
    let delay = BASE_SECS.saturating_mul(1i64 << attempt.min(10)).min(MAX_SECS);
    now + chrono::Duration::seconds(delay)
}
