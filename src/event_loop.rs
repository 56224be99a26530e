//! Poll-based cooperative event loop with timer and I/O sources.
//!
//! One iteration runs prepare / wait / writeback / dispatch / commit. A
//! source's `dispatch` receives `&mut Loop` and may pump nested iterations;
//! the source is taken out of its slot for the duration of the call, and
//! set mutations requested while any iteration is on the stack are deferred
//! until the outermost iteration commits.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

use nix::poll::{PollFd, PollFlags, poll};
use tracing::warn;

use crate::error::BoxError;
use crate::sockets::poll_timeout;

/// One pollable descriptor a source wants watched this iteration.
pub struct Interest<'a> {
    pub fd: BorrowedFd<'a>,
    pub events: PollFlags,
}

/// A unit of work owned by the [`Loop`].
pub trait Source {
    /// Report the next wanted wake-up measured from `now`; `None` means the
    /// source only reacts to descriptor events.
    fn prepare(&mut self, now: Instant) -> Option<Duration>;

    /// Descriptors to include in this iteration's poll.
    fn interests(&self) -> Vec<Interest<'_>> {
        Vec::new()
    }

    /// Receive the poll result for descriptor `index` of [`Source::interests`].
    fn writeback(&mut self, index: usize, revents: PollFlags) {
        let _ = (index, revents);
    }

    /// Decide whether [`Source::dispatch`] should run this iteration.
    fn check(&mut self, now: Instant) -> bool;

    /// Do work. `Ok(false)` removes the source; an error removes it too and
    /// is surfaced through the log.
    fn dispatch(&mut self, event_loop: &mut Loop) -> Result<bool, BoxError>;
}

/// Handle for removing a source from anywhere, including inside dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

struct Slot {
    id: SourceId,
    // None while the source is out for dispatch or already finished
    source: Option<Box<dyn Source>>,
}

#[derive(Default)]
pub struct Loop {
    slots: Vec<Slot>,
    pending_add: Vec<(SourceId, Box<dyn Source>)>,
    pending_remove: Vec<SourceId>,
    next_id: u64,
    depth: u32,
    running: bool,
}

impl Loop {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    /// Hand a source to the loop. Deferred until commit when called while
    /// an iteration is on the stack.
    pub fn connect(&mut self, source: impl Source + 'static) -> SourceId {
        let id = SourceId(self.next_id);
        self.next_id += 1;
        if self.depth == 0 {
            self.slots.push(Slot {
                id,
                source: Some(Box::new(source)),
            });
        } else {
            self.pending_add.push((id, Box::new(source)));
        }
        id
    }

    /// Remove a source. Safe from within dispatch; unknown ids are ignored.
    pub fn remove(&mut self, id: SourceId) {
        if self.depth == 0 {
            self.slots.retain(|slot| slot.id != id);
        } else {
            self.pending_remove.push(id);
        }
    }

    /// Stop [`Loop::run`] after the current iteration.
    pub fn quit(&mut self) {
        self.running = false;
    }

    /// Number of live sources (accurate outside an iteration).
    pub fn source_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.source.is_some()).count() + self.pending_add.len()
    }

    /// One scheduler turn. Returns `false` iff the source set is empty
    /// afterwards.
    pub fn iteration(&mut self, may_block: bool) -> bool {
        self.depth += 1;
        let now = Instant::now();

        // prepare: earliest timeout across all sources
        let mut timeout: Option<Duration> = None;
        for slot in &mut self.slots {
            if let Some(source) = slot.source.as_mut() {
                if let Some(wanted) = source.prepare(now) {
                    timeout = Some(match timeout {
                        Some(current) => current.min(wanted),
                        None => wanted,
                    });
                }
            }
        }
        if !may_block {
            timeout = Some(Duration::ZERO);
        }

        // wait: one poll across the packed descriptor array
        let mut results: Vec<(usize, usize, PollFlags)> = Vec::new();
        let mut poll_failed = false;
        {
            let mut pfds: Vec<PollFd<'_>> = Vec::new();
            let mut owners: Vec<(usize, usize)> = Vec::new();
            for (slot_idx, slot) in self.slots.iter().enumerate() {
                if let Some(source) = slot.source.as_ref() {
                    for (k, interest) in source.interests().into_iter().enumerate() {
                        pfds.push(PollFd::new(interest.fd, interest.events));
                        owners.push((slot_idx, k));
                    }
                }
            }
            if pfds.is_empty() {
                if may_block {
                    if let Some(wanted) = timeout {
                        if !wanted.is_zero() {
                            std::thread::sleep(wanted);
                        }
                    }
                }
            } else {
                match poll(&mut pfds, poll_timeout(timeout_ms(timeout))) {
                    Ok(_) => {
                        for (pfd, owner) in pfds.iter().zip(&owners) {
                            let revents = pfd.revents().unwrap_or(PollFlags::empty());
                            results.push((owner.0, owner.1, revents));
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "poll failed, skipping dispatch this iteration");
                        poll_failed = true;
                    }
                }
            }
        }

        // writeback: hand the event masks back to their owners
        for (slot_idx, k, revents) in results {
            if let Some(source) = self.slots[slot_idx].source.as_mut() {
                source.writeback(k, revents);
            }
        }

        // dispatch: only sources present at the start of this iteration
        if !poll_failed {
            let now = Instant::now();
            let count = self.slots.len();
            for idx in 0..count {
                let ready = match self.slots[idx].source.as_mut() {
                    Some(source) => source.check(now),
                    None => false,
                };
                if !ready {
                    continue;
                }
                let Some(mut source) = self.slots[idx].source.take() else {
                    continue;
                };
                let id = self.slots[idx].id;
                match source.dispatch(self) {
                    Ok(true) => self.slots[idx].source = Some(source),
                    Ok(false) => {}
                    Err(err) => {
                        warn!(source = id.0, error = %err, "source dispatch failed, removing it");
                    }
                }
            }
        }

        // commit: apply deferred mutations at the outermost level only
        if self.depth == 1 {
            let removals = std::mem::take(&mut self.pending_remove);
            let mut added = std::mem::take(&mut self.pending_add);
            for id in &removals {
                self.slots.retain(|slot| slot.id != *id);
                added.retain(|(added_id, _)| added_id != id);
            }
            self.slots.retain(|slot| slot.source.is_some());
            for (id, source) in added {
                self.slots.push(Slot {
                    id,
                    source: Some(source),
                });
            }
        }

        self.depth -= 1;
        self.slots.iter().any(|slot| slot.source.is_some()) || !self.pending_add.is_empty()
    }

    /// Iterate until [`Loop::quit`] is called or the source set drains.
    pub fn run(&mut self) {
        self.running = true;
        while self.running {
            if !self.iteration(true) {
                self.running = false;
            }
        }
    }
}

fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(duration) => {
            // round up so a sub-millisecond residue does not busy-spin
            let mut ms = duration.as_millis();
            if Duration::from_millis(ms as u64) < duration {
                ms += 1;
            }
            ms.min(i32::MAX as u128) as i32
        }
    }
}

/// Calls its slot every `interval`; removes itself when the slot returns
/// `false`. Missed ticks are collapsed: after a stall the next fire is
/// rescheduled strictly into the future instead of replaying the backlog.
pub struct TimeoutSource {
    interval: Duration,
    next_time: Instant,
    slot: Box<dyn FnMut(&mut Loop) -> bool>,
}

impl TimeoutSource {
    pub fn new(interval: Duration, slot: impl FnMut(&mut Loop) -> bool + 'static) -> Self {
        Self::with_first(interval, interval, slot)
    }

    /// First fire after `first`, then every `interval`.
    pub fn with_first(
        first: Duration,
        interval: Duration,
        slot: impl FnMut(&mut Loop) -> bool + 'static,
    ) -> Self {
        let interval = interval.max(Duration::from_millis(1));
        Self {
            interval,
            next_time: Instant::now() + first,
            slot: Box::new(slot),
        }
    }
}

impl Source for TimeoutSource {
    fn prepare(&mut self, now: Instant) -> Option<Duration> {
        Some(self.next_time.saturating_duration_since(now))
    }

    fn check(&mut self, now: Instant) -> bool {
        now >= self.next_time
    }

    fn dispatch(&mut self, event_loop: &mut Loop) -> Result<bool, BoxError> {
        let now = Instant::now();
        while self.next_time <= now {
            self.next_time += self.interval;
        }
        Ok((self.slot)(event_loop))
    }
}

/// Watches one descriptor for an interest mask and calls its slot with the
/// reported events. Removes itself when the slot returns `false`.
pub struct IoSource {
    fd: Rc<OwnedFd>,
    events: PollFlags,
    revents: PollFlags,
    #[allow(clippy::type_complexity)]
    slot: Box<dyn FnMut(&mut Loop, PollFlags) -> Result<bool, BoxError>>,
}

impl IoSource {
    pub fn new(
        fd: Rc<OwnedFd>,
        events: PollFlags,
        slot: impl FnMut(&mut Loop, PollFlags) -> Result<bool, BoxError> + 'static,
    ) -> Self {
        Self {
            fd,
            events,
            revents: PollFlags::empty(),
            slot: Box::new(slot),
        }
    }
}

impl Source for IoSource {
    fn prepare(&mut self, _now: Instant) -> Option<Duration> {
        None
    }

    fn interests(&self) -> Vec<Interest<'_>> {
        vec![Interest {
            fd: self.fd.as_fd(),
            events: self.events,
        }]
    }

    fn writeback(&mut self, _index: usize, revents: PollFlags) {
        self.revents = revents;
    }

    fn check(&mut self, _now: Instant) -> bool {
        self.revents.intersects(self.events)
    }

    fn dispatch(&mut self, event_loop: &mut Loop) -> Result<bool, BoxError> {
        let revents = std::mem::replace(&mut self.revents, PollFlags::empty());
        (self.slot)(event_loop, revents)
    }
}
