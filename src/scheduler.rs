use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tracing::{debug, error, info};

use crate::context::FlightContext;
use crate::health::ERROR_QUEUE_FULL;
use crate::protocol::{Destination, Envelope, ObcTime};
use crate::queue::CommandQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("command schedule full ({0} pending)")]
    Full(usize),
    #[error("execution time {execute_at} is not after onboard time {now}")]
    NotInFuture { execute_at: ObcTime, now: ObcTime },
}

/// A deferred command waiting for its due time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledCommand {
    pub command: Envelope,
    pub execution_time: ObcTime,
    pub scheduled_at: ObcTime,
    /// Seconds between periodic executions; 0 for one-shot commands.
    pub period: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub total_scheduled: u32,
    pub total_released: u32,
    pub total_rejected: u32,
    pub total_dropped: u32,
    pub currently_scheduled: usize,
}

#[derive(Debug)]
struct Entry {
    deadline: Instant,
    sequence: u64,
    scheduled: ScheduledCommand,
}

impl Entry {
    fn key(&self) -> (Instant, u64) {
        (self.deadline, self.sequence)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the max-heap yields the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

/// Bounded, earliest-first schedule of deferred commands.
///
/// Equal deadlines release in insertion order. An entry with a non-zero
/// `reschedule_count` is re-armed one period later on each release.
#[derive(Debug)]
pub struct CommandScheduler {
    entries: BinaryHeap<Entry>,
    capacity: usize,
    tick: Duration,
    next_sequence: u64,
    stats: SchedulerStats,
}

impl CommandScheduler {
    pub fn new(capacity: usize, tick: Duration) -> Self {
        Self {
            entries: BinaryHeap::with_capacity(capacity),
            capacity,
            tick,
            next_sequence: 0,
            stats: SchedulerStats::default(),
        }
    }

    /// Defers `command` until its `execute_at`, measured from onboard time `now`
    /// observed at `at`. Returns the release deadline.
    pub fn schedule(
        &mut self,
        command: Envelope,
        now: ObcTime,
        at: Instant,
    ) -> Result<Instant, ScheduleError> {
        let execute_at = command.execute_at;
        if execute_at <= now {
            return Err(ScheduleError::NotInFuture { execute_at, now });
        }
        if self.entries.len() >= self.capacity {
            self.stats.total_rejected += 1;
            return Err(ScheduleError::Full(self.entries.len()));
        }

        let period = if command.reschedule_count > 0 {
            execute_at - now
        } else {
            0
        };
        let deadline = at + self.ticks(execute_at - now);
        self.insert(
            deadline,
            ScheduledCommand {
                command,
                execution_time: execute_at,
                scheduled_at: now,
                period,
            },
        );
        self.stats.total_scheduled += 1;

        debug!(execute_at, now, period, pending = self.entries.len(), "command deferred");
        Ok(deadline)
    }

    /// Removes the earliest entry whose deadline has passed at `at` and whose
    /// execution time has been reached by onboard time `now`.
    ///
    /// An entry whose deadline passed while the onboard clock is still behind its
    /// execution time (the clock was set back) stays scheduled and does not block
    /// the entries behind it. The returned envelope is marked immediately due
    /// (`execute_at == 0`).
    pub fn pop_due(&mut self, at: Instant, now: ObcTime) -> Option<Envelope> {
        let mut held = Vec::new();
        let mut released = None;
        while self.entries.peek().is_some_and(|e| e.deadline <= at) {
            let Some(entry) = self.entries.pop() else {
                break;
            };
            if entry.scheduled.execution_time > now {
                held.push(entry);
                continue;
            }
            released = Some(self.release(entry));
            break;
        }
        if !held.is_empty() {
            debug!(held = held.len(), now, "onboard time behind deferred commands");
            self.entries.extend(held);
        }
        self.stats.currently_scheduled = self.entries.len();
        released
    }

    fn release(&mut self, entry: Entry) -> Envelope {
        let mut released = entry.scheduled.command.clone();

        if released.reschedule_count > 0 {
            // The popped slot is reused, so re-arming cannot exceed capacity.
            let period = entry.scheduled.period.max(1);
            let mut next = entry.scheduled;
            next.command.reschedule_count -= 1;
            next.command.execute_at = next.execution_time + period;
            next.execution_time = next.command.execute_at;
            self.insert(entry.deadline + self.ticks(period), next);
        }

        released.execute_at = 0;
        released.reschedule_count = 0;
        self.stats.total_released += 1;
        released
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.peek().map(|e| e.deadline)
    }

    /// Earliest deadline still ahead of `at`. Entries already past their deadline
    /// wait for the onboard clock instead.
    pub fn next_wake(&self, at: Instant) -> Option<Instant> {
        self.entries.iter().map(|e| e.deadline).filter(|d| *d > at).min()
    }

    /// Pending commands, earliest first.
    pub fn pending(&self) -> Vec<ScheduledCommand> {
        let mut entries: Vec<&Entry> = self.entries.iter().collect();
        entries.sort_by_key(|e| e.key());
        entries.into_iter().map(|e| e.scheduled.clone()).collect()
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn insert(&mut self, deadline: Instant, scheduled: ScheduledCommand) {
        // NASA Rule 5: Safety assertion for scheduler capacity
        debug_assert!(
            self.entries.len() < self.capacity,
            "schedule length {} at capacity {}",
            self.entries.len(),
            self.capacity
        );
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.push(Entry {
            deadline,
            sequence,
            scheduled,
        });
        self.stats.currently_scheduled = self.entries.len();
    }

    fn ticks(&self, seconds: u64) -> Duration {
        self.tick.saturating_mul(u32::try_from(seconds).unwrap_or(u32::MAX))
    }
}

/// The schedule shared between the dispatcher and its release timer.
///
/// The lock is held only for a single insert or pop, never across an await.
#[derive(Debug)]
pub struct DeferredSchedule {
    scheduler: Mutex<CommandScheduler>,
    wake: Notify,
}

impl DeferredSchedule {
    pub fn new(capacity: usize, tick: Duration) -> Self {
        Self {
            scheduler: Mutex::new(CommandScheduler::new(capacity, tick)),
            wake: Notify::new(),
        }
    }

    pub fn schedule(&self, command: Envelope, now: ObcTime) -> Result<Instant, ScheduleError> {
        let deadline = self.lock().schedule(command, now, Instant::now())?;
        self.wake.notify_one();
        Ok(deadline)
    }

    pub fn stats(&self) -> SchedulerStats {
        self.lock().stats().clone()
    }

    pub fn pending(&self) -> Vec<ScheduledCommand> {
        self.lock().pending()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.lock().next_deadline()
    }

    fn lock(&self) -> MutexGuard<'_, CommandScheduler> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop_due(&self, now: ObcTime) -> Option<Envelope> {
        self.lock().pop_due(Instant::now(), now)
    }

    fn next_wake(&self) -> Option<Instant> {
        self.lock().next_wake(Instant::now())
    }

    fn record_drop(&self) {
        self.lock().stats.total_dropped += 1;
    }
}

/// Releases due commands onto the dispatcher input, earliest first.
///
/// A command is released once its countdown has elapsed and the onboard clock
/// has reached its execution time. A release that finds the input queue full is
/// dropped, counted and flagged on the dispatcher's status.
pub async fn run_release_timer(
    schedule: Arc<DeferredSchedule>,
    dispatcher: CommandQueue,
    ctx: Arc<FlightContext>,
) {
    info!("release timer started");
    loop {
        while let Some(command) = schedule.pop_due(ctx.clock.now()) {
            let (destination, command_id) = (command.destination, command.command_id);
            match dispatcher.try_send(command) {
                Ok(()) => debug!(destination, command_id, "deferred command released"),
                Err(e) => {
                    schedule.record_drop();
                    ctx.status(Destination::Cdh).flag(ERROR_QUEUE_FULL);
                    error!(destination, command_id, error = %e, "deferred command lost on release");
                }
            }
        }

        let wake_at = schedule.next_wake();
        let countdown = async {
            match wake_at {
                Some(deadline) => time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            () = countdown => {}
            () = schedule.wake.notified() => {}
            () = ctx.clock.changed() => {}
        }
    }
}
