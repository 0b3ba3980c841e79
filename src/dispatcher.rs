use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use crate::context::FlightContext;
use crate::health::{
    report_health, requested_mode, ERROR_CMDINV, ERROR_QUEUE_FULL, ERROR_SCHEDULE,
};
use crate::protocol::{
    CommandError, CommandResponse, Destination, Diary, Envelope, HealthData, LogEntry,
    ProtocolError, ResponseStatus,
};
use crate::queue::{CommandQueue, DataQueue, QueueError};
use crate::scheduler::{DeferredSchedule, ScheduleError};
use crate::telemetry::{RetryPolicy, TelemetrySink};

pub const CDH_REPORT_HEALTH: u8 = 0x01;
pub const CDH_CHANGE_MODE: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("no route to {0}")]
    NoRoute(Destination),
    #[error("{0} queue full")]
    QueueFull(Destination),
    #[error(transparent)]
    Queue(QueueError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Command(#[from] CommandError),
}

impl RouteError {
    /// MSV bit the dispatcher raises for this failure.
    pub fn health_flag(&self) -> u8 {
        match self {
            RouteError::QueueFull(_) | RouteError::Queue(_) => ERROR_QUEUE_FULL,
            RouteError::Schedule(_) => ERROR_SCHEDULE,
            RouteError::Command(e) => e.health_flag(),
            RouteError::Protocol(_) | RouteError::NoRoute(_) => ERROR_CMDINV,
        }
    }
}

/// Per-module command queues reachable from the dispatcher.
///
/// A `None` entry is a module whose initialisation failed.
#[derive(Debug, Clone, Default)]
pub struct Routes {
    pub adcs: Option<CommandQueue>,
    pub comm: Option<CommandQueue>,
    pub housekeeping: Option<CommandQueue>,
    pub modes: Option<CommandQueue>,
    pub payload: Option<CommandQueue>,
    pub power: Option<CommandQueue>,
}

impl Routes {
    /// The filesystem and the dispatcher itself have no queue here.
    pub fn queue_for(&self, destination: Destination) -> Option<&CommandQueue> {
        match destination {
            Destination::Adcs => self.adcs.as_ref(),
            Destination::Comm => self.comm.as_ref(),
            Destination::Housekeeping => self.housekeeping.as_ref(),
            Destination::Modes => self.modes.as_ref(),
            Destination::Payload => self.payload.as_ref(),
            Destination::Power => self.power.as_ref(),
            Destination::Cdh | Destination::Filesystem => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Forwarded(Destination),
    Scheduled,
    HandledLocally,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    pub received: u32,
    pub forwarded: u32,
    pub scheduled: u32,
    pub handled_locally: u32,
    pub rejected: u32,
    pub dropped_queue_full: u32,
}

#[derive(Debug, Default)]
pub struct DispatchCounters {
    received: AtomicU32,
    forwarded: AtomicU32,
    scheduled: AtomicU32,
    handled_locally: AtomicU32,
    rejected: AtomicU32,
    dropped_queue_full: AtomicU32,
}

impl DispatchCounters {
    pub fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            received: self.received.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            scheduled: self.scheduled.load(Ordering::Relaxed),
            handled_locally: self.handled_locally.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dropped_queue_full: self.dropped_queue_full.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Result of fanning out one diary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiaryReport {
    pub forwarded: usize,
    pub skipped: usize,
    pub rejected: usize,
}

/// The command router: defers, handles locally, or forwards each envelope.
pub struct Dispatcher {
    ctx: Arc<FlightContext>,
    routes: Routes,
    schedule: Arc<DeferredSchedule>,
    sink: Arc<dyn TelemetrySink>,
    retry: RetryPolicy,
    housekeeping_data: Option<DataQueue>,
    responses: Option<broadcast::Sender<CommandResponse>>,
    counters: Arc<DispatchCounters>,
}

impl Dispatcher {
    pub fn new(
        ctx: Arc<FlightContext>,
        routes: Routes,
        schedule: Arc<DeferredSchedule>,
        sink: Arc<dyn TelemetrySink>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            ctx,
            routes,
            schedule,
            sink,
            retry,
            housekeeping_data: None,
            responses: None,
            counters: Arc::new(DispatchCounters::default()),
        }
    }

    pub fn with_housekeeping_data(mut self, queue: DataQueue) -> Self {
        self.housekeeping_data = Some(queue);
        self
    }

    /// Acknowledgements for every handled envelope are broadcast here.
    pub fn with_responses(mut self, responses: broadcast::Sender<CommandResponse>) -> Self {
        self.responses = Some(responses);
        self
    }

    pub fn counters(&self) -> Arc<DispatchCounters> {
        Arc::clone(&self.counters)
    }

    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    /// Routes one envelope. A routed or locally handled envelope is marked
    /// `processed`; an unknown destination is refused before it can be deferred.
    pub async fn handle(&self, mut envelope: Envelope) -> Result<Outcome, RouteError> {
        DispatchCounters::bump(&self.counters.received);
        let now = self.ctx.clock.now();
        let destination = envelope.destination()?;

        if envelope.execute_at > now {
            self.schedule.schedule(envelope, now)?;
            DispatchCounters::bump(&self.counters.scheduled);
            return Ok(Outcome::Scheduled);
        }

        trace!(entry = ?LogEntry::for_command(&envelope, now), "command");
        envelope.processed = true;

        if destination == Destination::Cdh {
            self.handle_local(&envelope).await?;
            DispatchCounters::bump(&self.counters.handled_locally);
            return Ok(Outcome::HandledLocally);
        }

        self.forward(destination, envelope)?;
        Ok(Outcome::Forwarded(destination))
    }

    /// Forwards each diary entry in order. ADCS and power entries are routed,
    /// COMM and payload entries are skipped, anything else is rejected.
    pub fn handle_diary(&self, diary: &Diary) -> DiaryReport {
        let mut report = DiaryReport::default();
        for entry in diary.entries() {
            let result = match entry.destination() {
                Ok(destination @ (Destination::Adcs | Destination::Power)) => {
                    let mut forwarded = entry.clone();
                    forwarded.processed = true;
                    self.forward(destination, forwarded)
                }
                Ok(destination @ (Destination::Comm | Destination::Payload)) => {
                    debug!(%destination, command_id = entry.command_id, "diary entry not mapped");
                    report.skipped += 1;
                    continue;
                }
                Ok(destination) => Err(RouteError::NoRoute(destination)),
                Err(e) => Err(e.into()),
            };
            match result {
                Ok(()) => report.forwarded += 1,
                Err(e) => {
                    report.rejected += 1;
                    self.reject(entry, &e);
                }
            }
        }
        report
    }

    pub async fn run(self: Arc<Self>, mut input: mpsc::Receiver<Envelope>) {
        info!("dispatcher started");
        while let Some(envelope) = input.recv().await {
            let mut summary = envelope.clone();
            match self.handle(envelope).await {
                Ok(outcome) => {
                    let status = match outcome {
                        Outcome::Scheduled => ResponseStatus::Scheduled,
                        Outcome::Forwarded(_) | Outcome::HandledLocally => {
                            summary.processed = true;
                            ResponseStatus::Acknowledged
                        }
                    };
                    self.respond(&summary, status, None);
                }
                Err(e) => self.reject(&summary, &e),
            }
        }
        info!("dispatcher input closed");
    }

    pub async fn run_diaries(self: Arc<Self>, mut input: mpsc::Receiver<Diary>) {
        info!("diary processor started");
        while let Some(diary) = input.recv().await {
            let report = self.handle_diary(&diary);
            debug!(?report, "diary processed");
        }
        info!("diary input closed");
    }

    async fn handle_local(&self, envelope: &Envelope) -> Result<(), CommandError> {
        let status = self.ctx.status(Destination::Cdh);
        match envelope.command_id {
            CDH_REPORT_HEALTH => {
                report_health(
                    Destination::Cdh,
                    status,
                    self.sink.as_ref(),
                    self.retry,
                    self.housekeeping_data.as_ref(),
                )
                .await?;
            }
            CDH_CHANGE_MODE => {
                let mode = requested_mode(envelope)?;
                status.set_mode(mode);
                info!(?mode, "dispatcher mode changed");
            }
            command_id => {
                return Err(CommandError::UnknownCommand {
                    destination: Destination::Cdh,
                    command_id,
                })
            }
        }
        Ok(())
    }

    fn forward(&self, destination: Destination, envelope: Envelope) -> Result<(), RouteError> {
        let queue = self
            .routes
            .queue_for(destination)
            .ok_or(RouteError::NoRoute(destination))?;
        let command_id = envelope.command_id;
        queue.try_send(envelope).map_err(|e| match e {
            QueueError::Full(_) => RouteError::QueueFull(destination),
            other => RouteError::Queue(other),
        })?;
        DispatchCounters::bump(&self.counters.forwarded);
        debug!(%destination, command_id, "command forwarded");
        Ok(())
    }

    fn reject(&self, envelope: &Envelope, error: &RouteError) {
        let status = self.ctx.status(Destination::Cdh);
        status.flag(error.health_flag());
        DispatchCounters::bump(&self.counters.rejected);

        if matches!(error, RouteError::QueueFull(_)) {
            DispatchCounters::bump(&self.counters.dropped_queue_full);
            if let Some(queue) = &self.housekeeping_data {
                let _ = queue.try_send(HealthData::health_status(Destination::Cdh, status.msv()));
            }
        }

        warn!(
            destination = envelope.destination,
            command_id = envelope.command_id,
            error = %error,
            "command rejected"
        );
        let mut refused = envelope.clone();
        refused.processed = false;
        refused.error = true;
        self.respond(&refused, ResponseStatus::NegativeAck, Some(error.to_string()));
    }

    fn respond(&self, envelope: &Envelope, status: ResponseStatus, reason: Option<String>) {
        if let Some(responses) = &self.responses {
            let response =
                CommandResponse::for_envelope(envelope, self.ctx.clock.now(), status, reason);
            // No subscriber is not an error.
            let _ = responses.send(response);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::SubsystemMode;
    use crate::queue::command_queue;
    use crate::telemetry::MemorySink;
    use std::time::Duration;

    fn dispatcher(routes: Routes) -> (Dispatcher, Arc<FlightContext>, Arc<MemorySink>) {
        let ctx = Arc::new(FlightContext::new());
        let sink = Arc::new(MemorySink::new());
        let schedule = Arc::new(DeferredSchedule::new(32, Duration::from_secs(1)));
        let dispatcher = Dispatcher::new(Arc::clone(&ctx), routes, schedule, sink.clone(), RetryPolicy::default());
        (dispatcher, ctx, sink)
    }

    #[tokio::test]
    async fn test_local_health_and_mode() {
        let (dispatcher, ctx, sink) = dispatcher(Routes::default());
        ctx.status(Destination::Cdh).set_mode(SubsystemMode::On);

        let outcome = dispatcher
            .handle(Envelope::new(Destination::Cdh, CDH_CHANGE_MODE).with_param(3))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::HandledLocally);
        assert_eq!(ctx.status(Destination::Cdh).mode(), SubsystemMode::Erp as u8);
        // The satellite-wide mode is untouched.
        assert_eq!(ctx.satellite_mode.get(), crate::modes::SatelliteMode::Detumbling);

        dispatcher
            .handle(Envelope::new(Destination::Cdh, CDH_REPORT_HEALTH))
            .await
            .unwrap();
        assert_eq!(sink.frames()[0].bytes, vec![3, 0]);
    }

    #[tokio::test]
    async fn test_filesystem_is_unrouted() {
        let (dispatcher, ctx, _sink) = dispatcher(Routes::default());
        let result = dispatcher.handle(Envelope::new(Destination::Filesystem, 1)).await;
        assert_eq!(result, Err(RouteError::NoRoute(Destination::Filesystem)));
        assert_eq!(result.unwrap_err().health_flag(), ERROR_CMDINV);
        // Flags are raised by the receive loop, not by `handle`.
        assert_eq!(ctx.status(Destination::Cdh).msv(), 0);
    }

    #[tokio::test]
    async fn test_due_now_is_routed_immediately() {
        let (power, mut power_rx) = command_queue("power", 6).unwrap();
        let (dispatcher, ctx, _sink) = dispatcher(Routes {
            power: Some(power),
            ..Routes::default()
        });
        ctx.clock.set(100);

        let envelope = Envelope::new(Destination::Power, 3).due_at(100);
        let outcome = dispatcher.handle(envelope).await.unwrap();
        assert_eq!(outcome, Outcome::Forwarded(Destination::Power));
        assert_eq!(power_rx.try_recv().unwrap().command_id, 3);
    }

    #[tokio::test]
    async fn test_future_command_is_scheduled() {
        let (dispatcher, ctx, _sink) = dispatcher(Routes::default());
        ctx.clock.set(10);

        let outcome = dispatcher
            .handle(Envelope::new(Destination::Power, 3).due_at(15))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Scheduled);
        assert_eq!(dispatcher.schedule.pending().len(), 1);
        assert_eq!(dispatcher.stats().scheduled, 1);
    }

    #[tokio::test]
    async fn test_future_command_with_unknown_destination_is_not_deferred() {
        let (dispatcher, ctx, _sink) = dispatcher(Routes::default());
        ctx.clock.set(10);

        let result = dispatcher.handle(Envelope::raw(0x33, 1).due_at(15)).await;
        assert_eq!(
            result,
            Err(RouteError::Protocol(ProtocolError::UnknownDestination(0x33)))
        );
        assert!(dispatcher.schedule.pending().is_empty());
        assert_eq!(dispatcher.stats().scheduled, 0);
    }

    #[tokio::test]
    async fn test_forwarded_copy_is_marked_processed() {
        let (power, mut power_rx) = command_queue("power", 6).unwrap();
        let (dispatcher, _ctx, _sink) = dispatcher(Routes {
            power: Some(power),
            ..Routes::default()
        });

        dispatcher.handle(Envelope::new(Destination::Power, 3)).await.unwrap();
        let forwarded = power_rx.try_recv().unwrap();
        assert!(forwarded.processed);
        assert!(!forwarded.error);
    }

    #[test]
    fn test_diary_entry_with_unknown_destination_is_rejected() {
        let (dispatcher, ctx, _sink) = dispatcher(Routes::default());
        let diary = Diary::from_entries([Envelope::raw(0x33, 1), Envelope::new(Destination::Modes, 1)]).unwrap();

        let report = dispatcher.handle_diary(&diary);
        assert_eq!(report.rejected, 2);
        assert!(ctx.status(Destination::Cdh).has(ERROR_CMDINV));
    }
}
