use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::clock::run_ticker;
use crate::config::{CdhConfig, ConfigError};
use crate::context::FlightContext;
use crate::dispatcher::{DispatchCounters, DispatchStats, Dispatcher, Routes};
use crate::health::{SubsystemMode, ERROR_INIT};
use crate::housekeeping::{run_telemetry_stream, Housekeeping};
use crate::modes::{run_supervisor, ModesManager, SatelliteMode};
use crate::protocol::{CommandResponse, Destination, Diary, Envelope};
use crate::queue::{bounded, command_queue, CommandQueue, DataQueue, DiaryQueue, Queue, QueueError};
use crate::scheduler::{run_release_timer, DeferredSchedule, ScheduledCommand, SchedulerStats};
use crate::subsystems::{run_link_poller, Adcs, Comms, Payload, Power, Subsystem, SubsystemManager};
use crate::telemetry::{AnalogSource, RetryPolicy, TelemetrySink};

const RESPONSE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0} is unavailable: its initialisation failed")]
    Unavailable(Destination),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

type Channel<T> = (Queue<T>, mpsc::Receiver<T>);

/// The running flight software: every queue and task, wired together.
///
/// Dropping it aborts all tasks.
pub struct FlightSoftware {
    ctx: Arc<FlightContext>,
    commands: Option<CommandQueue>,
    diaries: Option<DiaryQueue>,
    schedule: Arc<DeferredSchedule>,
    counters: Option<Arc<DispatchCounters>>,
    responses: broadcast::Sender<CommandResponse>,
    tasks: Vec<JoinHandle<()>>,
}

impl FlightSoftware {
    /// Creates every module and spawns its tasks on the current tokio runtime.
    ///
    /// A module whose queues cannot be created is flagged `ERROR_INIT` and left
    /// out; everything else still starts.
    pub fn start(
        config: CdhConfig,
        sink: Arc<dyn TelemetrySink>,
        analog: Arc<dyn AnalogSource>,
    ) -> Result<Self, AgentError> {
        config.validate()?;
        let ctx = Arc::new(FlightContext::new());
        let retry = config.retry;
        let queue_len = config.command_queue_len;

        let (cdh, cdh_diary) = both(
            init(&ctx, Destination::Cdh, command_queue("cdh", queue_len)),
            init(&ctx, Destination::Cdh, bounded("cdh-diary", config.diary_queue_len)),
        );
        let (hk, hk_data) = both(
            init(&ctx, Destination::Housekeeping, command_queue("housekeeping", queue_len)),
            init(&ctx, Destination::Housekeeping, bounded("housekeeping-data", config.data_queue_len)),
        );
        let modes = init(&ctx, Destination::Modes, command_queue("modes", queue_len));
        let adcs = init(&ctx, Destination::Adcs, command_queue("adcs", queue_len));
        let comm = init(&ctx, Destination::Comm, command_queue("comm", queue_len));
        let payload = init(&ctx, Destination::Payload, command_queue("payload", queue_len));
        let power = init(&ctx, Destination::Power, command_queue("power", queue_len));

        let routes = Routes {
            adcs: sender(&adcs),
            comm: sender(&comm),
            housekeeping: sender(&hk),
            modes: sender(&modes),
            payload: sender(&payload),
            power: sender(&power),
        };
        let commands = sender(&cdh);
        let diaries = sender(&cdh_diary);
        let hk_data_queue: Option<DataQueue> = sender(&hk_data);

        let (responses, _) = broadcast::channel(RESPONSE_CHANNEL_CAPACITY);
        let schedule = Arc::new(DeferredSchedule::new(config.schedule_capacity, config.tick_period()));
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(run_ticker(Arc::clone(&ctx), config.tick_period())));

        let mut counters = None;
        if let (Some((input, input_rx)), Some((_, diary_rx))) = (cdh, cdh_diary) {
            let mut dispatcher = Dispatcher::new(
                Arc::clone(&ctx),
                routes.clone(),
                Arc::clone(&schedule),
                Arc::clone(&sink),
                retry,
            )
            .with_responses(responses.clone());
            if let Some(data) = &hk_data_queue {
                dispatcher = dispatcher.with_housekeeping_data(data.clone());
            }
            let dispatcher = Arc::new(dispatcher);
            counters = Some(dispatcher.counters());

            tasks.push(tokio::spawn(Arc::clone(&dispatcher).run(input_rx)));
            tasks.push(tokio::spawn(dispatcher.run_diaries(diary_rx)));
            tasks.push(tokio::spawn(run_release_timer(
                Arc::clone(&schedule),
                input,
                Arc::clone(&ctx),
            )));
            ctx.status(Destination::Cdh).set_mode(SubsystemMode::On);
        }

        if let Some((modes_queue, modes_rx)) = modes {
            let mut manager = ModesManager::new(Arc::clone(&ctx));
            if let Some(input) = &commands {
                manager = manager.with_dispatcher(input.clone());
            }
            if let Some(data) = &hk_data_queue {
                manager = manager.with_housekeeping(data.clone());
            }
            tasks.push(tokio::spawn(manager.run(modes_rx)));
            if config.supervisor.enabled {
                tasks.push(tokio::spawn(run_supervisor(Arc::clone(&ctx), modes_queue, config.supervisor)));
            }
            ctx.status(Destination::Modes).set_mode(SubsystemMode::On);
        }

        if let (Some((_, hk_rx)), Some((data_queue, data_rx))) = (hk, hk_data) {
            let housekeeping = Arc::new(
                Housekeeping::new(Arc::clone(&ctx), Arc::clone(&sink), retry).with_data_queue(data_queue),
            );
            tasks.push(tokio::spawn(Arc::clone(&housekeeping).run_commands(hk_rx)));
            tasks.push(tokio::spawn(housekeeping.run_data(data_rx)));
            if config.telemetry_stream.enabled {
                match &routes.comm {
                    Some(comm_queue) => tasks.push(tokio::spawn(run_telemetry_stream(
                        Arc::clone(&ctx),
                        Arc::clone(&analog),
                        comm_queue.clone(),
                        config.telemetry_stream,
                    ))),
                    None => error!("telemetry stream not started: comm unavailable"),
                }
            }
            ctx.status(Destination::Housekeeping).set_mode(SubsystemMode::On);
        }

        let spawner = Spawner {
            ctx: &ctx,
            sink: &sink,
            retry,
            housekeeping: hk_data_queue.as_ref(),
        };
        tasks.extend(spawner.spawn(Adcs::new(), adcs));
        tasks.extend(spawner.spawn(Comms::new(), comm));
        tasks.extend(spawner.spawn(Payload::new(), payload));
        tasks.extend(spawner.spawn(Power::new(), power));

        if let (Some(period), Some(input)) = (config.link_poll_period(), &commands) {
            tasks.push(tokio::spawn(run_link_poller(Arc::clone(&ctx), input.clone(), period)));
        }

        info!(tasks = tasks.len(), "flight software started");
        Ok(Self {
            ctx,
            commands,
            diaries,
            schedule,
            counters,
            responses,
            tasks,
        })
    }

    /// Submits an envelope to the dispatcher input without blocking.
    pub fn submit(&self, envelope: Envelope) -> Result<(), AgentError> {
        let input = self
            .commands
            .as_ref()
            .ok_or(AgentError::Unavailable(Destination::Cdh))?;
        input.try_send(envelope)?;
        Ok(())
    }

    pub fn submit_diary(&self, diary: Diary) -> Result<(), AgentError> {
        let input = self
            .diaries
            .as_ref()
            .ok_or(AgentError::Unavailable(Destination::Cdh))?;
        input.try_send(diary)?;
        Ok(())
    }

    /// Acknowledgements emitted by the dispatcher from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CommandResponse> {
        self.responses.subscribe()
    }

    pub fn context(&self) -> &Arc<FlightContext> {
        &self.ctx
    }

    pub fn satellite_mode(&self) -> SatelliteMode {
        self.ctx.satellite_mode.get()
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.schedule.stats()
    }

    pub fn pending_commands(&self) -> Vec<ScheduledCommand> {
        self.schedule.pending()
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.counters
            .as_ref()
            .map(|c| c.snapshot())
            .unwrap_or_default()
    }

    pub fn shutdown(mut self) {
        self.abort_all();
        info!("flight software stopped");
    }

    fn abort_all(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for FlightSoftware {
    fn drop(&mut self) {
        self.abort_all();
    }
}

struct Spawner<'a> {
    ctx: &'a Arc<FlightContext>,
    sink: &'a Arc<dyn TelemetrySink>,
    retry: RetryPolicy,
    housekeeping: Option<&'a DataQueue>,
}

impl Spawner<'_> {
    fn spawn<S: Subsystem>(&self, subsystem: S, channel: Option<Channel<Envelope>>) -> Option<JoinHandle<()>> {
        let (_, input) = channel?;
        let mut manager = SubsystemManager::new(subsystem, Arc::clone(self.ctx), Arc::clone(self.sink), self.retry);
        if let Some(data) = self.housekeeping {
            manager = manager.with_housekeeping(data.clone());
        }
        self.ctx.status(S::ID).set_mode(SubsystemMode::On);
        Some(tokio::spawn(manager.run(input)))
    }
}

fn init<T>(ctx: &FlightContext, module: Destination, channel: Result<Channel<T>, QueueError>) -> Option<Channel<T>> {
    match channel {
        Ok(channel) => Some(channel),
        Err(e) => {
            ctx.status(module).flag(ERROR_INIT);
            error!(%module, error = %e, "module initialisation failed");
            None
        }
    }
}

/// A module with two queues starts only if both were created.
fn both<A, B>(a: Option<A>, b: Option<B>) -> (Option<A>, Option<B>) {
    match (a, b) {
        (Some(a), Some(b)) => (Some(a), Some(b)),
        _ => (None, None),
    }
}

fn sender<T>(channel: &Option<Channel<T>>) -> Option<Queue<T>> {
    channel.as_ref().map(|(queue, _)| queue.clone())
}
