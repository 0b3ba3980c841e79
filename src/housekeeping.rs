use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::TelemetryStreamConfig;
use crate::context::FlightContext;
use crate::health::{report_health, HealthRecord, ERROR_QUEUE_FULL};
use crate::protocol::{
    first_param, CommandError, Destination, Envelope, HealthData, ObcTime, HEALTH_STATUS,
};
use crate::queue::{CommandQueue, DataQueue};
use crate::subsystems::comms::COMM_DOWNLINK;
use crate::telemetry::{environment_frame, transmit_with_retry, AnalogSource, RetryPolicy, TelemetrySink};

pub const HK_REPORT_HEALTH: u8 = 0x01;
pub const HK_SET_TIME: u8 = 0x02;
pub const HK_GET_TIME: u8 = 0x03;

/// Time keeper and health aggregator.
///
/// The command side answers health and time requests; the data side folds
/// module health reports into the shared health table.
pub struct Housekeeping {
    ctx: Arc<FlightContext>,
    sink: Arc<dyn TelemetrySink>,
    retry: RetryPolicy,
    data: Option<DataQueue>,
}

impl Housekeeping {
    pub fn new(ctx: Arc<FlightContext>, sink: Arc<dyn TelemetrySink>, retry: RetryPolicy) -> Self {
        Self {
            ctx,
            sink,
            retry,
            data: None,
        }
    }

    /// Own data queue, so housekeeping's health report reaches its table too.
    pub fn with_data_queue(mut self, queue: DataQueue) -> Self {
        self.data = Some(queue);
        self
    }

    pub fn onboard_time(&self) -> ObcTime {
        self.ctx.clock.now()
    }

    pub async fn handle(&self, envelope: &Envelope) -> Result<(), CommandError> {
        match envelope.command_id {
            HK_REPORT_HEALTH => {
                report_health(
                    Destination::Housekeeping,
                    self.ctx.status(Destination::Housekeeping),
                    self.sink.as_ref(),
                    self.retry,
                    self.data.as_ref(),
                )
                .await?;
            }
            HK_SET_TIME => {
                let seconds = ObcTime::from(first_param(envelope)?);
                let previous = self.ctx.clock.now();
                self.ctx.clock.set(seconds);
                info!(previous, now = seconds, "onboard time set");
            }
            HK_GET_TIME => {
                // The downlink format carries the low 32 bits.
                let now = self.ctx.clock.now() as u32;
                if let Err(e) = transmit_with_retry(self.sink.as_ref(), &now.to_le_bytes(), self.retry).await {
                    self.ctx.status(Destination::Housekeeping).flag(crate::health::ERROR_TX);
                    return Err(e.into());
                }
            }
            command_id => {
                return Err(CommandError::UnknownCommand {
                    destination: Destination::Housekeeping,
                    command_id,
                })
            }
        }
        Ok(())
    }

    /// Applies one health update. Returns `None` for data types other than
    /// health status, which are ignored.
    pub fn ingest(&self, data: HealthData) -> Result<Option<HealthRecord>, CommandError> {
        let source = Destination::try_from(data.source).map_err(|_| CommandError::UnknownSource(data.source))?;
        if data.data_type != HEALTH_STATUS {
            debug!(%source, data_type = data.data_type, "ignoring non-health data");
            return Ok(None);
        }
        let record = self.ctx.health.update(source, data.data);
        debug!(%source, ?record, "health record updated");
        Ok(Some(record))
    }

    pub async fn run_commands(self: Arc<Self>, mut input: mpsc::Receiver<Envelope>) {
        info!("housekeeping command manager started");
        while let Some(envelope) = input.recv().await {
            if let Err(e) = self.handle(&envelope).await {
                self.ctx.status(Destination::Housekeeping).flag(e.health_flag());
                warn!(error = %e, "housekeeping command rejected");
            }
        }
        info!("housekeeping command input closed");
    }

    pub async fn run_data(self: Arc<Self>, mut input: mpsc::Receiver<HealthData>) {
        info!("housekeeping data manager started");
        while let Some(data) = input.recv().await {
            if let Err(e) = self.ingest(data) {
                self.ctx.status(Destination::Housekeeping).flag(e.health_flag());
                warn!(error = %e, "health data rejected");
            }
        }
        info!("housekeeping data input closed");
    }
}

/// Samples the analog front end every period and queues the framed result to
/// COMM for downlink.
pub async fn run_telemetry_stream(
    ctx: Arc<FlightContext>,
    analog: Arc<dyn AnalogSource>,
    comm: CommandQueue,
    config: TelemetryStreamConfig,
) {
    info!(period = ?config.period(), "telemetry stream started");
    let mut interval = time::interval_at(Instant::now() + config.period(), config.period());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let frame = environment_frame(config.selection, analog.as_ref());
        let envelope = match Envelope::new(Destination::Comm, COMM_DOWNLINK).with_payload(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "telemetry frame not queued");
                continue;
            }
        };
        if let Err(e) = comm.try_send(envelope) {
            ctx.status(Destination::Housekeeping).flag(ERROR_QUEUE_FULL);
            warn!(error = %e, "telemetry frame dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::bounded;
    use crate::telemetry::MemorySink;

    fn housekeeping() -> (Housekeeping, Arc<FlightContext>, Arc<MemorySink>) {
        let ctx = Arc::new(FlightContext::new());
        let sink = Arc::new(MemorySink::new());
        let hk = Housekeeping::new(Arc::clone(&ctx), sink.clone(), RetryPolicy::default());
        (hk, ctx, sink)
    }

    #[tokio::test]
    async fn test_set_and_get_time() {
        let (hk, ctx, sink) = housekeeping();
        hk.handle(&Envelope::new(Destination::Housekeeping, HK_SET_TIME).with_param(0x0102_0304))
            .await
            .unwrap();
        assert_eq!(ctx.clock.now(), 0x0102_0304);
        assert_eq!(hk.onboard_time(), 0x0102_0304);

        hk.handle(&Envelope::new(Destination::Housekeeping, HK_GET_TIME)).await.unwrap();
        assert_eq!(sink.frames()[0].bytes, vec![0x04, 0x03, 0x02, 0x01]);
    }

    #[tokio::test]
    async fn test_set_time_requires_parameter() {
        let (hk, _ctx, _sink) = housekeeping();
        let result = hk.handle(&Envelope::new(Destination::Housekeeping, HK_SET_TIME)).await;
        assert_eq!(result, Err(CommandError::MissingParameter(HK_SET_TIME)));
    }

    #[test]
    fn test_ingest_overwrites_record() {
        let (hk, ctx, _sink) = housekeeping();
        hk.ingest(HealthData::health_status(Destination::Adcs, 0)).unwrap();
        hk.ingest(HealthData::health_status(Destination::Adcs, 0x04)).unwrap();
        assert_eq!(ctx.health.get(Destination::Adcs), HealthRecord::Error);
        assert_eq!(ctx.health.get(Destination::Power), HealthRecord::Unknown);
    }

    #[test]
    fn test_ingest_rejects_unknown_source_and_ignores_other_types() {
        let (hk, ctx, _sink) = housekeeping();
        let bogus = HealthData {
            source: 42,
            data_type: HEALTH_STATUS,
            data: 0,
        };
        assert_eq!(hk.ingest(bogus), Err(CommandError::UnknownSource(42)));

        let other = HealthData {
            source: Destination::Power.address(),
            data_type: 9,
            data: 1,
        };
        assert_eq!(hk.ingest(other), Ok(None));
        assert_eq!(ctx.health.get(Destination::Power), HealthRecord::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_telemetry_stream_queues_frames_to_comm() {
        let ctx = Arc::new(FlightContext::new());
        let analog = Arc::new(crate::telemetry::FixedAnalog::new(1, 2, 0.0));
        let (comm, mut comm_rx) = bounded("comm", 6).unwrap();
        let config = TelemetryStreamConfig {
            enabled: true,
            ..TelemetryStreamConfig::default()
        };
        let stream = tokio::spawn(run_telemetry_stream(Arc::clone(&ctx), analog, comm, config));

        let started = Instant::now();
        let envelope = comm_rx.recv().await.unwrap();
        assert!(started.elapsed() >= config.period());
        assert_eq!(envelope.command_id, COMM_DOWNLINK);
        assert_eq!(&envelope.payload[..2], &[0x1F, 0x7F]);
        assert_eq!(&envelope.payload[envelope.payload.len() - 2..], &[0x1F, 0xFF]);

        stream.abort();
    }
}
