use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::context::FlightContext;
use crate::protocol::{first_param, CommandError, Destination, Envelope, HealthData};
use crate::queue::{CommandQueue, DataQueue};
use crate::subsystems::comms::COMM_NOTIFY;

pub const MODES_REPORT_HEALTH: u8 = 0x01;
pub const MODES_EVENT: u8 = 0x03;

/// Satellite-wide operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SatelliteMode {
    Detumbling = 0,
    Safe = 1,
    Nominal = 2,
    Link = 3,
    Erp = 4,
}

impl SatelliteMode {
    pub const ALL: [SatelliteMode; 5] = [
        SatelliteMode::Detumbling,
        SatelliteMode::Safe,
        SatelliteMode::Nominal,
        SatelliteMode::Link,
        SatelliteMode::Erp,
    ];

    /// Byte sent on the notification side channel when this mode is entered.
    pub const fn notification_code(self) -> u8 {
        self as u8 + 1
    }

    fn from_raw(value: u8) -> Self {
        match value {
            1 => SatelliteMode::Safe,
            2 => SatelliteMode::Nominal,
            3 => SatelliteMode::Link,
            4 => SatelliteMode::Erp,
            _ => SatelliteMode::Detumbling,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModeEvent {
    RequestSafe = 0,
    RequestNominal = 1,
    RequestLink = 2,
    RequestErp = 3,
}

impl ModeEvent {
    pub const ALL: [ModeEvent; 4] = [
        ModeEvent::RequestSafe,
        ModeEvent::RequestNominal,
        ModeEvent::RequestLink,
        ModeEvent::RequestErp,
    ];

    /// The modes-queue envelope that raises this event.
    pub fn envelope(self) -> Envelope {
        Envelope::new(Destination::Modes, MODES_EVENT).with_param(self as u32)
    }
}

impl TryFrom<u32> for ModeEvent {
    type Error = CommandError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ModeEvent::RequestSafe),
            1 => Ok(ModeEvent::RequestNominal),
            2 => Ok(ModeEvent::RequestLink),
            3 => Ok(ModeEvent::RequestErp),
            other => Err(CommandError::InvalidEvent(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Ignore,
    Enter(SatelliteMode),
}

/// The mode transition table. Every (state, event) pair has an entry.
pub const fn transition(state: SatelliteMode, event: ModeEvent) -> Transition {
    use ModeEvent::*;
    use SatelliteMode::*;
    use Transition::*;

    match state {
        Detumbling => match event {
            RequestSafe => Enter(Safe),
            RequestNominal => Ignore,
            RequestLink => Ignore,
            RequestErp => Enter(Erp),
        },
        Safe => match event {
            RequestSafe => Ignore,
            RequestNominal => Enter(Nominal),
            RequestLink => Ignore,
            RequestErp => Enter(Erp),
        },
        Nominal => match event {
            RequestSafe => Enter(Safe),
            RequestNominal => Ignore,
            RequestLink => Enter(Link),
            RequestErp => Enter(Erp),
        },
        Link => match event {
            RequestSafe => Enter(Safe),
            RequestNominal => Enter(Nominal),
            RequestLink => Ignore,
            RequestErp => Enter(Erp),
        },
        Erp => match event {
            RequestSafe => Enter(Safe),
            RequestNominal => Ignore,
            RequestLink => Ignore,
            RequestErp => Ignore,
        },
    }
}

/// Atomically readable satellite mode.
#[derive(Debug)]
pub struct ModeCell(AtomicU8);

impl ModeCell {
    pub fn new(mode: SatelliteMode) -> Self {
        Self(AtomicU8::new(mode as u8))
    }

    pub fn get(&self) -> SatelliteMode {
        SatelliteMode::from_raw(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, mode: SatelliteMode) {
        self.0.store(mode as u8, Ordering::SeqCst);
    }
}

/// Consumer of the modes command queue; the only writer of the satellite mode.
#[derive(Debug)]
pub struct ModesManager {
    ctx: Arc<FlightContext>,
    dispatcher: Option<CommandQueue>,
    housekeeping: Option<DataQueue>,
}

impl ModesManager {
    pub fn new(ctx: Arc<FlightContext>) -> Self {
        Self {
            ctx,
            dispatcher: None,
            housekeeping: None,
        }
    }

    /// Where transition notifications are submitted.
    pub fn with_dispatcher(mut self, queue: CommandQueue) -> Self {
        self.dispatcher = Some(queue);
        self
    }

    pub fn with_housekeeping(mut self, queue: DataQueue) -> Self {
        self.housekeeping = Some(queue);
        self
    }

    pub fn handle(&self, envelope: &Envelope) -> Result<Option<SatelliteMode>, CommandError> {
        match envelope.command_id {
            MODES_REPORT_HEALTH => {
                self.report_health();
                Ok(None)
            }
            MODES_EVENT => {
                let event = ModeEvent::try_from(first_param(envelope)?)?;
                Ok(self.apply(event))
            }
            command_id => Err(CommandError::UnknownCommand {
                destination: Destination::Modes,
                command_id,
            }),
        }
    }

    /// Runs `event` through the transition table; returns the mode entered, if any.
    pub fn apply(&self, event: ModeEvent) -> Option<SatelliteMode> {
        let current = self.ctx.satellite_mode.get();
        match transition(current, event) {
            Transition::Ignore => {
                debug!(?current, ?event, "mode event ignored");
                None
            }
            Transition::Enter(next) => {
                self.ctx.satellite_mode.set(next);
                info!(from = ?current, to = ?next, "satellite mode transition");
                self.notify(next);
                Some(next)
            }
        }
    }

    fn notify(&self, mode: SatelliteMode) {
        let Some(dispatcher) = &self.dispatcher else {
            return;
        };
        let notification =
            Envelope::new(Destination::Comm, COMM_NOTIFY).with_param(u32::from(mode.notification_code()));
        if let Err(e) = dispatcher.try_send(notification) {
            debug!(error = %e, ?mode, "mode notification dropped");
        }
    }

    fn report_health(&self) {
        let msv = self.ctx.status(Destination::Modes).msv();
        match &self.housekeeping {
            Some(queue) => {
                if let Err(e) = queue.try_send(HealthData::health_status(Destination::Modes, msv)) {
                    warn!(error = %e, "modes health data not posted");
                }
            }
            None => warn!("modes health report without a housekeeping queue"),
        }
    }

    pub async fn run(self, mut input: mpsc::Receiver<Envelope>) {
        info!("modes manager started");
        while let Some(envelope) = input.recv().await {
            if let Err(e) = self.handle(&envelope) {
                self.ctx.status(Destination::Modes).flag(e.health_flag());
                warn!(error = %e, "modes command rejected");
            }
        }
        info!("modes input closed");
    }
}

/// Advances the satellite mode on elapsed-time deadlines.
///
/// ERP is left once the satellite has spent an ERP dwell there and the health
/// table shows no module in error.
pub async fn run_supervisor(ctx: Arc<FlightContext>, modes: CommandQueue, config: SupervisorConfig) {
    info!("mode supervisor started");
    loop {
        let observed = ctx.satellite_mode.get();
        let request = match observed {
            SatelliteMode::Detumbling => {
                time::sleep(config.detumble_delay()).await;
                Some(ModeEvent::RequestSafe)
            }
            SatelliteMode::Safe | SatelliteMode::Link => {
                time::sleep(config.idle_poll()).await;
                None
            }
            SatelliteMode::Nominal => {
                time::sleep(config.nominal_dwell()).await;
                Some(ModeEvent::RequestLink)
            }
            SatelliteMode::Erp => {
                time::sleep(config.erp_dwell()).await;
                if ctx.health.any_error() {
                    debug!("ERP held: module health in error");
                    None
                } else {
                    Some(ModeEvent::RequestSafe)
                }
            }
        };

        if let Some(event) = request {
            // Only act on the mode the wait was for.
            if ctx.satellite_mode.get() != observed {
                continue;
            }
            debug!(?event, "supervisor mode request");
            if let Err(e) = modes.try_send(event.envelope()) {
                warn!(error = %e, ?event, "supervisor request dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{bounded, command_queue};

    #[test]
    fn test_transition_table_is_total() {
        let mut entered = 0;
        let mut ignored = 0;
        for state in SatelliteMode::ALL {
            for event in ModeEvent::ALL {
                match transition(state, event) {
                    Transition::Enter(_) => entered += 1,
                    Transition::Ignore => ignored += 1,
                }
            }
        }
        assert_eq!(entered + ignored, 20);
        assert_eq!(entered, 11);
        assert_eq!(ignored, 9);
    }

    #[test]
    fn test_transition_examples() {
        assert_eq!(
            transition(SatelliteMode::Nominal, ModeEvent::RequestLink),
            Transition::Enter(SatelliteMode::Link)
        );
        assert_eq!(
            transition(SatelliteMode::Link, ModeEvent::RequestSafe),
            Transition::Enter(SatelliteMode::Safe)
        );
        for event in [ModeEvent::RequestNominal, ModeEvent::RequestLink, ModeEvent::RequestErp] {
            assert_eq!(transition(SatelliteMode::Erp, event), Transition::Ignore);
        }
        for state in SatelliteMode::ALL {
            if state != SatelliteMode::Erp {
                assert_eq!(
                    transition(state, ModeEvent::RequestErp),
                    Transition::Enter(SatelliteMode::Erp)
                );
            }
        }
    }

    #[test]
    fn test_notification_codes() {
        assert_eq!(SatelliteMode::Safe.notification_code(), 2);
        assert_eq!(SatelliteMode::Nominal.notification_code(), 3);
        assert_eq!(SatelliteMode::Link.notification_code(), 4);
        assert_eq!(SatelliteMode::Erp.notification_code(), 5);
    }

    #[test]
    fn test_manager_applies_events_and_notifies() {
        let ctx = Arc::new(FlightContext::new());
        let (dispatcher, mut notifications) = command_queue("cdh", 6).unwrap();
        let manager = ModesManager::new(Arc::clone(&ctx)).with_dispatcher(dispatcher);

        let entered = manager.handle(&ModeEvent::RequestSafe.envelope()).unwrap();
        assert_eq!(entered, Some(SatelliteMode::Safe));
        assert_eq!(ctx.satellite_mode.get(), SatelliteMode::Safe);

        let notification = notifications.try_recv().unwrap();
        assert_eq!(notification.destination(), Ok(Destination::Comm));
        assert_eq!(notification.command_id, COMM_NOTIFY);
        assert_eq!(notification.param(0), Some(2));

        // Ignored events neither change the mode nor notify.
        assert_eq!(manager.handle(&ModeEvent::RequestSafe.envelope()).unwrap(), None);
        assert!(notifications.try_recv().is_err());
    }

    #[test]
    fn test_manager_rejects_bad_commands() {
        let ctx = Arc::new(FlightContext::new());
        let manager = ModesManager::new(Arc::clone(&ctx));

        let bad_event = Envelope::new(Destination::Modes, MODES_EVENT).with_param(7);
        assert_eq!(manager.handle(&bad_event), Err(CommandError::InvalidEvent(7)));

        let missing = Envelope::new(Destination::Modes, MODES_EVENT);
        assert_eq!(
            manager.handle(&missing),
            Err(CommandError::MissingParameter(MODES_EVENT))
        );

        let unknown = Envelope::new(Destination::Modes, 9);
        assert!(matches!(
            manager.handle(&unknown),
            Err(CommandError::UnknownCommand { command_id: 9, .. })
        ));
        assert_eq!(ctx.satellite_mode.get(), SatelliteMode::Detumbling);
    }

    #[test]
    fn test_manager_health_goes_to_housekeeping() {
        let ctx = Arc::new(FlightContext::new());
        ctx.status(Destination::Modes).flag(crate::health::ERROR_CMDINV);
        let (data, mut data_rx) = bounded("hk-data", 6).unwrap();
        let manager = ModesManager::new(Arc::clone(&ctx)).with_housekeeping(data);

        manager
            .handle(&Envelope::new(Destination::Modes, MODES_REPORT_HEALTH))
            .unwrap();
        let report = data_rx.try_recv().unwrap();
        assert_eq!(report.source, Destination::Modes.address());
        assert_eq!(report.data, crate::health::ERROR_CMDINV);
    }
}
