pub mod adcs;
pub mod comms;
pub mod payload;
pub mod power;

pub use adcs::{Adcs, AdcsState};
pub use comms::{run_link_poller, Comms, CommsCommand, CommsState};
pub use payload::{Payload, PayloadState};
pub use power::{Power, PowerCommand, PowerState};

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::context::FlightContext;
use crate::health::{report_health, requested_mode, SubsystemMode};
use crate::protocol::{CommandError, Destination, Envelope, PayloadBuffer};
use crate::queue::DataQueue;
use crate::telemetry::{transmit_with_retry, RetryPolicy, TelemetrySink};

/// Command ids common to every subsystem manager.
pub const REPORT_HEALTH: u8 = 0x01;
pub const CHANGE_MODE: u8 = 0x02;

/// What the manager should do after a subsystem command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    None,
    Transmit(PayloadBuffer),
}

/// A module behind a [`SubsystemManager`].
///
/// Health reports and mode changes are handled by the manager; the subsystem
/// only sees its own extra command ids.
pub trait Subsystem: Send + 'static {
    type State: Clone + Serialize;
    type Command: Clone;

    const ID: Destination;

    /// Maps an envelope with a subsystem-specific id onto a typed command.
    fn decode(&self, envelope: &Envelope) -> Result<Self::Command, CommandError>;
    fn execute_command(&mut self, command: Self::Command) -> Result<Action, CommandError>;
    fn get_state(&self) -> Self::State;

    /// Hook for hardware actions on a mode change.
    fn on_mode_change(&mut self, mode: SubsystemMode) {
        debug!(subsystem = %Self::ID, ?mode, "mode hook");
    }
}

pub(crate) fn unknown_command(destination: Destination, envelope: &Envelope) -> CommandError {
    CommandError::UnknownCommand {
        destination,
        command_id: envelope.command_id,
    }
}

/// Receive loop around one subsystem: ids 1 and 2 here, the rest delegated.
pub struct SubsystemManager<S: Subsystem> {
    subsystem: S,
    ctx: Arc<FlightContext>,
    sink: Arc<dyn TelemetrySink>,
    retry: RetryPolicy,
    housekeeping: Option<DataQueue>,
}

impl<S: Subsystem> SubsystemManager<S> {
    pub fn new(subsystem: S, ctx: Arc<FlightContext>, sink: Arc<dyn TelemetrySink>, retry: RetryPolicy) -> Self {
        Self {
            subsystem,
            ctx,
            sink,
            retry,
            housekeeping: None,
        }
    }

    pub fn with_housekeeping(mut self, queue: DataQueue) -> Self {
        self.housekeeping = Some(queue);
        self
    }

    pub fn subsystem(&self) -> &S {
        &self.subsystem
    }

    pub async fn handle(&mut self, envelope: &Envelope) -> Result<(), CommandError> {
        let status = self.ctx.status(S::ID);
        match envelope.command_id {
            REPORT_HEALTH => {
                report_health(S::ID, status, self.sink.as_ref(), self.retry, self.housekeeping.as_ref())
                    .await?;
            }
            CHANGE_MODE => {
                let mode = requested_mode(envelope)?;
                status.set_mode(mode);
                self.subsystem.on_mode_change(mode);
                info!(subsystem = %S::ID, ?mode, "mode changed");
            }
            _ => {
                let command = self.subsystem.decode(envelope)?;
                if let Action::Transmit(bytes) = self.subsystem.execute_command(command)? {
                    if let Err(e) = transmit_with_retry(self.sink.as_ref(), &bytes, self.retry).await {
                        status.flag(crate::health::ERROR_TX);
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn run(mut self, mut input: mpsc::Receiver<Envelope>) {
        info!(subsystem = %S::ID, "subsystem manager started");
        while let Some(envelope) = input.recv().await {
            if let Err(e) = self.handle(&envelope).await {
                self.ctx.status(S::ID).flag(e.health_flag());
                warn!(subsystem = %S::ID, error = %e, "command rejected");
            }
        }
        info!(subsystem = %S::ID, "subsystem input closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{ERROR_CMDINV, ERROR_TX};
    use crate::queue::bounded;
    use crate::telemetry::MemorySink;

    fn manager<S: Subsystem>(subsystem: S) -> (SubsystemManager<S>, Arc<FlightContext>, Arc<MemorySink>) {
        let ctx = Arc::new(FlightContext::new());
        ctx.status(S::ID).set_mode(SubsystemMode::On);
        let sink = Arc::new(MemorySink::new());
        let manager = SubsystemManager::new(subsystem, Arc::clone(&ctx), sink.clone(), RetryPolicy::default());
        (manager, ctx, sink)
    }

    #[tokio::test]
    async fn test_health_report_transmits_mode_and_msv() {
        let (manager, ctx, sink) = manager(Power::new());
        let (data, mut data_rx) = bounded("hk-data", 6).unwrap();
        let mut manager = manager.with_housekeeping(data);
        ctx.status(Destination::Power).flag(ERROR_CMDINV);

        manager.handle(&Envelope::new(Destination::Power, REPORT_HEALTH)).await.unwrap();

        assert_eq!(sink.frames()[0].bytes, vec![1, ERROR_CMDINV]);
        let posted = data_rx.recv().await.unwrap();
        assert_eq!(posted.source, Destination::Power.address());
        assert_eq!(posted.data, ERROR_CMDINV);
    }

    #[tokio::test]
    async fn test_mode_change_updates_status() {
        let (mut manager, ctx, _sink) = manager(Adcs::new());
        manager
            .handle(&Envelope::new(Destination::Adcs, CHANGE_MODE).with_param(2))
            .await
            .unwrap();
        assert_eq!(ctx.status(Destination::Adcs).mode(), SubsystemMode::Safe as u8);
        assert_eq!(manager.subsystem().get_state().mode, SubsystemMode::Safe);
    }

    #[tokio::test]
    async fn test_invalid_mode_is_rejected() {
        let (mut manager, ctx, _sink) = manager(Payload::new());
        let result = manager
            .handle(&Envelope::new(Destination::Payload, CHANGE_MODE).with_param(4))
            .await;
        assert_eq!(result, Err(CommandError::InvalidMode(4)));
        assert_eq!(ctx.status(Destination::Payload).mode(), SubsystemMode::On as u8);
    }

    #[tokio::test]
    async fn test_unknown_command_flags_and_loop_continues() {
        let (manager, ctx, sink) = manager(Adcs::new());
        let (queue, rx) = bounded("adcs", 6).unwrap();
        let handle = tokio::spawn(manager.run(rx));

        queue.try_send(Envelope::new(Destination::Adcs, 0x42)).unwrap();
        queue.try_send(Envelope::new(Destination::Adcs, REPORT_HEALTH)).unwrap();
        drop(queue);
        handle.await.unwrap();

        assert!(ctx.status(Destination::Adcs).has(ERROR_CMDINV));
        // The report after the bad command still went out, carrying the flag.
        assert_eq!(sink.frames()[0].bytes, vec![1, ERROR_CMDINV]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_sink_flags_tx_error() {
        let (mut manager, ctx, sink) = manager(Comms::new());
        sink.busy_for(u32::MAX);

        let result = manager
            .handle(&Envelope::new(Destination::Comm, comms::COMM_NOTIFY).with_param(2))
            .await;
        assert!(matches!(result, Err(CommandError::Output(_))));
        assert!(ctx.status(Destination::Comm).has(ERROR_TX));
    }
}
