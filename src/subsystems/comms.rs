use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time;
use tracing::{debug, info, trace, warn};

use super::{unknown_command, Action, Subsystem};
use crate::context::FlightContext;
use crate::health::SubsystemMode;
use crate::modes::SatelliteMode;
use crate::protocol::{first_param, CommandError, Destination, Envelope, PayloadBuffer};
use crate::queue::CommandQueue;

/// Transmit the single byte in `params[0]`.
pub const COMM_NOTIFY: u8 = 0x03;
/// Answer a telemetry request named by `params[0]`.
pub const COMM_TELEMETRY_REQUEST: u8 = 0x04;
/// Downlink the envelope payload.
pub const COMM_DOWNLINK: u8 = 0x05;

pub const TLM_TRANSFER_REQUEST_ACK: u32 = 0x80;
pub const TLM_TELECOMMAND_ACK: u32 = 0x82;

/// Value the link poller sends while a pass may be in progress.
pub const LINK_TRANSFER_REQUEST: u32 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommsState {
    pub mode: SubsystemMode,
    pub frames_sent: u32,
    pub notifications: u32,
    pub last_notification: Option<u8>,
    /// Commands handled since the last telecommand acknowledge.
    pub processed_since_ack: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommsCommand {
    Notify(u8),
    TelemetryRequest(u32),
    Downlink(PayloadBuffer),
}

/// Telecom subsystem stub: every output goes through the telemetry sink.
#[derive(Debug)]
pub struct Comms {
    state: CommsState,
}

impl Comms {
    pub fn new() -> Self {
        Self {
            state: CommsState {
                mode: SubsystemMode::On,
                frames_sent: 0,
                notifications: 0,
                last_notification: None,
                processed_since_ack: 0,
            },
        }
    }

    fn transmit(&mut self, bytes: &[u8]) -> Action {
        self.state.frames_sent += 1;
        // Frames are bounded by the envelope payload capacity.
        Action::Transmit(PayloadBuffer::from_slice(bytes).unwrap_or_default())
    }
}

impl Default for Comms {
    fn default() -> Self {
        Self::new()
    }
}

impl Subsystem for Comms {
    type State = CommsState;
    type Command = CommsCommand;

    const ID: Destination = Destination::Comm;

    fn decode(&self, envelope: &Envelope) -> Result<CommsCommand, CommandError> {
        match envelope.command_id {
            // Only the low byte of the parameter goes out on the wire.
            COMM_NOTIFY => Ok(CommsCommand::Notify((first_param(envelope)? & 0xFF) as u8)),
            COMM_TELEMETRY_REQUEST => Ok(CommsCommand::TelemetryRequest(first_param(envelope)?)),
            COMM_DOWNLINK => Ok(CommsCommand::Downlink(envelope.payload.clone())),
            _ => Err(unknown_command(Self::ID, envelope)),
        }
    }

    fn execute_command(&mut self, command: CommsCommand) -> Result<Action, CommandError> {
        self.state.processed_since_ack = self.state.processed_since_ack.saturating_add(1);
        match command {
            CommsCommand::Notify(code) => {
                self.state.notifications += 1;
                self.state.last_notification = Some(code);
                trace!(code, "notification");
                Ok(self.transmit(&[code]))
            }
            CommsCommand::TelemetryRequest(TLM_TRANSFER_REQUEST_ACK) => {
                debug!("transfer request acknowledged, no new data");
                Ok(Action::None)
            }
            CommsCommand::TelemetryRequest(TLM_TELECOMMAND_ACK) => {
                let processed = self.state.processed_since_ack;
                self.state.processed_since_ack = 0;
                Ok(self.transmit(&[1, processed, 0]))
            }
            CommsCommand::TelemetryRequest(other) => Err(CommandError::UnknownTelemetry(other)),
            CommsCommand::Downlink(bytes) => {
                debug!(len = bytes.len(), "downlink frame");
                Ok(self.transmit(&bytes))
            }
        }
    }

    fn get_state(&self) -> CommsState {
        self.state.clone()
    }

    fn on_mode_change(&mut self, mode: SubsystemMode) {
        self.state.mode = mode;
    }
}

/// While the satellite is in Safe or Link, submits a transfer request to the
/// dispatcher once per `period`.
pub async fn run_link_poller(ctx: Arc<FlightContext>, dispatcher: CommandQueue, period: Duration) {
    info!(?period, "link poller started");
    loop {
        time::sleep(period).await;
        let mode = ctx.satellite_mode.get();
        if !matches!(mode, SatelliteMode::Safe | SatelliteMode::Link) {
            continue;
        }
        let request = Envelope::new(Destination::Comm, COMM_NOTIFY).with_param(LINK_TRANSFER_REQUEST);
        if let Err(e) = dispatcher.try_send(request) {
            warn!(error = %e, "link poll dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::command_queue;

    fn run(comms: &mut Comms, envelope: &Envelope) -> Result<Action, CommandError> {
        let command = comms.decode(envelope)?;
        comms.execute_command(command)
    }

    fn bytes(action: Action) -> Vec<u8> {
        match action {
            Action::Transmit(bytes) => bytes.to_vec(),
            Action::None => Vec::new(),
        }
    }

    #[test]
    fn test_notify_transmits_code() {
        let mut comms = Comms::new();
        let action = run(&mut comms, &Envelope::new(Destination::Comm, COMM_NOTIFY).with_param(4)).unwrap();
        assert_eq!(bytes(action), vec![4]);
        assert_eq!(comms.get_state().last_notification, Some(4));
    }

    #[test]
    fn test_telecommand_ack_counts_processed() {
        let mut comms = Comms::new();
        run(&mut comms, &Envelope::new(Destination::Comm, COMM_NOTIFY).with_param(2)).unwrap();

        let ack = Envelope::new(Destination::Comm, COMM_TELEMETRY_REQUEST).with_param(TLM_TELECOMMAND_ACK);
        assert_eq!(bytes(run(&mut comms, &ack).unwrap()), vec![1, 2, 0]);
        // Counter restarts after each acknowledge.
        assert_eq!(bytes(run(&mut comms, &ack).unwrap()), vec![1, 1, 0]);
    }

    #[test]
    fn test_transfer_request_is_noop() {
        let mut comms = Comms::new();
        let request = Envelope::new(Destination::Comm, COMM_TELEMETRY_REQUEST).with_param(TLM_TRANSFER_REQUEST_ACK);
        assert_eq!(run(&mut comms, &request), Ok(Action::None));
    }

    #[test]
    fn test_unknown_telemetry_request() {
        let mut comms = Comms::new();
        let request = Envelope::new(Destination::Comm, COMM_TELEMETRY_REQUEST).with_param(0x90);
        assert_eq!(run(&mut comms, &request), Err(CommandError::UnknownTelemetry(0x90)));
    }

    #[test]
    fn test_downlink_sends_payload() {
        let mut comms = Comms::new();
        let frame = [0x1F, 0x7F, 0x1F, 0xFF];
        let envelope = Envelope::new(Destination::Comm, COMM_DOWNLINK).with_payload(&frame).unwrap();
        assert_eq!(bytes(run(&mut comms, &envelope).unwrap()), frame.to_vec());
        assert_eq!(comms.get_state().frames_sent, 1);
    }

    #[test]
    fn test_notify_requires_parameter() {
        let mut comms = Comms::new();
        assert_eq!(
            run(&mut comms, &Envelope::new(Destination::Comm, COMM_NOTIFY)),
            Err(CommandError::MissingParameter(COMM_NOTIFY))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_poller_only_polls_in_safe_or_link() {
        let ctx = Arc::new(FlightContext::new());
        let (dispatcher, mut rx) = command_queue("cdh", 6).unwrap();
        let poller = tokio::spawn(run_link_poller(Arc::clone(&ctx), dispatcher, Duration::from_secs(1)));

        // Detumbling: no polls.
        time::sleep(Duration::from_millis(2500)).await;
        assert!(rx.try_recv().is_err());

        ctx.satellite_mode.set(SatelliteMode::Link);
        let request = rx.recv().await.unwrap();
        assert_eq!(request.destination(), Ok(Destination::Comm));
        assert_eq!(request.command_id, COMM_NOTIFY);
        assert_eq!(request.param(0), Some(LINK_TRANSFER_REQUEST));

        poller.abort();
    }
}
