use core::fmt;

use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::{assert_impl_all, const_assert};
use thiserror::Error;

use crate::telemetry::SinkError;

/// Maximum number of parameters carried by a single envelope.
pub const PARAM_CAPACITY: usize = 1;
/// Maximum number of envelopes held in a single diary.
pub const DIARY_CAPACITY: usize = 4;
/// Maximum size of the opaque byte payload (telemetry frames travel here).
pub const MAX_PAYLOAD_SIZE: usize = 64;
/// Maximum size of a JSON uplink line accepted by [`parse_uplink`].
pub const MAX_UPLINK_SIZE: usize = 1024;

/// Data type tag for health status updates on the housekeeping data queue.
pub const HEALTH_STATUS: u8 = 1;

const_assert!(PARAM_CAPACITY >= 1);
const_assert!(DIARY_CAPACITY == 4);

/// Onboard time in seconds since the mission epoch.
pub type ObcTime = u64;

pub type Parameters = Vec<u32, PARAM_CAPACITY>;
pub type PayloadBuffer = Vec<u8, MAX_PAYLOAD_SIZE>;

/// Addressable modules of the flight software.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Destination {
    Adcs = 1,
    Cdh = 2,
    Comm = 3,
    Filesystem = 4,
    Housekeeping = 5,
    Modes = 6,
    Payload = 7,
    Power = 8,
}

/// Number of addressable modules.
pub const DESTINATION_COUNT: usize = 8;

impl Destination {
    pub const ALL: [Destination; DESTINATION_COUNT] = [
        Destination::Adcs,
        Destination::Cdh,
        Destination::Comm,
        Destination::Filesystem,
        Destination::Housekeeping,
        Destination::Modes,
        Destination::Payload,
        Destination::Power,
    ];

    pub const fn address(self) -> u8 {
        self as u8
    }

    /// Zero-based position in [`Destination::ALL`].
    pub const fn index(self) -> usize {
        self as usize - 1
    }

    pub const fn name(self) -> &'static str {
        match self {
            Destination::Adcs => "adcs",
            Destination::Cdh => "cdh",
            Destination::Comm => "comm",
            Destination::Filesystem => "filesystem",
            Destination::Housekeeping => "housekeeping",
            Destination::Modes => "modes",
            Destination::Payload => "payload",
            Destination::Power => "power",
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for Destination {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Destination::ALL
            .iter()
            .copied()
            .find(|d| d.address() == value)
            .ok_or(ProtocolError::UnknownDestination(value))
    }
}

impl From<Destination> for u8 {
    fn from(value: Destination) -> Self {
        value.address()
    }
}

/// The routed command message.
///
/// `destination` is kept as the raw address byte so that a malformed uplink can
/// still be represented, flagged and rejected by the dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Envelope {
    pub destination: u8,
    pub command_id: u8,
    pub parameters: Parameters,
    /// Absolute onboard time the command becomes due; 0 means immediately.
    pub execute_at: ObcTime,
    /// Remaining periodic re-executions (0 = one-shot).
    pub reschedule_count: u8,
    /// Set once the dispatcher has routed or handled the command.
    pub processed: bool,
    /// Set on a command the dispatcher refused.
    pub error: bool,
    pub payload: PayloadBuffer,
}

assert_impl_all!(Envelope: Send, Sync, Clone);

impl Envelope {
    pub fn new(destination: Destination, command_id: u8) -> Self {
        Self::raw(destination.address(), command_id)
    }

    /// Builds an envelope for an arbitrary address byte.
    pub fn raw(destination: u8, command_id: u8) -> Self {
        Self {
            destination,
            command_id,
            ..Self::default()
        }
    }

    /// Appends a parameter. Parameters beyond [`PARAM_CAPACITY`] are discarded;
    /// use [`Envelope::push_param`] when the overflow must be observed.
    #[must_use]
    pub fn with_param(mut self, value: u32) -> Self {
        let _ = self.push_param(value);
        self
    }

    #[must_use]
    pub fn due_at(mut self, execute_at: ObcTime) -> Self {
        self.execute_at = execute_at;
        self
    }

    #[must_use]
    pub fn repeated(mut self, reschedule_count: u8) -> Self {
        self.reschedule_count = reschedule_count;
        self
    }

    pub fn with_payload(mut self, bytes: &[u8]) -> Result<Self, ProtocolError> {
        self.payload = PayloadBuffer::from_slice(bytes)
            .map_err(|()| ProtocolError::PayloadTooLarge(bytes.len()))?;
        Ok(self)
    }

    pub fn push_param(&mut self, value: u32) -> Result<(), ProtocolError> {
        self.parameters
            .push(value)
            .map_err(|_| ProtocolError::TooManyParameters)
    }

    pub fn param(&self, index: usize) -> Option<u32> {
        self.parameters.get(index).copied()
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters.len()
    }

    pub fn destination(&self) -> Result<Destination, ProtocolError> {
        Destination::try_from(self.destination)
    }

    pub fn is_immediate(&self) -> bool {
        self.execute_at == 0
    }
}

/// A fixed-size batch of envelopes dispatched in sequence order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diary {
    entries: Vec<Envelope, DIARY_CAPACITY>,
}

impl Diary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<I>(entries: I) -> Result<Self, ProtocolError>
    where
        I: IntoIterator<Item = Envelope>,
    {
        let mut diary = Self::new();
        for entry in entries {
            diary.push(entry)?;
        }
        Ok(diary)
    }

    pub fn push(&mut self, entry: Envelope) -> Result<(), ProtocolError> {
        self.entries.push(entry).map_err(|_| ProtocolError::DiaryFull)
    }

    pub fn entries(&self) -> &[Envelope] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Data passed from a module to the housekeeping data queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthData {
    pub source: u8,
    pub data_type: u8,
    pub data: u8,
}

impl HealthData {
    pub fn health_status(source: Destination, msv: u8) -> Self {
        Self {
            source: source.address(),
            data_type: HEALTH_STATUS,
            data: msv,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LogKind {
    Command = 1,
    Telemetry = 2,
    Error = 3,
}

/// Shape of a persistence log record. Nothing in this crate writes it to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: ObcTime,
    pub kind: LogKind,
    pub source: u8,
    pub id: u8,
}

impl LogEntry {
    pub fn for_command(envelope: &Envelope, now: ObcTime) -> Self {
        Self {
            time: now,
            kind: LogKind::Command,
            source: envelope.destination,
            id: envelope.command_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    /// Routed to its destination or handled locally.
    Acknowledged,
    /// Deferred into the command schedule.
    Scheduled,
    /// Refused; `reason` says why.
    NegativeAck,
}

/// Acknowledgement emitted by the dispatcher toward the command source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub destination: u8,
    pub command_id: u8,
    pub timestamp: ObcTime,
    pub status: ResponseStatus,
    pub reason: Option<String>,
    /// Status bits of the envelope as the dispatcher left it.
    #[serde(default)]
    pub processed: bool,
    #[serde(default)]
    pub error: bool,
}

impl CommandResponse {
    pub fn new(
        destination: u8,
        command_id: u8,
        timestamp: ObcTime,
        status: ResponseStatus,
        reason: Option<String>,
    ) -> Self {
        Self {
            destination,
            command_id,
            timestamp,
            status,
            reason,
            processed: false,
            error: false,
        }
    }

    /// Acknowledges `envelope`, echoing its processed and error bits.
    pub fn for_envelope(
        envelope: &Envelope,
        timestamp: ObcTime,
        status: ResponseStatus,
        reason: Option<String>,
    ) -> Self {
        Self {
            processed: envelope.processed,
            error: envelope.error,
            ..Self::new(envelope.destination, envelope.command_id, timestamp, status, reason)
        }
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self.status, ResponseStatus::NegativeAck)
    }
}

/// Messages accepted from the terminal front end, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Uplink {
    Command(Envelope),
    Diary(Diary),
}

pub fn parse_uplink(line: &str) -> Result<Uplink, ProtocolError> {
    if line.len() > MAX_UPLINK_SIZE {
        return Err(ProtocolError::MessageTooLarge(line.len()));
    }
    serde_json::from_str(line).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown destination address {0}")]
    UnknownDestination(u8),
    #[error("envelope parameter capacity ({max}) exceeded", max = PARAM_CAPACITY)]
    TooManyParameters,
    #[error("payload of {0} bytes exceeds {max}", max = MAX_PAYLOAD_SIZE)]
    PayloadTooLarge(usize),
    #[error("diary capacity ({max}) exceeded", max = DIARY_CAPACITY)]
    DiaryFull,
    #[error("uplink of {0} bytes exceeds {max}", max = MAX_UPLINK_SIZE)]
    MessageTooLarge(usize),
    #[error("invalid uplink JSON: {0}")]
    InvalidJson(String),
}

/// Failure while executing a command inside a module.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown command {command_id:#04x} for {destination}")]
    UnknownCommand {
        destination: Destination,
        command_id: u8,
    },
    #[error("command {0:#04x} requires a parameter")]
    MissingParameter(u8),
    #[error("invalid module mode {0}")]
    InvalidMode(u32),
    #[error("invalid mode event {0}")]
    InvalidEvent(u32),
    #[error("unknown telemetry request {0:#04x}")]
    UnknownTelemetry(u32),
    #[error("unknown health data source {0}")]
    UnknownSource(u8),
    #[error("telemetry output failed: {0}")]
    Output(#[from] SinkError),
}

impl CommandError {
    /// MSV bit the owning module raises for this failure.
    pub fn health_flag(&self) -> u8 {
        match self {
            CommandError::Output(_) => crate::health::ERROR_TX,
            _ => crate::health::ERROR_CMDINV,
        }
    }
}

/// Returns the first parameter or the missing-parameter error for `envelope`.
pub fn first_param(envelope: &Envelope) -> Result<u32, CommandError> {
    envelope
        .param(0)
        .ok_or(CommandError::MissingParameter(envelope.command_id))
}
