use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::protocol::{
    first_param, CommandError, Destination, Envelope, HealthData, DESTINATION_COUNT,
};
use crate::queue::DataQueue;
use crate::telemetry::{transmit_with_retry, RetryPolicy, SinkError, TelemetrySink};

// Module status value (MSV) bits. Flags accumulate until a module is reset.
pub const ERROR_INIT: u8 = 0x01;
pub const ERROR_CMDINV: u8 = 0x02;
pub const ERROR_QUEUE_FULL: u8 = 0x04;
pub const ERROR_SCHEDULE: u8 = 0x08;
pub const ERROR_TX: u8 = 0x10;

/// Operating mode of an individual module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SubsystemMode {
    Off = 0,
    On = 1,
    Safe = 2,
    Erp = 3,
}

impl TryFrom<u32> for SubsystemMode {
    type Error = CommandError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SubsystemMode::Off),
            1 => Ok(SubsystemMode::On),
            2 => Ok(SubsystemMode::Safe),
            3 => Ok(SubsystemMode::Erp),
            other => Err(CommandError::InvalidMode(other)),
        }
    }
}

/// Parses the mode requested by a change-mode command.
pub fn requested_mode(envelope: &Envelope) -> Result<SubsystemMode, CommandError> {
    SubsystemMode::try_from(first_param(envelope)?)
}

/// Mode and MSV of one module, shared between its task and observers.
#[derive(Debug)]
pub struct ModuleStatus {
    mode: AtomicU8,
    msv: AtomicU8,
}

impl ModuleStatus {
    /// A module that has not been initialised yet.
    pub fn new() -> Self {
        Self {
            mode: AtomicU8::new(SubsystemMode::Off as u8),
            msv: AtomicU8::new(0),
        }
    }

    pub fn mode(&self) -> u8 {
        self.mode.load(Ordering::SeqCst)
    }

    pub fn set_mode(&self, mode: SubsystemMode) {
        self.mode.store(mode as u8, Ordering::SeqCst);
    }

    pub fn msv(&self) -> u8 {
        self.msv.load(Ordering::SeqCst)
    }

    pub fn flag(&self, bits: u8) {
        self.msv.fetch_or(bits, Ordering::SeqCst);
    }

    pub fn has(&self, bits: u8) -> bool {
        self.msv() & bits == bits
    }

    /// The two-byte health report: `[mode, msv]`.
    pub fn report_bytes(&self) -> [u8; 2] {
        [self.mode(), self.msv()]
    }
}

impl Default for ModuleStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Latest health state reported for a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum HealthRecord {
    Unknown = 0xFF,
    Ok = 1,
    Error = 2,
}

impl HealthRecord {
    fn from_raw(value: u8) -> Self {
        match value {
            1 => HealthRecord::Ok,
            2 => HealthRecord::Error,
            _ => HealthRecord::Unknown,
        }
    }
}

/// Per-module health as seen by housekeeping. Later updates overwrite earlier ones.
#[derive(Debug)]
pub struct HealthTable {
    records: [AtomicU8; DESTINATION_COUNT],
}

impl HealthTable {
    pub fn new() -> Self {
        Self {
            records: core::array::from_fn(|_| AtomicU8::new(HealthRecord::Unknown as u8)),
        }
    }

    /// Records a status report: 0 means OK, anything else is an error.
    pub fn update(&self, source: Destination, status: u8) -> HealthRecord {
        let record = if status == 0 {
            HealthRecord::Ok
        } else {
            HealthRecord::Error
        };
        self.records[source.index()].store(record as u8, Ordering::SeqCst);
        record
    }

    pub fn get(&self, source: Destination) -> HealthRecord {
        HealthRecord::from_raw(self.records[source.index()].load(Ordering::SeqCst))
    }

    pub fn any_error(&self) -> bool {
        Destination::ALL
            .iter()
            .any(|d| self.get(*d) == HealthRecord::Error)
    }

    pub fn snapshot(&self) -> Vec<(Destination, HealthRecord)> {
        Destination::ALL.iter().map(|d| (*d, self.get(*d))).collect()
    }
}

impl Default for HealthTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Sends a module's health report downlink, then posts its MSV to housekeeping.
///
/// A failed downlink raises `ERROR_TX` on the module, so the posted MSV already
/// carries it, and the error is returned.
pub async fn report_health(
    source: Destination,
    status: &ModuleStatus,
    sink: &dyn TelemetrySink,
    retry: RetryPolicy,
    housekeeping: Option<&DataQueue>,
) -> Result<(), SinkError> {
    let report = status.report_bytes();
    debug!(%source, mode = report[0], msv = report[1], "health report");

    let sent = transmit_with_retry(sink, &report, retry).await;
    if sent.is_err() {
        status.flag(ERROR_TX);
    }

    if let Some(queue) = housekeeping {
        if let Err(e) = queue.try_send(HealthData::health_status(source, status.msv())) {
            warn!(%source, error = %e, "health data not posted");
        }
    }
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::bounded;
    use crate::telemetry::MemorySink;

    #[test]
    fn test_flags_accumulate() {
        let status = ModuleStatus::new();
        status.flag(ERROR_CMDINV);
        status.flag(ERROR_QUEUE_FULL);
        status.flag(ERROR_CMDINV);
        assert_eq!(status.msv(), ERROR_CMDINV | ERROR_QUEUE_FULL);
        assert!(status.has(ERROR_QUEUE_FULL));
        assert!(!status.has(ERROR_TX));
    }

    #[test]
    fn test_report_bytes() {
        let status = ModuleStatus::new();
        status.set_mode(SubsystemMode::Safe);
        status.flag(ERROR_SCHEDULE);
        assert_eq!(status.report_bytes(), [2, ERROR_SCHEDULE]);

        // A mode change leaves the flags in place.
        status.set_mode(SubsystemMode::On);
        assert_eq!(status.report_bytes(), [1, ERROR_SCHEDULE]);
    }

    #[test]
    fn test_health_table_overwrites() {
        let table = HealthTable::new();
        assert_eq!(table.get(Destination::Power), HealthRecord::Unknown);

        assert_eq!(table.update(Destination::Power, 0), HealthRecord::Ok);
        assert_eq!(table.update(Destination::Power, 5), HealthRecord::Error);
        assert_eq!(table.get(Destination::Power), HealthRecord::Error);
        assert!(table.any_error());

        table.update(Destination::Power, 0);
        assert_eq!(table.get(Destination::Power), HealthRecord::Ok);
        assert!(!table.any_error());
    }

    #[test]
    fn test_requested_mode_validation() {
        let envelope = Envelope::new(Destination::Adcs, 2).with_param(3);
        assert_eq!(requested_mode(&envelope), Ok(SubsystemMode::Erp));

        let envelope = Envelope::new(Destination::Adcs, 2).with_param(9);
        assert_eq!(requested_mode(&envelope), Err(CommandError::InvalidMode(9)));

        let envelope = Envelope::new(Destination::Adcs, 2);
        assert_eq!(requested_mode(&envelope), Err(CommandError::MissingParameter(2)));
    }

    #[tokio::test]
    async fn test_report_health_transmits_and_posts() {
        let sink = MemorySink::new();
        let (data_queue, mut data_rx) = bounded("hk-data", 6).unwrap();
        let status = ModuleStatus::new();
        status.set_mode(SubsystemMode::On);

        report_health(Destination::Power, &status, &sink, RetryPolicy::default(), Some(&data_queue))
            .await
            .unwrap();

        assert!(sink.contains(&[1, 0]));
        let data = data_rx.recv().await.unwrap();
        assert_eq!(data, HealthData::health_status(Destination::Power, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_health_flags_tx_failure() {
        let sink = MemorySink::new();
        sink.busy_for(100);
        let status = ModuleStatus::new();

        let result = report_health(Destination::Adcs, &status, &sink, RetryPolicy::default(), None).await;
        assert!(result.is_err());
        assert!(status.has(ERROR_TX));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_report_posts_tx_flag() {
        let sink = MemorySink::new();
        sink.busy_for(100);
        let (data_queue, mut data_rx) = bounded("hk-data", 6).unwrap();
        let status = ModuleStatus::new();

        let result =
            report_health(Destination::Power, &status, &sink, RetryPolicy::default(), Some(&data_queue)).await;
        assert!(result.is_err());

        let data = data_rx.recv().await.unwrap();
        assert_eq!(data, HealthData::health_status(Destination::Power, ERROR_TX));
    }
}
