use crate::clock::OnboardClock;
use crate::health::{HealthTable, ModuleStatus};
use crate::modes::{ModeCell, SatelliteMode};
use crate::protocol::{Destination, DESTINATION_COUNT};

/// State shared by every component: onboard time, satellite mode, the
/// housekeeping health table and each module's status.
///
/// Every field is individually atomic; nothing here needs a lock.
#[derive(Debug)]
pub struct FlightContext {
    pub clock: OnboardClock,
    pub satellite_mode: ModeCell,
    pub health: HealthTable,
    statuses: [ModuleStatus; DESTINATION_COUNT],
}

impl FlightContext {
    pub fn new() -> Self {
        Self {
            clock: OnboardClock::new(),
            satellite_mode: ModeCell::new(SatelliteMode::Detumbling),
            health: HealthTable::new(),
            statuses: core::array::from_fn(|_| ModuleStatus::new()),
        }
    }

    pub fn status(&self, module: Destination) -> &ModuleStatus {
        &self.statuses[module.index()]
    }

    /// `(module, [mode, msv])` for every addressable module.
    pub fn status_report(&self) -> Vec<(Destination, [u8; 2])> {
        Destination::ALL
            .iter()
            .map(|d| (*d, self.status(*d).report_bytes()))
            .collect()
    }
}

impl Default for FlightContext {
    fn default() -> Self {
        Self::new()
    }
}
