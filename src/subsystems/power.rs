use serde::{Deserialize, Serialize};
use tracing::info;

use super::{unknown_command, Action, Subsystem};
use crate::health::SubsystemMode;
use crate::protocol::{CommandError, Destination, Envelope};

pub const POWER_CHECK_SHORT_CIRCUIT: u8 = 0x03;
pub const POWER_READ_VI: u8 = 0x04;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerState {
    pub mode: SubsystemMode,
    pub short_circuit_checks: u32,
    pub vi_reads: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerCommand {
    CheckShortCircuit,
    ReadVoltageCurrent,
}

/// Electrical power subsystem stub; no hardware behind it.
#[derive(Debug)]
pub struct Power {
    state: PowerState,
}

impl Power {
    pub fn new() -> Self {
        Self {
            state: PowerState {
                mode: SubsystemMode::On,
                short_circuit_checks: 0,
                vi_reads: 0,
            },
        }
    }
}

impl Default for Power {
    fn default() -> Self {
        Self::new()
    }
}

impl Subsystem for Power {
    type State = PowerState;
    type Command = PowerCommand;

    const ID: Destination = Destination::Power;

    fn decode(&self, envelope: &Envelope) -> Result<PowerCommand, CommandError> {
        match envelope.command_id {
            POWER_CHECK_SHORT_CIRCUIT => Ok(PowerCommand::CheckShortCircuit),
            POWER_READ_VI => Ok(PowerCommand::ReadVoltageCurrent),
            _ => Err(unknown_command(Self::ID, envelope)),
        }
    }

    fn execute_command(&mut self, command: PowerCommand) -> Result<Action, CommandError> {
        match command {
            PowerCommand::CheckShortCircuit => {
                self.state.short_circuit_checks += 1;
                info!("checking for short circuits");
            }
            PowerCommand::ReadVoltageCurrent => {
                self.state.vi_reads += 1;
                info!("reading power levels");
            }
        }
        Ok(Action::None)
    }

    fn get_state(&self) -> PowerState {
        self.state.clone()
    }

    fn on_mode_change(&mut self, mode: SubsystemMode) {
        self.state.mode = mode;
    }
}
