use serde::{Deserialize, Serialize};

use super::{unknown_command, Action, Subsystem};
use crate::health::SubsystemMode;
use crate::protocol::{CommandError, Destination, Envelope};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdcsState {
    pub mode: SubsystemMode,
}

/// Attitude determination and control stub. It has no commands beyond
/// health and mode.
#[derive(Debug)]
pub struct Adcs {
    state: AdcsState,
}

impl Adcs {
    pub fn new() -> Self {
        Self {
            state: AdcsState {
                mode: SubsystemMode::On,
            },
        }
    }
}

impl Default for Adcs {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub enum AdcsCommand {}

impl Subsystem for Adcs {
    type State = AdcsState;
    type Command = AdcsCommand;

    const ID: Destination = Destination::Adcs;

    fn decode(&self, envelope: &Envelope) -> Result<AdcsCommand, CommandError> {
        Err(unknown_command(Self::ID, envelope))
    }

    fn execute_command(&mut self, command: AdcsCommand) -> Result<Action, CommandError> {
        match command {}
    }

    fn get_state(&self) -> AdcsState {
        self.state.clone()
    }

    fn on_mode_change(&mut self, mode: SubsystemMode) {
        self.state.mode = mode;
    }
}
