use serde::{Deserialize, Serialize};

use super::{unknown_command, Action, Subsystem};
use crate::health::SubsystemMode;
use crate::protocol::{CommandError, Destination, Envelope};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadState {
    pub mode: SubsystemMode,
    pub mode_changes: u32,
}

#[derive(Debug, Clone, Copy)]
pub enum PayloadCommand {}

/// Payload stub.
#[derive(Debug)]
pub struct Payload {
    state: PayloadState,
}

impl Payload {
    pub fn new() -> Self {
        Self {
            state: PayloadState {
                mode: SubsystemMode::On,
                mode_changes: 0,
            },
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::new()
    }
}

impl Subsystem for Payload {
    type State = PayloadState;
    type Command = PayloadCommand;

    const ID: Destination = Destination::Payload;

    fn decode(&self, envelope: &Envelope) -> Result<PayloadCommand, CommandError> {
        Err(unknown_command(Self::ID, envelope))
    }

    fn execute_command(&mut self, command: PayloadCommand) -> Result<Action, CommandError> {
        match command {}
    }

    fn get_state(&self) -> PayloadState {
        self.state.clone()
    }

    // TODO: power the payload electronics down in Off/Safe once a driver exists.
    fn on_mode_change(&mut self, mode: SubsystemMode) {
        self.state.mode = mode;
        self.state.mode_changes += 1;
    }
}
