// Actuator backends for the 16 joint servos
//
// Provides:
// - The `Actuator` trait the control loop commits commands through
// - Feetech STS3215 serial protocol implementation (position mode)
// - A simulated backend for running without hardware

mod driver;
pub mod feetech;

use tracing::debug;

use crate::robot::JointCommands;

pub use driver::{FeetechActuator, goal_position, servo_id};
pub use feetech::{FeetechBus, FeetechError};

#[derive(Debug, thiserror::Error)]
pub enum ActuatorError {
    #[error(transparent)]
    Bus(#[from] FeetechError),
}

/// Sink for one tick's joint commands. Fire-and-forget: the caller logs
/// errors and keeps running.
pub trait Actuator: Send {
    fn commit(&mut self, commands: &JointCommands) -> Result<(), ActuatorError>;
}

/// Records commands instead of moving servos
#[derive(Debug, Default)]
pub struct SimulatedActuator {
    last: Option<JointCommands>,
    commits: u64,
}

impl SimulatedActuator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<&JointCommands> {
        self.last.as_ref()
    }

    pub fn commits(&self) -> u64 {
        self.commits
    }
}

impl Actuator for SimulatedActuator {
    fn commit(&mut self, commands: &JointCommands) -> Result<(), ActuatorError> {
        if self.last.as_ref() != Some(commands) {
            debug!("Simulated commit: {:?}", commands.0.map(|c| c.0));
        }
        self.last = Some(*commands);
        self.commits += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::robot::ActuatorCommand;

    #[test]
    fn test_simulated_actuator_records_commits() {
        let mut actuator = SimulatedActuator::new();
        assert!(actuator.last().is_none());

        let commands = JointCommands([ActuatorCommand(2048); 16]);
        actuator.commit(&commands).unwrap();
        actuator.commit(&commands).unwrap();
        assert_eq!(actuator.commits(), 2);
        assert_eq!(actuator.last(), Some(&commands));
    }
}
