// Servo driver for the quadruped's 16 joints
//
// Joint `n` is wired to bus servo id `n + 1`. All 16 goal positions go out in
// one sync-write packet per tick.

use tracing::{debug, info, warn};

use super::feetech::{FeetechBus, FeetechError, OperatingMode, POSITION_MAX};
use super::{Actuator, ActuatorError};
use crate::robot::{ActuatorCommand, JOINT_COUNT, JointCommands, JointId};

/// Bus id of a joint's servo
pub fn servo_id(joint: JointId) -> u8 {
    joint.index() as u8 + 1
}

/// Clamp a command into the servo's position range. Returns the goal and
/// whether it had to be clamped.
pub fn goal_position(command: ActuatorCommand) -> (u16, bool) {
    let clamped = command.0.clamp(0, POSITION_MAX as i32);
    (clamped as u16, clamped != command.0)
}

/// Servo acceleration limit, 0 = unlimited. The gait already shapes motion.
const SERVO_ACCELERATION: u8 = 0;

pub struct FeetechActuator {
    bus: FeetechBus,
}

impl FeetechActuator {
    pub fn open(port: &str) -> Result<Self, FeetechError> {
        info!("Opening servo bus on {}", port);
        let bus = FeetechBus::open(port)?;
        Ok(Self { bus })
    }

    /// Ping every servo, then put them all in position mode with torque on.
    pub fn initialize(&mut self) -> Result<(), FeetechError> {
        let ids: Vec<u8> = JointId::all().map(servo_id).collect();
        info!("Initializing servos {:?} for position control", ids);

        for &id in &ids {
            match self.bus.ping(id) {
                Ok(true) => debug!("Servo {} responding", id),
                Ok(false) => {
                    warn!("Servo {} not responding to ping", id);
                    return Err(FeetechError::Timeout { id });
                }
                Err(e) => return Err(e),
            }
        }

        // Operating mode can only change with torque off
        for &id in &ids {
            self.bus.disable_torque(id)?;
            self.bus.set_operating_mode(id, OperatingMode::Position)?;
            self.bus.set_acceleration(id, SERVO_ACCELERATION)?;
        }

        for &id in &ids {
            let position = self.bus.read_position(id)?;
            debug!("Servo {} at {}", id, position);
            self.bus.enable_torque(id)?;
        }

        info!("Servos initialized");
        Ok(())
    }
}

impl Actuator for FeetechActuator {
    fn commit(&mut self, commands: &JointCommands) -> Result<(), ActuatorError> {
        let mut data = [(0u8, 0u16); JOINT_COUNT];
        for (slot, (joint, command)) in data.iter_mut().zip(commands.iter()) {
            let (goal, clamped) = goal_position(command);
            if clamped {
                warn!("{} command {} outside servo range, clamped to {}", joint, command.0, goal);
            }
            *slot = (servo_id(joint), goal);
        }
        self.bus.sync_write_positions(&data)?;
        Ok(())
    }
}
