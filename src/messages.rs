// Message types crossing the runtime boundary
//
// Everything arriving from outside is decoded into `Intent` exactly once,
// here; the motion core never sees command strings.

use serde::{Deserialize, Serialize};

use crate::actions::SpecialAction;
use crate::gait::{GaitPattern, MovementVector};
use crate::robot::{FootTarget, JointCommands, JointId, LegRole};
use crate::safety::{StopReason, TelemetryHealth};

/// One movement axis: -1, 0 or 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub enum Direction {
    Negative,
    #[default]
    Zero,
    Positive,
}

impl Direction {
    pub fn value(self) -> f64 {
        match self {
            Direction::Negative => -1.0,
            Direction::Zero => 0.0,
            Direction::Positive => 1.0,
        }
    }
}

impl TryFrom<i8> for Direction {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Direction::Negative),
            0 => Ok(Direction::Zero),
            1 => Ok(Direction::Positive),
            other => Err(format!("direction must be -1, 0 or 1, got {other}")),
        }
    }
}

impl From<Direction> for i8 {
    fn from(d: Direction) -> Self {
        match d {
            Direction::Negative => -1,
            Direction::Zero => 0,
            Direction::Positive => 1,
        }
    }
}

/// Walking request. `left_right` positive turns right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MovementIntent {
    #[serde(default)]
    pub forward_back: Direction,
    #[serde(default)]
    pub left_right: Direction,
}

impl MovementIntent {
    pub const STOP: MovementIntent = MovementIntent {
        forward_back: Direction::Zero,
        left_right: Direction::Zero,
    };

    pub fn new(forward_back: Direction, left_right: Direction) -> Self {
        Self {
            forward_back,
            left_right,
        }
    }

    pub fn is_stop(&self) -> bool {
        *self == Self::STOP
    }

    pub fn movement_vector(&self) -> MovementVector {
        MovementVector::new(self.forward_back.value(), self.left_right.value())
    }
}

/// Command from the intent source (CV engine, teleop, HTTP bridge) -> runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Intent {
    Move(MovementIntent),
    Action { action: SpecialAction },
    Calibrate { joint: JointId, center_offset: i32 },
    SetGait { pattern: GaitPattern },
    /// Operator emergency stop; holds until `ClearStop`
    EmergencyStop,
    ClearStop,
}

/// Raw power and orientation readings, published by the sensor node
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub battery_voltage_v: f64,
    pub roll_deg: f64,
    pub pitch_deg: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "action")]
pub enum MotionState {
    Idle,
    Walking,
    SpecialAction(SpecialAction),
    EmergencyStop,
}

/// The most recent leg that could not be solved
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolveErrorReport {
    pub leg: LegRole,
    pub target: FootTarget,
    pub distance_mm: f64,
    pub tick: u64,
}

/// Status published by the runtime for the display/telemetry subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionStatus {
    pub state: MotionState,
    pub phase: f64,
    pub pattern: GaitPattern,
    pub last_tick_duration_ms: f64,
    pub overrun_count: u64,
    pub last_solve_error: Option<SolveErrorReport>,
    pub commands: JointCommands,
    pub telemetry: Option<TelemetrySample>,
    pub telemetry_health: TelemetryHealth,
    pub stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("Missing field '{0}'")]
    MissingField(&'static str),

    #[error("Unknown command variable '{0}'")]
    UnknownVariable(String),

    #[error("Invalid value '{value}' for '{var}'")]
    InvalidValue { var: String, value: String },
}

/// Decodes the legacy `var=<name>&val=<n>&cmd=<n>` commands of the robot's
/// HTTP controller.
///
/// Movement commands update one axis at a time (forward/back or left/right),
/// so the decoder remembers the last movement and emits the merged intent.
#[derive(Debug, Default)]
pub struct LegacyDecoder {
    movement: MovementIntent,
}

impl LegacyDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, query: &str) -> Result<Intent, DecodeError> {
        let mut var = None;
        let mut val = None;
        for pair in query.trim().trim_start_matches('?').split('&') {
            match pair.split_once('=') {
                Some(("var", v)) => var = Some(v),
                Some(("val", v)) => val = Some(v),
                _ => {}
            }
        }
        let var = var.ok_or(DecodeError::MissingField("var"))?;
        let val = val.ok_or(DecodeError::MissingField("val"))?;
        let invalid = || DecodeError::InvalidValue {
            var: var.to_string(),
            value: val.to_string(),
        };
        let code: u8 = val.parse().map_err(|_| invalid())?;

        match var {
            "move" => {
                let m = &mut self.movement;
                match code {
                    1 => m.forward_back = Direction::Positive,
                    2 => m.left_right = Direction::Negative,
                    3 => m.forward_back = Direction::Zero,
                    4 => m.left_right = Direction::Positive,
                    5 => m.forward_back = Direction::Negative,
                    6 => m.left_right = Direction::Zero,
                    _ => return Err(invalid()),
                }
                Ok(Intent::Move(*m))
            }
            "funcMode" => SpecialAction::from_func_mode(code)
                .map(|action| Intent::Action { action })
                .ok_or_else(invalid),
            other => Err(DecodeError::UnknownVariable(other.to_string())),
        }
    }
}
