// Typed identifiers and value types shared by every stage of the motion pipeline

use std::fmt;

use serde::{Deserialize, Serialize};

/// Total number of actuated joints: 3 per leg plus 4 auxiliary rotations.
pub const JOINT_COUNT: usize = 16;

/// Joints driven by the leg solver.
pub const LEG_JOINT_COUNT: usize = 12;

/// Auxiliary rotation joints (ids 12..16), not part of any leg.
pub const AUX_JOINT_COUNT: usize = JOINT_COUNT - LEG_JOINT_COUNT;

/// Identifies one physical joint. Leg joints are numbered
/// `3 * leg + LegJoint` in [`LegRole`] order, auxiliary joints follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct JointId(u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Joint id {0} out of range (0..16)")]
pub struct InvalidJoint(pub u8);

impl JointId {
    pub fn new(raw: u8) -> Result<Self, InvalidJoint> {
        if (raw as usize) < JOINT_COUNT {
            Ok(Self(raw))
        } else {
            Err(InvalidJoint(raw))
        }
    }

    pub fn of_leg(role: LegRole, joint: LegJoint) -> Self {
        Self(role as u8 * 3 + joint as u8)
    }

    pub fn aux(index: usize) -> Self {
        debug_assert!(index < AUX_JOINT_COUNT);
        Self((LEG_JOINT_COUNT + index) as u8)
    }

    pub fn all() -> impl Iterator<Item = JointId> {
        (0..JOINT_COUNT as u8).map(JointId)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// The leg owning this joint, `None` for auxiliary joints.
    pub fn leg(self) -> Option<(LegRole, LegJoint)> {
        let i = self.index();
        if i >= LEG_JOINT_COUNT {
            return None;
        }
        Some((LegRole::ALL[i / 3], LegJoint::ALL[i % 3]))
    }
}

impl TryFrom<u8> for JointId {
    type Error = InvalidJoint;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<JointId> for u8 {
    fn from(id: JointId) -> Self {
        id.0
    }
}

impl fmt::Display for JointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.leg() {
            Some((role, joint)) => write!(f, "{} {} (#{})", role, joint, self.0),
            None => write!(f, "aux {} (#{})", self.index() - LEG_JOINT_COUNT, self.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegRole {
    FrontLeft = 0,
    FrontRight = 1,
    BackLeft = 2,
    BackRight = 3,
}

impl LegRole {
    pub const ALL: [LegRole; 4] = [
        LegRole::FrontLeft,
        LegRole::FrontRight,
        LegRole::BackLeft,
        LegRole::BackRight,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_left(self) -> bool {
        matches!(self, LegRole::FrontLeft | LegRole::BackLeft)
    }

    pub fn is_front(self) -> bool {
        matches!(self, LegRole::FrontLeft | LegRole::FrontRight)
    }

    pub fn joints(self) -> [JointId; 3] {
        LegJoint::ALL.map(|joint| JointId::of_leg(self, joint))
    }
}

impl fmt::Display for LegRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegRole::FrontLeft => f.write_str("front left"),
            LegRole::FrontRight => f.write_str("front right"),
            LegRole::BackLeft => f.write_str("back left"),
            LegRole::BackRight => f.write_str("back right"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegJoint {
    Wiggle = 0,
    Hip = 1,
    Thigh = 2,
}

impl LegJoint {
    pub const ALL: [LegJoint; 3] = [LegJoint::Wiggle, LegJoint::Hip, LegJoint::Thigh];
}

impl fmt::Display for LegJoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegJoint::Wiggle => f.write_str("wiggle"),
            LegJoint::Hip => f.write_str("hip"),
            LegJoint::Thigh => f.write_str("thigh"),
        }
    }
}

/// Physical shape of one leg. Units: millimeters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LegGeometry {
    pub role: LegRole,
    pub thigh_mm: f64,
    pub shin_mm: f64,
    /// Lateral offset between the wiggle pivot and the thigh pivot.
    pub wiggle_arm_mm: f64,
    /// Hip origin in the body frame, `[forward, left]`.
    pub hip_offset_mm: [f64; 2],
    /// Foot height below the hip in the neutral standing pose.
    pub stand_height_mm: f64,
}

impl LegGeometry {
    pub fn max_reach(&self) -> f64 {
        self.thigh_mm + self.shin_mm
    }

    pub fn min_reach(&self) -> f64 {
        (self.thigh_mm - self.shin_mm).abs()
    }

    /// Foot position of the neutral standing pose: straight below the
    /// thigh pivot.
    pub fn neutral_target(&self) -> FootTarget {
        FootTarget::new(0.0, self.stand_height_mm, self.wiggle_arm_mm)
    }
}

/// Foot position relative to the hip origin: x forward, y down, z outward.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FootTarget {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl FootTarget {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn distance_to(&self, other: &FootTarget) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2) + (self.z - other.z).powi(2))
            .sqrt()
    }
}

impl fmt::Display for FootTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.1}, {:.1}, {:.1}) mm", self.x, self.y, self.z)
    }
}

/// Solved joint angles of one leg in degrees; zero is the neutral pose.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LegAngles {
    /// Pitch of the thigh link at the hip.
    pub hip: f64,
    /// Flex between thigh and shin.
    pub thigh: f64,
    /// Lateral rotation of the whole leg plane.
    pub wiggle: f64,
}

impl LegAngles {
    pub fn get(&self, joint: LegJoint) -> f64 {
        match joint {
            LegJoint::Wiggle => self.wiggle,
            LegJoint::Hip => self.hip,
            LegJoint::Thigh => self.thigh,
        }
    }
}

/// Raw servo position handed to hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActuatorCommand(pub i32);

/// One command per joint, indexed by [`JointId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JointCommands(pub [ActuatorCommand; JOINT_COUNT]);

impl JointCommands {
    pub fn get(&self, joint: JointId) -> ActuatorCommand {
        self.0[joint.index()]
    }

    pub fn set(&mut self, joint: JointId, command: ActuatorCommand) {
        self.0[joint.index()] = command;
    }

    pub fn iter(&self) -> impl Iterator<Item = (JointId, ActuatorCommand)> + '_ {
        JointId::all().zip(self.0.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_joint_numbering() {
        assert_eq!(JointId::of_leg(LegRole::FrontLeft, LegJoint::Wiggle).index(), 0);
        assert_eq!(JointId::of_leg(LegRole::BackRight, LegJoint::Thigh).index(), 11);
        assert_eq!(JointId::aux(0).index(), 12);
        assert_eq!(
            JointId::new(4).unwrap().leg(),
            Some((LegRole::FrontRight, LegJoint::Hip))
        );
        assert_eq!(JointId::aux(3).leg(), None);
    }

    #[test]
    fn test_joint_id_range() {
        assert!(JointId::new(15).is_ok());
        assert_eq!(JointId::new(16), Err(InvalidJoint(16)));
        assert!(serde_json::from_str::<JointId>("16").is_err());
        assert_eq!(serde_json::from_str::<JointId>("3").unwrap().index(), 3);
    }

    #[test]
    fn test_leg_sides() {
        let left: Vec<_> = LegRole::ALL.iter().filter(|r| r.is_left()).collect();
        assert_eq!(left, vec![&LegRole::FrontLeft, &LegRole::BackLeft]);
        assert_eq!(LegRole::BackLeft.joints().map(JointId::index), [6, 7, 8]);
    }
}
