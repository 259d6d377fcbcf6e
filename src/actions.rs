// Predefined special actions.
//
// A special action is a fixed keyframe sequence of joint angles played
// outside the gait. Frames are interpolated linearly from the previous
// pose. Every sequence ends back in the neutral pose.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::robot::{AUX_JOINT_COUNT, JOINT_COUNT, JointId, LegAngles, LegJoint, LegRole};

/// Extra wall-clock time a sequence gets before it is cut off.
const TIMEOUT_MARGIN: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialAction {
    Steady,
    StayLow,
    Handshake,
    Jump,
    Bow,
    Dance,
    HipHop,
    InitPos,
    MiddlePos,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown special action: {0}")]
pub struct UnknownAction(pub String);

impl SpecialAction {
    pub const ALL: [SpecialAction; 9] = [
        SpecialAction::Steady,
        SpecialAction::StayLow,
        SpecialAction::Handshake,
        SpecialAction::Jump,
        SpecialAction::Bow,
        SpecialAction::Dance,
        SpecialAction::HipHop,
        SpecialAction::InitPos,
        SpecialAction::MiddlePos,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SpecialAction::Steady => "steady",
            SpecialAction::StayLow => "stay_low",
            SpecialAction::Handshake => "handshake",
            SpecialAction::Jump => "jump",
            SpecialAction::Bow => "bow",
            SpecialAction::Dance => "dance",
            SpecialAction::HipHop => "hip_hop",
            SpecialAction::InitPos => "init_pos",
            SpecialAction::MiddlePos => "middle_pos",
        }
    }

    /// Function-mode number used by the legacy command protocol (1-9).
    pub fn from_func_mode(value: u8) -> Option<Self> {
        Self::ALL.get((value as usize).checked_sub(1)?).copied()
    }

    pub fn sequence(self) -> ActionSequence {
        let crouch = Pose::neutral().with_all_legs(LegAngles {
            hip: 25.0,
            thigh: -50.0,
            wiggle: 0.0,
        });
        let half_crouch = Pose::neutral().with_all_legs(LegAngles {
            hip: 12.0,
            thigh: -25.0,
            wiggle: 0.0,
        });

        let frames = match self {
            SpecialAction::Steady => vec![Keyframe::new(400, Pose::neutral())],
            SpecialAction::StayLow => vec![
                Keyframe::new(600, crouch),
                Keyframe::new(2000, crouch),
                Keyframe::new(600, Pose::neutral()),
            ],
            SpecialAction::Handshake => {
                // Sit back on the hind legs, then lift and shake the front left paw
                let lean = Pose::neutral()
                    .with_leg(LegRole::BackLeft, 20.0, -40.0, 0.0)
                    .with_leg(LegRole::BackRight, 20.0, -40.0, 0.0);
                let paw_up = lean.with_leg(LegRole::FrontLeft, 70.0, 10.0, 5.0);
                let paw_down = lean.with_leg(LegRole::FrontLeft, 55.0, 10.0, 5.0);
                let mut frames = vec![Keyframe::new(500, lean), Keyframe::new(500, paw_up)];
                for _ in 0..3 {
                    frames.push(Keyframe::new(250, paw_down));
                    frames.push(Keyframe::new(250, paw_up));
                }
                frames.push(Keyframe::new(400, lean));
                frames.push(Keyframe::new(500, Pose::neutral()));
                frames
            }
            SpecialAction::Jump => {
                let stretch = Pose::neutral().with_all_legs(LegAngles {
                    hip: -10.0,
                    thigh: 20.0,
                    wiggle: 0.0,
                });
                vec![
                    Keyframe::new(500, crouch),
                    Keyframe::new(100, stretch),
                    Keyframe::new(300, half_crouch),
                    Keyframe::new(400, Pose::neutral()),
                ]
            }
            SpecialAction::Bow => {
                let bow = Pose::neutral()
                    .with_leg(LegRole::FrontLeft, 30.0, -60.0, 0.0)
                    .with_leg(LegRole::FrontRight, 30.0, -60.0, 0.0)
                    .with_aux(1, -20.0);
                vec![
                    Keyframe::new(700, bow),
                    Keyframe::new(1000, bow),
                    Keyframe::new(700, Pose::neutral()),
                ]
            }
            SpecialAction::Dance => {
                let sway_left = Pose::neutral()
                    .with_leg(LegRole::FrontLeft, 15.0, -30.0, -8.0)
                    .with_leg(LegRole::BackLeft, 15.0, -30.0, -8.0)
                    .with_leg(LegRole::FrontRight, 0.0, 0.0, 8.0)
                    .with_leg(LegRole::BackRight, 0.0, 0.0, 8.0)
                    .with_aux(0, 20.0);
                let sway_right = Pose::neutral()
                    .with_leg(LegRole::FrontRight, 15.0, -30.0, -8.0)
                    .with_leg(LegRole::BackRight, 15.0, -30.0, -8.0)
                    .with_leg(LegRole::FrontLeft, 0.0, 0.0, 8.0)
                    .with_leg(LegRole::BackLeft, 0.0, 0.0, 8.0)
                    .with_aux(0, -20.0);
                let mut frames = Vec::new();
                for _ in 0..4 {
                    frames.push(Keyframe::new(400, sway_left));
                    frames.push(Keyframe::new(400, sway_right));
                }
                frames.push(Keyframe::new(400, Pose::neutral()));
                frames
            }
            SpecialAction::HipHop => {
                let mut frames = Vec::new();
                for beat in 0..4 {
                    let turn = if beat % 2 == 0 { 25.0 } else { -25.0 };
                    frames.push(Keyframe::new(250, half_crouch.with_aux(0, turn).with_aux(2, turn)));
                    frames.push(Keyframe::new(250, Pose::neutral().with_aux(1, 10.0)));
                }
                frames.push(Keyframe::new(300, Pose::neutral()));
                frames
            }
            SpecialAction::InitPos => vec![Keyframe::new(1000, Pose::neutral())],
            SpecialAction::MiddlePos => vec![
                Keyframe::new(500, half_crouch),
                Keyframe::new(1000, half_crouch),
                Keyframe::new(500, Pose::neutral()),
            ],
        };
        ActionSequence::new(frames)
    }
}

impl fmt::Display for SpecialAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SpecialAction {
    type Err = UnknownAction;

    /// Accepts the canonical names plus the aliases used by the voice and
    /// HTTP front ends ("sit", "ssdance", "hiphop", ...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let action = match normalized.as_str() {
            "steady" | "stand" => SpecialAction::Steady,
            "stay_low" | "staylow" | "sit" => SpecialAction::StayLow,
            "handshake" => SpecialAction::Handshake,
            "jump" => SpecialAction::Jump,
            "bow" => SpecialAction::Bow,
            "dance" | "ssdance" => SpecialAction::Dance,
            "hip_hop" | "hiphop" => SpecialAction::HipHop,
            "init_pos" | "initpos" => SpecialAction::InitPos,
            "middle_pos" | "middlepos" => SpecialAction::MiddlePos,
            _ => return Err(UnknownAction(s.to_string())),
        };
        Ok(action)
    }
}

/// Angles of all 16 joints in degrees, zero = neutral.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pose(pub [f64; JOINT_COUNT]);

impl Pose {
    pub fn neutral() -> Self {
        Self::default()
    }

    pub fn from_legs(legs: &[LegAngles; 4], aux: &[f64; AUX_JOINT_COUNT]) -> Self {
        let mut pose = Self::neutral();
        for role in LegRole::ALL {
            pose = pose.with_leg_angles(role, legs[role.index()]);
        }
        for (i, &angle) in aux.iter().enumerate() {
            pose = pose.with_aux(i, angle);
        }
        pose
    }

    pub fn with_leg(self, role: LegRole, hip: f64, thigh: f64, wiggle: f64) -> Self {
        self.with_leg_angles(role, LegAngles { hip, thigh, wiggle })
    }

    pub fn with_leg_angles(mut self, role: LegRole, angles: LegAngles) -> Self {
        for joint in LegJoint::ALL {
            self.0[JointId::of_leg(role, joint).index()] = angles.get(joint);
        }
        self
    }

    pub fn with_all_legs(self, angles: LegAngles) -> Self {
        LegRole::ALL
            .into_iter()
            .fold(self, |pose, role| pose.with_leg_angles(role, angles))
    }

    pub fn with_aux(mut self, index: usize, angle: f64) -> Self {
        self.0[JointId::aux(index).index()] = angle;
        self
    }

    pub fn angle(&self, joint: JointId) -> f64 {
        self.0[joint.index()]
    }

    pub fn leg(&self, role: LegRole) -> LegAngles {
        let [wiggle, hip, thigh] = role.joints().map(|j| self.angle(j));
        LegAngles { hip, thigh, wiggle }
    }

    fn lerp(&self, to: &Pose, t: f64) -> Pose {
        let mut out = *self;
        for (o, (a, b)) in out.0.iter_mut().zip(self.0.iter().zip(to.0.iter())) {
            *o = a + (b - a) * t;
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keyframe {
    /// Time to move from the previous pose into this one.
    pub duration: Duration,
    pub pose: Pose,
}

impl Keyframe {
    pub fn new(duration_ms: u64, pose: Pose) -> Self {
        Self {
            duration: Duration::from_millis(duration_ms),
            pose,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionSequence {
    pub keyframes: Vec<Keyframe>,
    /// Wall-clock limit after which the sequence counts as complete.
    pub timeout: Duration,
}

impl ActionSequence {
    pub fn new(keyframes: Vec<Keyframe>) -> Self {
        let total: Duration = keyframes.iter().map(|k| k.duration).sum();
        Self {
            keyframes,
            timeout: total + TIMEOUT_MARGIN,
        }
    }

    pub fn total_duration(&self) -> Duration {
        self.keyframes.iter().map(|k| k.duration).sum()
    }

    /// Pose after `played` time, starting from `start`.
    pub fn pose_at(&self, start: &Pose, played: Duration) -> Pose {
        let mut from = *start;
        let mut remaining = played;
        for frame in &self.keyframes {
            if remaining < frame.duration {
                let t = remaining.as_secs_f64() / frame.duration.as_secs_f64();
                return from.lerp(&frame.pose, t);
            }
            remaining -= frame.duration;
            from = frame.pose;
        }
        from
    }
}

/// Plays one sequence. Progress advances by the nominal tick period; the
/// timeout is checked against wall-clock time so a stalled loop can't keep
/// an action alive forever.
#[derive(Debug, Clone)]
pub struct ActionPlayer {
    action: SpecialAction,
    sequence: ActionSequence,
    start_pose: Pose,
    started_at: Instant,
    played: Duration,
    timed_out: bool,
}

impl ActionPlayer {
    pub fn new(action: SpecialAction, start_pose: Pose, now: Instant) -> Self {
        Self {
            action,
            sequence: action.sequence(),
            start_pose,
            started_at: now,
            played: Duration::ZERO,
            timed_out: false,
        }
    }

    pub fn action(&self) -> SpecialAction {
        self.action
    }

    /// Nominal time played so far.
    pub fn progress(&self) -> Duration {
        self.played
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn is_complete(&self) -> bool {
        self.timed_out || self.played >= self.sequence.total_duration()
    }

    /// Advance by one tick and return the pose to command.
    pub fn step(&mut self, dt: Duration, now: Instant) -> Pose {
        self.played = (self.played + dt).min(self.sequence.total_duration());
        if now.saturating_duration_since(self.started_at) >= self.sequence.timeout {
            self.timed_out = true;
            return Pose::neutral();
        }
        self.sequence.pose_at(&self.start_pose, self.played)
    }
}
