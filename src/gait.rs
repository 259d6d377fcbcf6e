// Gait generation and coordination.
//
// A gait cycle is a normalized phase in `[0, 1)`. The coordinator shifts the
// global phase by a fixed offset per leg; the generator turns a leg's local
// phase into a foot target. The first part of each local cycle is the swing
// window (foot in the air, carried forward), the rest is support (foot
// planted, pushed backward, which moves the body).

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::robot::{FootTarget, LegGeometry, LegRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GaitPattern {
    /// Diagonal pairs swing together; two legs always planted.
    Trot,
    /// One leg swings at a time; three legs always planted.
    Tripod,
}

impl GaitPattern {
    /// Fraction of the cycle each leg spends in the air.
    pub fn swing_window(self) -> f64 {
        match self {
            GaitPattern::Trot => 0.5,
            GaitPattern::Tripod => 0.25,
        }
    }

    /// Phase offset of a leg within the shared cycle.
    pub fn phase_offset(self, role: LegRole) -> f64 {
        match (self, role) {
            (GaitPattern::Trot, LegRole::FrontLeft | LegRole::BackRight) => 0.0,
            (GaitPattern::Trot, LegRole::FrontRight | LegRole::BackLeft) => 0.5,
            (GaitPattern::Tripod, LegRole::FrontLeft) => 0.0,
            (GaitPattern::Tripod, LegRole::BackLeft) => 0.25,
            (GaitPattern::Tripod, LegRole::FrontRight) => 0.5,
            (GaitPattern::Tripod, LegRole::BackRight) => 0.75,
        }
    }
}

/// Shape of the vertical lift during swing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiftEasing {
    /// `sin(pi * s)`: zero vertical speed at the apex only.
    #[default]
    HalfSine,
    /// Smoothstep up to the apex and back down: zero vertical speed at
    /// lift-off, apex and touchdown.
    SmoothStep,
}

impl LiftEasing {
    /// Lift fraction in `[0, 1]` for swing progress `s` in `[0, 1]`.
    pub fn lift(self, s: f64) -> f64 {
        let s = s.clamp(0.0, 1.0);
        match self {
            LiftEasing::HalfSine => (PI * s).sin(),
            LiftEasing::SmoothStep => {
                let t = 1.0 - (2.0 * s - 1.0).abs();
                t * t * (3.0 - 2.0 * t)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct GaitParams {
    /// Foot travel per cycle at full speed. Units: mm.
    pub stride_mm: f64,
    /// Peak foot lift during swing. Units: mm.
    pub lift_height_mm: f64,
    /// Foot height below the hip when standing. Units: mm.
    pub stand_height_mm: f64,
    /// How much a full turn command skews the stride between the two sides.
    pub turn_ratio: f64,
    pub easing: LiftEasing,
}

impl Default for GaitParams {
    fn default() -> Self {
        Self {
            stride_mm: 40.0,
            lift_height_mm: 25.0,
            stand_height_mm: 110.0,
            turn_ratio: 0.5,
            easing: LiftEasing::HalfSine,
        }
    }
}

/// Desired body motion, both components normalized to `[-1, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MovementVector {
    /// Positive walks forward.
    pub forward: f64,
    /// Positive turns right.
    pub turn: f64,
}

impl MovementVector {
    pub const ZERO: MovementVector = MovementVector {
        forward: 0.0,
        turn: 0.0,
    };

    pub fn new(forward: f64, turn: f64) -> Self {
        Self {
            forward: forward.clamp(-1.0, 1.0),
            turn: turn.clamp(-1.0, 1.0),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.forward == 0.0 && self.turn == 0.0
    }

    /// Stride scale for one leg. Turning right makes the left side step
    /// further than the right side.
    fn stride_scale(&self, role: LegRole, turn_ratio: f64) -> f64 {
        let side = if role.is_left() { 1.0 } else { -1.0 };
        (self.forward + side * self.turn * turn_ratio).clamp(-1.0, 1.0)
    }
}

/// Wrap any phase into `[0, 1)`.
pub fn wrap_phase(phase: f64) -> f64 {
    let wrapped = phase.rem_euclid(1.0);
    // rem_euclid can round up to exactly 1.0 for tiny negative inputs
    if wrapped >= 1.0 { 0.0 } else { wrapped }
}

/// Whether a leg at this local phase is in the air.
pub fn is_swing(local_phase: f64, pattern: GaitPattern) -> bool {
    wrap_phase(local_phase) < pattern.swing_window()
}

/// Foot target of one leg at a local phase.
pub fn foot_target_for_phase(
    local_phase: f64,
    movement: &MovementVector,
    geometry: &LegGeometry,
    params: &GaitParams,
    pattern: GaitPattern,
) -> FootTarget {
    let neutral = geometry.neutral_target();
    if movement.is_zero() {
        return neutral;
    }

    let phase = wrap_phase(local_phase);
    let window = pattern.swing_window();
    let half_stride = params.stride_mm / 2.0 * movement.stride_scale(geometry.role, params.turn_ratio);

    let (x, lift) = if phase < window {
        let s = phase / window;
        (-half_stride + 2.0 * half_stride * s, params.easing.lift(s))
    } else {
        let u = (phase - window) / (1.0 - window);
        (half_stride - 2.0 * half_stride * u, 0.0)
    };

    FootTarget::new(
        neutral.x + x,
        neutral.y - params.lift_height_mm * lift,
        neutral.z,
    )
}

/// Owns the active gait pattern and maps the global phase to each leg.
#[derive(Debug, Clone)]
pub struct GaitCoordinator {
    active: GaitPattern,
    pending: Option<GaitPattern>,
}

impl GaitCoordinator {
    pub fn new(pattern: GaitPattern) -> Self {
        Self {
            active: pattern,
            pending: None,
        }
    }

    pub fn pattern(&self) -> GaitPattern {
        self.active
    }

    pub fn pending(&self) -> Option<GaitPattern> {
        self.pending
    }

    /// Queue a pattern change. It takes effect at the next phase wrap so no
    /// foot jumps mid-cycle.
    pub fn request_pattern(&mut self, pattern: GaitPattern) {
        if pattern == self.active {
            self.pending = None;
        } else {
            self.pending = Some(pattern);
        }
    }

    /// Switch immediately; only valid while the phase is frozen at zero.
    pub fn apply_pending(&mut self) {
        if let Some(pattern) = self.pending.take() {
            info!("Gait pattern {:?} -> {:?}", self.active, pattern);
            self.active = pattern;
        }
    }

    /// Called when the global phase wraps back to zero.
    pub fn on_wrap(&mut self) {
        self.apply_pending();
    }

    pub fn leg_phase(&self, global_phase: f64, role: LegRole) -> f64 {
        wrap_phase(global_phase + self.active.phase_offset(role))
    }

    pub fn is_swing(&self, global_phase: f64, role: LegRole) -> bool {
        is_swing(self.leg_phase(global_phase, role), self.active)
    }

    /// Foot targets for all four legs, indexed by [`LegRole`].
    pub fn foot_targets(
        &self,
        global_phase: f64,
        movement: &MovementVector,
        geometries: &[LegGeometry; 4],
        params: &GaitParams,
    ) -> [FootTarget; 4] {
        LegRole::ALL.map(|role| {
            foot_target_for_phase(
                self.leg_phase(global_phase, role),
                movement,
                &geometries[role.index()],
                params,
                self.active,
            )
        })
    }
}
