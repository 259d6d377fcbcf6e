// Leg inverse kinematics
//
// Each leg is solved as two planar problems: the wiggle joint rotates the
// whole leg plane about the forward axis, then thigh and shin form a two-bar
// linkage inside that plane.

use crate::robot::{FootTarget, LegAngles, LegGeometry, LegRole};

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum KinematicsError {
    #[error("Target {target} unreachable for {leg} leg (linkage distance {distance:.3} mm)")]
    Unreachable {
        leg: LegRole,
        target: FootTarget,
        distance: f64,
    },
}

/// Raw solution in radians, before the neutral pose is subtracted.
#[derive(Debug, Clone, Copy)]
struct RawAngles {
    hip: f64,
    knee: f64,
    wiggle: f64,
}

/// Law of cosines, with the ratio clamped so points on the boundary don't
/// produce NaN.
fn cosine_rule(adjacent_a: f64, adjacent_b: f64, opposite: f64) -> f64 {
    let ratio = (adjacent_a.powi(2) + adjacent_b.powi(2) - opposite.powi(2))
        / (2.0 * adjacent_a * adjacent_b);
    ratio.clamp(-1.0, 1.0).acos()
}

fn solve_raw(target: &FootTarget, geometry: &LegGeometry) -> Result<RawAngles, KinematicsError> {
    let unreachable = |distance: f64| KinematicsError::Unreachable {
        leg: geometry.role,
        target: *target,
        distance,
    };

    // Wiggle plane (y, z)
    let arm = geometry.wiggle_arm_mm;
    let projected_sq = target.y.powi(2) + target.z.powi(2);
    if projected_sq < arm.powi(2) {
        return Err(unreachable(projected_sq.sqrt()));
    }
    let vertical = (projected_sq - arm.powi(2)).sqrt();
    let wiggle = target.z.atan2(target.y) - arm.atan2(vertical);

    // Linkage plane (x, corrected y)
    let distance = target.x.hypot(vertical);
    // Boundary is inclusive; cosine_rule clamps the rounding on it
    if distance > geometry.max_reach() || distance < geometry.min_reach() || distance == 0.0 {
        return Err(unreachable(distance));
    }

    let (thigh, shin) = (geometry.thigh_mm, geometry.shin_mm);
    let knee = cosine_rule(thigh, shin, distance);
    let hip = target.x.atan2(vertical) + cosine_rule(thigh, distance, shin);

    Ok(RawAngles { hip, knee, wiggle })
}

/// Solve one leg for a foot target.
///
/// Returned angles are degrees relative to the neutral standing pose, so the
/// mapper's center offsets apply directly.
pub fn solve_leg(target: &FootTarget, geometry: &LegGeometry) -> Result<LegAngles, KinematicsError> {
    let raw = solve_raw(target, geometry)?;
    let neutral = solve_raw(&geometry.neutral_target(), geometry)?;

    Ok(LegAngles {
        hip: (raw.hip - neutral.hip).to_degrees(),
        thigh: (raw.knee - neutral.knee).to_degrees(),
        wiggle: (raw.wiggle - neutral.wiggle).to_degrees(),
    })
}

/// Foot position produced by a set of joint angles. Inverse of [`solve_leg`]
/// inside the workspace.
pub fn forward_leg(angles: &LegAngles, geometry: &LegGeometry) -> FootTarget {
    // The neutral pose is always reachable for a validated geometry; fall back
    // to a straight leg if it is not.
    let neutral = solve_raw(&geometry.neutral_target(), geometry).unwrap_or(RawAngles {
        hip: 0.0,
        knee: std::f64::consts::PI,
        wiggle: 0.0,
    });
    let hip = neutral.hip + angles.hip.to_radians();
    let knee = neutral.knee + angles.thigh.to_radians();
    let wiggle = neutral.wiggle + angles.wiggle.to_radians();

    // Linkage plane: thigh from the pivot, shin folds back by the knee angle
    let shin_dir = hip - (std::f64::consts::PI - knee);
    let x = geometry.thigh_mm * hip.sin() + geometry.shin_mm * shin_dir.sin();
    let vertical = geometry.thigh_mm * hip.cos() + geometry.shin_mm * shin_dir.cos();

    // Rotate the plane back about the forward axis
    let arm = geometry.wiggle_arm_mm;
    FootTarget {
        x,
        y: vertical * wiggle.cos() - arm * wiggle.sin(),
        z: vertical * wiggle.sin() + arm * wiggle.cos(),
    }
}
