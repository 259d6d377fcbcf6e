// Loop timing, topics, servo bus settings and the motion configuration file
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::gait::{GaitParams, GaitPattern};
use crate::robot::{LegGeometry, LegRole};
use crate::safety::SafetyThresholds;

// Control loop frequency
pub const LOOP_HZ: u64 = 50;

// Telemetry / safety evaluation period
pub const TELEMETRY_PERIOD: Duration = Duration::from_secs(1);

// Telemetry older than this marks the runtime health as stale
pub const TELEMETRY_TIMEOUT: Duration = Duration::from_secs(5);

// Zenoh topics
pub const TOPIC_CMD_INTENT: &str = "quadruped/cmd/intent"; // JSON intents
pub const TOPIC_CMD_LEGACY: &str = "quadruped/cmd/legacy"; // var/val query strings
pub const TOPIC_TELEMETRY: &str = "quadruped/state/telemetry"; // power + orientation
pub const TOPIC_RT_JOINTS: &str = "quadruped/rt/joints"; // committed actuator commands
pub const TOPIC_STATUS: &str = "quadruped/state/status"; // scheduler status

// Serial port for the Feetech servo bus
pub const MOTOR_PORT: &str = "/dev/ttyUSB0";

// Enable hardware servo control (set to false for simulation/testing)
pub const MOTOR_ENABLED: bool = true;

// Default calibration file
pub const CALIBRATION_PATH: &str = "calibration.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Linkage dimensions shared by all four legs. Units: millimeters.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct LinkageConfig {
    pub thigh_mm: f64,
    pub shin_mm: f64,
    pub wiggle_arm_mm: f64,
    /// Distance between the front and back hip axes.
    pub body_length_mm: f64,
    /// Distance between the left and right hip axes.
    pub body_width_mm: f64,
}

impl Default for LinkageConfig {
    fn default() -> Self {
        Self {
            thigh_mm: 75.0,
            shin_mm: 75.0,
            wiggle_arm_mm: 20.0,
            body_length_mm: 150.0,
            body_width_mm: 80.0,
        }
    }
}

/// Everything the motion engine needs that is not a compile-time constant.
///
/// Loaded from a JSON file; every field falls back to its default so an
/// empty `{}` document is a valid configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    pub linkage: LinkageConfig,
    pub gait: GaitParams,
    pub pattern: GaitPattern,
    /// Duration of one full gait cycle.
    pub cycle_ms: u64,
    pub safety: SafetyThresholds,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            linkage: LinkageConfig::default(),
            gait: GaitParams::default(),
            pattern: GaitPattern::Trot,
            cycle_ms: 800,
            safety: SafetyThresholds::default(),
        }
    }
}

impl MotionConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let l = &self.linkage;
        if l.thigh_mm <= 0.0 || l.shin_mm <= 0.0 || l.wiggle_arm_mm < 0.0 {
            return Err(ConfigError::Invalid("linkage lengths must be positive".into()));
        }
        let reach = l.thigh_mm + l.shin_mm;
        let lowest = self.gait.stand_height_mm;
        if lowest <= (l.thigh_mm - l.shin_mm).abs() || lowest >= reach {
            return Err(ConfigError::Invalid(format!(
                "stand height {lowest} mm outside leg reach ({}, {reach})",
                (l.thigh_mm - l.shin_mm).abs()
            )));
        }
        if self.gait.lift_height_mm < 0.0 || self.gait.lift_height_mm >= lowest {
            return Err(ConfigError::Invalid("lift height must be in [0, stand height)".into()));
        }
        if self.cycle_ms < self.tick_period().as_millis() as u64 {
            return Err(ConfigError::Invalid(format!(
                "cycle of {} ms is shorter than one tick",
                self.cycle_ms
            )));
        }
        Ok(())
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(1000 / LOOP_HZ)
    }

    /// Number of control ticks in one gait cycle, at least one.
    pub fn ticks_per_cycle(&self) -> u32 {
        let tick_ms = self.tick_period().as_millis().max(1) as u64;
        (self.cycle_ms / tick_ms).max(1) as u32
    }

    /// Geometry for one leg. Hip mounting offsets are given in the body
    /// frame: x forward, z to the left.
    pub fn leg_geometry(&self, role: LegRole) -> LegGeometry {
        let l = &self.linkage;
        let x = if role.is_front() { l.body_length_mm / 2.0 } else { -l.body_length_mm / 2.0 };
        let z = if role.is_left() { l.body_width_mm / 2.0 } else { -l.body_width_mm / 2.0 };
        LegGeometry {
            role,
            thigh_mm: l.thigh_mm,
            shin_mm: l.shin_mm,
            wiggle_arm_mm: l.wiggle_arm_mm,
            hip_offset_mm: [x, z],
            stand_height_mm: self.gait.stand_height_mm,
        }
    }

    pub fn geometries(&self) -> [LegGeometry; 4] {
        LegRole::ALL.map(|role| self.leg_geometry(role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: MotionConfig = serde_json::from_str("{}").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.pattern, GaitPattern::Trot);
        assert_eq!(config.ticks_per_cycle(), 40);
    }

    #[test]
    fn test_partial_override() {
        let config: MotionConfig =
            serde_json::from_str(r#"{"gait": {"lift_height_mm": 30.0}, "pattern": "tripod"}"#)
                .unwrap();
        assert_eq!(config.gait.lift_height_mm, 30.0);
        assert_eq!(config.gait.stride_mm, GaitParams::default().stride_mm);
        assert_eq!(config.pattern, GaitPattern::Tripod);
    }

    #[test]
    fn test_stand_height_out_of_reach_rejected() {
        let mut config = MotionConfig::default();
        config.gait.stand_height_mm = 200.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_leg_geometry_mounting() {
        let config = MotionConfig::default();
        let fl = config.leg_geometry(LegRole::FrontLeft);
        let br = config.leg_geometry(LegRole::BackRight);
        assert!(fl.hip_offset_mm[0] > 0.0 && fl.hip_offset_mm[1] > 0.0);
        assert!(br.hip_offset_mm[0] < 0.0 && br.hip_offset_mm[1] < 0.0);
    }
}
