// Safety monitor: watches power and orientation telemetry and can force the
// motion scheduler into an emergency stop.
//
// The stop flag has exactly one writer (the monitor, running in the telemetry
// task) and one reader (the scheduler, once per tick).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::TELEMETRY_TIMEOUT;
use crate::messages::TelemetrySample;

/// Shared emergency-stop flag.
#[derive(Debug, Default)]
pub struct StopFlag(AtomicBool);

impl StopFlag {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self, value: bool) {
        self.0.store(value, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct SafetyThresholds {
    /// Battery voltage below which motion is stopped. Units: volts.
    pub min_battery_voltage_v: f64,
    /// Largest roll or pitch before the robot is considered tipping over.
    /// Units: degrees.
    pub max_tilt_deg: f64,
}

impl Default for SafetyThresholds {
    fn default() -> Self {
        Self {
            // 2S Li-ion pack near empty
            min_battery_voltage_v: 6.4,
            max_tilt_deg: 45.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StopReason {
    LowBattery { voltage_v: f64 },
    Tilt { roll_deg: f64, pitch_deg: f64 },
    Requested,
}

/// Health of the telemetry feed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryHealth {
    Ok,
    Stale,
}

/// Requests forwarded from the control loop to the task owning the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyRequest {
    ForceStop,
    ClearStop,
}

/// Point-in-time view of the monitor, handed to the control loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetySnapshot {
    pub telemetry: Option<TelemetrySample>,
    pub health: TelemetryHealth,
    pub stop_reason: Option<StopReason>,
}

impl Default for SafetySnapshot {
    fn default() -> Self {
        Self {
            telemetry: None,
            health: TelemetryHealth::Stale,
            stop_reason: None,
        }
    }
}

pub struct SafetyMonitor {
    thresholds: SafetyThresholds,
    flag: Arc<StopFlag>,
    latest: Option<(TelemetrySample, Instant)>,
    stop_reason: Option<StopReason>,
}

impl SafetyMonitor {
    pub fn new(thresholds: SafetyThresholds, flag: Arc<StopFlag>) -> Self {
        Self {
            thresholds,
            flag,
            latest: None,
            stop_reason: None,
        }
    }

    pub fn latest(&self) -> Option<TelemetrySample> {
        self.latest.map(|(sample, _)| sample)
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    pub fn health(&self, now: Instant) -> TelemetryHealth {
        match self.latest {
            Some((_, at)) if now.saturating_duration_since(at) <= TELEMETRY_TIMEOUT => {
                TelemetryHealth::Ok
            }
            _ => TelemetryHealth::Stale,
        }
    }

    pub fn snapshot(&self, now: Instant) -> SafetySnapshot {
        SafetySnapshot {
            telemetry: self.latest(),
            health: self.health(now),
            stop_reason: self.stop_reason,
        }
    }

    /// Record a telemetry sample and stop motion if it breaks a threshold.
    pub fn observe(&mut self, sample: TelemetrySample, now: Instant) -> Option<StopReason> {
        self.latest = Some((sample, now));

        let reason = if sample.battery_voltage_v < self.thresholds.min_battery_voltage_v {
            Some(StopReason::LowBattery {
                voltage_v: sample.battery_voltage_v,
            })
        } else if sample.roll_deg.abs() > self.thresholds.max_tilt_deg
            || sample.pitch_deg.abs() > self.thresholds.max_tilt_deg
        {
            Some(StopReason::Tilt {
                roll_deg: sample.roll_deg,
                pitch_deg: sample.pitch_deg,
            })
        } else {
            None
        };

        if let Some(reason) = reason {
            self.stop(reason);
        }
        reason
    }

    pub fn handle(&mut self, request: SafetyRequest) {
        match request {
            SafetyRequest::ForceStop => self.force_stop(),
            SafetyRequest::ClearStop => self.clear_stop(),
        }
    }

    /// Force an emergency stop.
    pub fn force_stop(&mut self) {
        self.stop(StopReason::Requested);
    }

    fn stop(&mut self, reason: StopReason) {
        if !self.flag.is_set() {
            warn!("Emergency stop: {:?}", reason);
            self.stop_reason = Some(reason);
        }
        self.flag.set(true);
    }

    /// Explicit acknowledgment of a stop. Never called automatically.
    pub fn clear_stop(&mut self) {
        if self.flag.is_set() {
            info!("Emergency stop cleared ({:?})", self.stop_reason);
        }
        self.stop_reason = None;
        self.flag.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(voltage: f64, roll: f64, pitch: f64) -> TelemetrySample {
        TelemetrySample {
            battery_voltage_v: voltage,
            roll_deg: roll,
            pitch_deg: pitch,
        }
    }

    #[test]
    fn test_nominal_sample_does_not_stop() {
        let flag = StopFlag::new();
        let mut monitor = SafetyMonitor::new(SafetyThresholds::default(), flag.clone());
        assert_eq!(monitor.observe(sample(7.8, 3.0, -2.0), Instant::now()), None);
        assert!(!flag.is_set());
    }

    #[test]
    fn test_low_battery_stops() {
        let flag = StopFlag::new();
        let mut monitor = SafetyMonitor::new(SafetyThresholds::default(), flag.clone());
        let reason = monitor.observe(sample(6.0, 0.0, 0.0), Instant::now());
        assert!(matches!(reason, Some(StopReason::LowBattery { .. })));
        assert!(flag.is_set());
    }

    #[test]
    fn test_tilt_stops_and_stays_stopped() {
        let flag = StopFlag::new();
        let mut monitor = SafetyMonitor::new(SafetyThresholds::default(), flag.clone());
        monitor.observe(sample(7.8, 0.0, -60.0), Instant::now());
        assert!(flag.is_set());
        // Recovery alone does not clear the stop
        monitor.observe(sample(7.8, 0.0, 0.0), Instant::now());
        assert!(flag.is_set());
        assert!(matches!(monitor.stop_reason(), Some(StopReason::Tilt { .. })));

        monitor.clear_stop();
        assert!(!flag.is_set());
        assert_eq!(monitor.stop_reason(), None);
    }

    #[test]
    fn test_health_goes_stale() {
        let flag = StopFlag::new();
        let mut monitor = SafetyMonitor::new(SafetyThresholds::default(), flag);
        let t0 = Instant::now();
        assert_eq!(monitor.health(t0), TelemetryHealth::Stale);
        monitor.observe(sample(7.8, 0.0, 0.0), t0);
        assert_eq!(monitor.health(t0), TelemetryHealth::Ok);
        assert_eq!(monitor.health(t0 + TELEMETRY_TIMEOUT * 2), TelemetryHealth::Stale);
    }

    #[test]
    fn test_snapshot_reports_forced_stop() {
        let flag = StopFlag::new();
        let mut monitor = SafetyMonitor::new(SafetyThresholds::default(), flag.clone());
        assert_eq!(monitor.snapshot(Instant::now()), SafetySnapshot::default());

        monitor.handle(SafetyRequest::ForceStop);
        let snapshot = monitor.snapshot(Instant::now());
        assert_eq!(snapshot.stop_reason, Some(StopReason::Requested));
        assert!(flag.is_set());

        monitor.handle(SafetyRequest::ClearStop);
        assert!(!flag.is_set());
    }
}
