// Motion scheduler: the fixed-rate state machine driving all 16 joints
//
// Each tick runs coordinator -> IK -> mapper for every leg and returns the
// commands to commit. All joint and phase state lives here; the runtime only
// feeds it intents and the current time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::actions::{ActionPlayer, Pose, SpecialAction, UnknownAction};
use crate::calibration::{Calibration, CalibrationError, CalibrationTable, map_to_actuator};
use crate::config::MotionConfig;
use crate::gait::{GaitCoordinator, GaitParams, GaitPattern};
use crate::kinematics::{KinematicsError, solve_leg};
use crate::messages::{MotionState, MotionStatus, MovementIntent, SolveErrorReport};
use crate::robot::{AUX_JOINT_COUNT, JointCommands, JointId, LegAngles, LegGeometry, LegRole};
use crate::safety::{SafetySnapshot, StopFlag};

#[derive(Debug, thiserror::Error)]
pub enum MotionError {
    #[error("Special action {0} is still running")]
    ActionInProgress(SpecialAction),

    #[error(transparent)]
    UnknownAction(#[from] UnknownAction),

    #[error("Emergency stop is active")]
    EmergencyStopActive,

    #[error("Calibration is only allowed while idle (state: {0:?})")]
    NotIdle(MotionState),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),
}

pub struct MotionScheduler {
    geometries: [LegGeometry; 4],
    params: GaitParams,
    tick_period: Duration,
    ticks_per_cycle: u32,

    coordinator: GaitCoordinator,
    calibration: Calibration,
    stop_flag: Arc<StopFlag>,

    state: MotionState,
    intent: MovementIntent,
    player: Option<ActionPlayer>,
    /// Position inside the gait cycle, in ticks. Integer so wrapping is exact.
    cycle_tick: u32,
    tick_count: u64,

    leg_angles: [LegAngles; 4],
    aux_angles: [f64; AUX_JOINT_COUNT],
    commands: JointCommands,

    last_tick_duration: Duration,
    last_solve_error: Option<SolveErrorReport>,
    overrun_count: u64,
}

impl MotionScheduler {
    pub fn new(config: &MotionConfig, calibration: Calibration, stop_flag: Arc<StopFlag>) -> Self {
        let mut scheduler = Self {
            geometries: config.geometries(),
            params: config.gait,
            tick_period: config.tick_period(),
            ticks_per_cycle: config.ticks_per_cycle(),
            coordinator: GaitCoordinator::new(config.pattern),
            calibration,
            stop_flag,
            state: MotionState::Idle,
            intent: MovementIntent::STOP,
            player: None,
            cycle_tick: 0,
            tick_count: 0,
            leg_angles: [LegAngles::default(); 4],
            aux_angles: [0.0; AUX_JOINT_COUNT],
            commands: JointCommands::default(),
            last_tick_duration: Duration::ZERO,
            last_solve_error: None,
            overrun_count: 0,
        };
        scheduler.commands = scheduler.map_pose();
        scheduler
    }

    fn stopped(&self) -> bool {
        self.state == MotionState::EmergencyStop || self.stop_flag.is_set()
    }

    /// Store the walking intent. Last write wins; it is evaluated at the
    /// start of the next tick.
    pub fn set_movement_intent(&mut self, intent: MovementIntent) -> Result<(), MotionError> {
        if self.stopped() {
            return Err(MotionError::EmergencyStopActive);
        }
        if intent != self.intent {
            debug!("Movement intent {:?} -> {:?}", self.intent, intent);
        }
        self.intent = intent;
        Ok(())
    }

    /// Start an action by name. An unknown name leaves the scheduler as it
    /// was.
    pub fn trigger_special_action(&mut self, name: &str, now: Instant) -> Result<(), MotionError> {
        let action: SpecialAction = name.parse()?;
        self.start_special_action(action, now)
    }

    pub fn start_special_action(
        &mut self,
        action: SpecialAction,
        now: Instant,
    ) -> Result<(), MotionError> {
        if self.stopped() {
            return Err(MotionError::EmergencyStopActive);
        }
        if let Some(player) = &self.player {
            return Err(MotionError::ActionInProgress(player.action()));
        }

        info!("Starting special action {} from {:?}", action, self.state);
        let start = Pose::from_legs(&self.leg_angles, &self.aux_angles);
        self.player = Some(ActionPlayer::new(action, start, now));
        self.state = MotionState::SpecialAction(action);
        self.cycle_tick = 0;
        Ok(())
    }

    /// Select a gait pattern. Applied at once while idle, otherwise at the
    /// next cycle wrap.
    pub fn request_pattern(&mut self, pattern: GaitPattern) -> Result<(), MotionError> {
        if self.stopped() {
            return Err(MotionError::EmergencyStopActive);
        }
        self.coordinator.request_pattern(pattern);
        if self.state == MotionState::Idle {
            self.coordinator.apply_pending();
        }
        Ok(())
    }

    /// Overwrite and persist one joint's center offset.
    pub fn save_calibration(&mut self, joint: JointId, center_offset: i32) -> Result<(), MotionError> {
        if self.state != MotionState::Idle || self.stop_flag.is_set() {
            return Err(MotionError::NotIdle(self.state));
        }
        self.calibration.save(joint, center_offset)?;
        self.commands = self.map_pose();
        Ok(())
    }

    /// Run one control tick and time it against `budget`.
    ///
    /// Returns the commands to commit, or `None` while the emergency stop
    /// holds the outputs frozen. Callers that commit the commands themselves
    /// use [`compute`](Self::compute) and [`record_tick`](Self::record_tick)
    /// so the commit counts toward the budget.
    pub fn tick(&mut self, now: Instant, budget: Duration) -> Option<JointCommands> {
        let started = Instant::now();
        let commands = self.compute(now);
        self.record_tick(started.elapsed(), budget);
        commands
    }

    /// Advance the state machine by one tick without timing it.
    pub fn compute(&mut self, now: Instant) -> Option<JointCommands> {
        self.tick_count += 1;
        self.step(now)
    }

    /// Record how long a whole tick took. Longer than `budget` is an overrun.
    pub fn record_tick(&mut self, elapsed: Duration, budget: Duration) {
        self.last_tick_duration = elapsed;
        if elapsed > budget {
            self.overrun_count += 1;
            warn!(
                "Tick overran its budget: {:?} > {:?} ({} overruns)",
                elapsed, budget, self.overrun_count
            );
        }
    }

    fn step(&mut self, now: Instant) -> Option<JointCommands> {
        if self.stop_flag.is_set() {
            if self.state != MotionState::EmergencyStop {
                warn!("Stop flag set, freezing outputs (was {:?})", self.state);
                self.player = None;
                self.state = MotionState::EmergencyStop;
            }
            return None;
        }

        if self.state == MotionState::EmergencyStop {
            info!("Emergency stop cleared, back to neutral idle");
            self.intent = MovementIntent::STOP;
            self.enter_idle();
        }

        match self.state {
            MotionState::Idle if !self.intent.is_stop() => {
                info!("Walking with {:?}", self.intent);
                self.state = MotionState::Walking;
            }
            MotionState::Walking if self.intent.is_stop() => {
                info!("Stop intent, returning to neutral");
                self.enter_idle();
            }
            _ => {}
        }

        match self.state {
            MotionState::Walking => self.walk_step(),
            MotionState::SpecialAction(_) => self.action_step(now),
            MotionState::Idle | MotionState::EmergencyStop => {}
        }

        self.commands = self.map_pose();
        Some(self.commands)
    }

    /// Idle always stands in the neutral pose.
    fn enter_idle(&mut self) {
        self.state = MotionState::Idle;
        self.cycle_tick = 0;
        self.coordinator.apply_pending();
        self.leg_angles = [LegAngles::default(); 4];
        self.aux_angles = [0.0; AUX_JOINT_COUNT];
    }

    fn walk_step(&mut self) {
        self.cycle_tick += 1;
        if self.cycle_tick >= self.ticks_per_cycle {
            self.cycle_tick = 0;
            self.coordinator.on_wrap();
        }

        let movement = self.intent.movement_vector();
        let targets = self.coordinator.foot_targets(
            self.current_phase(),
            &movement,
            &self.geometries,
            &self.params,
        );

        for role in LegRole::ALL {
            let i = role.index();
            match solve_leg(&targets[i], &self.geometries[i]) {
                Ok(angles) => self.leg_angles[i] = angles,
                Err(e @ KinematicsError::Unreachable { leg, target, distance }) => {
                    // Hold the last valid angles; the other legs keep walking
                    warn!("{}", e);
                    self.last_solve_error = Some(SolveErrorReport {
                        leg,
                        target,
                        distance_mm: distance,
                        tick: self.tick_count,
                    });
                }
            }
        }
        self.aux_angles = [0.0; AUX_JOINT_COUNT];
    }

    fn action_step(&mut self, now: Instant) {
        let Some(player) = self.player.as_mut() else {
            self.enter_idle();
            return;
        };

        let pose = player.step(self.tick_period, now);
        self.leg_angles = LegRole::ALL.map(|role| pose.leg(role));
        self.aux_angles = std::array::from_fn(|i| pose.angle(JointId::aux(i)));

        if player.is_complete() {
            if player.timed_out() {
                warn!("Special action {} timed out", player.action());
            } else {
                info!("Special action {} complete", player.action());
            }
            self.player = None;
            self.enter_idle();
        }
    }

    fn map_pose(&self) -> JointCommands {
        let pose = Pose::from_legs(&self.leg_angles, &self.aux_angles);
        let table = self.calibration.table();
        let mut commands = JointCommands::default();
        for joint in JointId::all() {
            commands.set(joint, map_to_actuator(joint, pose.angle(joint), table));
        }
        commands
    }

    /// Global gait phase in `[0, 1)`.
    pub fn current_phase(&self) -> f64 {
        self.cycle_tick as f64 / self.ticks_per_cycle as f64
    }

    pub fn current_state(&self) -> MotionState {
        self.state
    }

    pub fn pattern(&self) -> GaitPattern {
        self.coordinator.pattern()
    }

    pub fn intent(&self) -> MovementIntent {
        self.intent
    }

    pub fn last_tick_duration(&self) -> Duration {
        self.last_tick_duration
    }

    pub fn last_solve_error(&self) -> Option<SolveErrorReport> {
        self.last_solve_error
    }

    pub fn overrun_count(&self) -> u64 {
        self.overrun_count
    }

    /// Progress of the running special action, if any.
    pub fn action_progress(&self) -> Option<Duration> {
        self.player.as_ref().map(|p| p.progress())
    }

    pub fn leg_angles(&self, role: LegRole) -> LegAngles {
        self.leg_angles[role.index()]
    }

    /// Commands produced by the most recent unfrozen tick.
    pub fn commands(&self) -> JointCommands {
        self.commands
    }

    pub fn calibration_table(&self) -> &CalibrationTable {
        self.calibration.table()
    }

    pub fn status(&self, safety: &SafetySnapshot) -> MotionStatus {
        MotionStatus {
            state: self.state,
            phase: self.current_phase(),
            pattern: self.coordinator.pattern(),
            last_tick_duration_ms: self.last_tick_duration.as_secs_f64() * 1000.0,
            overrun_count: self.overrun_count,
            last_solve_error: self.last_solve_error,
            commands: self.commands,
            telemetry: safety.telemetry,
            telemetry_health: safety.health,
            stop_reason: safety.stop_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{DEFAULT_CENTER_OFFSET, MemoryStore};
    use crate::messages::Direction;
    use crate::robot::ActuatorCommand;
    use crate::safety::{SafetyMonitor, SafetyThresholds};

    const BUDGET: Duration = Duration::from_secs(1);

    fn scheduler() -> (MotionScheduler, SafetyMonitor) {
        let flag = StopFlag::new();
        let calibration = Calibration::load(Box::new(MemoryStore::new())).unwrap();
        let scheduler = MotionScheduler::new(&MotionConfig::default(), calibration, flag.clone());
        (scheduler, SafetyMonitor::new(SafetyThresholds::default(), flag))
    }

    fn forward() -> MovementIntent {
        MovementIntent::new(Direction::Positive, Direction::Zero)
    }

    fn neutral_commands() -> JointCommands {
        JointCommands([ActuatorCommand(DEFAULT_CENTER_OFFSET); 16])
    }

    #[test]
    fn test_starts_idle_at_neutral() {
        let (mut s, _) = scheduler();
        assert_eq!(s.current_state(), MotionState::Idle);
        assert_eq!(s.tick(Instant::now(), BUDGET), Some(neutral_commands()));
        assert_eq!(s.current_phase(), 0.0);
    }

    #[test]
    fn test_intent_starts_walking_and_advances_phase() {
        let (mut s, _) = scheduler();
        s.set_movement_intent(forward()).unwrap();
        let commands = s.tick(Instant::now(), BUDGET).unwrap();
        assert_eq!(s.current_state(), MotionState::Walking);
        assert_eq!(s.current_phase(), 1.0 / 40.0);
        assert_ne!(commands, neutral_commands());
    }

    #[test]
    fn test_phase_wraps_exactly() {
        let (mut s, _) = scheduler();
        s.set_movement_intent(forward()).unwrap();
        for _ in 0..40 {
            s.tick(Instant::now(), BUDGET);
        }
        assert_eq!(s.current_phase(), 0.0);
        for _ in 0..400 {
            s.tick(Instant::now(), BUDGET);
            assert!((0.0..1.0).contains(&s.current_phase()));
        }
    }

    #[test]
    fn test_stop_intent_resets_to_neutral() {
        let (mut s, _) = scheduler();
        s.set_movement_intent(forward()).unwrap();
        for _ in 0..7 {
            s.tick(Instant::now(), BUDGET);
        }
        s.set_movement_intent(MovementIntent::STOP).unwrap();
        let commands = s.tick(Instant::now(), BUDGET).unwrap();
        assert_eq!(s.current_state(), MotionState::Idle);
        assert_eq!(s.current_phase(), 0.0);
        assert_eq!(commands, neutral_commands());
    }

    #[test]
    fn test_pattern_change_waits_for_wrap() {
        let (mut s, _) = scheduler();
        s.set_movement_intent(forward()).unwrap();
        for _ in 0..10 {
            s.tick(Instant::now(), BUDGET);
        }
        s.request_pattern(GaitPattern::Tripod).unwrap();
        s.tick(Instant::now(), BUDGET);
        assert_eq!(s.pattern(), GaitPattern::Trot);
        for _ in 0..29 {
            s.tick(Instant::now(), BUDGET);
        }
        assert_eq!(s.current_phase(), 0.0);
        assert_eq!(s.pattern(), GaitPattern::Tripod);
    }

    #[test]
    fn test_pattern_change_applies_at_once_when_idle() {
        let (mut s, _) = scheduler();
        s.request_pattern(GaitPattern::Tripod).unwrap();
        assert_eq!(s.pattern(), GaitPattern::Tripod);
    }

    #[test]
    fn test_unknown_action_leaves_state() {
        let (mut s, _) = scheduler();
        s.set_movement_intent(forward()).unwrap();
        s.tick(Instant::now(), BUDGET);
        let err = s.trigger_special_action("moonwalk", Instant::now()).unwrap_err();
        assert!(matches!(err, MotionError::UnknownAction(_)));
        assert_eq!(s.current_state(), MotionState::Walking);
    }

    #[test]
    fn test_action_runs_to_completion() {
        let (mut s, _) = scheduler();
        let t0 = Instant::now();
        s.trigger_special_action("bow", t0).unwrap();
        assert_eq!(
            s.current_state(),
            MotionState::SpecialAction(SpecialAction::Bow)
        );

        let total = SpecialAction::Bow.sequence().total_duration();
        let ticks = total.as_millis().div_ceil(20) as u32;
        for k in 1..=ticks {
            s.tick(t0 + Duration::from_millis(20) * k, BUDGET);
        }
        assert_eq!(s.current_state(), MotionState::Idle);
        assert_eq!(s.commands(), neutral_commands());
    }

    #[test]
    fn test_second_action_rejected() {
        let (mut s, _) = scheduler();
        let t0 = Instant::now();
        s.start_special_action(SpecialAction::Dance, t0).unwrap();
        s.tick(t0, BUDGET);
        let progress = s.action_progress();

        let err = s.start_special_action(SpecialAction::Jump, t0).unwrap_err();
        assert!(matches!(
            err,
            MotionError::ActionInProgress(SpecialAction::Dance)
        ));
        assert_eq!(s.action_progress(), progress);
        assert_eq!(
            s.current_state(),
            MotionState::SpecialAction(SpecialAction::Dance)
        );
    }

    #[test]
    fn test_emergency_stop_freezes_until_cleared() {
        let (mut s, mut monitor) = scheduler();
        s.set_movement_intent(forward()).unwrap();
        for _ in 0..5 {
            s.tick(Instant::now(), BUDGET);
        }
        let frozen = s.commands();

        monitor.force_stop();
        assert_eq!(s.tick(Instant::now(), BUDGET), None);
        assert_eq!(s.current_state(), MotionState::EmergencyStop);
        assert!(matches!(
            s.set_movement_intent(forward()),
            Err(MotionError::EmergencyStopActive)
        ));
        assert!(matches!(
            s.start_special_action(SpecialAction::Bow, Instant::now()),
            Err(MotionError::EmergencyStopActive)
        ));
        assert_eq!(s.tick(Instant::now(), BUDGET), None);
        assert_eq!(s.commands(), frozen);

        monitor.clear_stop();
        s.tick(Instant::now(), BUDGET);
        assert_eq!(s.current_state(), MotionState::Idle);
        assert!(s.intent().is_stop());
    }

    #[test]
    fn test_idle_after_clear_stop_is_neutral() {
        let (mut s, mut monitor) = scheduler();
        s.set_movement_intent(forward()).unwrap();
        for _ in 0..7 {
            s.tick(Instant::now(), BUDGET);
        }
        assert_ne!(s.leg_angles(LegRole::FrontLeft), LegAngles::default());

        monitor.force_stop();
        s.tick(Instant::now(), BUDGET);
        monitor.clear_stop();
        let commands = s.tick(Instant::now(), BUDGET).unwrap();

        assert_eq!(s.current_state(), MotionState::Idle);
        assert_eq!(s.current_phase(), 0.0);
        for role in LegRole::ALL {
            assert_eq!(s.leg_angles(role), LegAngles::default());
        }
        assert_eq!(commands, neutral_commands());
    }

    #[test]
    fn test_calibration_only_while_idle() {
        let (mut s, _) = scheduler();
        let joint = JointId::new(4).unwrap();
        s.set_movement_intent(forward()).unwrap();
        s.tick(Instant::now(), BUDGET);
        assert!(matches!(
            s.save_calibration(joint, 2000),
            Err(MotionError::NotIdle(MotionState::Walking))
        ));

        s.set_movement_intent(MovementIntent::STOP).unwrap();
        s.tick(Instant::now(), BUDGET);
        s.save_calibration(joint, 2000).unwrap();
        assert_eq!(s.calibration_table().entry(joint).center_offset, 2000);
        assert_eq!(s.commands().get(joint), ActuatorCommand(2000));
    }

    #[test]
    fn test_overrun_is_counted() {
        let (mut s, _) = scheduler();
        s.set_movement_intent(forward()).unwrap();
        s.tick(Instant::now(), BUDGET);
        assert_eq!(s.overrun_count(), 0);
        s.tick(Instant::now(), Duration::ZERO);
        s.tick(Instant::now(), Duration::ZERO);
        assert_eq!(s.overrun_count(), 2);
        assert!(s.last_tick_duration() > Duration::ZERO);
    }

    #[test]
    fn test_recorded_tick_covers_caller_work() {
        let (mut s, _) = scheduler();
        assert!(s.compute(Instant::now()).is_some());
        assert_eq!(s.overrun_count(), 0);
        s.record_tick(Duration::from_millis(50), Duration::from_millis(20));
        assert_eq!(s.overrun_count(), 1);
        assert_eq!(s.last_tick_duration(), Duration::from_millis(50));
    }

    #[test]
    fn test_status_reflects_scheduler() {
        let (mut s, _) = scheduler();
        s.set_movement_intent(forward()).unwrap();
        s.tick(Instant::now(), BUDGET);
        let status = s.status(&SafetySnapshot::default());
        assert_eq!(status.state, MotionState::Walking);
        assert_eq!(status.pattern, GaitPattern::Trot);
        assert_eq!(status.commands, s.commands());
    }
}
